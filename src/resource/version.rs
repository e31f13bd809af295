//! Entity tags for collections, items and attachments.
//!
//! Item and attachment tags are digests of the stored bytes, so a tag changes
//! exactly when the content does. A collection's tag is a digest of its change
//! token (CTag), so it changes whenever membership or any member changes.
//!
//! # Basic Usage
//!
//! ```rust
//! use dav_store_bridge::resource::version::{EntityTag, TagList};
//!
//! let tag = EntityTag::from_content(b"BEGIN:VCALENDAR...");
//! let header = tag.to_string(); // "\"...\""
//!
//! let list: TagList = header.parse().unwrap();
//! assert!(list.matches(&tag));
//! assert!(TagList::Any.matches(&tag));
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// An HTTP entity tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTag {
    opaque: String,
    weak: bool,
}

impl EntityTag {
    /// Strong tag derived from content bytes.
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self {
            opaque: BASE64.encode(&digest[..16]),
            weak: false,
        }
    }

    /// Strong tag for a collection, derived from its change token.
    pub fn for_change_token(change_token: &str) -> Self {
        Self::from_content(change_token.as_bytes())
    }

    /// Strong tag with a caller-supplied opaque value.
    pub fn strong(opaque: impl Into<String>) -> Self {
        Self {
            opaque: opaque.into(),
            weak: false,
        }
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn opaque(&self) -> &str {
        &self.opaque
    }

    /// RFC 7232 strong comparison: both strong and identical.
    pub fn strong_eq(&self, other: &EntityTag) -> bool {
        !self.weak && !other.weak && self.opaque == other.opaque
    }

    /// RFC 7232 weak comparison: identical opaque values.
    pub fn weak_eq(&self, other: &EntityTag) -> bool {
        self.opaque == other.opaque
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weak {
            write!(f, "W/\"{}\"", self.opaque)
        } else {
            write!(f, "\"{}\"", self.opaque)
        }
    }
}

impl FromStr for EntityTag {
    type Err = VersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (weak, quoted) = match trimmed.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if quoted.len() < 2 || !quoted.starts_with('"') || !quoted.ends_with('"') {
            return Err(VersionError::InvalidEtagFormat(value.to_string()));
        }
        let opaque = &quoted[1..quoted.len() - 1];
        if opaque.contains('"') {
            return Err(VersionError::InvalidEtagFormat(value.to_string()));
        }
        Ok(Self {
            opaque: opaque.to_string(),
            weak,
        })
    }
}

/// Value of an `If-Match` or `If-None-Match` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagList {
    Any,
    Tags(Vec<EntityTag>),
}

impl TagList {
    /// `If-Match` semantics: strong comparison against any listed tag.
    pub fn matches(&self, current: &EntityTag) -> bool {
        match self {
            TagList::Any => true,
            TagList::Tags(tags) => tags.iter().any(|tag| tag.strong_eq(current)),
        }
    }

    /// `If-None-Match` semantics: weak comparison against any listed tag.
    pub fn matches_weak(&self, current: &EntityTag) -> bool {
        match self {
            TagList::Any => true,
            TagList::Tags(tags) => tags.iter().any(|tag| tag.weak_eq(current)),
        }
    }
}

impl FromStr for TagList {
    type Err = VersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed == "*" {
            return Ok(TagList::Any);
        }
        let tags = split_tags(trimmed)
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<EntityTag>, _>>()?;
        if tags.is_empty() {
            return Err(VersionError::ParseError("empty entity tag list".to_string()));
        }
        Ok(TagList::Tags(tags))
    }
}

/// Split a comma-separated tag list without breaking quoted values.
fn split_tags(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (index, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(value[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.into_iter().filter(|part| !part.is_empty()).collect()
}

/// Errors that can occur when parsing tags.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VersionError {
    #[error("Invalid ETag format: {0}")]
    InvalidEtagFormat(String),

    #[error("Failed to parse version: {0}")]
    ParseError(String),
}
