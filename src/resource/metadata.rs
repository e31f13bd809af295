//! Object metadata that may exist before the backend object does.
//!
//! Clients can set access restrictions or schedule state on a resource that is
//! about to be created. Until the create succeeds those values live in a
//! [`PendingMetadata`] map; afterwards they are read from the bound object.
//! [`resolve`] hides the difference.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Metadata fields an object resource exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    AccessMode,
    IsScheduleObject,
    ScheduleTag,
    ScheduleEtags,
    HasPrivateComment,
    /// UIDs created earlier in the same batch, visible to group members
    CoaddedUids,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataValue {
    Text(String),
    Flag(bool),
    List(Vec<String>),
    Set(BTreeSet<String>),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            MetadataValue::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            MetadataValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            MetadataValue::Set(set) => Some(set),
            _ => None,
        }
    }
}

/// Metadata recorded before the backend object exists.
pub type PendingMetadata = HashMap<MetadataKey, MetadataValue>;

/// Metadata stored with a backend object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub access_mode: Option<String>,
    pub is_schedule_object: Option<bool>,
    pub schedule_tag: Option<String>,
    /// Entity tags of versions produced by server-side scheduling since the
    /// last client write, oldest first
    pub schedule_etags: Vec<String>,
    pub has_private_comment: bool,
}

impl ObjectMetadata {
    fn get(&self, key: MetadataKey) -> Option<MetadataValue> {
        match key {
            MetadataKey::AccessMode => self.access_mode.clone().map(MetadataValue::Text),
            MetadataKey::IsScheduleObject => self.is_schedule_object.map(MetadataValue::Flag),
            MetadataKey::ScheduleTag => self.schedule_tag.clone().map(MetadataValue::Text),
            MetadataKey::ScheduleEtags => Some(MetadataValue::List(self.schedule_etags.clone())),
            MetadataKey::HasPrivateComment => Some(MetadataValue::Flag(self.has_private_comment)),
            MetadataKey::CoaddedUids => None,
        }
    }
}

/// Where a resource's metadata currently lives.
#[derive(Debug, Clone, Copy)]
pub enum MetadataSource<'a> {
    Bound(&'a ObjectMetadata),
    Pending(&'a PendingMetadata),
}

/// Effective value of `key` for a bound object or a pending create.
pub fn resolve(source: MetadataSource<'_>, key: MetadataKey) -> Option<MetadataValue> {
    match source {
        MetadataSource::Bound(metadata) => metadata.get(key),
        MetadataSource::Pending(pending) => pending.get(&key).cloned(),
    }
}

/// Typed helpers over [`resolve`].
impl MetadataSource<'_> {
    pub fn schedule_tag(self) -> Option<String> {
        resolve(self, MetadataKey::ScheduleTag).and_then(|value| value.as_text().map(str::to_string))
    }

    pub fn schedule_etags(self) -> Vec<String> {
        resolve(self, MetadataKey::ScheduleEtags)
            .and_then(|value| value.as_list().map(<[String]>::to_vec))
            .unwrap_or_default()
    }

    pub fn is_schedule_object(self) -> bool {
        resolve(self, MetadataKey::IsScheduleObject)
            .and_then(|value| value.as_flag())
            .unwrap_or(false)
    }

    pub fn access_mode(self) -> Option<String> {
        resolve(self, MetadataKey::AccessMode).and_then(|value| value.as_text().map(str::to_string))
    }

    pub fn has_private_comment(self) -> bool {
        resolve(self, MetadataKey::HasPrivateComment)
            .and_then(|value| value.as_flag())
            .unwrap_or(false)
    }
}
