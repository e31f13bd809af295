//! Conditional request evaluation.
//!
//! Entity tags for collections are derived from their change token, for
//! objects and attachments from a digest of the stored bytes. The standard
//! `If-Match` / `If-None-Match` / `If-Unmodified-Since` checks run first;
//! calendar objects then add the `If-Schedule-Tag-Match` check and the legacy
//! schedule-etag compatibility path.
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::precondition::check_standard;
//! use dav_store_bridge::protocol::{DavMethod, DavRequest, header};
//! use dav_store_bridge::resource::version::EntityTag;
//!
//! let current = EntityTag::from_content(b"BEGIN:VCALENDAR");
//! let request = DavRequest::new(DavMethod::Put, "/calendars/__uids__/a/c/x.ics")
//!     .with_header(header::IF_MATCH, current.to_string());
//! assert!(check_standard(&request, true, Some(&current), None).is_ok());
//!
//! let stale = DavRequest::new(DavMethod::Put, "/calendars/__uids__/a/c/x.ics")
//!     .with_header(header::IF_MATCH, "\"stale\"");
//! assert!(check_standard(&stale, true, Some(&current), None).is_err());
//! ```

use crate::error::{DavError, DavResult, ns};
use crate::protocol::{DavRequest, DavResponse, header};
use crate::resource::metadata::MetadataSource;
use crate::resource::version::{EntityTag, TagList};
use crate::storage::ObjectInfo;
use chrono::{DateTime, Utc};
use http::StatusCode;
use log::debug;

/// Entity tag of an object's stored content.
pub fn object_etag(object: &ObjectInfo) -> EntityTag {
    EntityTag::from_content(&object.data)
}

/// Entity tag of a collection, derived from its change token.
pub fn collection_etag(sync_token: &str) -> EntityTag {
    EntityTag::for_change_token(sync_token)
}

fn parse_tag_list(value: &str, name: &str) -> DavResult<TagList> {
    value
        .parse()
        .map_err(|e| DavError::bad_request(format!("Invalid {name} header: {e}")))
}

/// `If-Match`, `If-Unmodified-Since` and `If-None-Match`, in that order.
pub fn check_standard(
    request: &DavRequest,
    exists: bool,
    etag: Option<&EntityTag>,
    modified: Option<DateTime<Utc>>,
) -> DavResult<()> {
    if let Some(value) = request.header(header::IF_MATCH) {
        let list = parse_tag_list(value, "If-Match")?;
        let matched = exists
            && match (&list, etag) {
                (TagList::Any, _) => true,
                (TagList::Tags(_), Some(current)) => list.matches(current),
                (TagList::Tags(_), None) => false,
            };
        if !matched {
            debug!("If-Match failed for {} {}", request.method, request.path);
            return Err(DavError::precondition_failed("If-Match precondition failed"));
        }
    }

    if let (Some(value), Some(modified)) = (request.header(header::IF_UNMODIFIED_SINCE), modified) {
        // Unparseable dates are ignored
        if let Ok(since) = DateTime::parse_from_rfc2822(value.trim()) {
            if modified.timestamp() > since.timestamp() {
                debug!("If-Unmodified-Since failed for {}", request.path);
                return Err(DavError::precondition_failed(
                    "Resource modified since If-Unmodified-Since",
                ));
            }
        }
    }

    if let Some(value) = request.header(header::IF_NONE_MATCH) {
        let list = parse_tag_list(value, "If-None-Match")?;
        let matched = exists
            && match (&list, etag) {
                (TagList::Any, _) => true,
                (TagList::Tags(_), Some(current)) => list.matches_weak(current),
                (TagList::Tags(_), None) => false,
            };
        if matched {
            debug!("If-None-Match matched for {} {}", request.method, request.path);
            return Err(if request.method.is_read() {
                DavError::Status(StatusCode::NOT_MODIFIED)
            } else {
                DavError::precondition_failed("If-None-Match precondition failed")
            });
        }
    }
    Ok(())
}

fn unquote(tag: &str) -> &str {
    tag.trim().trim_matches('"')
}

/// Evaluate `If-Schedule-Tag-Match`.
///
/// Returns whether the store should smart-merge the write: true when the
/// schedule tag matched, or, in compatibility mode without the header, when
/// the client sent `If-Match`.
pub fn check_schedule_tag(
    request: &DavRequest,
    object: Option<&ObjectInfo>,
    compatibility: bool,
) -> DavResult<bool> {
    if let Some(value) = request.header(header::IF_SCHEDULE_TAG_MATCH) {
        let current = object.and_then(|object| MetadataSource::Bound(&object.metadata).schedule_tag());
        let matched = current
            .as_deref()
            .map(|tag| unquote(tag) == unquote(value))
            .unwrap_or(false);
        if !matched {
            debug!("Schedule-Tag mismatch on {}", request.path);
            return Err(DavError::precondition_failed("Schedule-Tag mismatch"));
        }
        return Ok(true);
    }
    Ok(compatibility && request.header(header::IF_MATCH).is_some())
}

/// Standard checks for an object, with the schedule-etag compatibility path.
///
/// When compatibility is on and the store recorded more than one entity tag
/// from server-side scheduling, a write may match any of them. The current
/// tag is tried first, then the recorded tags from newest to oldest; the
/// first passing check wins and otherwise the last failure is returned.
pub fn check_object(request: &DavRequest, object: Option<&ObjectInfo>, compatibility: bool) -> DavResult<()> {
    let current = object.map(object_etag);
    let modified = object.map(|object| object.modified);

    let schedule_etags = object
        .map(|object| MetadataSource::Bound(&object.metadata).schedule_etags())
        .unwrap_or_default();
    if !compatibility || schedule_etags.len() <= 1 || request.method.is_read() {
        return check_standard(request, object.is_some(), current.as_ref(), modified);
    }

    let mut candidates: Vec<EntityTag> = current.into_iter().collect();
    candidates.extend(
        schedule_etags
            .iter()
            .rev()
            .filter_map(|tag| tag.parse::<EntityTag>().ok()),
    );

    let mut last_failure = None;
    for candidate in &candidates {
        match check_standard(request, true, Some(candidate), modified) {
            Ok(()) => {
                debug!("Matched schedule entity tag {} on {}", candidate, request.path);
                return Ok(());
            }
            Err(err) => last_failure = Some(err),
        }
    }
    match last_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Check the CTag condition carried in an `If:` header.
///
/// Only the first tagged list is considered; its token must look like
/// `<http://me.com/_namespace/ctag/VALUE>`.
pub fn check_ctag(request: &DavRequest, sync_token: &str) -> DavResult<()> {
    let Some(value) = request.header(header::IF) else {
        return Ok(());
    };
    let prefix = format!("<{}ctag/", ns::MOBILEME);
    if let Some(start) = value.find(&prefix) {
        let rest = &value[start + prefix.len()..];
        let tested = rest.split('>').next().unwrap_or(rest);
        if tested != sync_token {
            debug!("CTag '{}' does not match '{}'", tested, sync_token);
            return Err(DavError::precondition_failed("CTag pre-condition failure"));
        }
    }
    Ok(())
}

/// Whether a response with `status` should be replaced by the resource's
/// representation because the client sent `Prefer: return=representation`.
pub fn wants_representation(request: &DavRequest, status: StatusCode) -> bool {
    request.prefers_representation()
        && (status.is_success() || status == StatusCode::PRECONDITION_FAILED)
}

/// Turn a GET response into the reply for a request that preferred a
/// representation. Created and precondition-failed statuses are kept.
pub fn into_representation(mut representation: DavResponse, original: StatusCode, url: &str) -> DavResponse {
    if original == StatusCode::CREATED || original == StatusCode::PRECONDITION_FAILED {
        representation.status = original;
    }
    representation.set_header(header::CONTENT_LOCATION, url);
    representation
}
