//! Transport-neutral request and response types.
//!
//! The bridge does not own a server loop. A host transport decodes a request
//! into a [`DavRequest`], hands it to [`Bridge::handle`](crate::Bridge::handle)
//! and writes the returned [`DavResponse`] back to the wire. Header maps use the
//! `http` crate types so hosts built on `hyper` can pass theirs through.

use crate::error::ErrorElement;
use crate::multistatus;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use log::warn;
use std::fmt;
use std::str::FromStr;

/// Header names consumed and produced by the bridge.
pub mod header {
    pub const ACCEPT: &str = "accept";
    pub const ACCEPT_PATCH: &str = "accept-patch";
    pub const CAL_MANAGED_ID: &str = "cal-managed-id";
    pub const CONTENT_DISPOSITION: &str = "content-disposition";
    pub const CONTENT_LOCATION: &str = "content-location";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CTAG: &str = "ctag";
    pub const DEPTH: &str = "depth";
    pub const DESTINATION: &str = "destination";
    pub const ETAG: &str = "etag";
    pub const IF: &str = "if";
    pub const IF_MATCH: &str = "if-match";
    pub const IF_NONE_MATCH: &str = "if-none-match";
    pub const IF_SCHEDULE_TAG_MATCH: &str = "if-schedule-tag-match";
    pub const IF_UNMODIFIED_SINCE: &str = "if-unmodified-since";
    pub const LOCATION: &str = "location";
    pub const MOBILEME_DAV_OPTIONS: &str = "x-mobileme-dav-options";
    pub const OVERWRITE: &str = "overwrite";
    pub const PREFER: &str = "prefer";
    pub const RETRY_AFTER: &str = "retry-after";
    pub const SCHEDULE_TAG: &str = "schedule-tag";
    pub const SPLIT_COMPONENT_URL: &str = "split-component-url";
}

/// Protocol methods the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DavMethod {
    Get,
    Head,
    Put,
    Patch,
    Post,
    Delete,
    Move,
    Copy,
    Acl,
    Mkcol,
    Mkcalendar,
    Proppatch,
    Options,
}

impl DavMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DavMethod::Get => "GET",
            DavMethod::Head => "HEAD",
            DavMethod::Put => "PUT",
            DavMethod::Patch => "PATCH",
            DavMethod::Post => "POST",
            DavMethod::Delete => "DELETE",
            DavMethod::Move => "MOVE",
            DavMethod::Copy => "COPY",
            DavMethod::Acl => "ACL",
            DavMethod::Mkcol => "MKCOL",
            DavMethod::Mkcalendar => "MKCALENDAR",
            DavMethod::Proppatch => "PROPPATCH",
            DavMethod::Options => "OPTIONS",
        }
    }

    /// GET and HEAD never modify state.
    pub fn is_read(&self) -> bool {
        matches!(self, DavMethod::Get | DavMethod::Head)
    }
}

impl fmt::Display for DavMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for DavMethod {
    type Err = UnknownMethod;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        Ok(match method.to_ascii_uppercase().as_str() {
            "GET" => DavMethod::Get,
            "HEAD" => DavMethod::Head,
            "PUT" => DavMethod::Put,
            "PATCH" => DavMethod::Patch,
            "POST" => DavMethod::Post,
            "DELETE" => DavMethod::Delete,
            "MOVE" => DavMethod::Move,
            "COPY" => DavMethod::Copy,
            "ACL" => DavMethod::Acl,
            "MKCOL" => DavMethod::Mkcol,
            "MKCALENDAR" => DavMethod::Mkcalendar,
            "PROPPATCH" => DavMethod::Proppatch,
            "OPTIONS" => DavMethod::Options,
            _ => return Err(UnknownMethod(method.to_string())),
        })
    }
}

/// A parsed `type/subtype; param=value` media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    essence: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    /// Parse a media type, lower-casing the type, subtype and parameter names.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let essence = parts.next()?.trim().to_ascii_lowercase();
        let (kind, subtype) = essence.split_once('/')?;
        if kind.is_empty() || subtype.is_empty() {
            return None;
        }
        let params = parts
            .filter_map(|param| {
                let (name, value) = param.split_once('=')?;
                Some((
                    name.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect();
        Some(Self { essence, params })
    }

    /// `type/subtype` without parameters.
    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (name, value) in &self.params {
            write!(f, "; {name}={value}")?;
        }
        Ok(())
    }
}

/// Pick the best supported media type for an `Accept` header.
///
/// `supported[0]` is the default used when the header is absent or a wildcard
/// range matches. Returns `None` when nothing acceptable is supported.
pub fn negotiate<'a>(accept: Option<&str>, supported: &[&'a str]) -> Option<&'a str> {
    let default = supported.first().copied()?;
    let Some(accept) = accept.filter(|value| !value.trim().is_empty()) else {
        return Some(default);
    };

    let mut ranges: Vec<(f32, String)> = accept
        .split(',')
        .filter_map(|entry| {
            let media = MediaType::parse(entry)?;
            let quality = media
                .param("q")
                .and_then(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((quality, media.essence().to_string()))
        })
        .filter(|(quality, _)| *quality > 0.0)
        .collect();
    ranges.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    for (_, range) in ranges {
        if range == "*/*" {
            return Some(default);
        }
        if let Some(kind) = range.strip_suffix("/*") {
            if let Some(found) = supported
                .iter()
                .find(|candidate| candidate.split('/').next() == Some(kind))
                .copied()
            {
                return Some(found);
            }
            continue;
        }
        if let Some(found) = supported.iter().find(|candidate| **candidate == range).copied() {
            return Some(found);
        }
    }
    None
}

/// A decoded protocol request.
#[derive(Debug, Clone)]
pub struct DavRequest {
    pub method: DavMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Authenticated principal uid, if any
    pub principal: Option<String>,
}

impl DavRequest {
    /// Create a request for `uri`, splitting off any query string.
    pub fn new(method: DavMethod, uri: impl AsRef<str>) -> Self {
        let uri = uri.as_ref();
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (uri, Vec::new()),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            principal: None,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(value) => {
                self.headers.append(name, value);
            }
            Err(_) => warn!("Dropping invalid value for request header '{}'", name),
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// First value of a header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn depth(&self) -> Option<&str> {
        self.header(header::DEPTH).map(str::trim)
    }

    /// `Overwrite` defaults to true; only `F` disables it.
    pub fn overwrite(&self) -> bool {
        !matches!(self.header(header::OVERWRITE).map(str::trim), Some("F" | "f"))
    }

    /// Path component of the `Destination` header.
    pub fn destination(&self) -> Option<String> {
        let destination = self.header(header::DESTINATION)?.trim();
        if destination.is_empty() {
            return None;
        }
        let path = match destination.split_once("://") {
            Some((_, rest)) => match rest.find('/') {
                Some(index) => &rest[index..],
                None => "/",
            },
            None => destination,
        };
        Some(path.to_string())
    }

    /// True when `Prefer` contains `return=representation`.
    pub fn prefers_representation(&self) -> bool {
        self.headers
            .get_all(header::PREFER)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split([',', ';']))
            .any(|token| {
                token
                    .split_once('=')
                    .map(|(key, value)| {
                        key.trim().eq_ignore_ascii_case("return")
                            && value.trim().trim_matches('"').eq_ignore_ascii_case("representation")
                    })
                    .unwrap_or(false)
            })
    }

    /// True when `X-MobileMe-DAV-Options` asks for changed data to be echoed.
    pub fn return_changed_data(&self) -> bool {
        self.header(header::MOBILEME_DAV_OPTIONS)
            .map(|options| options.contains("return-changed-data"))
            .unwrap_or(false)
    }

    pub fn content_type(&self) -> Option<MediaType> {
        self.header(header::CONTENT_TYPE).and_then(MediaType::parse)
    }

    /// `filename` parameter of `Content-Disposition`.
    pub fn content_disposition_filename(&self) -> Option<String> {
        let value = self.header(header::CONTENT_DISPOSITION)?;
        value.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("filename") {
                let filename = value.trim().trim_matches('"');
                (!filename.is_empty()).then(|| filename.to_string())
            } else {
                None
            }
        })
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// A protocol response produced by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct DavResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DavResponse {
    /// Status-only response.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Plain text response with a human-readable message.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self::with_body(status, "text/plain; charset=utf-8", message.into())
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(status);
        response.set_header(header::CONTENT_TYPE, content_type);
        response.body = body.into();
        response
    }

    /// Structured `DAV:error` response.
    pub fn error_element(status: StatusCode, element: &ErrorElement, message: Option<&str>) -> Self {
        Self::with_body(
            status,
            multistatus::XML_CONTENT_TYPE,
            multistatus::error_document(element, message),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Replace a header value.
    pub fn set_header(&mut self, name: &'static str, value: impl AsRef<str>) {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!("Dropping invalid value for response header '{}'", name),
        }
    }

    pub fn remove_header(&mut self, name: &'static str) {
        self.headers.remove(name);
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_query_and_headers() {
        let request = DavRequest::new(DavMethod::Post, "/calendars/__uids__/a/cal/x.ics?action=split&rid=20240101T000000Z")
            .with_header(header::OVERWRITE, "F")
            .with_header(header::PREFER, "return=representation");
        assert_eq!(request.path, "/calendars/__uids__/a/cal/x.ics");
        assert_eq!(request.query_param("action"), Some("split"));
        assert!(!request.overwrite());
        assert!(request.prefers_representation());
    }

    #[test]
    fn test_overwrite_defaults_true() {
        let request = DavRequest::new(DavMethod::Move, "/x");
        assert!(request.overwrite());
    }

    #[test]
    fn test_destination_strips_authority() {
        let request = DavRequest::new(DavMethod::Move, "/a")
            .with_header(header::DESTINATION, "https://cal.example.com/calendars/__uids__/u/c/b.ics");
        assert_eq!(
            request.destination().as_deref(),
            Some("/calendars/__uids__/u/c/b.ics")
        );
    }

    #[test]
    fn test_content_disposition_filename() {
        let request = DavRequest::new(DavMethod::Post, "/a")
            .with_header(header::CONTENT_DISPOSITION, "attachment; filename=\"agenda.pdf\"");
        assert_eq!(request.content_disposition_filename().as_deref(), Some("agenda.pdf"));
    }

    #[test]
    fn test_media_type_parse() {
        let media = MediaType::parse("Text/Calendar; charset=\"utf-8\"").unwrap();
        assert_eq!(media.essence(), "text/calendar");
        assert_eq!(media.param("charset"), Some("utf-8"));
        assert!(MediaType::parse("garbage").is_none());
    }

    #[test]
    fn test_negotiate() {
        let supported = ["text/calendar", "application/calendar+json"];
        assert_eq!(negotiate(None, &supported), Some("text/calendar"));
        assert_eq!(
            negotiate(Some("application/calendar+json"), &supported),
            Some("application/calendar+json")
        );
        assert_eq!(negotiate(Some("text/*"), &supported), Some("text/calendar"));
        assert_eq!(
            negotiate(Some("text/calendar;q=0.1, application/calendar+json"), &supported),
            Some("application/calendar+json")
        );
        assert_eq!(negotiate(Some("image/png"), &supported), None);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("mkcalendar".parse::<DavMethod>().unwrap(), DavMethod::Mkcalendar);
        assert!("BREW".parse::<DavMethod>().is_err());
    }
}
