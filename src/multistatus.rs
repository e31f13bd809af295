//! Multistatus and error XML bodies.
//!
//! Batch operations and cascading deletes answer with one `DAV:multistatus`
//! document holding an entry per item. An entry is either a property-status
//! success (entity tag and optionally the stored data) or a bare status with an
//! optional structured error.

use crate::error::{DavError, DavResult, ErrorElement, ns};
use crate::protocol::DavResponse;
use crate::storage::PropertyName;
use bytes::Bytes;
use http::StatusCode;
use log::warn;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

pub const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

const PREFIXES: [(&str, &str); 5] = [
    (ns::DAV, "D"),
    (ns::CALDAV, "C"),
    (ns::CARDDAV, "A"),
    (ns::CALENDARSERVER, "CS"),
    (ns::MOBILEME, "M"),
];

fn prefix_for(namespace: &str) -> Option<&'static str> {
    PREFIXES
        .iter()
        .find(|(uri, _)| *uri == namespace)
        .map(|(_, prefix)| *prefix)
}

/// A property echoed in a successful entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prop {
    GetEtag(String),
    ScheduleTag(String),
    Uid(String),
    /// `calendar-data` or `address-data`
    Data {
        namespace: &'static str,
        name: &'static str,
        text: String,
    },
    /// Empty element naming a property, as in a PROPPATCH result
    Name(PropertyName),
}

/// One `DAV:response` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEntry {
    PropStat {
        href: String,
        props: Vec<Prop>,
        status: StatusCode,
    },
    Status {
        href: String,
        status: StatusCode,
        error: Option<ErrorElement>,
        uid: Option<String>,
    },
}

impl ResponseEntry {
    pub fn status_only(href: impl Into<String>, status: StatusCode) -> Self {
        ResponseEntry::Status {
            href: href.into(),
            status,
            error: None,
            uid: None,
        }
    }

    pub fn href(&self) -> &str {
        match self {
            ResponseEntry::PropStat { href, .. } | ResponseEntry::Status { href, .. } => href,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ResponseEntry::PropStat { status, .. } | ResponseEntry::Status { status, .. } => *status,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            ResponseEntry::PropStat { props, .. } => props.iter().find_map(|prop| match prop {
                Prop::GetEtag(etag) => Some(etag.as_str()),
                _ => None,
            }),
            ResponseEntry::Status { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorElement> {
        match self {
            ResponseEntry::Status { error, .. } => error.as_ref(),
            ResponseEntry::PropStat { .. } => None,
        }
    }
}

/// Ordered collection of per-item outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiStatus {
    entries: Vec<ResponseEntry>,
}

impl MultiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ResponseEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ResponseEntry] {
        &self.entries
    }

    /// Serialize to a `DAV:multistatus` document.
    pub fn to_xml(&self) -> DavResult<Bytes> {
        let mut writer = Writer::new(Vec::new());
        emit(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)),
        )?;

        let mut root = BytesStart::new("D:multistatus");
        for (uri, prefix) in PREFIXES {
            root.push_attribute((format!("xmlns:{prefix}").as_str(), uri));
        }
        emit(&mut writer, Event::Start(root))?;

        for entry in &self.entries {
            write_entry(&mut writer, entry)?;
        }

        emit(&mut writer, Event::End(BytesEnd::new("D:multistatus")))?;
        Ok(Bytes::from(writer.into_inner()))
    }

    /// Render as a 207 response.
    pub fn into_response(self) -> DavResult<DavResponse> {
        let body = self.to_xml()?;
        Ok(DavResponse::with_body(
            StatusCode::MULTI_STATUS,
            XML_CONTENT_TYPE,
            body,
        ))
    }
}

impl FromIterator<ResponseEntry> for MultiStatus {
    fn from_iter<I: IntoIterator<Item = ResponseEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> DavResult<()> {
    writer
        .write_event(event)
        .map_err(|e| DavError::internal(format!("Failed to write XML: {e}")))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> DavResult<()> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &ErrorElement) -> DavResult<()> {
    let (name, declaration) = match prefix_for(element.namespace) {
        Some(prefix) => (format!("{prefix}:{}", element.name), None),
        None => (element.name.to_string(), Some(element.namespace)),
    };
    let mut start = BytesStart::new(name.as_str());
    if let Some(namespace) = declaration {
        start.push_attribute(("xmlns", namespace));
    }
    match &element.text {
        Some(text) => {
            emit(writer, Event::Start(start))?;
            emit(writer, Event::Text(BytesText::new(text)))?;
            emit(writer, Event::End(BytesEnd::new(name.as_str())))
        }
        None => emit(writer, Event::Empty(start)),
    }
}

fn write_prop(writer: &mut Writer<Vec<u8>>, prop: &Prop) -> DavResult<()> {
    match prop {
        Prop::GetEtag(etag) => text_element(writer, "D:getetag", etag),
        Prop::ScheduleTag(tag) => text_element(writer, "C:schedule-tag", tag),
        Prop::Uid(uid) => text_element(writer, "CS:uid", uid),
        Prop::Data {
            namespace,
            name,
            text,
        } => {
            let prefix = prefix_for(namespace).unwrap_or("C");
            text_element(writer, &format!("{prefix}:{name}"), text)
        }
        Prop::Name(property) => match prefix_for(&property.namespace) {
            Some(prefix) => emit(
                writer,
                Event::Empty(BytesStart::new(format!("{prefix}:{}", property.name))),
            ),
            None => {
                let mut start = BytesStart::new(property.name.as_str());
                start.push_attribute(("xmlns", property.namespace.as_str()));
                emit(writer, Event::Empty(start))
            }
        },
    }
}

fn write_entry(writer: &mut Writer<Vec<u8>>, entry: &ResponseEntry) -> DavResult<()> {
    emit(writer, Event::Start(BytesStart::new("D:response")))?;
    match entry {
        ResponseEntry::PropStat {
            href,
            props,
            status,
        } => {
            text_element(writer, "D:href", href)?;
            emit(writer, Event::Start(BytesStart::new("D:propstat")))?;
            emit(writer, Event::Start(BytesStart::new("D:prop")))?;
            for prop in props {
                write_prop(writer, prop)?;
            }
            emit(writer, Event::End(BytesEnd::new("D:prop")))?;
            text_element(writer, "D:status", &status_line(*status))?;
            emit(writer, Event::End(BytesEnd::new("D:propstat")))?;
        }
        ResponseEntry::Status {
            href,
            status,
            error,
            uid,
        } => {
            text_element(writer, "D:href", href)?;
            text_element(writer, "D:status", &status_line(*status))?;
            if let Some(element) = error {
                emit(writer, Event::Start(BytesStart::new("D:error")))?;
                write_element(writer, element)?;
                if let Some(uid) = uid {
                    text_element(writer, "CS:uid", uid)?;
                }
                emit(writer, Event::End(BytesEnd::new("D:error")))?;
            }
        }
    }
    emit(writer, Event::End(BytesEnd::new("D:response")))
}

fn write_error_document(element: &ErrorElement, message: Option<&str>) -> DavResult<Bytes> {
    let mut writer = Writer::new(Vec::new());
    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)),
    )?;
    let mut root = BytesStart::new("D:error");
    for (uri, prefix) in PREFIXES {
        root.push_attribute((format!("xmlns:{prefix}").as_str(), uri));
    }
    emit(&mut writer, Event::Start(root))?;
    write_element(&mut writer, element)?;
    if let Some(message) = message {
        text_element(&mut writer, "D:responsedescription", message)?;
    }
    emit(&mut writer, Event::End(BytesEnd::new("D:error")))?;
    Ok(Bytes::from(writer.into_inner()))
}

/// A `DAV:error` document naming one violated precondition.
pub fn error_document(element: &ErrorElement, message: Option<&str>) -> Bytes {
    write_error_document(element, message).unwrap_or_else(|e| {
        warn!("Could not render error body for {}: {}", element, e);
        Bytes::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::precondition;

    #[test]
    fn test_multistatus_preserves_entry_order() {
        let mut multistatus = MultiStatus::new();
        multistatus.push(ResponseEntry::PropStat {
            href: "/c/1.ics".to_string(),
            props: vec![Prop::GetEtag("\"a\"".to_string()), Prop::Uid("u1".to_string())],
            status: StatusCode::OK,
        });
        multistatus.push(ResponseEntry::Status {
            href: String::new(),
            status: StatusCode::FORBIDDEN,
            error: Some(precondition::CALDAV_NO_UID_CONFLICT),
            uid: Some("u2".to_string()),
        });

        let xml = String::from_utf8(multistatus.to_xml().unwrap().to_vec()).unwrap();
        let first = xml.find("/c/1.ics").unwrap();
        let second = xml.find("HTTP/1.1 403 Forbidden").unwrap();
        assert!(first < second);
        assert!(xml.contains("<C:no-uid-conflict/>"));
        assert!(xml.contains("<CS:uid>u2</CS:uid>"));
        assert!(xml.contains("&quot;a&quot;") || xml.contains("\"a\""));
    }

    #[test]
    fn test_text_is_escaped() {
        let multistatus: MultiStatus = vec![ResponseEntry::PropStat {
            href: "/c/a&b.ics".to_string(),
            props: vec![],
            status: StatusCode::OK,
        }]
        .into_iter()
        .collect();
        let xml = String::from_utf8(multistatus.to_xml().unwrap().to_vec()).unwrap();
        assert!(xml.contains("/c/a&amp;b.ics"));
    }

    #[test]
    fn test_error_document_with_text() {
        let element = precondition::MAX_INSTANCES.with_text("3000");
        let body = error_document(&element, Some("Too many instances"));
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains("<C:max-instances>3000</C:max-instances>"));
        assert!(xml.contains("Too many instances"));
    }

    #[test]
    fn test_property_names_declare_unknown_namespaces() {
        let multistatus: MultiStatus = vec![ResponseEntry::PropStat {
            href: "/c/a.ics".to_string(),
            props: vec![
                Prop::Name(PropertyName::new(ns::DAV, "displayname")),
                Prop::Name(PropertyName::new("urn:example", "color")),
            ],
            status: StatusCode::OK,
        }]
        .into_iter()
        .collect();
        let xml = String::from_utf8(multistatus.to_xml().unwrap().to_vec()).unwrap();
        assert!(xml.contains("<D:displayname/>"));
        assert!(xml.contains("<color xmlns=\"urn:example\"/>"));
    }

    #[test]
    fn test_into_response_is_207() {
        let response = MultiStatus::new().into_response().unwrap();
        assert_eq!(response.status, StatusCode::MULTI_STATUS);
    }
}
