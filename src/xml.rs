//! Minimal XML request-body reader.
//!
//! Request bodies the bridge has to look inside (multiput batches, ACL
//! simulations, PROPPATCH documents) are small, so they are read into a light
//! element tree. Namespace prefixes are resolved against the `xmlns`
//! declarations in scope; elements are matched by namespace and local name.

use crate::error::{DavError, DavResult};
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;

/// One element of a parsed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub namespace: Option<String>,
    pub local: String,
    /// Non-namespace attributes by local name
    pub attributes: Vec<(String, String)>,
    /// Concatenated character data directly inside this element
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// True for `{namespace}local`.
    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.local == local && self.namespace.as_deref() == Some(namespace)
    }

    /// First child with the given qualified name.
    pub fn child(&self, namespace: &str, local: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.is(namespace, local))
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        local: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children
            .iter()
            .filter(move |child| child.is(namespace, local))
    }

    /// All descendants (depth first) with the given qualified name.
    pub fn descendants<'a>(&'a self, namespace: &str, local: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.is(namespace, local) {
                found.push(child);
            }
            child.descendants(namespace, local, found);
        }
    }

    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn split_qname(raw: &[u8]) -> (Option<String>, String) {
    let name = String::from_utf8_lossy(raw);
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.into_owned()),
    }
}

fn malformed(detail: impl std::fmt::Display) -> DavError {
    DavError::bad_request(format!("Invalid XML request body: {detail}"))
}

/// Character data for a predefined or numeric entity reference.
fn resolve_entity(name: &[u8]) -> Option<String> {
    match name {
        b"lt" => Some("<".to_string()),
        b"gt" => Some(">".to_string()),
        b"amp" => Some("&".to_string()),
        b"quot" => Some("\"".to_string()),
        b"apos" => Some("'".to_string()),
        _ => {
            let name = std::str::from_utf8(name).ok()?;
            let code = if let Some(hex) = name.strip_prefix("#x") {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code).map(String::from)
        }
    }
}

struct TreeBuilder {
    scopes: Vec<HashMap<Option<String>, String>>,
    stack: Vec<Element>,
    root: Option<Element>,
}

impl TreeBuilder {
    fn resolve(&self, prefix: &Option<String>) -> Option<String> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(prefix).cloned())
    }

    fn open(&mut self, start: &BytesStart<'_>) -> DavResult<()> {
        let mut scope = HashMap::new();
        let mut attributes = Vec::new();
        for attribute in start.attributes().with_checks(false) {
            let attribute = attribute.map_err(malformed)?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute.unescape_value().map_err(malformed)?.into_owned();
            if key == "xmlns" {
                scope.insert(None, value);
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                scope.insert(Some(prefix.to_string()), value);
            } else {
                let local = key.rsplit(':').next().unwrap_or(&key).to_string();
                attributes.push((local, value));
            }
        }
        self.scopes.push(scope);

        let (prefix, local) = split_qname(start.name().as_ref());
        let namespace = self.resolve(&prefix);
        self.stack.push(Element {
            namespace,
            local,
            attributes,
            ..Default::default()
        });
        Ok(())
    }

    fn close(&mut self) -> DavResult<()> {
        self.scopes.pop();
        let element = self
            .stack
            .pop()
            .ok_or_else(|| malformed("unbalanced end tag"))?;
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => self.root = Some(element),
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if let Some(current) = self.stack.last_mut() {
            current.text.push_str(text);
        }
    }
}

/// Parse a request body into its root element.
pub fn parse_document(body: &[u8]) -> DavResult<Element> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(false);

    let mut builder = TreeBuilder {
        scopes: Vec::new(),
        stack: Vec::new(),
        root: None,
    };
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => builder.open(&e)?,
            Ok(Event::Empty(e)) => {
                builder.open(&e)?;
                builder.close()?;
            }
            Ok(Event::End(_)) => builder.close()?,
            Ok(Event::Text(e)) => {
                let raw = std::str::from_utf8(e.as_ref()).map_err(malformed)?;
                let text = unescape(raw).map_err(malformed)?;
                builder.text(&text);
            }
            Ok(Event::CData(e)) => {
                builder.text(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) => {
                let raw: &[u8] = &e;
                let resolved = resolve_entity(raw)
                    .ok_or_else(|| malformed(format!("unknown entity '{}'", String::from_utf8_lossy(raw))))?;
                builder.text(&resolved);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(e)),
            _ => {}
        }
        buf.clear();
    }

    if !builder.stack.is_empty() {
        return Err(malformed("unclosed element"));
    }
    builder.root.ok_or_else(|| malformed("no root element"))
}
