//! Parsed calendar and contact items.
//!
//! The bridge treats item data as opaque apart from the handful of facts it
//! needs to route requests: the UID, the component type a calendar collection
//! restricts on, group membership for address-book batches, and the
//! organizer/attendee identities used by attachment ACLs. Full iCalendar and
//! vCard handling belongs to the host; it plugs in through [`ComponentParser`].
//! [`TextComponentParser`] is a line-oriented default good enough for tests
//! and simple deployments.

use crate::storage::StoreKind;
use std::collections::BTreeSet;

/// One parsed calendar object or vCard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub kind: StoreKind,
    pub uid: String,
    pub text: String,
    /// First non-timezone calendar component (`VEVENT`, `VTODO`, ...)
    pub component_type: Option<String>,
    /// `X-ADDRESSBOOKSERVER-KIND` of a vCard, lower-cased
    pub vcard_kind: Option<String>,
    /// Member UIDs of a vCard group
    pub members: BTreeSet<String>,
    pub organizer: Option<String>,
    pub attendees: Vec<String>,
    pub recurring: bool,
}

impl Component {
    pub fn is_group(&self) -> bool {
        self.vcard_kind.as_deref() == Some("group")
    }

    /// Calendar objects with an organizer take part in implicit scheduling.
    pub fn is_scheduling_object(&self) -> bool {
        self.kind == StoreKind::Calendar && self.organizer.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("No data")]
    Empty,

    #[error("Can't parse data: {0}")]
    Malformed(String),

    #[error("Missing UID")]
    MissingUid,

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// The patch document itself is invalid
    #[error("Invalid patch data: {0}")]
    InvalidData(String),

    /// The patch is valid but does not apply to the current data
    #[error("Patch does not apply: {0}")]
    CannotApply(String),
}

/// Host-supplied parsing and serialization of item data.
pub trait ComponentParser: Send + Sync {
    /// Media types the parser can read and render, preferred first.
    fn media_types(&self, kind: StoreKind) -> Vec<&'static str>;

    /// Parse a single item.
    fn parse(&self, kind: StoreKind, data: &[u8]) -> Result<Component, ParseError>;

    /// Split a batch body into items. `None` means nothing recognisable was
    /// found; individual items may still fail to parse.
    fn parse_batch(
        &self,
        kind: StoreKind,
        data: &[u8],
    ) -> Option<Vec<Result<Component, ParseError>>>;

    /// Apply a PATCH document to the current item.
    fn apply_patch(&self, current: &Component, patch: &[u8]) -> Result<Component, PatchError>;

    /// Render an item in one of [`media_types`](Self::media_types).
    fn render(&self, component: &Component, media_type: &str) -> Result<String, ParseError>;
}

/// Line-oriented parser for `text/calendar` and `text/vcard` data.
///
/// The PATCH format it accepts is one instruction per line:
/// `SET NAME:value` replaces (or appends) a property, `DELETE NAME` removes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextComponentParser;

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        let raw = raw.trim_end_matches('\r');
        if let Some(continuation) = raw.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(continuation);
                continue;
            }
        }
        if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

/// Split a content line into (upper-cased name, value).
fn split_line(line: &str) -> Option<(String, &str)> {
    let (head, value) = line.split_once(':')?;
    let name = head.split(';').next()?.trim().to_ascii_uppercase();
    Some((name, value))
}

fn calendar_user(value: &str) -> String {
    let value = value.trim();
    for prefix in ["urn:x-uid:", "urn:uuid:", "mailto:"] {
        if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
            return value[prefix.len()..].to_string();
        }
    }
    value.to_string()
}

fn root_name(kind: StoreKind) -> &'static str {
    match kind {
        StoreKind::Calendar => "VCALENDAR",
        StoreKind::AddressBook => "VCARD",
    }
}

impl TextComponentParser {
    fn parse_lines(kind: StoreKind, lines: &[String]) -> Result<Component, ParseError> {
        let root = root_name(kind);
        let first = lines.first().ok_or(ParseError::Empty)?;
        if !first.eq_ignore_ascii_case(&format!("BEGIN:{root}")) {
            return Err(ParseError::Malformed(format!("expected BEGIN:{root}")));
        }
        let last = lines.last().ok_or(ParseError::Empty)?;
        if !last.eq_ignore_ascii_case(&format!("END:{root}")) {
            return Err(ParseError::Malformed(format!("expected END:{root}")));
        }

        let mut uid = None;
        let mut component_type = None;
        let mut vcard_kind = None;
        let mut members = BTreeSet::new();
        let mut organizer = None;
        let mut attendees = Vec::new();
        let mut recurring = false;
        let mut depth = 0usize;

        for line in lines {
            let Some((name, value)) = split_line(line) else {
                return Err(ParseError::Malformed(format!("invalid content line '{line}'")));
            };
            match name.as_str() {
                "BEGIN" => {
                    depth += 1;
                    let component = value.trim().to_ascii_uppercase();
                    if depth == 2 && component != "VTIMEZONE" && component_type.is_none() {
                        component_type = Some(component);
                    }
                }
                "END" => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| ParseError::Malformed("unbalanced END".to_string()))?;
                }
                "UID" if uid.is_none() => uid = Some(value.trim().to_string()),
                "X-ADDRESSBOOKSERVER-KIND" => {
                    vcard_kind = Some(value.trim().to_ascii_lowercase());
                }
                "X-ADDRESSBOOKSERVER-MEMBER" => {
                    members.insert(calendar_user(value));
                }
                "ORGANIZER" => organizer = Some(calendar_user(value)),
                "ATTENDEE" => attendees.push(calendar_user(value)),
                "RRULE" | "RDATE" => recurring = true,
                _ => {}
            }
        }
        if depth != 0 {
            return Err(ParseError::Malformed("unbalanced BEGIN".to_string()));
        }

        let uid = uid.filter(|uid| !uid.is_empty()).ok_or(ParseError::MissingUid)?;
        let mut text = lines.join("\r\n");
        text.push_str("\r\n");
        Ok(Component {
            kind,
            uid,
            text,
            component_type,
            vcard_kind,
            members,
            organizer,
            attendees,
            recurring,
        })
    }
}

impl ComponentParser for TextComponentParser {
    fn media_types(&self, kind: StoreKind) -> Vec<&'static str> {
        vec![kind.media_type()]
    }

    fn parse(&self, kind: StoreKind, data: &[u8]) -> Result<Component, ParseError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ParseError::Malformed(format!("invalid UTF-8: {e}")))?;
        let lines = unfold(text);
        if lines.is_empty() {
            return Err(ParseError::Empty);
        }
        Self::parse_lines(kind, &lines)
    }

    fn parse_batch(
        &self,
        kind: StoreKind,
        data: &[u8],
    ) -> Option<Vec<Result<Component, ParseError>>> {
        let text = std::str::from_utf8(data).ok()?;
        let root = root_name(kind);
        let begin = format!("BEGIN:{root}");
        let end = format!("END:{root}");

        let mut items = Vec::new();
        let mut current: Option<Vec<String>> = None;
        for line in unfold(text) {
            if line.eq_ignore_ascii_case(&begin) && current.is_none() {
                current = Some(vec![line]);
            } else if let Some(block) = current.as_mut() {
                let closes = line.eq_ignore_ascii_case(&end);
                block.push(line);
                if closes {
                    if let Some(block) = current.take() {
                        items.push(Self::parse_lines(kind, &block));
                    }
                }
            }
        }
        if let Some(block) = current {
            items.push(Self::parse_lines(kind, &block));
        }
        (!items.is_empty()).then_some(items)
    }

    fn apply_patch(&self, current: &Component, patch: &[u8]) -> Result<Component, PatchError> {
        let patch = std::str::from_utf8(patch)
            .map_err(|e| PatchError::InvalidData(format!("invalid UTF-8: {e}")))?;
        let mut lines = unfold(&current.text);

        for instruction in patch.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (verb, rest) = instruction
                .split_once(' ')
                .ok_or_else(|| PatchError::InvalidData(format!("no operand in '{instruction}'")))?;
            match verb.to_ascii_uppercase().as_str() {
                "SET" => {
                    let (name, _) = split_line(rest).ok_or_else(|| {
                        PatchError::InvalidData(format!("invalid property '{rest}'"))
                    })?;
                    if name == "UID" || name == "BEGIN" || name == "END" {
                        return Err(PatchError::CannotApply(format!("{name} cannot be patched")));
                    }
                    let position = lines
                        .iter()
                        .position(|line| split_line(line).map(|(n, _)| n == name).unwrap_or(false));
                    match position {
                        Some(index) => lines[index] = rest.to_string(),
                        None => {
                            // Append inside the first nested component.
                            let index = lines
                                .iter()
                                .skip(1)
                                .position(|line| line.to_ascii_uppercase().starts_with("END:"))
                                .map(|index| index + 1)
                                .unwrap_or(lines.len().saturating_sub(1));
                            lines.insert(index, rest.to_string());
                        }
                    }
                }
                "DELETE" => {
                    let name = rest.trim().to_ascii_uppercase();
                    let before = lines.len();
                    lines.retain(|line| split_line(line).map(|(n, _)| n != name).unwrap_or(true));
                    if lines.len() == before {
                        return Err(PatchError::CannotApply(format!("no {name} property to delete")));
                    }
                }
                other => {
                    return Err(PatchError::InvalidData(format!("unknown patch verb '{other}'")));
                }
            }
        }

        Self::parse_lines(current.kind, &lines)
            .map_err(|e| PatchError::CannotApply(e.to_string()))
    }

    fn render(&self, component: &Component, media_type: &str) -> Result<String, ParseError> {
        if media_type.eq_ignore_ascii_case(component.kind.media_type()) {
            Ok(component.text.clone())
        } else {
            Err(ParseError::UnsupportedMediaType(media_type.to_string()))
        }
    }
}
