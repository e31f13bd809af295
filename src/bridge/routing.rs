//! URL layout served by the bridge.
//!
//! ```text
//! /calendars/__uids__/{home}/{calendar}/{object}
//! /calendars/__uids__/{home}/dropbox/{dropbox-id}/{attachment}
//! /calendars/__uids__/{home}/attachments/{dropbox-id}/{attachment}
//! /calendars/__uids__/{home}/notification/{name}
//! /addressbooks/__uids__/{home}/{addressbook}/{object}
//! ```
//!
//! Paths are expected to be percent-decoded by the host. Homes themselves
//! and principal URLs are served by the host, not the bridge.

use crate::attachment::AttachmentMode;
use crate::storage::{CollectionKey, ObjectKey, StoreKind};

/// Segment between the kind root and the home name.
pub const UIDS_SEGMENT: &str = "__uids__";

/// A parsed request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Collection(CollectionKey),
    Object(ObjectKey),
    AttachmentHome {
        mode: AttachmentMode,
        home: String,
    },
    AttachmentCollection {
        mode: AttachmentMode,
        home: String,
        dropbox_id: String,
    },
    Attachment {
        mode: AttachmentMode,
        home: String,
        dropbox_id: String,
        name: String,
    },
    Notifications {
        home: String,
    },
    Notification {
        home: String,
        name: String,
    },
}

fn attachment_mode(segment: &str) -> Option<AttachmentMode> {
    match segment {
        "dropbox" => Some(AttachmentMode::Dropbox),
        "attachments" => Some(AttachmentMode::Managed),
        _ => None,
    }
}

/// Parse `path`; `None` for anything outside the layout.
pub fn route(path: &str) -> Option<Route> {
    let trailing_slash = path.ends_with('/');
    let trimmed = path.trim_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return None;
    }

    let kind = match segments.first().copied()? {
        "calendars" => StoreKind::Calendar,
        "addressbooks" => StoreKind::AddressBook,
        _ => return None,
    };
    if segments.get(1).copied()? != UIDS_SEGMENT {
        return None;
    }
    let home = segments.get(2).copied()?.to_string();
    let rest = &segments[3..];

    if kind == StoreKind::Calendar {
        if let Some(first) = rest.first() {
            if let Some(mode) = attachment_mode(first) {
                return match rest {
                    [_] => Some(Route::AttachmentHome { mode, home }),
                    [_, id] => Some(Route::AttachmentCollection {
                        mode,
                        home,
                        dropbox_id: id.to_string(),
                    }),
                    [_, id, name] if !trailing_slash => Some(Route::Attachment {
                        mode,
                        home,
                        dropbox_id: id.to_string(),
                        name: name.to_string(),
                    }),
                    _ => None,
                };
            }
            if *first == "notification" {
                return match rest {
                    [_] => Some(Route::Notifications { home }),
                    [_, name] if !trailing_slash => Some(Route::Notification {
                        home,
                        name: name.to_string(),
                    }),
                    _ => None,
                };
            }
        }
    }

    match rest {
        [collection] => Some(Route::Collection(CollectionKey::new(kind, home, *collection))),
        [collection, name] if !trailing_slash => {
            Some(Route::Object(CollectionKey::new(kind, home, *collection).object(*name)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collections_and_objects() {
        assert_eq!(
            route("/calendars/__uids__/alice/work/"),
            Some(Route::Collection(CollectionKey::new(StoreKind::Calendar, "alice", "work")))
        );
        assert_eq!(
            route("/calendars/__uids__/alice/work"),
            Some(Route::Collection(CollectionKey::new(StoreKind::Calendar, "alice", "work")))
        );
        assert_eq!(
            route("/addressbooks/__uids__/alice/contacts/c.vcf"),
            Some(Route::Object(
                CollectionKey::new(StoreKind::AddressBook, "alice", "contacts").object("c.vcf")
            ))
        );
    }

    #[test]
    fn test_attachment_routes() {
        assert_eq!(
            route("/calendars/__uids__/alice/dropbox/"),
            Some(Route::AttachmentHome {
                mode: AttachmentMode::Dropbox,
                home: "alice".to_string(),
            })
        );
        assert_eq!(
            route("/calendars/__uids__/alice/attachments/abc.dropbox/notes.txt"),
            Some(Route::Attachment {
                mode: AttachmentMode::Managed,
                home: "alice".to_string(),
                dropbox_id: "abc.dropbox".to_string(),
                name: "notes.txt".to_string(),
            })
        );
        // Address books have no dropboxes
        assert_eq!(
            route("/addressbooks/__uids__/alice/dropbox/"),
            Some(Route::Collection(CollectionKey::new(StoreKind::AddressBook, "alice", "dropbox")))
        );
    }

    #[test]
    fn test_notifications() {
        assert_eq!(
            route("/calendars/__uids__/alice/notification/"),
            Some(Route::Notifications {
                home: "alice".to_string()
            })
        );
        assert_eq!(
            route("/calendars/__uids__/alice/notification/n1.xml"),
            Some(Route::Notification {
                home: "alice".to_string(),
                name: "n1.xml".to_string(),
            })
        );
    }

    #[test]
    fn test_outside_layout() {
        assert_eq!(route("/"), None);
        assert_eq!(route("/calendars/__uids__/alice/"), None);
        assert_eq!(route("/calendars/users/alice/work/"), None);
        assert_eq!(route("/principals/__uids__/alice/"), None);
        assert_eq!(route("/calendars/__uids__/alice/work/e.ics/"), None);
        assert_eq!(route("/calendars/__uids__/alice//e.ics"), None);
        assert_eq!(route("/calendars/__uids__/alice/work/a/b"), None);
    }
}
