//! Effective ACLs for shared and attachment resources.
//!
//! Every list starts from the owner's grants, then adds proxy principals and
//! the grants implied by accepted sharing invites. Attachment collections are
//! governed by the attendees of the item they belong to, not by the item's
//! sharing state.

use super::{
    Ace, Acl, DelegatedAccess, DelegationResolver, PRINCIPAL_UIDS_PREFIX, Privilege,
    principal_url, proxy_read_url, proxy_write_url,
};
use crate::error::{DavError, DavResult, ns};
use crate::storage::{BindMode, Invite, InviteStatus, ObjectInfo};
use crate::xml;
use log::debug;

const READ: [Privilege; 2] = [Privilege::Read, Privilege::ReadCurrentUserPrivilegeSet];
const READ_WRITE: [Privilege; 3] = [
    Privilege::Read,
    Privilege::ReadCurrentUserPrivilegeSet,
    Privilege::Write,
];

/// Access a sharee ends up with after resolving an invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedAccess {
    ReadOnly,
    ReadWrite,
}

/// Resolve the access an accepted invite grants.
///
/// `None` means the invite adds nothing: either the external resolver denied
/// access or the sharee simply inherits the owner's ACL.
pub fn shared_access(invite: &Invite, delegation: &dyn DelegationResolver) -> Option<SharedAccess> {
    match invite.mode {
        BindMode::Read => Some(SharedAccess::ReadOnly),
        BindMode::Write => Some(SharedAccess::ReadWrite),
        BindMode::Direct => match delegation.access(&invite.owner_uid, &invite.sharee_uid) {
            DelegatedAccess::Own | DelegatedAccess::ReadWrite => Some(SharedAccess::ReadWrite),
            DelegatedAccess::ReadOnly => Some(SharedAccess::ReadOnly),
            DelegatedAccess::Original | DelegatedAccess::None => None,
        },
        BindMode::Own => None,
    }
}

fn accepted(invites: &[Invite]) -> impl Iterator<Item = &Invite> {
    invites
        .iter()
        .filter(|invite| invite.status == InviteStatus::Accepted)
}

/// Attendee addresses that name a local principal. Email-style addresses do
/// not resolve to principals and are skipped.
fn attendee_uids(object: &ObjectInfo) -> impl Iterator<Item = &str> {
    object
        .attendees
        .iter()
        .map(String::as_str)
        .filter(|attendee| !attendee.is_empty() && !attendee.contains('@'))
}

fn owner_ace(owner_uid: &str) -> Ace {
    Ace::grant(principal_url(owner_uid), &[Privilege::All])
}

/// ACL of a calendar or address-book collection.
pub fn collection_acl(
    owner_uid: &str,
    invites: &[Invite],
    enable_proxies: bool,
    delegation: &dyn DelegationResolver,
) -> Acl {
    let mut aces = vec![owner_ace(owner_uid)];
    if enable_proxies {
        aces.push(Ace::grant(proxy_read_url(owner_uid), &READ));
        aces.push(Ace::grant(proxy_write_url(owner_uid), &READ_WRITE));
    }

    for invite in accepted(invites) {
        let privileges: &[Privilege] = match shared_access(invite, delegation) {
            Some(SharedAccess::ReadOnly) => &READ,
            Some(SharedAccess::ReadWrite) => &READ_WRITE,
            None => continue,
        };
        aces.push(Ace::grant(principal_url(&invite.sharee_uid), privileges));
        if enable_proxies {
            aces.push(Ace::grant(proxy_read_url(&invite.sharee_uid), &READ));
            aces.push(Ace::grant(proxy_write_url(&invite.sharee_uid), privileges));
        }
    }
    Acl::new(aces)
}

/// ACL of an item's legacy dropbox collection.
pub fn dropbox_acl(
    owner_uid: &str,
    object: &ObjectInfo,
    invites: &[Invite],
    enable_proxies: bool,
    attendees_can_write: bool,
) -> Acl {
    let mut aces = vec![owner_ace(owner_uid)];
    if enable_proxies {
        aces.push(Ace::grant(proxy_write_url(owner_uid), &[Privilege::WriteAcl]));
    }

    let privileges: &[Privilege] = if attendees_can_write { &READ_WRITE } else { &READ };
    for attendee in attendee_uids(object) {
        aces.push(Ace::grant(principal_url(attendee), privileges));
        aces.push(Ace::grant(proxy_write_url(attendee), privileges));
        aces.push(Ace::grant(proxy_read_url(attendee), &READ));
    }

    for invite in accepted(invites) {
        let mut user = Vec::new();
        if matches!(invite.mode, BindMode::Read | BindMode::Write) {
            user.extend([
                Privilege::Read,
                Privilege::ReadAcl,
                Privilege::ReadCurrentUserPrivilegeSet,
            ]);
        }
        match invite.mode {
            BindMode::Read => user.push(Privilege::WriteProperties),
            BindMode::Write => user.push(Privilege::Write),
            _ => {}
        }
        if user.is_empty() {
            debug!(
                "Invite for '{}' on a dropbox carries no privileges",
                invite.sharee_uid
            );
            continue;
        }
        let proxy: Vec<Privilege> = user
            .iter()
            .copied()
            .filter(|privilege| *privilege != Privilege::ReadAcl)
            .collect();

        aces.push(Ace::grant(principal_url(&invite.sharee_uid), &user));
        if enable_proxies {
            aces.push(Ace::grant(proxy_read_url(&invite.sharee_uid), &READ));
            aces.push(Ace::grant(proxy_write_url(&invite.sharee_uid), &proxy));
        }
    }
    Acl::new(aces)
}

/// Fixed ACL of the managed attachments home: read access only.
pub fn attachments_home_acl(owner_uid: &str, enable_proxies: bool) -> Acl {
    let mut aces = vec![Ace::grant(principal_url(owner_uid), &READ)];
    if enable_proxies {
        aces.push(Ace::grant(proxy_read_url(owner_uid), &READ));
        aces.push(Ace::grant(proxy_write_url(owner_uid), &READ));
    }
    Acl::new(aces)
}

/// ACL of one item's managed attachment collection.
///
/// Attendees and sharees only ever get read access here; managed attachments
/// are changed through the item, never through this collection.
pub fn attachments_child_acl(
    owner_uid: &str,
    object: &ObjectInfo,
    invites: &[Invite],
    enable_proxies: bool,
    delegation: &dyn DelegationResolver,
) -> Acl {
    let mut acl = attachments_home_acl(owner_uid, enable_proxies);
    if enable_proxies {
        acl.aces
            .push(Ace::grant(proxy_write_url(owner_uid), &[Privilege::WriteAcl]));
    }

    for attendee in attendee_uids(object) {
        acl.aces.push(Ace::grant(principal_url(attendee), &READ));
        acl.aces.push(Ace::grant(proxy_write_url(attendee), &READ));
        acl.aces.push(Ace::grant(proxy_read_url(attendee), &READ));
    }

    for invite in accepted(invites) {
        if shared_access(invite, delegation).is_none() {
            continue;
        }
        acl.aces.push(Ace::grant(principal_url(&invite.sharee_uid), &READ));
        if enable_proxies {
            acl.aces
                .push(Ace::grant(proxy_read_url(&invite.sharee_uid), &READ));
            acl.aces
                .push(Ace::grant(proxy_write_url(&invite.sharee_uid), &READ));
        }
    }
    acl
}

/// ACL of an individually shared address-book object, as seen by a sharee.
pub fn sharee_object_acl(owner_uid: &str, sharee_uid: &str, mode: BindMode) -> Acl {
    let mut sharee = vec![
        Privilege::Read,
        Privilege::ReadAcl,
        Privilege::ReadCurrentUserPrivilegeSet,
    ];
    if mode == BindMode::Write {
        sharee.push(Privilege::Write);
    } else {
        sharee.push(Privilege::WriteProperties);
    }
    Acl::new(vec![
        owner_ace(owner_uid),
        Ace::grant(principal_url(sharee_uid), &sharee),
    ])
}

/// Validate an ACL request against a dropbox without storing anything.
///
/// Every principal named in the request must be an attendee of the item,
/// directly or through one of their proxy principals.
pub fn simulate_dropbox_acl(body: &[u8], attendees: &[String]) -> DavResult<()> {
    let root = xml::parse_document(body)?;
    let mut principals = Vec::new();
    root.descendants(ns::DAV, "principal", &mut principals);

    for principal in principals {
        for href in principal.children_named(ns::DAV, "href") {
            let uri = href.trimmed_text();
            let Some(rest) = uri.strip_prefix(PRINCIPAL_UIDS_PREFIX) else {
                return Err(DavError::forbidden(format!("Unknown principal: {uri}")));
            };
            let mut segments: Vec<&str> = rest.split('/').collect();
            if segments.last() == Some(&"") {
                segments.pop();
            }
            if matches!(
                segments.last(),
                Some(&"calendar-proxy-read") | Some(&"calendar-proxy-write")
            ) {
                segments.pop();
            }
            let [uid] = segments.as_slice() else {
                return Err(DavError::forbidden(format!("Unknown principal: {uri}")));
            };
            if !attendees.iter().any(|attendee| attendee == uid) {
                return Err(DavError::forbidden(format!(
                    "Principal is not an attendee: {uri}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::StaticDelegation;
    use crate::resource::metadata::ObjectMetadata;
    use crate::storage::{CollectionKey, ShareRole, StoreKind};
    use bytes::Bytes;
    use chrono::Utc;

    fn event(attendees: &[&str]) -> ObjectInfo {
        let key = CollectionKey::new(StoreKind::Calendar, "alice", "work").object("e.ics");
        ObjectInfo {
            key,
            uid: "e".to_string(),
            data: Bytes::new(),
            content_type: "text/calendar".to_string(),
            metadata: ObjectMetadata::default(),
            created: Utc::now(),
            modified: Utc::now(),
            in_trash: false,
            dropbox_id: "e.dropbox".to_string(),
            organizer: Some("alice".to_string()),
            attendees: attendees.iter().map(|a| a.to_string()).collect(),
            share_role: ShareRole::Unshared,
            is_shared_group: false,
            vcard_kind: None,
            attachment_count: 1,
        }
    }

    fn invite(sharee: &str, mode: BindMode, status: InviteStatus) -> Invite {
        Invite {
            sharee_uid: sharee.to_string(),
            owner_uid: "alice".to_string(),
            mode,
            status,
        }
    }

    #[test]
    fn test_dropbox_attendees_read_only_by_default() {
        let acl = dropbox_acl("alice", &event(&["bob", "carol@example.com"]), &[], true, false);
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::Read));
        assert!(!acl.grants("/principals/__uids__/bob/", Privilege::Write));
        assert!(acl.grants(
            "/principals/__uids__/alice/calendar-proxy-write/",
            Privilege::WriteAcl
        ));
        // email-only attendees have no principal
        assert!(acl.aces.iter().all(|ace| !ace.principal.contains("carol")));
    }

    #[test]
    fn test_dropbox_attendees_can_write_when_enabled() {
        let acl = dropbox_acl("alice", &event(&["bob"]), &[], false, true);
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::Write));
        assert!(acl.grants(
            "/principals/__uids__/bob/calendar-proxy-write/",
            Privilege::Write
        ));
        assert!(!acl.grants(
            "/principals/__uids__/bob/calendar-proxy-read/",
            Privilege::Write
        ));
    }

    #[test]
    fn test_dropbox_invites() {
        let invites = [
            invite("dave", BindMode::Read, InviteStatus::Accepted),
            invite("erin", BindMode::Write, InviteStatus::Accepted),
            invite("frank", BindMode::Write, InviteStatus::Invited),
        ];
        let acl = dropbox_acl("alice", &event(&[]), &invites, true, false);
        assert!(acl.grants("/principals/__uids__/dave/", Privilege::WriteProperties));
        assert!(!acl.grants("/principals/__uids__/dave/", Privilege::Write));
        assert!(acl.grants("/principals/__uids__/erin/", Privilege::Write));
        assert!(acl.grants("/principals/__uids__/erin/", Privilege::ReadAcl));
        assert!(!acl.grants(
            "/principals/__uids__/erin/calendar-proxy-write/",
            Privilege::ReadAcl
        ));
        assert!(acl.aces.iter().all(|ace| !ace.principal.contains("frank")));
    }

    #[test]
    fn test_managed_attachments_never_grant_write() {
        let invites = [invite("erin", BindMode::Write, InviteStatus::Accepted)];
        let acl = attachments_child_acl(
            "alice",
            &event(&["bob"]),
            &invites,
            true,
            &StaticDelegation::new(),
        );
        assert!(acl.grants("/principals/__uids__/erin/", Privilege::Read));
        assert!(!acl.grants("/principals/__uids__/erin/", Privilege::Write));
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::Read));
        assert!(!acl.grants("/principals/__uids__/bob/", Privilege::Write));
    }

    #[test]
    fn test_direct_invites_consult_resolver() {
        let delegation = StaticDelegation::new()
            .with_access("alice", "wiki-reader", DelegatedAccess::ReadOnly)
            .with_access("alice", "wiki-none", DelegatedAccess::None);
        let invites = [
            invite("wiki-reader", BindMode::Direct, InviteStatus::Accepted),
            invite("wiki-none", BindMode::Direct, InviteStatus::Accepted),
            invite("wiki-original", BindMode::Direct, InviteStatus::Accepted),
        ];
        let acl = collection_acl("alice", &invites, false, &delegation);
        assert!(acl.grants("/principals/__uids__/wiki-reader/", Privilege::Read));
        assert!(!acl.grants("/principals/__uids__/wiki-reader/", Privilege::Write));
        assert_eq!(acl.for_principal("/principals/__uids__/wiki-none/").count(), 0);
        assert_eq!(
            acl.for_principal("/principals/__uids__/wiki-original/").count(),
            0
        );
    }

    #[test]
    fn test_sharee_object_acl() {
        let acl = sharee_object_acl("alice", "bob", BindMode::Read);
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::WriteProperties));
        assert!(!acl.grants("/principals/__uids__/bob/", Privilege::Write));
        assert!(acl.grants("/principals/__uids__/alice/", Privilege::Write));

        let acl = sharee_object_acl("alice", "bob", BindMode::Write);
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::Write));
    }

    fn acl_body(href: &str) -> String {
        format!(
            r#"<D:acl xmlns:D="DAV:"><D:ace><D:principal><D:href>{href}</D:href></D:principal><D:grant><D:privilege><D:read/></D:privilege></D:grant></D:ace></D:acl>"#
        )
    }

    #[test]
    fn test_acl_simulation() {
        let attendees = vec!["bob".to_string()];
        assert!(simulate_dropbox_acl(acl_body("/principals/__uids__/bob/").as_bytes(), &attendees).is_ok());
        assert!(
            simulate_dropbox_acl(
                acl_body("/principals/__uids__/bob/calendar-proxy-write/").as_bytes(),
                &attendees
            )
            .is_ok()
        );
        assert!(simulate_dropbox_acl(acl_body("/principals/__uids__/eve/").as_bytes(), &attendees).is_err());
        assert!(simulate_dropbox_acl(acl_body("/principals/users/bob/").as_bytes(), &attendees).is_err());
        assert!(
            simulate_dropbox_acl(acl_body("/principals/__uids__/bob/extra/").as_bytes(), &attendees)
                .is_err()
        );
    }
}
