//! Access control for bridged resources.
//!
//! Two things live here. The [`Authorizer`] seam is how the bridge asks the
//! host's privilege engine whether a principal may perform an operation; the
//! engine itself is external. [`synthesis`] computes the effective ACLs the
//! bridge exposes for shared collections, dropboxes and managed attachment
//! collections.
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::acl::{Authorizer, Privilege, StaticAuthorizer};
//!
//! let authorizer = StaticAuthorizer::new()
//!     .deny("bob", "/calendars/__uids__/alice/", Privilege::Write);
//!
//! let url = "/calendars/__uids__/alice/work/";
//! assert!(authorizer.allowed(Some("bob"), url, Privilege::Read));
//! assert!(!authorizer.allowed(Some("bob"), url, Privilege::Bind));
//! assert!(authorizer.allowed(Some("carol"), url, Privilege::Bind));
//! ```

pub mod synthesis;

pub use synthesis::{
    SharedAccess, attachments_child_acl, attachments_home_acl, collection_acl, dropbox_acl,
    shared_access, sharee_object_acl, simulate_dropbox_acl,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Prefix of principal URLs addressed by uid.
pub const PRINCIPAL_UIDS_PREFIX: &str = "/principals/__uids__/";

/// Principal URL for a uid.
pub fn principal_url(uid: &str) -> String {
    format!("{PRINCIPAL_UIDS_PREFIX}{uid}/")
}

/// Proxy principal URLs hang off the principal they proxy for.
pub fn proxy_read_url(uid: &str) -> String {
    format!("{}calendar-proxy-read/", principal_url(uid))
}

pub fn proxy_write_url(uid: &str) -> String {
    format!("{}calendar-proxy-write/", principal_url(uid))
}

/// WebDAV ACL privileges used by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Privilege {
    All,
    Read,
    ReadAcl,
    ReadCurrentUserPrivilegeSet,
    Write,
    WriteContent,
    WriteProperties,
    WriteAcl,
    Bind,
    Unbind,
}

impl Privilege {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::All => "all",
            Privilege::Read => "read",
            Privilege::ReadAcl => "read-acl",
            Privilege::ReadCurrentUserPrivilegeSet => "read-current-user-privilege-set",
            Privilege::Write => "write",
            Privilege::WriteContent => "write-content",
            Privilege::WriteProperties => "write-properties",
            Privilege::WriteAcl => "write-acl",
            Privilege::Bind => "bind",
            Privilege::Unbind => "unbind",
        }
    }

    /// Whether holding `self` includes `other` (aggregate privileges).
    pub fn contains(&self, other: Privilege) -> bool {
        match self {
            Privilege::All => true,
            Privilege::Write => matches!(
                other,
                Privilege::Write
                    | Privilege::WriteContent
                    | Privilege::WriteProperties
                    | Privilege::Bind
                    | Privilege::Unbind
            ),
            _ => *self == other,
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DAV:{}", self.as_str())
    }
}

/// One access control entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ace {
    /// Principal URL
    pub principal: String,
    pub grant: Vec<Privilege>,
    pub protected: bool,
    pub inheritable: bool,
}

impl Ace {
    /// Protected, inheritable grant, the form every synthesized entry takes.
    pub fn grant(principal: impl Into<String>, privileges: &[Privilege]) -> Self {
        Self {
            principal: principal.into(),
            grant: privileges.to_vec(),
            protected: true,
            inheritable: true,
        }
    }

    pub fn grants(&self, privilege: Privilege) -> bool {
        self.grant.iter().any(|granted| granted.contains(privilege))
    }
}

/// Ordered access control list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub aces: Vec<Ace>,
}

impl Acl {
    pub fn new(aces: Vec<Ace>) -> Self {
        Self { aces }
    }

    /// Entries for exactly this principal URL.
    pub fn for_principal<'a>(&'a self, principal: &'a str) -> impl Iterator<Item = &'a Ace> + 'a {
        self.aces.iter().filter(move |ace| ace.principal == principal)
    }

    /// True when any entry for `principal` grants `privilege`.
    pub fn grants(&self, principal: &str, privilege: Privilege) -> bool {
        self.for_principal(principal).any(|ace| ace.grants(privilege))
    }
}

/// Host privilege engine.
///
/// `principal` is the authenticated principal uid, `url` the resource the
/// privilege is needed on. Implementations must not block.
pub trait Authorizer: Send + Sync {
    fn allowed(&self, principal: Option<&str>, url: &str, privilege: Privilege) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allowed(&self, _principal: Option<&str>, _url: &str, _privilege: Privilege) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct Denial {
    principal: Option<String>,
    prefix: String,
    privilege: Privilege,
}

/// Allow-by-default authorizer with explicit denials.
///
/// A denial of `P` under a URL prefix also blocks requests for any privilege
/// that contains `P` or that `P` contains.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    denials: Vec<Denial>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny `privilege` to `principal` on every URL starting with `prefix`.
    pub fn deny(mut self, principal: impl Into<String>, prefix: impl Into<String>, privilege: Privilege) -> Self {
        self.denials.push(Denial {
            principal: Some(principal.into()),
            prefix: prefix.into(),
            privilege,
        });
        self
    }

    /// Deny `privilege` to everyone, authenticated or not.
    pub fn deny_all(mut self, prefix: impl Into<String>, privilege: Privilege) -> Self {
        self.denials.push(Denial {
            principal: None,
            prefix: prefix.into(),
            privilege,
        });
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn allowed(&self, principal: Option<&str>, url: &str, privilege: Privilege) -> bool {
        !self.denials.iter().any(|denial| {
            let principal_matches = match &denial.principal {
                Some(denied) => principal == Some(denied.as_str()),
                None => true,
            };
            principal_matches
                && url.starts_with(&denial.prefix)
                && (denial.privilege.contains(privilege) || privilege.contains(denial.privilege))
        })
    }
}

/// Access decided by an external system for `direct` shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DelegatedAccess {
    Own,
    ReadOnly,
    ReadWrite,
    /// Inherit whatever the owner's collection grants
    Original,
    /// No access at all
    None,
}

/// Resolves access for `direct`-mode shares (e.g. wiki-backed calendars).
pub trait DelegationResolver: Send + Sync {
    fn access(&self, owner_uid: &str, sharee_uid: &str) -> DelegatedAccess;
}

/// Table-driven resolver; unknown pairs resolve to [`DelegatedAccess::Original`].
#[derive(Debug, Clone, Default)]
pub struct StaticDelegation {
    table: HashMap<(String, String), DelegatedAccess>,
}

impl StaticDelegation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access(
        mut self,
        owner_uid: impl Into<String>,
        sharee_uid: impl Into<String>,
        access: DelegatedAccess,
    ) -> Self {
        self.table
            .insert((owner_uid.into(), sharee_uid.into()), access);
        self
    }
}

impl DelegationResolver for StaticDelegation {
    fn access(&self, owner_uid: &str, sharee_uid: &str) -> DelegatedAccess {
        self.table
            .get(&(owner_uid.to_string(), sharee_uid.to_string()))
            .copied()
            .unwrap_or(DelegatedAccess::Original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_aggregates_bind_and_unbind() {
        assert!(Privilege::Write.contains(Privilege::Bind));
        assert!(Privilege::Write.contains(Privilege::Unbind));
        assert!(!Privilege::Write.contains(Privilege::Read));
        assert!(Privilege::All.contains(Privilege::WriteAcl));
        assert!(!Privilege::Bind.contains(Privilege::Write));
    }

    #[test]
    fn test_static_authorizer_denials() {
        let authorizer = StaticAuthorizer::new()
            .deny("bob", "/calendars/__uids__/alice/work/", Privilege::Unbind)
            .deny_all("/addressbooks/", Privilege::Write);
        let url = "/calendars/__uids__/alice/work/";

        assert!(!authorizer.allowed(Some("bob"), url, Privilege::Unbind));
        // Write contains the denied unbind
        assert!(!authorizer.allowed(Some("bob"), url, Privilege::Write));
        assert!(authorizer.allowed(Some("bob"), url, Privilege::Bind));
        assert!(authorizer.allowed(Some("alice"), url, Privilege::Unbind));
        assert!(!authorizer.allowed(None, "/addressbooks/__uids__/a/b/", Privilege::Bind));
    }

    #[test]
    fn test_principal_urls() {
        assert_eq!(principal_url("bob"), "/principals/__uids__/bob/");
        assert_eq!(
            proxy_write_url("bob"),
            "/principals/__uids__/bob/calendar-proxy-write/"
        );
    }

    #[test]
    fn test_static_delegation_defaults_to_original() {
        let delegation =
            StaticDelegation::new().with_access("wiki", "bob", DelegatedAccess::ReadOnly);
        assert_eq!(delegation.access("wiki", "bob"), DelegatedAccess::ReadOnly);
        assert_eq!(delegation.access("wiki", "carol"), DelegatedAccess::Original);
    }

    #[test]
    fn test_acl_grants() {
        let acl = Acl::new(vec![Ace::grant(
            principal_url("bob"),
            &[Privilege::Read, Privilege::Write],
        )]);
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::Bind));
        assert!(!acl.grants("/principals/__uids__/bob/", Privilege::WriteAcl));
        assert!(!acl.grants("/principals/__uids__/carol/", Privilege::Read));
    }
}
