//! Backend store collaborator interface.
//!
//! The bridge never touches storage directly. Everything it needs from the
//! transactional calendar and contact store goes through the [`Store`] trait:
//! lookups and mutations of home children (calendars and address books), the
//! objects inside them, dead properties, attachments and notifications.
//!
//! # Transactions
//!
//! A [`Store`] value represents the transaction of a single request. The only
//! handoff between transactions is [`Store::reopen_object`], which commits the
//! current work and re-resolves an object by its stable identity (owning home,
//! collection name, object name) in a new, sequentially later transaction.
//!
//! # Errors
//!
//! Every operation returns [`StoreError`] on failure. Variants are tagged so
//! that the bridge can match them exhaustively; nothing is signalled by panics.
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::storage::{CollectionKey, InMemoryStore, Store, StoreKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let key = CollectionKey::new(StoreKind::Calendar, "alice", "work");
//! store.create_collection(&key, None).await?;
//!
//! let info = store.collection(&key).await?.expect("just created");
//! assert!(store.list_objects(&key).await?.is_empty());
//! println!("CTag: {}", info.sync_token);
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod in_memory;

pub use errors::StoreError;
pub use in_memory::{InMemoryStore, InMemoryStoreStats};

use crate::component::Component;
use crate::resource::metadata::{ObjectMetadata, PendingMetadata};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// Which protocol family a collection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreKind {
    Calendar,
    AddressBook,
}

impl StoreKind {
    /// Top-level URL segment for homes of this kind.
    pub fn root(&self) -> &'static str {
        match self {
            StoreKind::Calendar => "calendars",
            StoreKind::AddressBook => "addressbooks",
        }
    }

    /// Suffix for server-assigned object names.
    pub fn resource_suffix(&self) -> &'static str {
        match self {
            StoreKind::Calendar => ".ics",
            StoreKind::AddressBook => ".vcf",
        }
    }

    /// Native media type of stored items.
    pub fn media_type(&self) -> &'static str {
        match self {
            StoreKind::Calendar => "text/calendar",
            StoreKind::AddressBook => "text/vcard",
        }
    }

    /// Namespace and local name of the data property echoed in multistatus.
    pub fn data_element(&self) -> (&'static str, &'static str) {
        match self {
            StoreKind::Calendar => (crate::error::ns::CALDAV, "calendar-data"),
            StoreKind::AddressBook => (crate::error::ns::CARDDAV, "address-data"),
        }
    }
}

/// Stable identity of a home child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    kind: StoreKind,
    home: String,
    name: String,
}

impl CollectionKey {
    pub fn new(kind: StoreKind, home: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            home: home.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Owning home uid.
    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of a child object.
    pub fn object(&self, name: impl Into<String>) -> ObjectKey {
        ObjectKey {
            collection: self.clone(),
            name: name.into(),
        }
    }

    /// Same home and kind, different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            home: self.home.clone(),
            name: name.into(),
        }
    }

    /// URL of the home that owns this collection.
    pub fn home_url(&self) -> String {
        format!("/{}/__uids__/{}/", self.kind.root(), self.home)
    }

    pub fn url(&self) -> String {
        format!("{}{}/", self.home_url(), self.name)
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Stable identity of an object inside a home child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    collection: CollectionKey,
    name: String,
}

impl ObjectKey {
    pub fn collection(&self) -> &CollectionKey {
        &self.collection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home(&self) -> &str {
        self.collection.home()
    }

    pub fn kind(&self) -> StoreKind {
        self.collection.kind()
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.collection.url(), self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// How the requesting home relates to a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareRole {
    /// Owned and not shared with anyone
    Unshared,
    /// Owned and shared out to sharees
    Owner,
    /// Bound into this home from another owner's share
    Sharee,
}

/// Sharing grant level of an invite or a sharee binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindMode {
    Own,
    Read,
    Write,
    /// Access resolved externally (e.g. by a wiki or group service)
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InviteStatus {
    Invited,
    Accepted,
    Declined,
    Deleted,
    Invalid,
}

/// A sharing invite on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub sharee_uid: String,
    pub owner_uid: String,
    pub mode: BindMode,
    pub status: InviteStatus,
}

/// Snapshot of a home child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub key: CollectionKey,
    /// Change token; differs after every membership or content change
    pub sync_token: String,
    pub share_role: ShareRole,
    pub bind_mode: BindMode,
    pub owner_uid: String,
    /// Calendar component types this collection accepts, `None` for any
    pub supported_components: Option<Vec<String>>,
    pub is_inbox: bool,
    pub allows_object_properties: bool,
    pub modified: DateTime<Utc>,
}

/// Snapshot of an object resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: ObjectKey,
    pub uid: String,
    pub data: Bytes,
    pub content_type: String,
    pub metadata: ObjectMetadata,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub in_trash: bool,
    pub dropbox_id: String,
    pub organizer: Option<String>,
    pub attendees: Vec<String>,
    /// Address-book objects shared individually
    pub share_role: ShareRole,
    /// The group vCard that stands for a shared address book
    pub is_shared_group: bool,
    pub vcard_kind: Option<String>,
    pub attachment_count: usize,
}

/// Result of storing item data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub object: ObjectInfo,
    /// The store changed the data relative to what the client sent
    pub altered: bool,
}

/// Snapshot of a stored attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    /// Set for managed attachments
    pub managed_id: Option<String>,
    pub created: DateTime<Utc>,
}

impl AttachmentInfo {
    pub fn is_managed(&self) -> bool {
        self.managed_id.is_some()
    }
}

/// Identity of a managed attachment after add or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedAttachment {
    pub managed_id: String,
    pub name: String,
    pub dropbox_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    InviteNotification,
    InviteReply,
}

/// A sharing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationInfo {
    pub name: String,
    pub kind: NotificationKind,
    pub xml: String,
}

/// Owner of a set of dead properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyTarget {
    Collection(CollectionKey),
    Object(ObjectKey),
}

/// Qualified dead property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyName {
    pub namespace: String,
    pub name: String,
}

impl PropertyName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.name)
    }
}

/// Streamed upload of legacy attachment content.
///
/// Size and quota limits are enforced when the writer is closed, not while
/// chunks are written.
pub trait AttachmentWriter: Send {
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn close(self) -> impl Future<Output = Result<AttachmentInfo, StoreError>> + Send;
}

/// Transactional calendar and contact store.
///
/// Lookups return `Ok(None)` for absent resources; mutations of absent
/// resources return [`StoreError::NoSuchObject`].
pub trait Store: Send + Sync {
    type Writer: AttachmentWriter;

    // --- home children ---

    fn collection(
        &self,
        key: &CollectionKey,
    ) -> impl Future<Output = Result<Option<CollectionInfo>, StoreError>> + Send;

    fn create_collection(
        &self,
        key: &CollectionKey,
        supported_components: Option<Vec<String>>,
    ) -> impl Future<Output = Result<CollectionInfo, StoreError>> + Send;

    fn remove_collection(
        &self,
        key: &CollectionKey,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove a sharee's binding without touching the owner's data.
    fn unshare_collection(
        &self,
        key: &CollectionKey,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn rename_collection(
        &self,
        key: &CollectionKey,
        new_name: &str,
    ) -> impl Future<Output = Result<CollectionInfo, StoreError>> + Send;

    /// Child object names, sorted.
    fn list_objects(
        &self,
        key: &CollectionKey,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn invites(
        &self,
        key: &CollectionKey,
    ) -> impl Future<Output = Result<Vec<Invite>, StoreError>> + Send;

    // --- objects ---

    fn object(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<Option<ObjectInfo>, StoreError>> + Send;

    fn create_object(
        &self,
        key: &ObjectKey,
        component: &Component,
        metadata: &PendingMetadata,
    ) -> impl Future<Output = Result<WriteOutcome, StoreError>> + Send;

    fn set_component(
        &self,
        key: &ObjectKey,
        component: &Component,
        smart_merge: bool,
    ) -> impl Future<Output = Result<WriteOutcome, StoreError>> + Send;

    fn remove_object(&self, key: &ObjectKey)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove a sharee's binding to an individually shared object.
    fn unshare_object(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Withdraw the share attached to an owner's shared group.
    fn remove_group_share(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn move_object(
        &self,
        key: &ObjectKey,
        destination: &ObjectKey,
    ) -> impl Future<Output = Result<ObjectInfo, StoreError>> + Send;

    /// Split a recurring item at `rid`; returns the newly created object that
    /// holds the instances before the split point.
    fn split_object(
        &self,
        key: &ObjectKey,
        rid: DateTime<Utc>,
        new_uid: Option<&str>,
    ) -> impl Future<Output = Result<ObjectInfo, StoreError>> + Send;

    /// Commit the current transaction and re-resolve `key` in a new one.
    fn reopen_object(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<Option<ObjectInfo>, StoreError>> + Send;

    // --- dead properties ---

    fn property(
        &self,
        target: &PropertyTarget,
        name: &PropertyName,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn set_property(
        &self,
        target: &PropertyTarget,
        name: &PropertyName,
        value: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns whether the property existed.
    fn remove_property(
        &self,
        target: &PropertyTarget,
        name: &PropertyName,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn property_names(
        &self,
        target: &PropertyTarget,
    ) -> impl Future<Output = Result<Vec<PropertyName>, StoreError>> + Send;

    // --- attachments ---

    fn attachment_names(
        &self,
        object: &ObjectKey,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn attachment(
        &self,
        object: &ObjectKey,
        name: &str,
    ) -> impl Future<Output = Result<Option<AttachmentInfo>, StoreError>> + Send;

    fn read_attachment(
        &self,
        object: &ObjectKey,
        name: &str,
    ) -> impl Future<Output = Result<Bytes, StoreError>> + Send;

    /// Start a legacy (dropbox) attachment upload, creating or replacing `name`.
    fn open_attachment(
        &self,
        object: &ObjectKey,
        name: &str,
        content_type: &str,
    ) -> impl Future<Output = Result<Self::Writer, StoreError>> + Send;

    fn remove_attachment(
        &self,
        object: &ObjectKey,
        name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn add_managed_attachment(
        &self,
        object: &ObjectKey,
        content_type: &str,
        filename: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<ManagedAttachment, StoreError>> + Send;

    fn update_managed_attachment(
        &self,
        object: &ObjectKey,
        managed_id: &str,
        content_type: &str,
        filename: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<ManagedAttachment, StoreError>> + Send;

    fn remove_managed_attachment(
        &self,
        object: &ObjectKey,
        managed_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Dropbox ids of calendar objects in a home that may carry attachments.
    fn dropbox_ids(&self, home: &str)
    -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn object_for_dropbox(
        &self,
        home: &str,
        dropbox_id: &str,
    ) -> impl Future<Output = Result<Option<ObjectInfo>, StoreError>> + Send;

    // --- notifications ---

    fn notification_names(
        &self,
        home: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn notifications_sync_token(
        &self,
        home: &str,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    fn notification(
        &self,
        home: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<NotificationInfo>, StoreError>> + Send;

    fn remove_notification(
        &self,
        home: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_urls() {
        let collection = CollectionKey::new(StoreKind::Calendar, "alice", "work");
        assert_eq!(collection.url(), "/calendars/__uids__/alice/work/");
        assert_eq!(collection.home_url(), "/calendars/__uids__/alice/");

        let object = collection.object("event.ics");
        assert_eq!(object.url(), "/calendars/__uids__/alice/work/event.ics");
        assert_eq!(object.home(), "alice");

        let renamed = collection.renamed("home");
        assert_eq!(renamed.url(), "/calendars/__uids__/alice/home/");
    }

    #[test]
    fn test_kind_properties() {
        assert_eq!(StoreKind::AddressBook.resource_suffix(), ".vcf");
        assert_eq!(StoreKind::AddressBook.root(), "addressbooks");
        assert_eq!(StoreKind::Calendar.data_element().1, "calendar-data");
    }
}
