//! In-memory store implementation.
//!
//! [`InMemoryStore`] keeps homes, collections, objects, attachments and
//! notifications in a single `RwLock`-guarded state. It implements the full
//! [`Store`] contract and is used by the test suite and for development.
//!
//! Besides the trait operations it offers setup hooks that reproduce backend
//! behavior the bridge has to cope with:
//!
//! * resource locks that make mutations fail with [`StoreError::LockTimeout`]
//! * removals that fail for a specific URL
//! * per-home attachment quotas and a maximum attachment size
//! * scheduling side effects: data rewritten on store, items deleted on store,
//!   and server-side updates that change the entity tag but keep the schedule tag
//!
//! # Policy
//!
//! A vCard group may only reference member UIDs that already exist in the
//! collection or that the writer declares as co-added in the batch metadata
//! ([`MetadataKey::CoaddedUids`]). Other references fail with
//! [`StoreError::GroupWithUnsharedAddressNotAllowed`].
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::storage::{CollectionKey, InMemoryStore, Store, StoreKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let calendar = CollectionKey::new(StoreKind::Calendar, "alice", "work");
//! store.create_collection(&calendar, Some(vec!["VEVENT".to_string()])).await?;
//!
//! // Any mutation of a locked URL reports a lock timeout
//! store.lock(&calendar.url()).await;
//! assert!(store.remove_collection(&calendar).await.is_err());
//! # Ok(())
//! # }
//! ```

use crate::component::Component;
use crate::resource::metadata::{MetadataKey, ObjectMetadata, PendingMetadata};
use crate::resource::version::EntityTag;
use crate::storage::{
    AttachmentInfo, AttachmentWriter, BindMode, CollectionInfo, CollectionKey, Invite,
    InviteStatus, ManagedAttachment, NotificationInfo, NotificationKind, ObjectInfo, ObjectKey,
    PropertyName, PropertyTarget, ShareRole, Store, StoreError, StoreKind, WriteOutcome,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

const PROCESSED_MARKER: &str = "X-CALENDARSERVER-PROCESSED:TRUE";

#[derive(Debug, Clone)]
struct StoredAttachment {
    info: AttachmentInfo,
    data: Bytes,
}

#[derive(Debug, Clone)]
struct ObjectState {
    info: ObjectInfo,
    properties: BTreeMap<PropertyName, String>,
    attachments: BTreeMap<String, StoredAttachment>,
}

#[derive(Debug, Clone)]
struct CollectionState {
    info: CollectionInfo,
    objects: BTreeMap<String, ObjectState>,
    invites: Vec<Invite>,
    properties: BTreeMap<PropertyName, String>,
}

#[derive(Debug, Default)]
struct HomeNotifications {
    revision: u64,
    items: BTreeMap<String, NotificationInfo>,
}

#[derive(Debug, Default)]
struct Faults {
    locked: HashSet<String>,
    failing_removals: HashSet<String>,
    protected_properties: HashSet<PropertyName>,
    rewrite_on_store: HashSet<String>,
    delete_on_store: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    revision: u64,
    collections: BTreeMap<CollectionKey, CollectionState>,
    notifications: HashMap<String, HomeNotifications>,
    quotas: HashMap<String, u64>,
    max_attachment_size: Option<u64>,
    max_resource_size: Option<usize>,
    max_resources: Option<usize>,
    faults: Faults,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn check_lock(&self, url: &str) -> Result<(), StoreError> {
        if self.faults.locked.contains(url) {
            debug!("Lock timeout on '{}'", url);
            return Err(StoreError::LockTimeout);
        }
        Ok(())
    }

    /// Bump a collection's change token.
    fn touch(&mut self, key: &CollectionKey) {
        let revision = self.next_revision();
        if let Some(collection) = self.collections.get_mut(key) {
            collection.info.sync_token = revision.to_string();
            collection.info.modified = Utc::now();
        }
    }

    fn collection_mut(&mut self, key: &CollectionKey) -> Result<&mut CollectionState, StoreError> {
        self.collections
            .get_mut(key)
            .ok_or_else(|| StoreError::no_such_object(key.name()))
    }

    fn object_mut(&mut self, key: &ObjectKey) -> Result<&mut ObjectState, StoreError> {
        self.collections
            .get_mut(key.collection())
            .and_then(|collection| collection.objects.get_mut(key.name()))
            .ok_or_else(|| StoreError::no_such_object(key.name()))
    }

    fn object(&self, key: &ObjectKey) -> Option<&ObjectState> {
        self.collections
            .get(key.collection())
            .and_then(|collection| collection.objects.get(key.name()))
    }

    fn attachment_bytes_used(&self, home: &str) -> u64 {
        self.collections
            .iter()
            .filter(|(key, _)| key.home() == home)
            .flat_map(|(_, collection)| collection.objects.values())
            .flat_map(|object| object.attachments.values())
            .map(|attachment| attachment.info.size)
            .sum()
    }

    /// Enforce size and quota limits for `size` new bytes replacing `replaced`.
    fn check_attachment_limits(&self, home: &str, size: u64, replaced: u64) -> Result<(), StoreError> {
        if let Some(limit) = self.max_attachment_size {
            if size > limit {
                return Err(StoreError::AttachmentSizeTooLarge);
            }
        }
        if let Some(quota) = self.quotas.get(home) {
            let used = self.attachment_bytes_used(home).saturating_sub(replaced);
            if used + size > *quota {
                return Err(StoreError::QuotaExceeded);
            }
        }
        Ok(())
    }

    fn check_group_members(
        collection: &CollectionState,
        component: &Component,
        coadded: Option<&BTreeSet<String>>,
    ) -> Result<(), StoreError> {
        if !component.is_group() {
            return Ok(());
        }
        let missing: BTreeSet<String> = component
            .members
            .iter()
            .filter(|member| {
                !collection.objects.values().any(|object| &object.info.uid == *member)
                    && !coadded.map(|set| set.contains(*member)).unwrap_or(false)
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::GroupWithUnsharedAddressNotAllowed { missing })
        }
    }

    fn check_component(
        &self,
        collection: &CollectionState,
        component: &Component,
    ) -> Result<(), StoreError> {
        if component.kind != collection.info.key.kind() {
            return Err(StoreError::InvalidComponentForStore {
                message: "data does not belong in this collection".to_string(),
            });
        }
        if let Some(limit) = self.max_resource_size {
            if component.text.len() > limit {
                return Err(StoreError::ObjectTooBig);
            }
        }
        if let (Some(supported), Some(component_type)) = (
            collection.info.supported_components.as_ref(),
            component.component_type.as_ref(),
        ) {
            if !supported.iter().any(|s| s.eq_ignore_ascii_case(component_type)) {
                return Err(StoreError::InvalidComponentType {
                    component: component_type.clone(),
                });
            }
        }
        Ok(())
    }
}

fn insert_before_first_end(text: &str, line: &str) -> String {
    let mut lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
    let index = lines
        .iter()
        .position(|l| l.to_ascii_uppercase().starts_with("END:"))
        .unwrap_or(lines.len());
    lines.insert(index, line);
    let mut joined = lines.join("\r\n");
    joined.push_str("\r\n");
    joined
}

fn remove_lines_containing(text: &str, needle: &str) -> String {
    let mut joined = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.contains(needle))
        .collect::<Vec<_>>()
        .join("\r\n");
    joined.push_str("\r\n");
    joined
}

fn replace_uid(text: &str, old_uid: &str, new_uid: &str) -> String {
    let mut joined = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .map(|l| {
            if l.eq_ignore_ascii_case(&format!("UID:{old_uid}")) {
                format!("UID:{new_uid}")
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n");
    joined.push_str("\r\n");
    joined
}

fn is_recurring(text: &str) -> bool {
    text.lines().any(|line| {
        let upper = line.to_ascii_uppercase();
        upper.starts_with("RRULE") || upper.starts_with("RDATE")
    })
}

fn dropbox_id_for(uid: &str) -> String {
    format!("{}.dropbox", EntityTag::from_content(uid.as_bytes()).opaque())
}

fn schedule_metadata(
    component: &Component,
    stored: &str,
    base: ObjectMetadata,
) -> ObjectMetadata {
    if component.is_scheduling_object() {
        ObjectMetadata {
            is_schedule_object: Some(true),
            schedule_tag: Some(uuid::Uuid::new_v4().simple().to_string()),
            schedule_etags: vec![EntityTag::from_content(stored.as_bytes()).to_string()],
            ..base
        }
    } else {
        ObjectMetadata {
            is_schedule_object: Some(false),
            schedule_tag: None,
            schedule_etags: Vec::new(),
            ..base
        }
    }
}

/// Thread-safe in-memory [`Store`].
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    transactions: Arc<AtomicUsize>,
}

/// Counters for debugging and assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryStoreStats {
    pub collection_count: usize,
    pub object_count: usize,
    pub attachment_count: usize,
    /// Transactions started through [`Store::reopen_object`]
    pub reopened_transactions: usize,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            transactions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn stats(&self) -> InMemoryStoreStats {
        let state = self.state.read().await;
        let objects = state.collections.values().flat_map(|c| c.objects.values());
        InMemoryStoreStats {
            collection_count: state.collections.len(),
            object_count: state.collections.values().map(|c| c.objects.len()).sum(),
            attachment_count: objects.map(|o| o.attachments.len()).sum(),
            reopened_transactions: self.transactions.load(Ordering::SeqCst),
        }
    }

    /// Make every mutation of `url` fail with a lock timeout.
    pub async fn lock(&self, url: &str) {
        self.state.write().await.faults.locked.insert(url.to_string());
    }

    pub async fn unlock(&self, url: &str) {
        self.state.write().await.faults.locked.remove(url);
    }

    /// Make removal of `url` fail with a generic store failure.
    pub async fn fail_removal(&self, url: &str) {
        self.state
            .write()
            .await
            .faults
            .failing_removals
            .insert(url.to_string());
    }

    /// Reject changes to a property.
    pub async fn protect_property(&self, name: PropertyName) {
        self.state
            .write()
            .await
            .faults
            .protected_properties
            .insert(name);
    }

    /// Alter stored data for items with `uid`, as implicit scheduling would.
    pub async fn rewrite_on_store(&self, uid: &str) {
        self.state
            .write()
            .await
            .faults
            .rewrite_on_store
            .insert(uid.to_string());
    }

    /// Delete items with `uid` as a side effect of storing them.
    pub async fn delete_on_store(&self, uid: &str) {
        self.state
            .write()
            .await
            .faults
            .delete_on_store
            .insert(uid.to_string());
    }

    pub async fn set_quota(&self, home: &str, bytes: u64) {
        self.state.write().await.quotas.insert(home.to_string(), bytes);
    }

    pub async fn set_max_attachment_size(&self, bytes: u64) {
        self.state.write().await.max_attachment_size = Some(bytes);
    }

    pub async fn set_max_resource_size(&self, bytes: usize) {
        self.state.write().await.max_resource_size = Some(bytes);
    }

    pub async fn set_max_resources(&self, count: usize) {
        self.state.write().await.max_resources = Some(count);
    }

    /// Record an invite on an owner's collection and mark it shared.
    pub async fn add_invite(&self, key: &CollectionKey, invite: Invite) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let collection = state.collection_mut(key)?;
        collection.info.share_role = ShareRole::Owner;
        collection.invites.push(invite);
        Ok(())
    }

    /// Bind an owner's collection into a sharee home under `key`.
    pub async fn bind_shared(
        &self,
        owner: &CollectionKey,
        key: &CollectionKey,
        mode: BindMode,
    ) -> Result<CollectionInfo, StoreError> {
        let mut state = self.state.write().await;
        let revision = state.next_revision();
        let source = state
            .collections
            .get(owner)
            .cloned()
            .ok_or_else(|| StoreError::no_such_object(owner.name()))?;
        if state.collections.contains_key(key) {
            return Err(StoreError::HomeChildNameAlreadyExists {
                name: key.name().to_string(),
            });
        }
        let objects = source
            .objects
            .into_iter()
            .map(|(name, mut object)| {
                object.info.key = key.object(name.clone());
                (name, object)
            })
            .collect();
        let info = CollectionInfo {
            key: key.clone(),
            sync_token: revision.to_string(),
            share_role: ShareRole::Sharee,
            bind_mode: mode,
            owner_uid: owner.home().to_string(),
            ..source.info
        };
        state.collections.insert(
            key.clone(),
            CollectionState {
                info: info.clone(),
                objects,
                invites: Vec::new(),
                properties: BTreeMap::new(),
            },
        );
        if let Some(owner_state) = state.collections.get_mut(owner) {
            owner_state.info.share_role = ShareRole::Owner;
            owner_state.invites.push(Invite {
                sharee_uid: key.home().to_string(),
                owner_uid: owner.home().to_string(),
                mode,
                status: InviteStatus::Accepted,
            });
        }
        Ok(info)
    }

    pub async fn mark_inbox(&self, key: &CollectionKey) -> Result<(), StoreError> {
        self.state.write().await.collection_mut(key)?.info.is_inbox = true;
        Ok(())
    }

    pub async fn allow_object_properties(&self, key: &CollectionKey) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .collection_mut(key)?
            .info
            .allows_object_properties = true;
        Ok(())
    }

    /// Set the sharing role of an individually shared address-book object.
    pub async fn set_object_share(
        &self,
        key: &ObjectKey,
        role: ShareRole,
        is_shared_group: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let object = state.object_mut(key)?;
        object.info.share_role = role;
        object.info.is_shared_group = is_shared_group;
        Ok(())
    }

    pub async fn move_to_trash(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.state.write().await.object_mut(key)?.info.in_trash = true;
        Ok(())
    }

    /// Apply a server-side scheduling change: new data and entity tag, same
    /// schedule tag, and the new tag appended to the schedule entity tags.
    pub async fn apply_scheduling_update(&self, key: &ObjectKey, data: &str) -> Result<ObjectInfo, StoreError> {
        let mut state = self.state.write().await;
        let object = state.object_mut(key)?;
        object.info.data = Bytes::from(data.to_string());
        object.info.modified = Utc::now();
        object
            .info
            .metadata
            .schedule_etags
            .push(EntityTag::from_content(data.as_bytes()).to_string());
        let info = object.info.clone();
        state.touch(key.collection());
        Ok(info)
    }

    pub async fn add_notification(
        &self,
        home: &str,
        name: &str,
        kind: NotificationKind,
        xml: &str,
    ) {
        let mut state = self.state.write().await;
        let notifications = state.notifications.entry(home.to_string()).or_default();
        notifications.revision += 1;
        notifications.items.insert(
            name.to_string(),
            NotificationInfo {
                name: name.to_string(),
                kind,
                xml: xml.to_string(),
            },
        );
    }

    fn notification_url(home: &str, name: &str) -> String {
        format!("/calendars/__uids__/{home}/notification/{name}")
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffered upload that commits on [`close`](AttachmentWriter::close).
pub struct InMemoryAttachmentWriter {
    state: Arc<RwLock<State>>,
    object: ObjectKey,
    name: String,
    content_type: String,
    buffer: Vec<u8>,
}

impl AttachmentWriter for InMemoryAttachmentWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn close(self) -> Result<AttachmentInfo, StoreError> {
        let mut state = self.state.write().await;
        let size = self.buffer.len() as u64;
        let replaced = state
            .object(&self.object)
            .and_then(|object| object.attachments.get(&self.name))
            .map(|attachment| attachment.info.size)
            .unwrap_or(0);
        state.check_attachment_limits(self.object.home(), size, replaced)?;

        let object = state.object_mut(&self.object)?;
        let created = object
            .attachments
            .get(&self.name)
            .map(|attachment| attachment.info.created)
            .unwrap_or_else(Utc::now);
        let info = AttachmentInfo {
            name: self.name.clone(),
            content_type: self.content_type,
            size,
            managed_id: None,
            created,
        };
        object.attachments.insert(
            self.name,
            StoredAttachment {
                info: info.clone(),
                data: Bytes::from(self.buffer),
            },
        );
        object.info.attachment_count = object.attachments.len();
        trace!("Stored {} attachment bytes for {}", size, self.object);
        Ok(info)
    }
}

impl Store for InMemoryStore {
    type Writer = InMemoryAttachmentWriter;

    async fn collection(&self, key: &CollectionKey) -> Result<Option<CollectionInfo>, StoreError> {
        let state = self.state.read().await;
        trace!("Looking up collection {}", key);
        Ok(state.collections.get(key).map(|c| c.info.clone()))
    }

    async fn create_collection(
        &self,
        key: &CollectionKey,
        supported_components: Option<Vec<String>>,
    ) -> Result<CollectionInfo, StoreError> {
        let mut state = self.state.write().await;
        if state.collections.contains_key(key) {
            return Err(StoreError::HomeChildNameAlreadyExists {
                name: key.name().to_string(),
            });
        }
        let revision = state.next_revision();
        let info = CollectionInfo {
            key: key.clone(),
            sync_token: revision.to_string(),
            share_role: ShareRole::Unshared,
            bind_mode: BindMode::Own,
            owner_uid: key.home().to_string(),
            supported_components,
            is_inbox: false,
            allows_object_properties: false,
            modified: Utc::now(),
        };
        state.collections.insert(
            key.clone(),
            CollectionState {
                info: info.clone(),
                objects: BTreeMap::new(),
                invites: Vec::new(),
                properties: BTreeMap::new(),
            },
        );
        Ok(info)
    }

    async fn remove_collection(&self, key: &CollectionKey) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        if state.faults.failing_removals.contains(&key.url()) {
            return Err(StoreError::internal(format!("cannot remove {key}")));
        }
        state
            .collections
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::no_such_object(key.name()))
    }

    async fn unshare_collection(&self, key: &CollectionKey) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        let removed = state
            .collections
            .remove(key)
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        let owner_uid = removed.info.owner_uid;
        for (other, collection) in state.collections.iter_mut() {
            if other.home() == owner_uid && other.kind() == key.kind() {
                for invite in collection.invites.iter_mut() {
                    if invite.sharee_uid == key.home() {
                        invite.status = InviteStatus::Deleted;
                    }
                }
            }
        }
        Ok(())
    }

    async fn rename_collection(
        &self,
        key: &CollectionKey,
        new_name: &str,
    ) -> Result<CollectionInfo, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        let target = key.renamed(new_name);
        if state.collections.contains_key(&target) {
            return Err(StoreError::HomeChildNameAlreadyExists {
                name: new_name.to_string(),
            });
        }
        let mut collection = state
            .collections
            .remove(key)
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        collection.info.key = target.clone();
        for (name, object) in collection.objects.iter_mut() {
            object.info.key = target.object(name.clone());
        }
        let info = collection.info.clone();
        state.collections.insert(target.clone(), collection);
        state.touch(&target);
        Ok(state
            .collections
            .get(&target)
            .map(|c| c.info.clone())
            .unwrap_or(info))
    }

    async fn list_objects(&self, key: &CollectionKey) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let collection = state
            .collections
            .get(key)
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        Ok(collection.objects.keys().cloned().collect())
    }

    async fn invites(&self, key: &CollectionKey) -> Result<Vec<Invite>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .collections
            .get(key)
            .map(|c| c.invites.clone())
            .unwrap_or_default())
    }

    async fn object(&self, key: &ObjectKey) -> Result<Option<ObjectInfo>, StoreError> {
        let state = self.state.read().await;
        trace!("Looking up object {}", key);
        Ok(state.object(key).map(|o| o.info.clone()))
    }

    async fn create_object(
        &self,
        key: &ObjectKey,
        component: &Component,
        metadata: &PendingMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        state.check_lock(&key.collection().url())?;

        let name = key.name();
        if name.is_empty() || name.starts_with('.') || name.contains('/') {
            return Err(StoreError::ObjectNameNotAllowed {
                name: name.to_string(),
            });
        }

        let max_resources = state.max_resources;
        let collection = state
            .collections
            .get(key.collection())
            .ok_or_else(|| StoreError::no_such_object(key.collection().name()))?;
        if collection.objects.contains_key(name) {
            return Err(StoreError::ObjectNameAlreadyExists {
                name: name.to_string(),
            });
        }
        if let Some(limit) = max_resources {
            if collection.objects.len() >= limit {
                return Err(StoreError::TooManyObjectResources);
            }
        }
        state.check_component(collection, component)?;
        if collection
            .objects
            .values()
            .any(|object| object.info.uid == component.uid)
        {
            return Err(StoreError::UidExists {
                uid: component.uid.clone(),
            });
        }
        let coadded = metadata
            .get(&MetadataKey::CoaddedUids)
            .and_then(|value| value.as_set());
        State::check_group_members(collection, component, coadded)?;

        if state.faults.delete_on_store.contains(&component.uid) {
            debug!("Store deleted {} while creating it", key);
            return Err(StoreError::ResourceDeleted);
        }

        let altered = state.faults.rewrite_on_store.contains(&component.uid);
        let text = if altered {
            insert_before_first_end(&component.text, PROCESSED_MARKER)
        } else {
            component.text.clone()
        };

        let base = ObjectMetadata {
            access_mode: metadata
                .get(&MetadataKey::AccessMode)
                .and_then(|value| value.as_text().map(str::to_string)),
            has_private_comment: metadata
                .get(&MetadataKey::HasPrivateComment)
                .and_then(|value| value.as_flag())
                .unwrap_or(false),
            ..Default::default()
        };
        let now = Utc::now();
        let info = ObjectInfo {
            key: key.clone(),
            uid: component.uid.clone(),
            metadata: schedule_metadata(component, &text, base),
            data: Bytes::from(text),
            content_type: component.kind.media_type().to_string(),
            created: now,
            modified: now,
            in_trash: false,
            dropbox_id: dropbox_id_for(&component.uid),
            organizer: component.organizer.clone(),
            attendees: component.attendees.clone(),
            share_role: ShareRole::Unshared,
            is_shared_group: false,
            vcard_kind: component.vcard_kind.clone(),
            attachment_count: 0,
        };

        state.collection_mut(key.collection())?.objects.insert(
            name.to_string(),
            ObjectState {
                info: info.clone(),
                properties: BTreeMap::new(),
                attachments: BTreeMap::new(),
            },
        );
        state.touch(key.collection());
        debug!("Created {} (uid '{}')", key, info.uid);
        Ok(WriteOutcome {
            object: info,
            altered,
        })
    }

    async fn set_component(
        &self,
        key: &ObjectKey,
        component: &Component,
        smart_merge: bool,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;

        let collection = state
            .collections
            .get(key.collection())
            .ok_or_else(|| StoreError::no_such_object(key.collection().name()))?;
        let current = collection
            .objects
            .get(key.name())
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        state.check_component(collection, component)?;
        if current.info.uid != component.uid {
            return Err(StoreError::InvalidUid);
        }
        if key.kind() == StoreKind::AddressBook
            && current.info.vcard_kind.as_deref().unwrap_or("individual")
                != component.vcard_kind.as_deref().unwrap_or("individual")
        {
            return Err(StoreError::KindChangeNotAllowed);
        }
        State::check_group_members(collection, component, None)?;

        if state.faults.delete_on_store.contains(&component.uid) {
            debug!("Store deleted {} while updating it", key);
            state.collection_mut(key.collection())?.objects.remove(key.name());
            state.touch(key.collection());
            return Err(StoreError::ResourceDeleted);
        }

        let altered = state.faults.rewrite_on_store.contains(&component.uid);
        let text = if altered {
            insert_before_first_end(&component.text, PROCESSED_MARKER)
        } else {
            component.text.clone()
        };

        let object = state.object_mut(key)?;
        let base = ObjectMetadata {
            access_mode: object.info.metadata.access_mode.clone(),
            has_private_comment: object.info.metadata.has_private_comment,
            ..Default::default()
        };
        object.info.metadata = schedule_metadata(component, &text, base);
        object.info.data = Bytes::from(text);
        object.info.modified = Utc::now();
        object.info.organizer = component.organizer.clone();
        object.info.attendees = component.attendees.clone();
        let info = object.info.clone();
        state.touch(key.collection());
        debug!("Updated {} (smart merge: {})", key, smart_merge);
        Ok(WriteOutcome {
            object: info,
            altered,
        })
    }

    async fn remove_object(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        if state.faults.failing_removals.contains(&key.url()) {
            return Err(StoreError::internal(format!("cannot remove {key}")));
        }
        state
            .collection_mut(key.collection())?
            .objects
            .remove(key.name())
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        state.touch(key.collection());
        Ok(())
    }

    async fn unshare_object(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        state
            .collection_mut(key.collection())?
            .objects
            .remove(key.name())
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        state.touch(key.collection());
        Ok(())
    }

    async fn remove_group_share(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        let object = state.object_mut(key)?;
        object.info.share_role = ShareRole::Unshared;
        state.touch(key.collection());
        Ok(())
    }

    async fn move_object(
        &self,
        key: &ObjectKey,
        destination: &ObjectKey,
    ) -> Result<ObjectInfo, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        state.check_lock(&destination.collection().url())?;

        let source = state
            .object(key)
            .cloned()
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        let target = state
            .collections
            .get(destination.collection())
            .ok_or_else(|| StoreError::no_such_object(destination.collection().name()))?;
        if key.kind() != destination.kind() {
            return Err(StoreError::InvalidResourceMove);
        }
        if target.objects.contains_key(destination.name()) {
            return Err(StoreError::ObjectNameAlreadyExists {
                name: destination.name().to_string(),
            });
        }
        if let (Some(supported), Some(vevent)) = (
            target.info.supported_components.as_ref(),
            first_component_type(&source.info.data),
        ) {
            if !supported.iter().any(|s| s.eq_ignore_ascii_case(&vevent)) {
                return Err(StoreError::InvalidComponentType { component: vevent });
            }
        }

        state
            .collection_mut(key.collection())?
            .objects
            .remove(key.name());
        let mut moved = source;
        moved.info.key = destination.clone();
        let info = moved.info.clone();
        state
            .collection_mut(destination.collection())?
            .objects
            .insert(destination.name().to_string(), moved);
        state.touch(key.collection());
        state.touch(destination.collection());
        Ok(info)
    }

    async fn split_object(
        &self,
        key: &ObjectKey,
        rid: DateTime<Utc>,
        new_uid: Option<&str>,
    ) -> Result<ObjectInfo, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&key.url())?;
        let current = state
            .object(key)
            .cloned()
            .ok_or_else(|| StoreError::no_such_object(key.name()))?;
        let text = String::from_utf8_lossy(&current.info.data).into_owned();
        if !is_recurring(&text) {
            return Err(StoreError::InvalidSplit {
                message: "item does not recur".to_string(),
            });
        }
        let uid = new_uid
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let marker = format!("X-CALENDARSERVER-SPLIT-RID:{}", rid.format("%Y%m%dT%H%M%SZ"));
        let older_text = insert_before_first_end(&replace_uid(&text, &current.info.uid, &uid), &marker);
        let newer_text = insert_before_first_end(&text, &marker);

        let name = format!("{}{}", uuid::Uuid::new_v4().simple(), key.kind().resource_suffix());
        let now = Utc::now();
        let older = ObjectInfo {
            key: key.collection().object(name.clone()),
            uid: uid.clone(),
            data: Bytes::from(older_text.clone()),
            metadata: ObjectMetadata {
                schedule_tag: current
                    .info
                    .metadata
                    .is_schedule_object
                    .filter(|flag| *flag)
                    .map(|_| uuid::Uuid::new_v4().simple().to_string()),
                schedule_etags: Vec::new(),
                ..current.info.metadata.clone()
            },
            created: now,
            modified: now,
            dropbox_id: dropbox_id_for(&uid),
            attachment_count: 0,
            ..current.info.clone()
        };

        let object = state.object_mut(key)?;
        object.info.data = Bytes::from(newer_text);
        object.info.modified = now;
        state.collection_mut(key.collection())?.objects.insert(
            name,
            ObjectState {
                info: older.clone(),
                properties: BTreeMap::new(),
                attachments: BTreeMap::new(),
            },
        );
        state.touch(key.collection());
        Ok(older)
    }

    async fn reopen_object(&self, key: &ObjectKey) -> Result<Option<ObjectInfo>, StoreError> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        debug!("Reopening {} in a new transaction", key);
        self.object(key).await
    }

    async fn property(
        &self,
        target: &PropertyTarget,
        name: &PropertyName,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state.read().await;
        let properties = match target {
            PropertyTarget::Collection(key) => state.collections.get(key).map(|c| &c.properties),
            PropertyTarget::Object(key) => state.object(key).map(|o| &o.properties),
        };
        Ok(properties.and_then(|p| p.get(name).cloned()))
    }

    async fn set_property(
        &self,
        target: &PropertyTarget,
        name: &PropertyName,
        value: String,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.faults.protected_properties.contains(name) {
            return Err(StoreError::PropertyChangeNotAllowed {
                name: name.to_string(),
            });
        }
        let properties = match target {
            PropertyTarget::Collection(key) => &mut state.collection_mut(key)?.properties,
            PropertyTarget::Object(key) => &mut state.object_mut(key)?.properties,
        };
        properties.insert(name.clone(), value);
        Ok(())
    }

    async fn remove_property(
        &self,
        target: &PropertyTarget,
        name: &PropertyName,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.faults.protected_properties.contains(name) {
            return Err(StoreError::PropertyChangeNotAllowed {
                name: name.to_string(),
            });
        }
        let properties = match target {
            PropertyTarget::Collection(key) => &mut state.collection_mut(key)?.properties,
            PropertyTarget::Object(key) => &mut state.object_mut(key)?.properties,
        };
        Ok(properties.remove(name).is_some())
    }

    async fn property_names(&self, target: &PropertyTarget) -> Result<Vec<PropertyName>, StoreError> {
        let state = self.state.read().await;
        let properties = match target {
            PropertyTarget::Collection(key) => state.collections.get(key).map(|c| &c.properties),
            PropertyTarget::Object(key) => state.object(key).map(|o| &o.properties),
        };
        Ok(properties
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn attachment_names(&self, object: &ObjectKey) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let object = state
            .object(object)
            .ok_or_else(|| StoreError::no_such_object(object.name()))?;
        Ok(object.attachments.keys().cloned().collect())
    }

    async fn attachment(
        &self,
        object: &ObjectKey,
        name: &str,
    ) -> Result<Option<AttachmentInfo>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .object(object)
            .and_then(|o| o.attachments.get(name))
            .map(|a| a.info.clone()))
    }

    async fn read_attachment(&self, object: &ObjectKey, name: &str) -> Result<Bytes, StoreError> {
        let state = self.state.read().await;
        state
            .object(object)
            .and_then(|o| o.attachments.get(name))
            .map(|a| a.data.clone())
            .ok_or_else(|| StoreError::Io {
                message: format!("attachment {name} has no stored content"),
            })
    }

    async fn open_attachment(
        &self,
        object: &ObjectKey,
        name: &str,
        content_type: &str,
    ) -> Result<Self::Writer, StoreError> {
        let state = self.state.read().await;
        let current = state
            .object(object)
            .ok_or_else(|| StoreError::no_such_object(object.name()))?;
        if current
            .attachments
            .get(name)
            .map(|a| a.info.is_managed())
            .unwrap_or(false)
        {
            return Err(StoreError::AttachmentDropboxNotAllowed);
        }
        state.check_lock(&format!(
            "/calendars/__uids__/{}/dropbox/{}/{}",
            object.home(),
            current.info.dropbox_id,
            name
        ))?;
        Ok(InMemoryAttachmentWriter {
            state: Arc::clone(&self.state),
            object: object.clone(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            buffer: Vec::new(),
        })
    }

    async fn remove_attachment(&self, object: &ObjectKey, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let current = state.object_mut(object)?;
        current
            .attachments
            .remove(name)
            .ok_or_else(|| StoreError::no_such_object(name))?;
        current.info.attachment_count = current.attachments.len();
        Ok(())
    }

    async fn add_managed_attachment(
        &self,
        object: &ObjectKey,
        content_type: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<ManagedAttachment, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&object.url())?;
        state.check_attachment_limits(object.home(), data.len() as u64, 0)?;

        let managed_id = uuid::Uuid::new_v4().simple().to_string();
        let current = state.object_mut(object)?;
        let name = if current.attachments.contains_key(filename) {
            format!("{}-{}", &managed_id[..8], filename)
        } else {
            filename.to_string()
        };
        let line = format!("ATTACH;MANAGED-ID={managed_id};FILENAME={name}:{name}");
        let text = insert_before_first_end(&String::from_utf8_lossy(&current.info.data), &line);
        current.info.data = Bytes::from(text);
        current.info.modified = Utc::now();
        current.attachments.insert(
            name.clone(),
            StoredAttachment {
                info: AttachmentInfo {
                    name: name.clone(),
                    content_type: content_type.to_string(),
                    size: data.len() as u64,
                    managed_id: Some(managed_id.clone()),
                    created: Utc::now(),
                },
                data,
            },
        );
        current.info.attachment_count = current.attachments.len();
        let dropbox_id = current.info.dropbox_id.clone();
        state.touch(object.collection());
        Ok(ManagedAttachment {
            managed_id,
            name,
            dropbox_id,
        })
    }

    async fn update_managed_attachment(
        &self,
        object: &ObjectKey,
        managed_id: &str,
        content_type: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<ManagedAttachment, StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&object.url())?;
        let existing = state
            .object(object)
            .ok_or_else(|| StoreError::no_such_object(object.name()))?
            .attachments
            .iter()
            .find(|(_, a)| a.info.managed_id.as_deref() == Some(managed_id))
            .map(|(name, a)| (name.clone(), a.info.size))
            .ok_or_else(|| StoreError::AttachmentStoreValidManagedId {
                managed_id: managed_id.to_string(),
            })?;
        state.check_attachment_limits(object.home(), data.len() as u64, existing.1)?;

        let current = state.object_mut(object)?;
        current.attachments.remove(&existing.0);
        let text = remove_lines_containing(
            &String::from_utf8_lossy(&current.info.data),
            &format!("MANAGED-ID={managed_id}"),
        );
        let line = format!("ATTACH;MANAGED-ID={managed_id};FILENAME={filename}:{filename}");
        current.info.data = Bytes::from(insert_before_first_end(&text, &line));
        current.info.modified = Utc::now();
        current.attachments.insert(
            filename.to_string(),
            StoredAttachment {
                info: AttachmentInfo {
                    name: filename.to_string(),
                    content_type: content_type.to_string(),
                    size: data.len() as u64,
                    managed_id: Some(managed_id.to_string()),
                    created: Utc::now(),
                },
                data,
            },
        );
        current.info.attachment_count = current.attachments.len();
        let dropbox_id = current.info.dropbox_id.clone();
        state.touch(object.collection());
        Ok(ManagedAttachment {
            managed_id: managed_id.to_string(),
            name: filename.to_string(),
            dropbox_id,
        })
    }

    async fn remove_managed_attachment(
        &self,
        object: &ObjectKey,
        managed_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&object.url())?;
        let current = state.object_mut(object)?;
        let name = current
            .attachments
            .iter()
            .find(|(_, a)| a.info.managed_id.as_deref() == Some(managed_id))
            .map(|(name, _)| name.clone())
            .ok_or(StoreError::AttachmentRemoveFailed)?;
        current.attachments.remove(&name);
        current.info.attachment_count = current.attachments.len();
        let text = remove_lines_containing(
            &String::from_utf8_lossy(&current.info.data),
            &format!("MANAGED-ID={managed_id}"),
        );
        current.info.data = Bytes::from(text);
        current.info.modified = Utc::now();
        state.touch(object.collection());
        Ok(())
    }

    async fn dropbox_ids(&self, home: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let ids: BTreeSet<String> = state
            .collections
            .iter()
            .filter(|(key, _)| key.home() == home && key.kind() == StoreKind::Calendar)
            .flat_map(|(_, collection)| collection.objects.values())
            .map(|object| object.info.dropbox_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn object_for_dropbox(
        &self,
        home: &str,
        dropbox_id: &str,
    ) -> Result<Option<ObjectInfo>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .collections
            .iter()
            .filter(|(key, _)| key.home() == home && key.kind() == StoreKind::Calendar)
            .flat_map(|(_, collection)| collection.objects.values())
            .find(|object| object.info.dropbox_id == dropbox_id)
            .map(|object| object.info.clone()))
    }

    async fn notification_names(&self, home: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .notifications
            .get(home)
            .map(|n| n.items.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn notifications_sync_token(&self, home: &str) -> Result<String, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .notifications
            .get(home)
            .map(|n| n.revision)
            .unwrap_or(0)
            .to_string())
    }

    async fn notification(
        &self,
        home: &str,
        name: &str,
    ) -> Result<Option<NotificationInfo>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .notifications
            .get(home)
            .and_then(|n| n.items.get(name).cloned()))
    }

    async fn remove_notification(&self, home: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_lock(&Self::notification_url(home, name))?;
        let notifications = state
            .notifications
            .get_mut(home)
            .ok_or_else(|| StoreError::no_such_object(name))?;
        notifications
            .items
            .remove(name)
            .ok_or_else(|| StoreError::no_such_object(name))?;
        notifications.revision += 1;
        Ok(())
    }
}

fn first_component_type(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .filter_map(|line| line.trim_end_matches('\r').split_once(':'))
        .filter(|(name, _)| name.eq_ignore_ascii_case("BEGIN"))
        .map(|(_, value)| value.trim().to_ascii_uppercase())
        .find(|value| value != "VCALENDAR" && value != "VTIMEZONE" && value != "VCARD")
}
