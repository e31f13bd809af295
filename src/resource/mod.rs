//! Protocol resources bound to backend store objects.
//!
//! A resource is a node of the URL tree bound either to a backend object or
//! to nothing (the non-existent sentinel). Handlers for the protocol methods
//! live on the concrete resource types; algorithms shared between them (batch
//! processing, conditional checks, move and delete) take any value that
//! implements the relevant capability trait:
//!
//! * [`Bindable`]: URL and existence
//! * [`ExceptionMapped`]: which exception maps apply to stores and moves
//! * [`Shareable`]: sharing role and owner
//! * [`Batchable`]: a collection that accepts batch POSTs
//!
//! Every handler receives a [`Context`] holding the request's store
//! transaction and the bridge-wide collaborators.

pub mod collection;
pub mod metadata;
pub mod notification;
pub mod object;
pub mod properties;
pub mod version;

pub use collection::CollectionResource;
pub use metadata::{MetadataKey, MetadataSource, MetadataValue, ObjectMetadata, PendingMetadata};
pub use notification::{NotificationCollection, NotificationResource};
pub use object::ObjectResource;
pub use properties::{PropertyAdapter, PropertyUpdate};
pub use version::{EntityTag, TagList, VersionError};

use crate::acl::{Authorizer, DelegationResolver, Privilege};
use crate::component::ComponentParser;
use crate::config::BridgeConfig;
use crate::error::{DavError, DavResult, precondition};
use crate::mapping::{self, ErrorMap, ExceptionMapper};
use crate::protocol::DavRequest;
use crate::storage::{CollectionInfo, CollectionKey, ShareRole, Store, StoreError, StoreKind};
use log::debug;
use std::future::Future;

/// Everything a handler needs for one request.
pub struct Context<'a, S: Store> {
    /// The request's transaction
    pub store: &'a S,
    pub parser: &'a dyn ComponentParser,
    pub config: &'a BridgeConfig,
    pub mapper: &'a ExceptionMapper,
    pub authorizer: &'a dyn Authorizer,
    pub delegation: &'a dyn DelegationResolver,
}

impl<S: Store> Clone for Context<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Store> Copy for Context<'_, S> {}

impl<S: Store> Context<'_, S> {
    pub fn allowed(&self, request: &DavRequest, url: &str, privilege: Privilege) -> bool {
        self.authorizer
            .allowed(request.principal.as_deref(), url, privilege)
    }

    /// Fail with `need-privileges` unless the requester holds `privilege` on `url`.
    pub fn require(&self, request: &DavRequest, url: &str, privilege: Privilege) -> DavResult<()> {
        if self.allowed(request, url, privilege) {
            Ok(())
        } else {
            debug!(
                "{:?} lacks {} on {}",
                request.principal, privilege, url
            );
            Err(DavError::precondition_with(
                precondition::NEED_PRIVILEGES,
                format!("{privilege} privilege required on {url}"),
            ))
        }
    }

    /// Translate a store failure with one exception map.
    pub fn map(&self, err: StoreError, map: ErrorMap) -> DavError {
        self.mapper.map(err, map)
    }
}

/// A node that may or may not be bound to a backend object.
pub trait Bindable {
    fn url(&self) -> String;

    fn exists(&self) -> bool;
}

/// Exception maps used when storing into, or moving out of, a resource.
pub trait ExceptionMapped {
    fn store_errors(&self) -> ErrorMap;

    fn move_errors(&self) -> ErrorMap;
}

/// Sharing state of a collection or an individually shared object.
pub trait Shareable {
    fn share_role(&self) -> ShareRole;

    fn owner_uid(&self) -> &str;

    fn is_sharee(&self) -> bool {
        self.share_role() == ShareRole::Sharee
    }
}

/// A collection that accepts simple and CRUD batch POSTs.
pub trait Batchable: Bindable + ExceptionMapped {
    fn collection_key(&self) -> &CollectionKey;

    /// Current change token, `None` while unbound.
    fn sync_token(&self) -> Option<&str>;

    fn collection_info(&self) -> Option<&CollectionInfo>;

    /// Re-read the collection so the change token reflects the batch.
    fn refresh<S: Store>(&mut self, store: &S) -> impl Future<Output = DavResult<()>> + Send;

    fn kind(&self) -> StoreKind {
        self.collection_key().kind()
    }
}

/// Store map for objects of a kind.
pub fn object_errors(kind: StoreKind) -> ErrorMap {
    match kind {
        StoreKind::Calendar => mapping::calendar_object,
        StoreKind::AddressBook => mapping::addressbook_object,
    }
}

/// Move map for objects of a kind.
pub fn object_move_errors(kind: StoreKind) -> ErrorMap {
    match kind {
        StoreKind::Calendar => mapping::calendar_object_move,
        StoreKind::AddressBook => mapping::addressbook_object_move,
    }
}

/// URL of the parent collection, with a trailing slash.
pub fn parent_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(index) => trimmed[..=index].to_string(),
        None => "/".to_string(),
    }
}

/// Final path segment without a trailing slash.
pub fn last_segment(url: &str) -> &str {
    let trimmed = url.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Context;
    use crate::acl::{AllowAll, StaticDelegation};
    use crate::component::TextComponentParser;
    use crate::config::BridgeConfig;
    use crate::mapping::ExceptionMapper;
    use crate::storage::InMemoryStore;

    pub(crate) struct Fixture {
        pub store: InMemoryStore,
        pub config: BridgeConfig,
        pub mapper: ExceptionMapper,
        pub delegation: StaticDelegation,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_config(BridgeConfig::default())
        }

        pub fn with_config(config: BridgeConfig) -> Self {
            Self {
                store: InMemoryStore::new(),
                mapper: ExceptionMapper::new(&config),
                config,
                delegation: StaticDelegation::new(),
            }
        }

        pub fn ctx(&self) -> Context<'_, InMemoryStore> {
            Context {
                store: &self.store,
                parser: &TextComponentParser,
                config: &self.config,
                mapper: &self.mapper,
                authorizer: &AllowAll,
                delegation: &self.delegation,
            }
        }
    }

    pub(crate) fn event(uid: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:20240101T100000Z\r\nSUMMARY:Test\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
        )
    }

    pub(crate) fn scheduled_event(uid: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:20240101T100000Z\r\nRRULE:FREQ=DAILY\r\nORGANIZER:urn:x-uid:alice\r\nATTENDEE:urn:x-uid:bob\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
        )
    }

    pub(crate) fn card(uid: &str) -> String {
        format!("BEGIN:VCARD\r\nVERSION:3.0\r\nUID:{uid}\r\nFN:{uid}\r\nEND:VCARD\r\n")
    }
}
