//! Batch POSTs on calendar and address-book collections.
//!
//! Two request shapes share one engine:
//!
//! * a **simple batch** is a body of the collection's own media type holding
//!   several items, each of which is created under a server-assigned name
//!   ([`simple`]);
//! * a **CRUD batch** is a `multiput` XML document mixing creates, updates
//!   and deletes ([`crud`]).
//!
//! Both answer with one multistatus whose entries follow the order of the
//! request items, whatever order the phases ran in. A failing item only
//! fails its own entry. The collection's change token is re-read once at the
//! end and returned in the `CTag` header.
//!
//! Address-book creates may reference group members created in the same
//! batch; see [`groups`].
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::{BridgeBuilder, BridgeConfig, DavMethod, DavRequest};
//! use dav_store_bridge::protocol::header;
//! use dav_store_bridge::storage::{CollectionKey, InMemoryStore, Store, StoreKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let key = CollectionKey::new(StoreKind::Calendar, "alice", "work");
//! store.create_collection(&key, None).await?;
//! let config = BridgeConfig {
//!     enable_batch_upload: true,
//!     ..BridgeConfig::default()
//! };
//! let bridge = BridgeBuilder::new(store).with_config(config).build()?;
//!
//! let body = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:a\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n\
//!             BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:b\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
//! let request = DavRequest::new(DavMethod::Post, key.url())
//!     .with_header(header::CONTENT_TYPE, "text/calendar")
//!     .with_body(body);
//! let response = bridge.handle(request).await;
//! assert_eq!(response.status.as_u16(), 207);
//! assert!(response.header(header::CTAG).is_some());
//! # Ok(())
//! # }
//! ```

pub mod crud;
pub mod groups;
pub mod simple;

use crate::component::Component;
use crate::error::{DavError, DavResult};
use crate::mapping::ErrorMap;
use crate::multistatus::{MultiStatus, Prop, ResponseEntry};
use crate::protocol::{DavRequest, DavResponse, header};
use crate::resource::{Batchable, Bindable, Context, ObjectResource, PendingMetadata};
use crate::storage::{CollectionInfo, Store, StoreError, StoreKind};
use chrono::Utc;
use http::StatusCode;
use log::{debug, info};
use sha2::{Digest, Sha256};

/// Entry point for a POST without an `action` parameter.
pub async fn post<S: Store, B: Batchable>(
    ctx: Context<'_, S>,
    collection: &mut B,
    request: &DavRequest,
) -> DavResult<DavResponse> {
    let content_type = request.content_type().ok_or_else(|| {
        DavError::unsupported_media_type("Batch request requires a content type")
    })?;
    let essence = content_type.essence();
    let kind = collection.kind();
    if ctx.parser.media_types(kind).iter().any(|media| *media == essence) {
        simple::post(ctx, collection, request).await
    } else if essence == "text/xml" || essence == "application/xml" {
        crud::post(ctx, collection, request).await
    } else {
        debug!("Rejecting batch POST of type {}", essence);
        Err(DavError::unsupported_media_type(format!(
            "Unsupported content type for batch request: {essence}"
        )))
    }
}

pub(crate) fn check_body_size(body_bytes: usize, max_bytes: usize) -> DavResult<()> {
    if body_bytes > max_bytes {
        return Err(DavError::forbidden("Batch request body too large"));
    }
    Ok(())
}

pub(crate) fn check_item_count(items: usize, max_items: usize) -> DavResult<()> {
    if items > max_items {
        return Err(DavError::forbidden("Too many resources in batch request"));
    }
    Ok(())
}

/// The collection a batch writes into; batches need a bound collection.
pub(crate) fn bound_parent<B: Batchable>(collection: &B) -> DavResult<CollectionInfo> {
    collection
        .collection_info()
        .cloned()
        .ok_or_else(|| DavError::not_found(format!("Collection not found: {}", collection.url())))
}

/// Server-assigned name for the `index`-th created item.
pub fn item_name(index: usize, uid: &str, collection_url: &str, kind: StoreKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(uid.as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    hasher.update(collection_url.as_bytes());
    let digest: String = hasher.finalize()[..16]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("{digest}{}", kind.resource_suffix())
}

/// An item to create, keyed by its position in the request.
#[derive(Debug)]
pub struct CreateItem {
    pub index: usize,
    pub component: DavResult<Component>,
}

/// Entry for a stored item: its entity tag plus either its UID or, when the
/// client asked for changed data and the store altered it, the stored data.
pub(crate) fn stored_entry(
    object: &ObjectResource,
    altered: bool,
    return_changed: bool,
    with_uid: bool,
) -> ResponseEntry {
    let mut props = Vec::new();
    if let Some(etag) = object.etag() {
        props.push(Prop::GetEtag(etag.to_string()));
    }
    if return_changed && altered {
        if let Some(info) = object.info() {
            let (namespace, name) = object.kind().data_element();
            props.push(Prop::Data {
                namespace,
                name,
                text: String::from_utf8_lossy(&info.data).into_owned(),
            });
        }
    } else if with_uid {
        if let Some(info) = object.info() {
            props.push(Prop::Uid(info.uid.clone()));
        }
    }
    ResponseEntry::PropStat {
        href: object.url(),
        props,
        status: StatusCode::OK,
    }
}

/// Entry for a failed item.
pub(crate) fn failure_entry(href: impl Into<String>, err: &DavError, uid: Option<String>) -> ResponseEntry {
    ResponseEntry::Status {
        href: href.into(),
        status: err.status(),
        error: err.element().cloned(),
        uid,
    }
}

/// Per-item store failures are reported with the collection's map; failures
/// it does not cover are the client's fault.
pub(crate) fn item_error<S: Store>(ctx: Context<'_, S>, err: StoreError, map: ErrorMap) -> DavError {
    match ctx.mapper.try_map(&err, &[map], None) {
        Some(mapped) => mapped,
        None => {
            debug!("Unmapped batch item failure: {}", err);
            DavError::bad_request(err.to_string())
        }
    }
}

/// Create one item under a fresh name.
pub(crate) async fn create_one<S: Store>(
    ctx: Context<'_, S>,
    parent: &CollectionInfo,
    index: usize,
    component: &Component,
    pending: PendingMetadata,
) -> Result<(ObjectResource, bool), StoreError> {
    let name = item_name(index, &component.uid, &parent.key.url(), parent.key.kind());
    let mut object = ObjectResource::unbound(parent.clone(), &name);
    object.pending_mut().extend(pending);
    let outcome = object.write(ctx.store, component, false).await?;
    Ok((object, outcome.altered))
}

/// Create every item, returning one entry per item.
pub async fn bulk_create<S: Store>(
    ctx: Context<'_, S>,
    parent: &CollectionInfo,
    map: ErrorMap,
    items: Vec<CreateItem>,
    return_changed: bool,
) -> DavResult<Vec<(usize, ResponseEntry)>> {
    if parent.key.kind() == StoreKind::AddressBook {
        return groups::bulk_create(ctx, parent, map, items, return_changed).await;
    }
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let entry = match item.component {
            Err(err) => failure_entry("", &err, None),
            Ok(component) => {
                match create_one(ctx, parent, item.index, &component, PendingMetadata::new()).await {
                    Ok((object, altered)) => stored_entry(&object, altered, return_changed, true),
                    Err(err) => {
                        failure_entry("", &item_error(ctx, err, map), Some(component.uid.clone()))
                    }
                }
            }
        };
        results.push((item.index, entry));
    }
    Ok(results)
}

/// Order the entries by request position, refresh the collection and answer
/// with its new change token.
pub(crate) async fn finish<S: Store, B: Batchable>(
    ctx: Context<'_, S>,
    collection: &mut B,
    mut results: Vec<(usize, ResponseEntry)>,
) -> DavResult<DavResponse> {
    results.sort_by_key(|(index, _)| *index);
    let mut multistatus = MultiStatus::new();
    for (_, entry) in results {
        multistatus.push(entry);
    }
    collection.refresh(ctx.store).await?;
    info!(
        "Batch on {} finished with {} entries",
        collection.url(),
        multistatus.len()
    );
    let mut response = multistatus.into_response()?;
    if let Some(token) = collection.sync_token() {
        response.set_header(header::CTAG, token);
    }
    Ok(response)
}
