//! DELETE and MOVE for collections and objects.
//!
//! Deleting a collection removes its children one by one first. A child that
//! cannot be removed is reported as a 400 entry of a multistatus reply while
//! the remaining children, and then the collection itself, are still removed.
//! Sharees never delete the owner's data: their binding is dropped instead.
//!
//! MOVE is a rename inside one home. Collections may only be renamed within
//! their parent; objects may move between collections of the same home.
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::{BridgeBuilder, DavMethod, DavRequest};
//! use dav_store_bridge::protocol::header;
//! use dav_store_bridge::storage::{CollectionKey, InMemoryStore, Store, StoreKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let key = CollectionKey::new(StoreKind::Calendar, "alice", "work");
//! store.create_collection(&key, None).await?;
//! let bridge = BridgeBuilder::new(store).build()?;
//!
//! let rename = DavRequest::new(DavMethod::Move, key.url())
//!     .with_header(header::DESTINATION, "/calendars/__uids__/alice/projects/");
//! assert_eq!(bridge.handle(rename).await.status.as_u16(), 204);
//!
//! let delete = DavRequest::new(DavMethod::Delete, "/calendars/__uids__/alice/projects/");
//! assert_eq!(bridge.handle(delete).await.status.as_u16(), 204);
//! # Ok(())
//! # }
//! ```

use crate::acl::Privilege;
use crate::error::{DavError, DavResult};
use crate::mapping;
use crate::multistatus::{MultiStatus, ResponseEntry};
use crate::precondition::{check_object, check_schedule_tag};
use crate::protocol::{DavRequest, DavResponse, header};
use crate::resource::{
    Bindable, CollectionResource, Context, ExceptionMapped, ObjectResource, Shareable,
    last_segment, parent_url,
};
use crate::storage::{CollectionInfo, ShareRole, Store, StoreError, StoreKind};
use http::StatusCode;
use log::{debug, info, warn};

/// Address-book objects that stand for a share are removed without the
/// parent's Unbind privilege.
fn is_share_binding(object: &ObjectResource) -> bool {
    object.kind() == StoreKind::AddressBook
        && (object.is_sharee() || object.info().map(|info| info.is_shared_group).unwrap_or(false))
}

/// Remove an object from the store and unbind it.
///
/// Address-book objects honour sharing: a sharee's object is unshared, the
/// group standing for a shared address book drops the whole share, and an
/// owner's shared group withdraws the share before being removed.
pub async fn store_remove<S: Store>(ctx: Context<'_, S>, object: &mut ObjectResource) -> DavResult<()> {
    let key = object.key().clone();
    let result = if object.kind() == StoreKind::AddressBook && object.is_sharee() {
        debug!("Unsharing shared object {}", key);
        ctx.store.unshare_object(&key).await
    } else if object.kind() == StoreKind::AddressBook
        && object.info().map(|info| info.is_shared_group).unwrap_or(false)
    {
        debug!("Removing share of {} through its group {}", key.collection(), key);
        ctx.store.unshare_collection(key.collection()).await
    } else {
        if object.kind() == StoreKind::AddressBook && object.share_role() == ShareRole::Owner {
            debug!("Withdrawing group share of {}", key);
            ctx.store
                .remove_group_share(&key)
                .await
                .map_err(|err| ctx.map(err, object.store_errors()))?;
        }
        ctx.store.remove_object(&key).await
    };

    match result {
        Ok(()) => {
            object.unbind();
            Ok(())
        }
        Err(StoreError::NoSuchObject { .. }) => {
            debug!("Object {} vanished before removal", key);
            Err(DavError::not_found(format!("Resource not found: {key}")))
        }
        Err(err) => Err(ctx.map(err, object.store_errors())),
    }
}

/// DELETE on an object.
pub async fn delete_object<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    object: &mut ObjectResource,
) -> DavResult<DavResponse> {
    let info = object.require_bound()?;
    if !is_share_binding(object) {
        ctx.require(request, &parent_url(&object.url()), Privilege::Unbind)?;
    }
    if object.kind() == StoreKind::Calendar {
        check_schedule_tag(request, Some(info), false)?;
    }
    check_object(request, Some(info), ctx.config.schedule_tag_compatibility)?;

    info!("Deleting {}", object.url());
    store_remove(ctx, object).await?;
    Ok(DavResponse::new(StatusCode::NO_CONTENT))
}

/// DELETE on a calendar or address book.
pub async fn delete_collection<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    collection: &mut CollectionResource,
) -> DavResult<DavResponse> {
    if collection.is_inbox() {
        return Err(DavError::forbidden("The scheduling inbox cannot be deleted"));
    }
    collection.require_bound()?;
    if let Some(depth) = request.depth() {
        if !depth.eq_ignore_ascii_case("infinity") {
            return Err(DavError::bad_request(format!(
                "illegal depth header for DELETE on collection: {depth}"
            )));
        }
    }
    ctx.require(request, &collection.key().home_url(), Privilege::Unbind)?;

    let key = collection.key().clone();
    if collection.is_sharee() {
        info!("Removing shared collection {}", key);
        ctx.store
            .unshare_collection(&key)
            .await
            .map_err(|err| ctx.map(err, mapping::collection))?;
        collection.unbind();
        return Ok(DavResponse::new(StatusCode::NO_CONTENT));
    }

    info!("Deleting collection {}", key);
    let mut errors = MultiStatus::new();
    for name in collection.children(ctx.store).await? {
        let mut child = collection.child(ctx.store, &name).await?;
        if !child.exists() {
            continue;
        }
        if let Err(err) = store_remove(ctx, &mut child).await {
            warn!("Could not remove {} while deleting {}: {}", child.url(), key, err);
            errors.push(ResponseEntry::status_only(child.url(), StatusCode::BAD_REQUEST));
        }
    }

    ctx.store
        .remove_collection(&key)
        .await
        .map_err(|err| ctx.map(err, mapping::collection))?;
    collection.unbind();

    if errors.is_empty() {
        Ok(DavResponse::new(StatusCode::NO_CONTENT))
    } else {
        debug!("{} children of {} could not be removed", errors.len(), key);
        errors.into_response()
    }
}

/// MOVE on a collection: rename within the same home.
pub async fn move_collection<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    collection: &mut CollectionResource,
) -> DavResult<DavResponse> {
    if collection.is_inbox() {
        return Err(DavError::forbidden("The scheduling inbox cannot be moved"));
    }
    if collection.key().kind() == StoreKind::AddressBook {
        return Err(DavError::forbidden("Address books may not be renamed"));
    }
    collection.require_bound()?;
    let destination = request
        .destination()
        .ok_or_else(|| DavError::bad_request("No destination header in MOVE request."))?;

    let source_url = collection.url();
    if parent_url(&source_url) != parent_url(&destination) {
        debug!("Refusing to move {} outside its home to {}", source_url, destination);
        return Err(DavError::forbidden("Collections can only be renamed within their home"));
    }
    let new_name = last_segment(&destination);
    if new_name.is_empty() {
        return Err(DavError::bad_request("Destination of MOVE has no name"));
    }
    let target = collection.key().renamed(new_name);
    if ctx.store.collection(&target).await?.is_some() {
        return Err(DavError::forbidden(format!("Destination already exists: {}", target.url())));
    }

    let home_url = collection.key().home_url();
    ctx.require(request, &home_url, Privilege::Unbind)?;
    ctx.require(request, &home_url, Privilege::Bind)?;

    info!("Renaming {} to {}", source_url, target);
    let renamed = ctx
        .store
        .rename_collection(collection.key(), new_name)
        .await
        .map_err(|err| match err {
            StoreError::HomeChildNameAlreadyExists { name } => {
                DavError::forbidden(format!("Home child name already exists: {name}"))
            }
            err => ctx.map(err, mapping::collection),
        })?;
    collection.bind(renamed);
    Ok(DavResponse::new(StatusCode::NO_CONTENT))
}

/// MOVE on an object.
///
/// `destination_parent` is the bound collection the `Destination` URL falls
/// into, `None` when it names no calendar or address book.
pub async fn move_object<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    object: &mut ObjectResource,
    destination_parent: Option<CollectionInfo>,
) -> DavResult<DavResponse> {
    let info = object.require_bound()?;
    if object.kind() == StoreKind::Calendar {
        check_schedule_tag(request, Some(info), false)?;
    }
    let destination_url = request
        .destination()
        .ok_or_else(|| DavError::bad_request("No destination header in MOVE request."))?;

    let Some(destination_parent) = destination_parent else {
        debug!("MOVE destination {} has no collection parent", destination_url);
        return Err(DavError::forbidden(format!(
            "Destination of MOVE is not valid: {destination_url}"
        )));
    };
    let destination =
        ObjectResource::locate(ctx.store, destination_parent, last_segment(&destination_url)).await?;
    if destination.exists() {
        return Err(if request.overwrite() {
            DavError::forbidden("Cannot overwrite existing resource with a MOVE")
        } else {
            DavError::precondition_failed(
                "Cannot MOVE to existing resource without overwrite flag enabled",
            )
        });
    }
    if destination.parent().key.home_url() != object.parent().key.home_url() {
        return Err(DavError::forbidden(format!(
            "Can only MOVE within the same home collection: {destination_url}"
        )));
    }

    ctx.require(request, &object.parent().key.url(), Privilege::Unbind)?;
    ctx.require(request, &destination.parent().key.url(), Privilege::Bind)?;

    info!("Moving {} to {}", object.url(), destination.url());
    ctx.store
        .move_object(object.key(), destination.key())
        .await
        .map_err(|err| ctx.map(err, object.move_errors()))?;
    object.unbind();

    let mut response = DavResponse::new(StatusCode::CREATED);
    response.set_header(header::LOCATION, destination.url());
    Ok(response)
}
