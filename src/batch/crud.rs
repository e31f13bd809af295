//! CRUD batch: a `multiput` document of creates, updates and deletes.
//!
//! ```xml
//! <M:multiput xmlns:M="http://me.com/_namespace/" xmlns:D="DAV:">
//!   <M:resource>
//!     <D:set><D:prop><C:calendar-data>...</C:calendar-data></D:prop></D:set>
//!   </M:resource>
//!   <M:resource>
//!     <D:href>/calendars/__uids__/alice/work/old.ics</D:href>
//!     <M:delete/>
//!     <M:if-match>"etag"</M:if-match>
//!   </M:resource>
//! </M:multiput>
//! ```
//!
//! Deletes run first, then creates, then updates. Bind and Unbind are
//! checked once for their whole phase; Write is checked per update.

use super::{
    CreateItem, bound_parent, bulk_create, check_body_size, check_item_count, failure_entry,
    finish, stored_entry,
};
use crate::acl::Privilege;
use crate::component::Component;
use crate::error::{DavError, DavResult, ns, precondition};
use crate::move_delete;
use crate::multistatus::ResponseEntry;
use crate::precondition::check_ctag;
use crate::protocol::{DavRequest, DavResponse};
use crate::resource::{
    Batchable, Bindable, Context, ObjectResource, Shareable, last_segment, parent_url,
};
use crate::storage::{CollectionInfo, Store, StoreKind};
use crate::xml::{self, Element};
use http::StatusCode;
use log::{debug, info};

/// One classified `M:resource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create {
        data: String,
    },
    Update {
        href: String,
        data: String,
        if_match: Option<String>,
    },
    Delete {
        href: String,
        if_match: Option<String>,
    },
}

fn item_data(resource: &Element) -> Option<String> {
    let set = resource.child(ns::DAV, "set")?;
    let prop = set.child(ns::DAV, "prop")?;
    let data = prop.children.first()?;
    (!data.text.trim().is_empty()).then(|| data.text.clone())
}

fn item_if_match(resource: &Element) -> Option<String> {
    let element = resource.child(ns::MOBILEME, "if-match")?;
    let value = match element.child(ns::DAV, "getetag") {
        Some(etag) => etag.trimmed_text(),
        None => element.trimmed_text(),
    };
    (!value.is_empty()).then(|| value.to_string())
}

/// Classify every `M:resource` of a `multiput` body, in document order.
pub fn parse_multiput(body: &[u8]) -> DavResult<Vec<Operation>> {
    let root = xml::parse_document(body)?;
    if !root.is(ns::MOBILEME, "multiput") {
        return Err(DavError::bad_request("Invalid multiput request body"));
    }
    root.children_named(ns::MOBILEME, "resource")
        .enumerate()
        .map(|(index, resource)| {
            let href = resource
                .child(ns::DAV, "href")
                .map(|href| href.trimmed_text().to_string())
                .filter(|href| !href.is_empty());
            let delete = resource.child(ns::MOBILEME, "delete").is_some();
            let if_match = item_if_match(resource);
            match (href, delete) {
                (None, _) => item_data(resource)
                    .map(|data| Operation::Create { data })
                    .ok_or_else(|| {
                        DavError::bad_request(format!("Missing data for create in batch item {index}"))
                    }),
                (Some(href), true) => Ok(Operation::Delete { href, if_match }),
                (Some(href), false) => item_data(resource)
                    .map(|data| Operation::Update {
                        href,
                        data,
                        if_match,
                    })
                    .ok_or_else(|| {
                        DavError::bad_request(format!("Missing data for update in batch item {index}"))
                    }),
            }
        })
        .collect()
}

fn if_match_fails(object: &ObjectResource, if_match: Option<&str>) -> bool {
    match (if_match, object.etag()) {
        (Some(expected), Some(current)) => expected.trim().trim_matches('"') != current.opaque(),
        _ => false,
    }
}

/// Bind the object `href` names, provided it is a child of `parent`.
async fn locate_item<S: Store>(
    ctx: Context<'_, S>,
    parent: &CollectionInfo,
    href: &str,
) -> DavResult<Option<ObjectResource>> {
    if parent_url(href) != parent.key.url() {
        debug!("Batch href {} is outside {}", href, parent.key);
        return Ok(None);
    }
    let object = ObjectResource::locate(ctx.store, parent.clone(), last_segment(href)).await?;
    Ok(object.exists().then_some(object))
}

fn not_found(href: &str) -> DavError {
    DavError::not_found(format!("Resource not found: {href}"))
}

pub async fn post<S: Store, B: Batchable>(
    ctx: Context<'_, S>,
    collection: &mut B,
    request: &DavRequest,
) -> DavResult<DavResponse> {
    let parent = bound_parent(collection)?;
    let url = collection.url();
    ctx.require(request, &url, Privilege::Read)?;
    ctx.require(request, &url, Privilege::Write)?;
    check_ctag(request, &parent.sync_token)?;
    check_body_size(request.body.len(), ctx.config.max_crud_batch_bytes)?;
    let return_changed = request.return_changed_data();

    let operations = parse_multiput(&request.body)?;
    check_item_count(operations.len(), ctx.config.max_crud_batch_resources)?;
    info!("CRUD batch of {} items on {}", operations.len(), url);

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    for (index, operation) in operations.into_iter().enumerate() {
        match operation {
            Operation::Create { data } => creates.push((index, data)),
            Operation::Update { href, data, if_match } => updates.push((index, href, data, if_match)),
            Operation::Delete { href, if_match } => deletes.push((index, href, if_match)),
        }
    }

    let mut results = Vec::new();

    let unbind_allowed = deletes.is_empty() || ctx.allowed(request, &url, Privilege::Unbind);
    for (index, href, if_match) in deletes {
        let entry = match delete_item(ctx, &parent, &href, if_match.as_deref(), unbind_allowed).await {
            Ok(()) => ResponseEntry::status_only(href, StatusCode::OK),
            Err(err) => failure_entry(href, &err, None),
        };
        results.push((index, entry));
    }

    if !creates.is_empty() {
        let kind = collection.kind();
        match ctx.require(request, &url, Privilege::Bind) {
            Ok(()) => {
                let items = creates
                    .into_iter()
                    .map(|(index, data)| CreateItem {
                        index,
                        component: parse_item(ctx, kind, &data),
                    })
                    .collect();
                results.extend(
                    bulk_create(ctx, &parent, collection.store_errors(), items, return_changed).await?,
                );
            }
            Err(err) => {
                debug!("Bind denied for batch creates on {}", url);
                results.extend(
                    creates
                        .into_iter()
                        .map(|(index, _)| (index, failure_entry("", &err, None))),
                );
            }
        }
    }

    for (index, href, data, if_match) in updates {
        let entry = match update_item(ctx, request, &parent, &href, &data, if_match.as_deref()).await {
            Ok((object, altered)) => stored_entry(&object, altered, return_changed, false),
            Err(err) => failure_entry(href, &err, None),
        };
        results.push((index, entry));
    }

    finish(ctx, collection, results).await
}

fn parse_item<S: Store>(ctx: Context<'_, S>, kind: StoreKind, data: &str) -> DavResult<Component> {
    ctx.parser
        .parse(kind, data.as_bytes())
        .map_err(|err| DavError::bad_request(format!("Could not parse item: {err}")))
}

async fn delete_item<S: Store>(
    ctx: Context<'_, S>,
    parent: &CollectionInfo,
    href: &str,
    if_match: Option<&str>,
    unbind_allowed: bool,
) -> DavResult<()> {
    if !unbind_allowed {
        return Err(DavError::precondition_with(
            precondition::NEED_PRIVILEGES,
            format!("{} privilege required on {}", Privilege::Unbind, parent.key.url()),
        ));
    }
    let mut object = locate_item(ctx, parent, href).await?.ok_or_else(|| not_found(href))?;
    if object.kind() == StoreKind::AddressBook
        && (object.is_sharee() || object.info().map(|info| info.is_shared_group).unwrap_or(false))
    {
        return Err(DavError::forbidden("Shared address book objects cannot be deleted in a batch"));
    }
    if if_match_fails(&object, if_match) {
        return Err(DavError::precondition_failed("If-Match precondition failed"));
    }
    move_delete::store_remove(ctx, &mut object).await
}

async fn update_item<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    parent: &CollectionInfo,
    href: &str,
    data: &str,
    if_match: Option<&str>,
) -> DavResult<(ObjectResource, bool)> {
    let mut object = locate_item(ctx, parent, href).await?.ok_or_else(|| not_found(href))?;
    ctx.require(request, href, Privilege::Write)?;
    if if_match_fails(&object, if_match) {
        return Err(DavError::precondition_failed("If-Match precondition failed"));
    }
    let component = parse_item(ctx, object.kind(), data)?;
    let outcome = object.store_component(ctx, &component, false).await?;
    Ok((object, outcome.altered))
}
