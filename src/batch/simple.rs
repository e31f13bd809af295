//! Simple batch: many items of one media type, all created.

use super::{CreateItem, bound_parent, bulk_create, check_body_size, check_item_count, finish};
use crate::acl::Privilege;
use crate::error::{DavError, DavResult};
use crate::precondition::check_ctag;
use crate::protocol::{DavRequest, DavResponse};
use crate::resource::{Batchable, Context};
use crate::storage::Store;
use log::{debug, info};

pub async fn post<S: Store, B: Batchable>(
    ctx: Context<'_, S>,
    collection: &mut B,
    request: &DavRequest,
) -> DavResult<DavResponse> {
    let parent = bound_parent(collection)?;
    ctx.require(request, &collection.url(), Privilege::Bind)?;
    check_ctag(request, &parent.sync_token)?;
    check_body_size(request.body.len(), ctx.config.max_simple_batch_bytes)?;
    let return_changed = request.return_changed_data();

    let parsed = ctx
        .parser
        .parse_batch(collection.kind(), &request.body)
        .ok_or_else(|| DavError::bad_request("Could not parse valid data from request body"))?;
    check_item_count(parsed.len(), ctx.config.max_simple_batch_resources)?;
    info!("Simple batch of {} items on {}", parsed.len(), collection.url());

    let items = parsed
        .into_iter()
        .enumerate()
        .map(|(index, component)| CreateItem {
            index,
            component: component.map_err(|err| {
                debug!("Batch item {} does not parse: {}", index, err);
                DavError::bad_request(format!("Could not parse item: {err}"))
            }),
        })
        .collect();

    let results = bulk_create(ctx, &parent, collection.store_errors(), items, return_changed).await?;
    finish(ctx, collection, results).await
}
