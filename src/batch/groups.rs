//! Address-book batch creates with forward references between groups.
//!
//! A vCard group may list members that are themselves created later in the
//! same batch. The store refuses such a group on the first attempt, naming
//! the members it cannot see yet. Those groups are deferred; once every
//! other item has been attempted, the set of co-added UIDs (created items
//! plus deferred groups) is narrowed until every remaining deferred group
//! references only UIDs inside it. Groups that cannot satisfy that are
//! rejected, the rest are created once more with the co-added set in their
//! metadata.

use super::{CreateItem, create_one, failure_entry, item_error, stored_entry};
use crate::component::Component;
use crate::error::{DavError, DavResult};
use crate::mapping::ErrorMap;
use crate::multistatus::ResponseEntry;
use crate::resource::{Context, MetadataKey, MetadataValue, PendingMetadata};
use crate::storage::{CollectionInfo, Store, StoreError};
use log::{debug, info};
use std::collections::BTreeSet;

/// A group create waiting for co-added members.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub index: usize,
    pub component: Component,
    pub missing: BTreeSet<String>,
}

/// Outcome of narrowing the co-added set.
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    pub retry: Vec<Deferred>,
    pub rejected: Vec<Deferred>,
    pub coadded: BTreeSet<String>,
}

/// Evict deferred groups whose missing members are outside the co-added set
/// until none remain. Scans in input order; each eviction shrinks the set,
/// so the result does not depend on that order.
pub fn settle(created: &BTreeSet<String>, deferred: Vec<Deferred>) -> Settlement {
    let mut coadded: BTreeSet<String> = created.clone();
    coadded.extend(deferred.iter().map(|item| item.component.uid.clone()));

    let mut retry = deferred;
    let mut rejected = Vec::new();
    while let Some(position) = retry
        .iter()
        .position(|item| !item.missing.is_subset(&coadded))
    {
        let evicted = retry.remove(position);
        debug!(
            "Group {} references members outside the batch: {:?}",
            evicted.component.uid,
            evicted.missing.difference(&coadded).collect::<Vec<_>>()
        );
        if !created.contains(&evicted.component.uid)
            && !retry.iter().any(|item| item.component.uid == evicted.component.uid)
        {
            coadded.remove(&evicted.component.uid);
        }
        rejected.push(evicted);
    }
    rejected.sort_by_key(|item| item.index);

    Settlement {
        retry,
        rejected,
        coadded,
    }
}

pub(crate) async fn bulk_create<S: Store>(
    ctx: Context<'_, S>,
    parent: &CollectionInfo,
    map: ErrorMap,
    items: Vec<CreateItem>,
    return_changed: bool,
) -> DavResult<Vec<(usize, ResponseEntry)>> {
    let mut results = Vec::with_capacity(items.len());
    let mut created = BTreeSet::new();
    let mut deferred = Vec::new();

    for item in items {
        let component = match item.component {
            Ok(component) => component,
            Err(err) => {
                results.push((item.index, failure_entry("", &err, None)));
                continue;
            }
        };
        match create_one(ctx, parent, item.index, &component, PendingMetadata::new()).await {
            Ok((object, altered)) => {
                created.insert(component.uid.clone());
                results.push((item.index, stored_entry(&object, altered, return_changed, true)));
            }
            Err(StoreError::GroupWithUnsharedAddressNotAllowed { missing }) => {
                debug!("Deferring group {} until co-added members exist", component.uid);
                deferred.push(Deferred {
                    index: item.index,
                    component,
                    missing,
                });
            }
            Err(err) => {
                let uid = component.uid.clone();
                results.push((item.index, failure_entry("", &item_error(ctx, err, map), Some(uid))));
            }
        }
    }
    if deferred.is_empty() {
        return Ok(results);
    }

    let settlement = settle(&created, deferred);
    info!(
        "Retrying {} deferred groups, rejecting {}",
        settlement.retry.len(),
        settlement.rejected.len()
    );
    for rejected in settlement.rejected {
        let err = DavError::forbidden("Group references members outside the batch");
        results.push((rejected.index, failure_entry("", &err, Some(rejected.component.uid))));
    }

    for item in settlement.retry {
        let mut pending = PendingMetadata::new();
        pending.insert(
            MetadataKey::CoaddedUids,
            MetadataValue::Set(settlement.coadded.clone()),
        );
        let (object, altered) = create_one(ctx, parent, item.index, &item.component, pending)
            .await
            .map_err(|err| ctx.map(err, map))?;
        results.push((item.index, stored_entry(&object, altered, return_changed, true)));
    }
    Ok(results)
}
