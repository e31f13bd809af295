//! Dead property access over the store's property interface.
//!
//! [`PropertyAdapter`] gives resources a key/value view of the properties the
//! store keeps for a collection or object. Missing keys surface as 404 on
//! read, protected properties as 403 on write, and removing an absent key
//! succeeds.

use crate::error::{DavError, DavResult, ns};
use crate::multistatus::{MultiStatus, Prop, ResponseEntry};
use crate::storage::{PropertyName, PropertyTarget, Store, StoreError};
use crate::xml::{self, Element};
use http::StatusCode;
use log::{debug, trace};

/// Property view of one collection or object.
pub struct PropertyAdapter<'a, S: Store> {
    store: &'a S,
    target: PropertyTarget,
}

impl<'a, S: Store> PropertyAdapter<'a, S> {
    pub fn new(store: &'a S, target: PropertyTarget) -> Self {
        Self { store, target }
    }

    pub async fn get(&self, name: &PropertyName) -> DavResult<String> {
        trace!("Reading property {}", name);
        self.store
            .property(&self.target, name)
            .await?
            .ok_or_else(|| DavError::not_found(format!("No such property: {name}")))
    }

    pub async fn set(&self, name: &PropertyName, value: impl Into<String>) -> DavResult<()> {
        self.store
            .set_property(&self.target, name, value.into())
            .await
            .map_err(change_error)
    }

    /// Remove a property; absent properties are not an error.
    pub async fn delete(&self, name: &PropertyName) -> DavResult<()> {
        let existed = self
            .store
            .remove_property(&self.target, name)
            .await
            .map_err(change_error)?;
        if !existed {
            debug!("Property {} was already absent", name);
        }
        Ok(())
    }

    pub async fn contains(&self, name: &PropertyName) -> DavResult<bool> {
        Ok(self.store.property(&self.target, name).await?.is_some())
    }

    pub async fn list(&self) -> DavResult<Vec<PropertyName>> {
        Ok(self.store.property_names(&self.target).await?)
    }
}

fn change_error(err: StoreError) -> DavError {
    match err {
        StoreError::PropertyChangeNotAllowed { name } => {
            DavError::forbidden(format!("Property cannot be changed: {name}"))
        }
        other => DavError::from(other),
    }
}

/// One instruction of a `DAV:propertyupdate` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyUpdate {
    Set(PropertyName, String),
    Remove(PropertyName),
}

impl PropertyUpdate {
    pub fn name(&self) -> &PropertyName {
        match self {
            PropertyUpdate::Set(name, _) | PropertyUpdate::Remove(name) => name,
        }
    }
}

fn property_name(element: &Element) -> PropertyName {
    PropertyName::new(
        element.namespace.clone().unwrap_or_default(),
        element.local.clone(),
    )
}

/// Read a PROPPATCH body into its instructions, in document order.
pub fn parse_property_update(body: &[u8]) -> DavResult<Vec<PropertyUpdate>> {
    let root = xml::parse_document(body)?;
    if !root.is(ns::DAV, "propertyupdate") {
        return Err(DavError::bad_request(
            "PROPPATCH body must be a DAV:propertyupdate document",
        ));
    }
    let mut updates = Vec::new();
    for instruction in &root.children {
        let remove = if instruction.is(ns::DAV, "set") {
            false
        } else if instruction.is(ns::DAV, "remove") {
            true
        } else {
            continue;
        };
        for prop in instruction.children_named(ns::DAV, "prop") {
            for property in &prop.children {
                let name = property_name(property);
                updates.push(if remove {
                    PropertyUpdate::Remove(name)
                } else {
                    PropertyUpdate::Set(name, property.trimmed_text().to_string())
                });
            }
        }
    }
    Ok(updates)
}

/// Apply updates in order and report one status per property.
///
/// Once an update fails, the remaining ones are not attempted and report
/// 424 Failed Dependency.
pub async fn apply_updates<S: Store>(
    adapter: &PropertyAdapter<'_, S>,
    href: &str,
    updates: Vec<PropertyUpdate>,
) -> DavResult<MultiStatus> {
    let mut multistatus = MultiStatus::new();
    let mut failed = false;
    for update in updates {
        let status = if failed {
            StatusCode::FAILED_DEPENDENCY
        } else {
            let result = match &update {
                PropertyUpdate::Set(name, value) => adapter.set(name, value.clone()).await,
                PropertyUpdate::Remove(name) => adapter.delete(name).await,
            };
            match result {
                Ok(()) => StatusCode::OK,
                Err(err) => {
                    debug!("PROPPATCH of {} on {} failed: {}", update.name(), href, err);
                    failed = true;
                    err.status()
                }
            }
        };
        multistatus.push(ResponseEntry::PropStat {
            href: href.to_string(),
            props: vec![Prop::Name(update.name().clone())],
            status,
        });
    }
    Ok(multistatus)
}
