//! Calendar and address-book collections.
//!
//! A [`CollectionResource`] wraps one home child. It may be unbound (the URL
//! names no collection yet), in which case only MKCOL/MKCALENDAR succeed and
//! every other method reports 404.
//!
//! Deletion and renaming live in [`crate::move_delete`]; batch POSTs in
//! [`crate::batch`].

use super::{
    Batchable, Bindable, Context, ExceptionMapped, ObjectResource, PropertyAdapter, Shareable,
    object_errors, object_move_errors, properties,
};
use crate::acl::{self, Acl, Privilege};
use crate::batch;
use crate::error::{DavError, DavResult, ns, precondition};
use crate::mapping::{self, ErrorMap};
use crate::precondition::{check_standard, collection_etag};
use crate::protocol::{DavMethod, DavRequest, DavResponse, header};
use crate::resource::version::EntityTag;
use crate::storage::{
    CollectionInfo, CollectionKey, PropertyName, PropertyTarget, ShareRole, Store, StoreError,
    StoreKind,
};
use crate::xml;
use http::StatusCode;
use log::{debug, info, trace};

/// Component types a single-type calendar may be restricted to.
const SINGLE_COMPONENT_TYPES: [&str; 2] = ["VEVENT", "VTODO"];

/// A calendar or address book, bound or not.
#[derive(Debug, Clone)]
pub struct CollectionResource {
    key: CollectionKey,
    info: Option<CollectionInfo>,
}

impl CollectionResource {
    /// Resolve `key` in the store.
    pub async fn locate<S: Store>(store: &S, key: CollectionKey) -> DavResult<Self> {
        trace!("Locating collection {}", key);
        let info = store.collection(&key).await?;
        Ok(Self { key, info })
    }

    pub fn bound(info: CollectionInfo) -> Self {
        Self {
            key: info.key.clone(),
            info: Some(info),
        }
    }

    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    pub fn info(&self) -> Option<&CollectionInfo> {
        self.info.as_ref()
    }

    pub fn is_inbox(&self) -> bool {
        self.info.as_ref().map(|info| info.is_inbox).unwrap_or(false)
    }

    /// Entity tag derived from the change token.
    pub fn etag(&self) -> Option<EntityTag> {
        self.info
            .as_ref()
            .map(|info| collection_etag(&info.sync_token))
    }

    /// Re-read the backing collection, e.g. after a child changed the CTag.
    pub async fn rebind<S: Store>(&mut self, store: &S) -> DavResult<()> {
        self.info = store.collection(&self.key).await?;
        Ok(())
    }

    /// Drop the binding after the collection was removed.
    pub fn unbind(&mut self) {
        self.info = None;
    }

    pub(crate) fn bind(&mut self, info: CollectionInfo) {
        self.key = info.key.clone();
        self.info = Some(info);
    }

    pub fn require_bound(&self) -> DavResult<&CollectionInfo> {
        self.info.as_ref().ok_or_else(|| {
            debug!("Collection {} not found", self.key);
            DavError::not_found(format!("Collection not found: {}", self.key))
        })
    }

    pub async fn children<S: Store>(&self, store: &S) -> DavResult<Vec<String>> {
        self.require_bound()?;
        Ok(store.list_objects(&self.key).await?)
    }

    /// Resource for a child object, bound if it exists.
    pub async fn child<S: Store>(&self, store: &S, name: &str) -> DavResult<ObjectResource> {
        let info = self.require_bound()?;
        ObjectResource::locate(store, info.clone(), name).await
    }

    /// GET/HEAD: the child names, one per line, with `ETag` and `CTag`.
    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let info = self.require_bound()?;
        ctx.require(request, &self.url(), Privilege::Read)?;
        let etag = collection_etag(&info.sync_token);
        check_standard(request, true, Some(&etag), Some(info.modified))?;

        let children = ctx.store.list_objects(&self.key).await?;
        let mut body = children.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        let mut response = DavResponse::with_body(StatusCode::OK, "text/plain; charset=utf-8", body);
        if request.method == DavMethod::Head {
            response.body = Default::default();
        }
        response.set_header(header::ETAG, etag.to_string());
        response.set_header(header::CTAG, &info.sync_token);
        Ok(response)
    }

    /// MKCOL and MKCALENDAR.
    pub async fn create<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        if self.exists() {
            return Err(DavError::method_not_allowed(format!(
                "Resource already exists: {}",
                self.key
            )));
        }
        ctx.require(request, &self.key.home_url(), Privilege::Bind)?;
        if request.method == DavMethod::Mkcalendar && self.key.kind() == StoreKind::AddressBook {
            return Err(DavError::forbidden("Cannot create a calendar in an address book home"));
        }

        let components = match self.key.kind() {
            StoreKind::Calendar => self.component_restriction(ctx, &request.body)?,
            StoreKind::AddressBook => None,
        };

        info!("Creating collection {}", self.key);
        let created = ctx
            .store
            .create_collection(&self.key, components)
            .await
            .map_err(|err| match err {
                StoreError::HomeChildNameAlreadyExists { .. } => {
                    DavError::forbidden("Unaccepted share exists")
                }
                other => ctx.map(other, mapping::collection),
            })?;
        self.bind(created);
        Ok(DavResponse::new(StatusCode::CREATED))
    }

    /// Read the supported component set from an MKCALENDAR body and apply the
    /// single-component restriction.
    fn component_restriction<S: Store>(
        &self,
        ctx: Context<'_, S>,
        body: &[u8],
    ) -> DavResult<Option<Vec<String>>> {
        let mut requested = None;
        if !body.iter().all(u8::is_ascii_whitespace) {
            let root = xml::parse_document(body)?;
            let mut set = Vec::new();
            root.descendants(ns::CALDAV, "supported-calendar-component-set", &mut set);
            if let Some(set) = set.first() {
                let names: Vec<String> = set
                    .children_named(ns::CALDAV, "comp")
                    .filter_map(|comp| comp.attribute("name"))
                    .map(str::to_ascii_uppercase)
                    .collect();
                requested = Some(names);
            }
        }

        if !ctx.config.restrict_calendars_to_one_component_type {
            return Ok(requested);
        }
        match requested {
            None => Ok(Some(vec!["VEVENT".to_string()])),
            Some(names)
                if names.len() == 1 && SINGLE_COMPONENT_TYPES.contains(&names[0].as_str()) =>
            {
                Ok(Some(names))
            }
            Some(names) => {
                debug!("Rejecting component set {:?} for {}", names, self.key);
                Err(DavError::precondition(precondition::SUPPORTED_CALENDAR_COMPONENT))
            }
        }
    }

    /// Collections are never written with PUT; POST adds members instead.
    pub fn put(&self) -> DavResult<DavResponse> {
        Err(DavError::forbidden("Cannot PUT to a collection; use POST"))
    }

    pub fn copy(&self) -> DavResult<DavResponse> {
        Err(DavError::forbidden("Collections cannot be copied"))
    }

    /// Live properties computed by the bridge rather than stored.
    pub fn live_properties(&self, ctx: Context<'_, impl Store>) -> Vec<PropertyName> {
        let mut names = vec![PropertyName::new(ns::CALENDARSERVER, "getctag")];
        if ctx.config.max_resources_per_collection.is_some() {
            names.push(PropertyName::new(ns::CALENDARSERVER, "max-resources"));
        }
        if ctx.config.enable_batch_upload {
            names.push(PropertyName::new(ns::MOBILEME, "bulk-requests"));
        }
        if self.key.kind() == StoreKind::Calendar {
            names.push(PropertyName::new(ns::CALDAV, "supported-calendar-component-set"));
        }
        names
    }

    /// Value of a live or dead property as XML text content.
    pub async fn read_property<S: Store>(&self, ctx: Context<'_, S>, name: &PropertyName) -> DavResult<String> {
        let info = self.require_bound()?;
        match (name.namespace.as_str(), name.name.as_str()) {
            (ns::CALENDARSERVER, "getctag") => return Ok(info.sync_token.clone()),
            (ns::CALENDARSERVER, "max-resources") => {
                if let Some(limit) = ctx.config.max_resources_per_collection {
                    return Ok(limit.to_string());
                }
            }
            (ns::MOBILEME, "bulk-requests") if ctx.config.enable_batch_upload => {
                let config = ctx.config;
                return Ok(format!(
                    "<M:simple><M:max-resources>{}</M:max-resources><M:max-bytes>{}</M:max-bytes></M:simple>\
                     <M:crud><M:max-resources>{}</M:max-resources><M:max-bytes>{}</M:max-bytes></M:crud>",
                    config.max_simple_batch_resources,
                    config.max_simple_batch_bytes,
                    config.max_crud_batch_resources,
                    config.max_crud_batch_bytes,
                ));
            }
            (ns::CALDAV, "supported-calendar-component-set")
                if self.key.kind() == StoreKind::Calendar =>
            {
                let components = info
                    .supported_components
                    .clone()
                    .unwrap_or_else(|| vec!["VEVENT".to_string(), "VTODO".to_string()]);
                return Ok(components
                    .iter()
                    .map(|name| format!("<C:comp name=\"{name}\"/>"))
                    .collect());
            }
            _ => {}
        }
        self.properties(ctx).get(name).await
    }

    pub fn properties<'a, S: Store>(&self, ctx: Context<'a, S>) -> PropertyAdapter<'a, S> {
        PropertyAdapter::new(ctx.store, PropertyTarget::Collection(self.key.clone()))
    }

    pub async fn proppatch<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        self.require_bound()?;
        ctx.require(request, &self.url(), Privilege::WriteProperties)?;
        let updates = properties::parse_property_update(&request.body)?;
        let live = self.live_properties(ctx);
        if let Some(protected) = updates.iter().find(|update| live.contains(update.name())) {
            return Err(DavError::forbidden(format!(
                "Property cannot be changed: {}",
                protected.name()
            )));
        }
        properties::apply_updates(&self.properties(ctx), &self.url(), updates)
            .await?
            .into_response()
    }

    /// POST: `action=add-member`, or a batch.
    pub async fn post<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        self.require_bound()?;
        match request.query_param("action") {
            Some("add-member") => self.add_member(ctx, request).await,
            Some(action) => {
                debug!("Unknown collection action '{}' on {}", action, self.key);
                Err(DavError::precondition_with(
                    precondition::VALID_ACTION_PARAMETER,
                    "The action parameter in the request-URI is not valid",
                ))
            }
            None if ctx.config.enable_batch_upload => batch::post(ctx, self, request).await,
            None => Err(DavError::method_not_allowed("Batch upload is not enabled")),
        }
    }

    /// Store the request body as a new child with a server-assigned name.
    pub async fn add_member<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let name = format!(
            "{}{}",
            uuid::Uuid::new_v4(),
            self.key.kind().resource_suffix()
        );
        let mut child = self.child(ctx.store, &name).await?;
        info!("Adding member {} to {}", name, self.key);
        let mut response = child.put(ctx, request).await?;
        response.set_header(header::LOCATION, child.url());
        self.rebind(ctx.store).await?;
        Ok(response)
    }

    /// Effective ACL including sharing invites.
    pub async fn acl<S: Store>(&self, ctx: Context<'_, S>) -> DavResult<Acl> {
        let info = self.require_bound()?;
        let invites = ctx.store.invites(&self.key).await?;
        Ok(acl::collection_acl(
            &info.owner_uid,
            &invites,
            ctx.config.enable_proxy_principals,
            ctx.delegation,
        ))
    }
}

impl Bindable for CollectionResource {
    fn url(&self) -> String {
        self.key.url()
    }

    fn exists(&self) -> bool {
        self.info.is_some()
    }
}

impl ExceptionMapped for CollectionResource {
    /// Children are stored through the collection.
    fn store_errors(&self) -> ErrorMap {
        object_errors(self.key.kind())
    }

    fn move_errors(&self) -> ErrorMap {
        object_move_errors(self.key.kind())
    }
}

impl Shareable for CollectionResource {
    fn share_role(&self) -> ShareRole {
        self.info
            .as_ref()
            .map(|info| info.share_role)
            .unwrap_or(ShareRole::Unshared)
    }

    fn owner_uid(&self) -> &str {
        self.info
            .as_ref()
            .map(|info| info.owner_uid.as_str())
            .unwrap_or_else(|| self.key.home())
    }
}

impl Batchable for CollectionResource {
    fn collection_key(&self) -> &CollectionKey {
        &self.key
    }

    fn sync_token(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.sync_token.as_str())
    }

    fn collection_info(&self) -> Option<&CollectionInfo> {
        self.info.as_ref()
    }

    async fn refresh<S: Store>(&mut self, store: &S) -> DavResult<()> {
        self.rebind(store).await
    }
}
