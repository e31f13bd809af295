//! Calendar object and vCard resources.
//!
//! An [`ObjectResource`] is a child URL of a bound collection. Before the
//! first successful store it is unbound and carries only
//! [`PendingMetadata`]; storing creates the backend object and binds the
//! resource to it. Handlers here cover reads, writes (PUT and PATCH), POST
//! actions and item splitting. Deletion and moves live in
//! [`crate::move_delete`], managed attachment actions in
//! [`crate::attachment::managed`].
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
//! let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:1\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
//! let request = DavRequest::new(DavMethod::Put, format!("{}e.ics", key.url()))
//!     .with_header(header::CONTENT_TYPE, "text/calendar")
//!     .with_body(ics);
//! let response = bridge.handle(request).await;
//! assert_eq!(response.status.as_u16(), 201);
//! assert!(response.header(header::ETAG).is_some());
//! # Ok(())
//! # }
//! ```

use super::{
    Bindable, Context, ExceptionMapped, PropertyAdapter, Shareable, object_errors,
    object_move_errors, properties,
};
use crate::acl::{self, Acl, Privilege};
use crate::attachment::managed::{self, ManagedAction};
use crate::component::{Component, ParseError, PatchError};
use crate::error::{DavError, DavResult, ErrorElement, precondition};
use crate::mapping::ErrorMap;
use crate::multistatus::{MultiStatus, Prop, ResponseEntry};
use crate::precondition::{
    check_object, check_schedule_tag, check_standard, into_representation, object_etag,
    wants_representation,
};
use crate::protocol::{DavMethod, DavRequest, DavResponse, header, negotiate};
use crate::resource::metadata::{MetadataSource, PendingMetadata};
use crate::resource::version::EntityTag;
use crate::storage::{
    CollectionInfo, ObjectInfo, ObjectKey, PropertyTarget, ShareRole, Store, StoreError,
    StoreKind,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use http::StatusCode;
use log::{debug, info, trace, warn};

/// Media type of PATCH documents for calendar objects.
pub const CALENDAR_PATCH_TYPE: &str = "text/calendar";

/// Format of the `rid` parameter of a split request (UTC date-time).
const RID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Result of a successful store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    /// 201 when the object was created, 204 when replaced
    pub status: StatusCode,
    /// The store changed the data relative to what was sent
    pub altered: bool,
}

/// An object inside a collection, bound or not.
#[derive(Debug, Clone)]
pub struct ObjectResource {
    key: ObjectKey,
    parent: CollectionInfo,
    info: Option<ObjectInfo>,
    pending: PendingMetadata,
}

impl ObjectResource {
    pub async fn locate<S: Store>(store: &S, parent: CollectionInfo, name: &str) -> DavResult<Self> {
        let key = parent.key.object(name);
        trace!("Locating object {}", key);
        let info = store.object(&key).await?;
        Ok(Self {
            key,
            parent,
            info,
            pending: PendingMetadata::new(),
        })
    }

    pub fn unbound(parent: CollectionInfo, name: &str) -> Self {
        Self {
            key: parent.key.object(name),
            parent,
            info: None,
            pending: PendingMetadata::new(),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn kind(&self) -> StoreKind {
        self.key.kind()
    }

    pub fn parent(&self) -> &CollectionInfo {
        &self.parent
    }

    pub fn info(&self) -> Option<&ObjectInfo> {
        self.info.as_ref()
    }

    /// Metadata to apply when the object is created.
    pub fn pending_mut(&mut self) -> &mut PendingMetadata {
        &mut self.pending
    }

    pub fn metadata(&self) -> MetadataSource<'_> {
        match &self.info {
            Some(info) => MetadataSource::Bound(&info.metadata),
            None => MetadataSource::Pending(&self.pending),
        }
    }

    pub fn etag(&self) -> Option<EntityTag> {
        self.info.as_ref().map(object_etag)
    }

    /// Quoted `Schedule-Tag` value for scheduling objects.
    pub fn schedule_tag(&self) -> Option<String> {
        let metadata = self.metadata();
        if !metadata.is_schedule_object() {
            return None;
        }
        metadata.schedule_tag().map(|tag| format!("\"{tag}\""))
    }

    pub fn require_bound(&self) -> DavResult<&ObjectInfo> {
        self.info.as_ref().ok_or_else(|| {
            debug!("Object {} not found", self.key);
            DavError::not_found(format!("Resource not found: {}", self.key))
        })
    }

    pub(crate) fn bind(&mut self, info: ObjectInfo) {
        self.key = info.key.clone();
        self.info = Some(info);
        self.pending.clear();
    }

    pub fn unbind(&mut self) {
        self.info = None;
    }

    pub async fn rebind<S: Store>(&mut self, store: &S) -> DavResult<()> {
        self.info = store.object(&self.key).await?;
        Ok(())
    }

    /// Commit and re-resolve this object in a new transaction so that
    /// scheduling side effects of the write are visible to what follows.
    pub async fn in_new_transaction<S: Store>(&mut self, store: &S) -> DavResult<()> {
        debug!("Re-resolving {} in a new transaction", self.key);
        self.info = store.reopen_object(&self.key).await?;
        Ok(())
    }

    /// Parsed form of the stored data.
    pub fn component<S: Store>(&self, ctx: Context<'_, S>) -> DavResult<Component> {
        let info = self.require_bound()?;
        ctx.parser
            .parse(self.kind(), &info.data)
            .map_err(|e| DavError::internal(format!("Stored data for {} is invalid: {e}", self.key)))
    }

    /// Stored data rendered as `media_type`.
    pub fn render<S: Store>(&self, ctx: Context<'_, S>, media_type: &str) -> DavResult<String> {
        let info = self.require_bound()?;
        if info.content_type.eq_ignore_ascii_case(media_type) {
            return Ok(String::from_utf8_lossy(&info.data).into_owned());
        }
        let component = self.component(ctx)?;
        ctx.parser
            .render(&component, media_type)
            .map_err(|e| DavError::not_acceptable(e.to_string()))
    }

    fn media_types<S: Store>(&self, ctx: Context<'_, S>) -> Vec<&'static str> {
        ctx.parser.media_types(self.kind())
    }

    /// GET/HEAD with `Accept` negotiation.
    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let info = self.require_bound()?;
        ctx.require(request, &self.url(), Privilege::Read)?;
        check_object(request, Some(info), ctx.config.schedule_tag_compatibility)?;

        let supported = self.media_types(ctx);
        let Some(media_type) = negotiate(request.header(header::ACCEPT), &supported) else {
            return Err(DavError::not_acceptable("Cannot generate requested data type"));
        };
        let body = self.render(ctx, media_type)?;

        let mut response = DavResponse::with_body(StatusCode::OK, media_type, body);
        if request.method == DavMethod::Head {
            response.body = Default::default();
        }
        response.set_header(header::ETAG, object_etag(info).to_string());
        if let Some(tag) = self.schedule_tag() {
            response.set_header(header::SCHEDULE_TAG, tag);
        }
        Ok(response)
    }

    /// Replace a 2xx or 412 response with the current representation when the
    /// client asked for `return=representation`.
    pub async fn process_prefer<S: Store>(
        &self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        accept: Option<&str>,
        response: DavResponse,
    ) -> DavResponse {
        if !wants_representation(request, response.status) || !self.exists() {
            return response;
        }
        let mut get = DavRequest::new(DavMethod::Get, self.url());
        if let Some(accept) = accept {
            get = get.with_header(header::ACCEPT, accept);
        }
        get.principal = request.principal.clone();
        match self.get(ctx, &get).await {
            Ok(representation) => into_representation(representation, response.status, &self.url()),
            Err(err) => {
                debug!("Cannot return representation of {}: {}", self.key, err);
                response
            }
        }
    }

    /// Turn a precondition failure into a representation response if the
    /// client prefers one.
    async fn intercept_precondition<S: Store>(
        &self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        err: DavError,
    ) -> DavError {
        if !err.is_precondition_failed() || !wants_representation(request, err.status()) {
            return err;
        }
        let accept = request.header(header::ACCEPT);
        let failed = err.into_response();
        DavError::Response(Box::new(self.process_prefer(ctx, request, accept, failed).await))
    }

    /// Write `component`, creating the object when unbound.
    pub async fn write<S: Store>(
        &mut self,
        store: &S,
        component: &Component,
        smart_merge: bool,
    ) -> Result<StoreOutcome, StoreError> {
        let (outcome, status) = if self.exists() {
            (
                store.set_component(&self.key, component, smart_merge).await?,
                StatusCode::NO_CONTENT,
            )
        } else {
            (
                store.create_object(&self.key, component, &self.pending).await?,
                StatusCode::CREATED,
            )
        };
        let altered = outcome.altered;
        self.bind(outcome.object);
        Ok(StoreOutcome { status, altered })
    }

    /// [`write`](Self::write) with store failures mapped for this kind.
    pub async fn store_component<S: Store>(
        &mut self,
        ctx: Context<'_, S>,
        component: &Component,
        smart_merge: bool,
    ) -> DavResult<StoreOutcome> {
        let map = self.store_errors();
        self.write(ctx.store, component, smart_merge)
            .await
            .map_err(|err| ctx.map(err, map))
    }

    /// PUT (and the body of an `add-member` POST).
    pub async fn put<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        if self.exists() {
            ctx.require(request, &self.url(), Privilege::Write)?;
        } else {
            ctx.require(request, &self.parent.key.url(), Privilege::Bind)?;
        }
        match self.kind() {
            StoreKind::Calendar => self.put_or_patch(ctx, request, false).await,
            StoreKind::AddressBook => self.put_vcard(ctx, request).await,
        }
    }

    /// PATCH, calendar objects only.
    pub async fn patch<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        if self.kind() != StoreKind::Calendar || !ctx.config.enable_calendar_patch {
            return Err(DavError::method_not_allowed(
                "PATCH method not allowed on this resource",
            ));
        }
        if !self.exists() {
            return Err(DavError::not_found(
                "PATCH method not allowed on non-existent resource",
            ));
        }
        ctx.require(request, &self.url(), Privilege::Write)?;
        let patch_type = request.content_type();
        if patch_type.as_ref().map(|media| media.essence()) != Some(CALENDAR_PATCH_TYPE) {
            return Err(DavError::unsupported_media_type(format!(
                "Invalid PATCH content type: {}",
                patch_type.map(|media| media.to_string()).unwrap_or_default()
            )));
        }
        self.put_or_patch(ctx, request, true).await
    }

    /// OPTIONS: advertise PATCH support.
    pub fn options<S: Store>(&self, ctx: Context<'_, S>) -> DavResponse {
        let mut response = DavResponse::new(StatusCode::OK);
        if self.kind() == StoreKind::Calendar && ctx.config.enable_calendar_patch {
            response.set_header(header::ACCEPT_PATCH, CALENDAR_PATCH_TYPE);
        }
        response
    }

    async fn put_or_patch<S: Store>(
        &mut self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        patch: bool,
    ) -> DavResult<DavResponse> {
        let compatibility = ctx.config.schedule_tag_compatibility;
        let smart_merge = match check_schedule_tag(request, self.info.as_ref(), compatibility) {
            Ok(merge) => merge,
            Err(err) => return Err(self.intercept_precondition(ctx, request, err).await),
        };
        if let Err(err) = check_object(request, self.info.as_ref(), compatibility) {
            return Err(self.intercept_precondition(ctx, request, err).await);
        }

        let content_type = request.content_type();
        if !patch {
            let supported = self.media_types(ctx);
            let allowed = content_type
                .as_ref()
                .map(|media| supported.iter().any(|candidate| *candidate == media.essence()))
                .unwrap_or(false);
            if !allowed {
                debug!("Rejecting content type {:?} for {}", content_type, self.key);
                return Err(DavError::precondition_with(
                    precondition::SUPPORTED_CALENDAR_DATA,
                    "Invalid MIME type for calendar collection",
                ));
            }
        }

        if request.body.is_empty() {
            return Err(DavError::precondition_with(
                precondition::VALID_CALENDAR_DATA,
                "No calendar data",
            ));
        }

        let component = if patch {
            let current = self.component(ctx)?;
            ctx.parser
                .apply_patch(&current, &request.body)
                .map_err(|err| match err {
                    PatchError::InvalidData(message) => DavError::Precondition {
                        status: StatusCode::BAD_REQUEST,
                        element: precondition::VALID_CALENDAR_DATA,
                        message: Some(message),
                    },
                    PatchError::CannotApply(message) => DavError::Precondition {
                        status: StatusCode::UNPROCESSABLE_ENTITY,
                        element: precondition::VALID_CALENDAR_DATA,
                        message: Some(message),
                    },
                })?
        } else {
            ctx.parser
                .parse(StoreKind::Calendar, &request.body)
                .map_err(|err| {
                    DavError::precondition_with(
                        precondition::VALID_CALENDAR_DATA,
                        format!("Can't parse calendar data: {err}"),
                    )
                })?
        };

        info!("{} {} (smart merge: {})", request.method, self.key, smart_merge);
        let existed = self.exists();
        let response = match self.write(ctx.store, &component, smart_merge).await {
            Ok(outcome) => {
                let mut response = DavResponse::new(outcome.status);
                if self.metadata().is_schedule_object() {
                    self.in_new_transaction(ctx.store).await?;
                }
                self.set_version_headers(&mut response, outcome.altered);
                response
            }
            Err(StoreError::ResourceDeleted) => {
                debug!("{} was deleted by the store while writing", self.key);
                self.unbind();
                DavResponse::new(if existed {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::CREATED
                })
            }
            Err(err) => return Err(ctx.map(err, self.store_errors())),
        };

        let format = content_type.map(|media| media.essence().to_string());
        let accept = request
            .header(header::ACCEPT)
            .map(str::to_string)
            .or(format);
        Ok(self
            .process_prefer(ctx, request, accept.as_deref(), response)
            .await)
    }

    fn set_version_headers(&self, response: &mut DavResponse, altered: bool) {
        if let Some(tag) = self.schedule_tag() {
            response.set_header(header::SCHEDULE_TAG, tag);
        }
        if altered {
            response.remove_header(header::ETAG);
        } else if let Some(etag) = self.etag() {
            response.set_header(header::ETAG, etag.to_string());
        }
    }

    async fn put_vcard<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let etag = self.etag();
        check_standard(
            request,
            self.exists(),
            etag.as_ref(),
            self.info.as_ref().map(|info| info.modified),
        )?;

        let content_type = request.content_type();
        let supported = self.media_types(ctx);
        if !content_type
            .as_ref()
            .map(|media| supported.iter().any(|candidate| *candidate == media.essence()))
            .unwrap_or(false)
        {
            return Err(DavError::precondition_with(
                precondition::SUPPORTED_ADDRESS_DATA,
                "Invalid MIME type for address book collection",
            ));
        }
        if request.body.is_empty() {
            return Err(DavError::precondition_with(
                precondition::VALID_ADDRESS_DATA,
                "No address data",
            ));
        }
        let component = ctx
            .parser
            .parse(StoreKind::AddressBook, &request.body)
            .map_err(|err| {
                DavError::precondition_with(
                    precondition::VALID_ADDRESS_DATA,
                    format!("Could not parse address data: {err}"),
                )
            })?;

        info!("{} {}", request.method, self.key);
        let outcome = self.store_component(ctx, &component, false).await?;
        let mut response = DavResponse::new(outcome.status);
        self.set_version_headers(&mut response, outcome.altered);
        let accept = request
            .header(header::ACCEPT)
            .map(str::to_string)
            .or(content_type.map(|media| media.essence().to_string()));
        Ok(self
            .process_prefer(ctx, request, accept.as_deref(), response)
            .await)
    }

    /// Dead properties are only writable where the parent allows them.
    pub async fn proppatch<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        self.require_bound()?;
        if !self.parent.allows_object_properties {
            return Err(DavError::forbidden("Properties cannot be set on this resource"));
        }
        ctx.require(request, &self.url(), Privilege::WriteProperties)?;
        let updates = properties::parse_property_update(&request.body)?;
        properties::apply_updates(&self.properties(ctx), &self.url(), updates)
            .await?
            .into_response()
    }

    pub fn properties<'a, S: Store>(&self, ctx: Context<'a, S>) -> PropertyAdapter<'a, S> {
        PropertyAdapter::new(ctx.store, PropertyTarget::Object(self.key.clone()))
    }

    /// POST `?action=...` on a calendar object.
    pub async fn post<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        if self.kind() != StoreKind::Calendar {
            return Err(DavError::method_not_allowed("POST not allowed on address book objects"));
        }
        let Some(action) = request.query_param("action") else {
            return Err(DavError::method_not_allowed("POST requires an action parameter"));
        };
        if action == "split" {
            return self.split(ctx, request).await;
        }
        match ManagedAction::from_action(action) {
            Some(action) => managed::post(self, ctx, request, action).await,
            None => {
                debug!("Invalid action '{}' on {}", action, self.key);
                Err(DavError::precondition_with(
                    precondition::VALID_ACTION_PARAMETER,
                    "The action parameter in the request-URI is not valid",
                ))
            }
        }
    }

    /// Split a recurring item at `rid` into two objects.
    pub async fn split<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        ctx.require(request, &self.url(), Privilege::WriteContent)?;
        self.require_bound()?;
        if let Err(err) = check_schedule_tag(request, self.info.as_ref(), ctx.config.schedule_tag_compatibility) {
            return Err(self.intercept_precondition(ctx, request, err).await);
        }

        let rid = request
            .query_param("rid")
            .and_then(parse_rid)
            .ok_or_else(|| {
                DavError::precondition_with(
                    precondition::VALID_RID_PARAMETER,
                    "The rid parameter in the request-URI contains an invalid value",
                )
            })?;
        let new_uid = request.query_param("uid").filter(|uid| !uid.is_empty());

        info!("Splitting {} at {}", self.key, rid);
        let other = ctx
            .store
            .split_object(&self.key, rid, new_uid)
            .await
            .map_err(|err| match err {
                StoreError::InvalidSplit { message } => {
                    DavError::precondition_with(precondition::VALID_SPLIT, message)
                }
                other => ctx.map(other, self.store_errors()),
            })?;
        self.in_new_transaction(ctx.store).await?;
        let other = ObjectResource {
            key: other.key.clone(),
            parent: self.parent.clone(),
            info: Some(other),
            pending: PendingMetadata::new(),
        };

        if request.prefers_representation() {
            let supported = self.media_types(ctx);
            let Some(media_type) = negotiate(request.header(header::ACCEPT), &supported) else {
                return Err(DavError::not_acceptable("Cannot generate requested data type"));
            };
            let mut multistatus = MultiStatus::new();
            for resource in [&*self, &other] {
                multistatus.push(resource.split_entry(ctx, media_type)?);
            }
            return multistatus.into_response();
        }

        let mut response = DavResponse::new(StatusCode::NO_CONTENT);
        response.set_header(header::SPLIT_COMPONENT_URL, other.url());
        Ok(response)
    }

    fn split_entry<S: Store>(&self, ctx: Context<'_, S>, media_type: &str) -> DavResult<ResponseEntry> {
        let mut props = Vec::new();
        if let Some(etag) = self.etag() {
            props.push(Prop::GetEtag(etag.to_string()));
        }
        if let Some(tag) = self.schedule_tag() {
            props.push(Prop::ScheduleTag(tag));
        }
        let (namespace, name) = self.kind().data_element();
        props.push(Prop::Data {
            namespace,
            name,
            text: self.render(ctx, media_type)?,
        });
        Ok(ResponseEntry::PropStat {
            href: self.url(),
            props,
            status: StatusCode::OK,
        })
    }

    /// Effective ACL: the sharee grant for individually shared vCards,
    /// otherwise the parent collection's.
    pub async fn acl<S: Store>(&self, ctx: Context<'_, S>) -> DavResult<Acl> {
        let info = self.require_bound()?;
        if info.share_role == ShareRole::Sharee {
            return Ok(acl::sharee_object_acl(
                &self.parent.owner_uid,
                self.key.home(),
                self.parent.bind_mode,
            ));
        }
        let invites = ctx.store.invites(&self.parent.key).await?;
        Ok(acl::collection_acl(
            &self.parent.owner_uid,
            &invites,
            ctx.config.enable_proxy_principals,
            ctx.delegation,
        ))
    }

    /// Structured error naming the data precondition for this kind.
    pub fn data_error(&self) -> ErrorElement {
        match self.kind() {
            StoreKind::Calendar => precondition::VALID_CALENDAR_DATA,
            StoreKind::AddressBook => precondition::VALID_ADDRESS_DATA,
        }
    }

    /// Parse batch or request data for this kind, reporting parse failures
    /// with the kind's data precondition.
    pub fn parse<S: Store>(&self, ctx: Context<'_, S>, data: &[u8]) -> DavResult<Component> {
        ctx.parser.parse(self.kind(), data).map_err(|err: ParseError| {
            warn!("Unparseable data for {}: {}", self.key, err);
            DavError::precondition_with(self.data_error(), err.to_string())
        })
    }
}

/// Parse an RFC 5545 UTC date-time such as `20240105T100000Z`.
fn parse_rid(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), RID_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl Bindable for ObjectResource {
    fn url(&self) -> String {
        self.key.url()
    }

    fn exists(&self) -> bool {
        self.info.is_some()
    }
}

impl ExceptionMapped for ObjectResource {
    fn store_errors(&self) -> ErrorMap {
        object_errors(self.kind())
    }

    fn move_errors(&self) -> ErrorMap {
        object_move_errors(self.kind())
    }
}

impl Shareable for ObjectResource {
    fn share_role(&self) -> ShareRole {
        self.info
            .as_ref()
            .map(|info| info.share_role)
            .unwrap_or(ShareRole::Unshared)
    }

    fn owner_uid(&self) -> &str {
        &self.parent.owner_uid
    }
}
