//! The [`Bridge`] value and request resolution.

use super::routing::{Route, route};
use crate::acl::{self, Acl, AllowAll, Authorizer, DelegationResolver, StaticDelegation};
use crate::attachment::{AttachmentCollection, AttachmentHome, AttachmentResource};
use crate::component::{ComponentParser, TextComponentParser};
use crate::config::{BridgeConfig, ConfigError};
use crate::error::{DavError, DavResult};
use crate::mapping::ExceptionMapper;
use crate::protocol::{DavRequest, DavResponse};
use crate::resource::{
    CollectionResource, Context, NotificationCollection, NotificationResource, ObjectResource,
};
use crate::storage::Store;
use bytes::Bytes;
use futures::Stream;
use log::{debug, error, info, trace};
use std::sync::Arc;

/// Translates protocol requests into operations on a backend store.
///
/// One `Bridge` serves many requests. Each call to [`handle`](Self::handle)
/// works against the store it was built with, which the host scopes to the
/// request's transaction.
///
/// # Examples
///
/// ```rust
/// use dav_store_bridge::{Bridge, DavMethod, DavRequest};
/// use dav_store_bridge::storage::InMemoryStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bridge = Bridge::new(InMemoryStore::new())?;
/// let response = bridge
///     .handle(DavRequest::new(DavMethod::Get, "/calendars/__uids__/alice/missing/"))
///     .await;
/// assert_eq!(response.status.as_u16(), 404);
/// # Ok(())
/// # }
/// ```
pub struct Bridge<S> {
    pub(super) store: S,
    pub(super) config: BridgeConfig,
    pub(super) mapper: ExceptionMapper,
    pub(super) parser: Arc<dyn ComponentParser>,
    pub(super) authorizer: Arc<dyn Authorizer>,
    pub(super) delegation: Arc<dyn DelegationResolver>,
}

/// What a request path resolved to.
pub(super) enum Target {
    Collection(CollectionResource),
    Object(ObjectResource),
    /// An object or attachment URL whose parent does not exist
    NoParent(String),
    AttachmentHome(AttachmentHome),
    AttachmentCollection(AttachmentCollection),
    Attachment(AttachmentResource),
    Notifications(NotificationCollection),
    Notification(NotificationResource),
}

impl<S: Store> Bridge<S> {
    /// Bridge with the default configuration, the text component parser and
    /// an authorizer that allows everything.
    pub fn new(store: S) -> Result<Self, ConfigError> {
        Self::with_config(store, BridgeConfig::default())
    }

    pub fn with_config(store: S, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            mapper: ExceptionMapper::new(&config),
            config,
            parser: Arc::new(TextComponentParser),
            authorizer: Arc::new(AllowAll),
            delegation: Arc::new(StaticDelegation::new()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn context(&self) -> Context<'_, S> {
        Context {
            store: &self.store,
            parser: self.parser.as_ref(),
            config: &self.config,
            mapper: &self.mapper,
            authorizer: self.authorizer.as_ref(),
            delegation: self.delegation.as_ref(),
        }
    }

    /// Handle one request. Failures are rendered into the response.
    pub async fn handle(&self, request: DavRequest) -> DavResponse {
        debug!("{} {}", request.method, request.path);
        let result = self.dispatch(&request).await;
        finish(&request, result)
    }

    /// PUT of a legacy attachment whose body arrives as a stream. The
    /// request's own body is ignored.
    pub async fn put_attachment_stream<St>(&self, request: &DavRequest, content: St) -> DavResponse
    where
        St: Stream<Item = Bytes> + Send,
    {
        debug!("Streamed {} {}", request.method, request.path);
        let result = async {
            match self.resolve(&request.path).await? {
                Target::Attachment(mut attachment) => {
                    attachment.put_stream(self.context(), request, content).await
                }
                Target::NoParent(url) => Err(no_parent(&url)),
                _ => Err(DavError::forbidden(
                    "Streamed uploads are only accepted for attachments",
                )),
            }
        }
        .await;
        finish(request, result)
    }

    /// Effective ACL of the resource at `path`, for the host's privilege
    /// engine.
    pub async fn access_control_list(&self, path: &str) -> DavResult<Acl> {
        let ctx = self.context();
        match self.resolve(path).await? {
            Target::Collection(collection) => collection.acl(ctx).await,
            Target::Object(object) => object.acl(ctx).await,
            Target::AttachmentHome(home) => Ok(home.acl(ctx)),
            Target::AttachmentCollection(collection) => collection.acl(ctx).await,
            Target::Attachment(attachment) => {
                AttachmentHome::new(attachment.mode(), attachment.object().key.home())
                    .child(ctx.store, &attachment.object().dropbox_id)
                    .await?
                    .acl(ctx)
                    .await
            }
            Target::Notifications(notifications) => Ok(acl::collection_acl(
                notifications.home(),
                &[],
                ctx.config.enable_proxy_principals,
                ctx.delegation,
            )),
            Target::Notification(notification) => Ok(acl::collection_acl(
                notification.home(),
                &[],
                ctx.config.enable_proxy_principals,
                ctx.delegation,
            )),
            Target::NoParent(url) => Err(DavError::not_found(format!("Resource not found: {url}"))),
        }
    }

    /// Bind `path` to a resource.
    pub(super) async fn resolve(&self, path: &str) -> DavResult<Target> {
        let Some(route) = route(path) else {
            debug!("No resource at {}", path);
            return Err(DavError::not_found(format!("Resource not found: {path}")));
        };
        trace!("Resolved {} to {:?}", path, route);
        let store = &self.store;
        Ok(match route {
            Route::Collection(key) => Target::Collection(CollectionResource::locate(store, key).await?),
            Route::Object(key) => match store.collection(key.collection()).await? {
                Some(parent) => {
                    Target::Object(ObjectResource::locate(store, parent, key.name()).await?)
                }
                None => Target::NoParent(key.url()),
            },
            Route::AttachmentHome { mode, home } => {
                Target::AttachmentHome(AttachmentHome::new(mode, home))
            }
            Route::AttachmentCollection {
                mode,
                home,
                dropbox_id,
            } => Target::AttachmentCollection(
                AttachmentHome::new(mode, home).child(store, &dropbox_id).await?,
            ),
            Route::Attachment {
                mode,
                home,
                dropbox_id,
                name,
            } => {
                let collection = AttachmentHome::new(mode, home).child(store, &dropbox_id).await?;
                match collection.child(store, &name).await? {
                    Some(attachment) => Target::Attachment(attachment),
                    None => Target::NoParent(path.to_string()),
                }
            }
            Route::Notifications { home } => {
                Target::Notifications(NotificationCollection::locate(store, &home).await?)
            }
            Route::Notification { home, name } => {
                let notifications = NotificationCollection::locate(store, &home).await?;
                Target::Notification(notifications.child(store, &name).await?)
            }
        })
    }
}

pub(super) fn no_parent(url: &str) -> DavError {
    DavError::conflict(format!("Parent of {url} does not exist"))
}

fn finish(request: &DavRequest, result: DavResult<DavResponse>) -> DavResponse {
    match result {
        Ok(response) => {
            info!("{} {} -> {}", request.method, request.path, response.status.as_u16());
            response
        }
        Err(err) => {
            let response = err.into_response();
            if response.status.is_server_error() {
                error!("{} {} failed: {}", request.method, request.path, response.status);
            } else {
                debug!("{} {} -> {}", request.method, request.path, response.status.as_u16());
            }
            response
        }
    }
}
