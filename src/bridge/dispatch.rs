//! Method dispatch for each kind of resolved resource.

use super::core::{Bridge, Target, no_parent};
use super::routing::{Route, route};
use crate::attachment::{AttachmentCollection, AttachmentHome, AttachmentResource};
use crate::error::{DavError, DavResult};
use crate::move_delete;
use crate::protocol::{DavMethod, DavRequest, DavResponse};
use crate::resource::{
    CollectionResource, Context, NotificationCollection, NotificationResource, ObjectResource,
};
use crate::storage::{CollectionInfo, Store};
use http::StatusCode;
use log::debug;

fn not_allowed(method: DavMethod, what: &str) -> DavError {
    DavError::method_not_allowed(format!("{method} is not supported on {what}"))
}

fn synthesized_acl() -> DavError {
    DavError::forbidden("Access control lists are derived from sharing and cannot be set")
}

impl<S: Store> Bridge<S> {
    pub(super) async fn dispatch(&self, request: &DavRequest) -> DavResult<DavResponse> {
        let ctx = self.context();
        match self.resolve(&request.path).await? {
            Target::Collection(mut collection) => collection_method(ctx, request, &mut collection).await,
            Target::Object(mut object) => self.object_method(ctx, request, &mut object).await,
            Target::NoParent(url) => match request.method {
                DavMethod::Put | DavMethod::Post | DavMethod::Mkcol | DavMethod::Mkcalendar => {
                    Err(no_parent(&url))
                }
                _ => Err(DavError::not_found(format!("Resource not found: {url}"))),
            },
            Target::AttachmentHome(home) => attachment_home_method(ctx, request, &home).await,
            Target::AttachmentCollection(collection) => {
                attachment_collection_method(ctx, request, &collection).await
            }
            Target::Attachment(mut attachment) => {
                self.attachment_method(ctx, request, &mut attachment).await
            }
            Target::Notifications(notifications) => {
                notifications_method(ctx, request, &notifications).await
            }
            Target::Notification(mut notification) => {
                notification_method(ctx, request, &mut notification).await
            }
        }
    }

    async fn object_method(
        &self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        object: &mut ObjectResource,
    ) -> DavResult<DavResponse> {
        match request.method {
            DavMethod::Get | DavMethod::Head => object.get(ctx, request).await,
            DavMethod::Put => object.put(ctx, request).await,
            DavMethod::Patch => object.patch(ctx, request).await,
            DavMethod::Post => object.post(ctx, request).await,
            DavMethod::Delete => move_delete::delete_object(ctx, request, object).await,
            DavMethod::Move => {
                let parent = self.destination_parent(request).await?;
                move_delete::move_object(ctx, request, object, parent).await
            }
            DavMethod::Copy => Err(DavError::forbidden("Copying of item data isn't allowed")),
            DavMethod::Proppatch => object.proppatch(ctx, request).await,
            DavMethod::Options => Ok(object.options(ctx)),
            DavMethod::Acl => Err(synthesized_acl()),
            DavMethod::Mkcol | DavMethod::Mkcalendar => {
                Err(DavError::forbidden("Collections cannot be created inside a collection"))
            }
        }
    }

    /// The bound collection a MOVE `Destination` points into.
    async fn destination_parent(&self, request: &DavRequest) -> DavResult<Option<CollectionInfo>> {
        let Some(destination) = request.destination() else {
            return Ok(None);
        };
        match route(&destination) {
            Some(Route::Object(key)) => Ok(self.store.collection(key.collection()).await?),
            _ => {
                debug!("MOVE destination {} is not an object URL", destination);
                Ok(None)
            }
        }
    }

    async fn attachment_method(
        &self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        attachment: &mut AttachmentResource,
    ) -> DavResult<DavResponse> {
        match request.method {
            DavMethod::Get | DavMethod::Head => attachment.get(ctx, request).await,
            DavMethod::Put => attachment.put(ctx, request).await,
            DavMethod::Delete => attachment.delete(ctx, request).await,
            DavMethod::Copy => {
                let destination = request
                    .destination()
                    .ok_or_else(|| DavError::bad_request("No destination header in COPY request."))?;
                match self.resolve(&destination).await? {
                    Target::Attachment(mut target) => attachment.copy_to(ctx, request, &mut target).await,
                    Target::NoParent(url) => Err(no_parent(&url)),
                    _ => Err(DavError::forbidden(
                        "Attachments can only be copied to another attachment",
                    )),
                }
            }
            DavMethod::Move => Err(DavError::forbidden("Attachments cannot be moved")),
            DavMethod::Acl => Err(synthesized_acl()),
            DavMethod::Options => Ok(DavResponse::new(StatusCode::OK)),
            method => Err(not_allowed(method, "attachments")),
        }
    }
}

async fn collection_method<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    collection: &mut CollectionResource,
) -> DavResult<DavResponse> {
    match request.method {
        DavMethod::Get | DavMethod::Head => collection.get(ctx, request).await,
        DavMethod::Mkcol | DavMethod::Mkcalendar => collection.create(ctx, request).await,
        DavMethod::Put => collection.put(),
        DavMethod::Copy => collection.copy(),
        DavMethod::Post => collection.post(ctx, request).await,
        DavMethod::Delete => move_delete::delete_collection(ctx, request, collection).await,
        DavMethod::Move => move_delete::move_collection(ctx, request, collection).await,
        DavMethod::Proppatch => collection.proppatch(ctx, request).await,
        DavMethod::Acl => Err(synthesized_acl()),
        DavMethod::Options => {
            collection.require_bound()?;
            Ok(DavResponse::new(StatusCode::OK))
        }
        DavMethod::Patch => Err(not_allowed(request.method, "collections")),
    }
}

async fn attachment_home_method<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    home: &AttachmentHome,
) -> DavResult<DavResponse> {
    match request.method {
        DavMethod::Get | DavMethod::Head => home.get(ctx, request).await,
        DavMethod::Options => Ok(DavResponse::new(StatusCode::OK)),
        DavMethod::Mkcol => Err(not_allowed(request.method, "an existing collection")),
        DavMethod::Acl => Err(synthesized_acl()),
        _ => Err(DavError::forbidden("Attachment homes are maintained by the server")),
    }
}

async fn attachment_collection_method<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    collection: &AttachmentCollection,
) -> DavResult<DavResponse> {
    match request.method {
        DavMethod::Get | DavMethod::Head => collection.get(ctx, request).await,
        DavMethod::Mkcol => collection.mkcol(),
        DavMethod::Mkcalendar => collection.mkcalendar(),
        DavMethod::Delete => collection.delete(),
        DavMethod::Acl => collection.simulate_acl(ctx, request),
        DavMethod::Options => Ok(DavResponse::new(StatusCode::OK)),
        _ => Err(DavError::forbidden(
            "Attachment collections follow their calendar item",
        )),
    }
}

async fn notifications_method<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    notifications: &NotificationCollection,
) -> DavResult<DavResponse> {
    match request.method {
        DavMethod::Get | DavMethod::Head => notifications.get(ctx, request).await,
        DavMethod::Proppatch => notifications.proppatch(),
        DavMethod::Options => Ok(DavResponse::new(StatusCode::OK)),
        _ => Err(DavError::forbidden("The notification collection is read-only")),
    }
}

async fn notification_method<S: Store>(
    ctx: Context<'_, S>,
    request: &DavRequest,
    notification: &mut NotificationResource,
) -> DavResult<DavResponse> {
    match request.method {
        DavMethod::Get | DavMethod::Head => notification.get(ctx, request).await,
        DavMethod::Delete => notification.delete(ctx, request).await,
        DavMethod::Proppatch => notification.proppatch(),
        DavMethod::Options => Ok(DavResponse::new(StatusCode::OK)),
        method => Err(not_allowed(method, "notifications")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header;
    use crate::storage::{CollectionKey, InMemoryStore, StoreKind};

    const ICS: &str = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:e1\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    fn work() -> CollectionKey {
        CollectionKey::new(StoreKind::Calendar, "alice", "work")
    }

    async fn bridge() -> Bridge<InMemoryStore> {
        let bridge = Bridge::new(InMemoryStore::new()).unwrap();
        let response = bridge
            .handle(DavRequest::new(DavMethod::Mkcalendar, work().url()))
            .await;
        assert_eq!(response.status, StatusCode::CREATED);
        bridge
    }

    fn put(url: impl AsRef<str>) -> DavRequest {
        DavRequest::new(DavMethod::Put, url)
            .with_header(header::CONTENT_TYPE, "text/calendar")
            .with_body(ICS)
    }

    #[tokio::test]
    async fn test_object_lifecycle() {
        let bridge = bridge().await;
        let url = work().object("e1.ics").url();
        assert_eq!(bridge.handle(put(&url)).await.status, StatusCode::CREATED);

        let response = bridge.handle(DavRequest::new(DavMethod::Get, &url)).await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body_text().contains("UID:e1"));

        let copy = DavRequest::new(DavMethod::Copy, &url)
            .with_header(header::DESTINATION, work().object("copy.ics").url());
        assert_eq!(bridge.handle(copy).await.status, StatusCode::FORBIDDEN);

        let delete = DavRequest::new(DavMethod::Delete, &url);
        assert_eq!(bridge.handle(delete).await.status, StatusCode::NO_CONTENT);
        let response = bridge.handle(DavRequest::new(DavMethod::Get, &url)).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_parent_conflicts() {
        let bridge = bridge().await;
        let url = "/calendars/__uids__/alice/nowhere/e1.ics";
        assert_eq!(bridge.handle(put(url)).await.status, StatusCode::CONFLICT);
        let response = bridge.handle(DavRequest::new(DavMethod::Get, url)).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_move_between_calendars() {
        let bridge = bridge().await;
        let home = CollectionKey::new(StoreKind::Calendar, "alice", "home");
        bridge
            .handle(DavRequest::new(DavMethod::Mkcalendar, home.url()))
            .await;
        let url = work().object("e1.ics").url();
        bridge.handle(put(&url)).await;

        let outside = DavRequest::new(DavMethod::Move, &url)
            .with_header(header::DESTINATION, "/principals/__uids__/alice/e1.ics");
        assert_eq!(bridge.handle(outside).await.status, StatusCode::FORBIDDEN);

        let destination = home.object("moved.ics").url();
        let request = DavRequest::new(DavMethod::Move, &url)
            .with_header(header::DESTINATION, format!("https://cal.example.com{destination}"));
        let response = bridge.handle(request).await;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.header(header::LOCATION), Some(destination.as_str()));

        let response = bridge.handle(DavRequest::new(DavMethod::Get, &destination)).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_acl_method_is_rejected_outside_dropboxes() {
        let bridge = bridge().await;
        let response = bridge
            .handle(DavRequest::new(DavMethod::Acl, work().url()))
            .await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_collection_patch_not_allowed() {
        let bridge = bridge().await;
        let response = bridge
            .handle(DavRequest::new(DavMethod::Patch, work().url()))
            .await;
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
