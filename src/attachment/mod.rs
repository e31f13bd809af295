//! Binary attachments of calendar items.
//!
//! Attachments come in two flavours that never share a name:
//!
//! * **legacy** (dropbox) attachments are uploaded with PUT under a
//!   client-chosen name in `/calendars/__uids__/{home}/dropbox/{id}/`;
//! * **managed** attachments are created through POST actions on the item
//!   ([`managed`]) and read back from `/calendars/__uids__/{home}/attachments/{id}/`.
//!
//! Uploads are streamed into an [`AttachmentWriter`](crate::storage::AttachmentWriter).
//! Size and quota limits are enforced by the store when the writer is
//! closed, so an oversized upload is only rejected after the last chunk.
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
//! let url = format!("{}e.ics", key.url());
//! bridge
//!     .handle(DavRequest::new(DavMethod::Put, &url)
//!         .with_header(header::CONTENT_TYPE, "text/calendar")
//!         .with_body(ics))
//!     .await;
//!
//! let add = DavRequest::new(DavMethod::Post, format!("{url}?action=attachment-add"))
//!     .with_header(header::CONTENT_TYPE, "text/plain")
//!     .with_header(header::CONTENT_DISPOSITION, "attachment;filename=notes.txt")
//!     .with_body("hello");
//! let response = bridge.handle(add).await;
//! assert_eq!(response.status.as_u16(), 201);
//! assert!(response.header(header::CAL_MANAGED_ID).is_some());
//! # Ok(())
//! # }
//! ```

pub mod dropbox;
pub mod managed;

pub use dropbox::{AttachmentCollection, AttachmentHome};
pub use managed::ManagedAction;

use crate::acl::Privilege;
use crate::error::{DavError, DavResult, precondition};
use crate::mapping;
use crate::precondition::check_standard;
use crate::protocol::{DavMethod, DavRequest, DavResponse, header};
use crate::resource::{Bindable, Context, EntityTag};
use crate::storage::{AttachmentInfo, AttachmentWriter, ObjectInfo, Store, StoreError};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use http::StatusCode;
use log::{debug, info, warn};

/// Chunk size used when a buffered request body is fed to the writer.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Content type of attachments uploaded without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub fn dropbox_home_url(home: &str) -> String {
    format!("/calendars/__uids__/{home}/dropbox/")
}

pub fn attachments_home_url(home: &str) -> String {
    format!("/calendars/__uids__/{home}/attachments/")
}

/// Size and quota failures reported when an upload is committed.
pub(crate) fn limit_error(err: &StoreError) -> Option<DavError> {
    match err {
        StoreError::AttachmentSizeTooLarge => Some(DavError::precondition_with(
            precondition::MAX_ATTACHMENT_SIZE,
            "Attachment size is too large",
        )),
        StoreError::QuotaExceeded => Some(DavError::precondition_status(
            StatusCode::INSUFFICIENT_STORAGE,
            precondition::QUOTA_NOT_EXCEEDED,
        )),
        _ => None,
    }
}

/// Split a buffered body into upload chunks.
pub fn chunked(body: Bytes) -> impl Stream<Item = Bytes> + Send {
    let mut chunks = Vec::with_capacity(body.len() / UPLOAD_CHUNK_SIZE + 1);
    let mut rest = body;
    while rest.len() > UPLOAD_CHUNK_SIZE {
        chunks.push(rest.split_to(UPLOAD_CHUNK_SIZE));
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    futures::stream::iter(chunks)
}

/// Where an attachment lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    Dropbox,
    Managed,
}

/// One named attachment of an item, bound or not.
#[derive(Debug, Clone)]
pub struct AttachmentResource {
    mode: AttachmentMode,
    object: ObjectInfo,
    name: String,
    info: Option<AttachmentInfo>,
}

impl AttachmentResource {
    pub async fn locate<S: Store>(
        store: &S,
        mode: AttachmentMode,
        object: ObjectInfo,
        name: &str,
    ) -> DavResult<Self> {
        let info = store.attachment(&object.key, name).await?;
        Ok(Self {
            mode,
            object,
            name: name.to_string(),
            info,
        })
    }

    pub fn mode(&self) -> AttachmentMode {
        self.mode
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The item the attachment belongs to.
    pub fn object(&self) -> &ObjectInfo {
        &self.object
    }

    pub fn info(&self) -> Option<&AttachmentInfo> {
        self.info.as_ref()
    }

    /// Managed either by location or by what is stored under the name.
    pub fn is_managed(&self) -> bool {
        self.mode == AttachmentMode::Managed
            || self.info.as_ref().map(AttachmentInfo::is_managed).unwrap_or(false)
    }

    /// URL of the collection holding this attachment.
    pub fn collection_url(&self) -> String {
        let home = self.object.key.home();
        match self.mode {
            AttachmentMode::Dropbox => format!("{}{}/", dropbox_home_url(home), self.object.dropbox_id),
            AttachmentMode::Managed => {
                format!("{}{}/", attachments_home_url(home), self.object.dropbox_id)
            }
        }
    }

    pub fn require_bound(&self) -> DavResult<&AttachmentInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| DavError::not_found(format!("Attachment not found: {}", self.url())))
    }

    async fn current_etag<S: Store>(&self, store: &S) -> DavResult<Option<EntityTag>> {
        if !self.exists() {
            return Ok(None);
        }
        let data = store.read_attachment(&self.object.key, &self.name).await?;
        Ok(Some(EntityTag::from_content(&data)))
    }

    /// GET/HEAD: stored bytes with a download filename.
    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let info = self.require_bound()?;
        ctx.require(request, &self.url(), Privilege::Read)?;
        let data = ctx
            .store
            .read_attachment(&self.object.key, &self.name)
            .await
            .map_err(|err| ctx.map(err, mapping::attachment))?;
        let etag = EntityTag::from_content(&data);
        check_standard(request, true, Some(&etag), Some(info.created))?;

        let body = if request.method == DavMethod::Head {
            Bytes::new()
        } else {
            data
        };
        let mut response = DavResponse::with_body(StatusCode::OK, &info.content_type, body);
        response.set_header(header::ETAG, etag.to_string());
        response.set_header(
            header::CONTENT_DISPOSITION,
            format!("attachment;filename={}", self.name),
        );
        Ok(response)
    }

    /// PUT with the whole body already buffered.
    pub async fn put<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let body = request.body.clone();
        self.put_stream(ctx, request, chunked(body)).await
    }

    /// Streamed PUT of a legacy attachment. Returns 201 on create, 204 on
    /// replace.
    pub async fn put_stream<S, St>(
        &mut self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        content: St,
    ) -> DavResult<DavResponse>
    where
        S: Store,
        St: Stream<Item = Bytes> + Send,
    {
        if self.is_managed() {
            return Err(DavError::forbidden(
                "Managed attachments cannot be changed with PUT",
            ));
        }
        let existed = self.exists();
        if existed {
            ctx.require(request, &self.url(), Privilege::Write)?;
        } else {
            ctx.require(request, &self.collection_url(), Privilege::Bind)?;
        }
        let etag = self.current_etag(ctx.store).await?;
        check_standard(
            request,
            existed,
            etag.as_ref(),
            self.info.as_ref().map(|info| info.created),
        )?;

        let content_type = request
            .content_type()
            .map(|media| media.to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        info!("Uploading attachment {} ({})", self.url(), content_type);

        let mut writer = ctx
            .store
            .open_attachment(&self.object.key, &self.name, &content_type)
            .await
            .map_err(|err| self.write_error(ctx, err))?;
        pin_mut!(content);
        let mut written = 0usize;
        while let Some(chunk) = content.next().await {
            written += chunk.len();
            writer
                .write(chunk)
                .await
                .map_err(|err| self.write_error(ctx, err))?;
        }
        debug!("Streamed {} bytes into {}", written, self.url());

        let stored = writer.close().await.map_err(|err| match limit_error(&err) {
            Some(limit) => {
                debug!("Attachment {} rejected on close: {}", self.url(), err);
                limit
            }
            None => self.write_error(ctx, err),
        })?;
        self.info = Some(stored);

        let mut response = DavResponse::new(if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        });
        if let Some(etag) = self.current_etag(ctx.store).await? {
            response.set_header(header::ETAG, etag.to_string());
        }
        Ok(response)
    }

    fn write_error<S: Store>(&self, ctx: Context<'_, S>, err: StoreError) -> DavError {
        match err {
            StoreError::AttachmentDropboxNotAllowed => {
                DavError::forbidden("Attachments must be managed")
            }
            other => {
                warn!("Storing attachment {} failed: {}", self.url(), other);
                DavError::unavailable(
                    "Attachment could not be stored",
                    Utc::now() + Duration::seconds(ctx.config.transaction_retry_seconds as i64),
                )
            }
        }
    }

    /// DELETE of a legacy attachment.
    pub async fn delete<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        self.require_bound()?;
        if self.is_managed() {
            return Err(DavError::forbidden(
                "Managed attachments are removed through their item",
            ));
        }
        ctx.require(request, &self.collection_url(), Privilege::Unbind)?;
        let etag = self.current_etag(ctx.store).await?;
        check_standard(request, true, etag.as_ref(), None)?;

        info!("Removing attachment {}", self.url());
        ctx.store
            .remove_attachment(&self.object.key, &self.name)
            .await
            .map_err(|err| ctx.map(err, mapping::collection))?;
        self.info = None;
        Ok(DavResponse::new(StatusCode::NO_CONTENT))
    }

    /// COPY of a legacy attachment into another attachment resource.
    pub async fn copy_to<S: Store>(
        &self,
        ctx: Context<'_, S>,
        request: &DavRequest,
        destination: &mut AttachmentResource,
    ) -> DavResult<DavResponse> {
        self.require_bound()?;
        if self.is_managed() {
            return Err(DavError::forbidden("Managed attachments cannot be copied"));
        }
        ctx.require(request, &self.url(), Privilege::Read)?;
        if destination.exists() && !request.overwrite() {
            return Err(DavError::precondition_failed(format!(
                "Destination exists: {}",
                destination.url()
            )));
        }
        let data = ctx
            .store
            .read_attachment(&self.object.key, &self.name)
            .await
            .map_err(|err| ctx.map(err, mapping::attachment))?;
        let content_type = self
            .info
            .as_ref()
            .map(|info| info.content_type.clone())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let upload = DavRequest {
            headers: Default::default(),
            ..request.clone()
        }
        .with_header(header::CONTENT_TYPE, content_type);
        destination.put_stream(ctx, &upload, chunked(data)).await
    }
}

impl Bindable for AttachmentResource {
    fn url(&self) -> String {
        format!("{}{}", self.collection_url(), self.name)
    }

    fn exists(&self) -> bool {
        self.info.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resource::ObjectResource;
    use crate::resource::test_support::{Fixture, event};
    use crate::storage::{CollectionKey, StoreKind};

    pub(crate) async fn stored_event(fixture: &Fixture, uid: &str) -> ObjectResource {
        let key = CollectionKey::new(StoreKind::Calendar, "alice", "work");
        let parent = match fixture.store.collection(&key).await.unwrap() {
            Some(info) => info,
            None => fixture.store.create_collection(&key, None).await.unwrap(),
        };
        let mut object = ObjectResource::unbound(parent, &format!("{uid}.ics"));
        let request = DavRequest::new(DavMethod::Put, object.url())
            .with_header(header::CONTENT_TYPE, "text/calendar")
            .with_body(event(uid));
        object.put(fixture.ctx(), &request).await.unwrap();
        object
    }

    async fn legacy(fixture: &Fixture, name: &str) -> AttachmentResource {
        let object = stored_event(fixture, "e1").await;
        AttachmentResource::locate(
            &fixture.store,
            AttachmentMode::Dropbox,
            object.info().unwrap().clone(),
            name,
        )
        .await
        .unwrap()
    }

    fn upload(attachment: &AttachmentResource, body: &'static str) -> DavRequest {
        DavRequest::new(DavMethod::Put, attachment.url())
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_body(body)
    }

    #[test]
    fn test_chunking() {
        let body = Bytes::from(vec![7u8; UPLOAD_CHUNK_SIZE * 2 + 10]);
        let chunks: Vec<Bytes> = futures::executor::block_on(chunked(body).collect());
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![UPLOAD_CHUNK_SIZE, UPLOAD_CHUNK_SIZE, 10]);
        assert!(futures::executor::block_on(chunked(Bytes::new()).collect::<Vec<_>>()).is_empty());
    }

    #[test]
    fn test_limit_errors() {
        let size = limit_error(&StoreError::AttachmentSizeTooLarge).unwrap();
        assert_eq!(size.status(), StatusCode::FORBIDDEN);
        assert_eq!(size.element(), Some(&precondition::MAX_ATTACHMENT_SIZE));
        let quota = limit_error(&StoreError::QuotaExceeded).unwrap();
        assert_eq!(quota.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(quota.element(), Some(&precondition::QUOTA_NOT_EXCEEDED));
        assert!(limit_error(&StoreError::LockTimeout).is_none());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let fixture = Fixture::new();
        let mut attachment = legacy(&fixture, "notes.txt").await;
        assert!(attachment.url().contains("/dropbox/"));

        let response = attachment
            .put(fixture.ctx(), &upload(&attachment, "hello"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        let etag = response.header(header::ETAG).unwrap().to_string();

        let get = DavRequest::new(DavMethod::Get, attachment.url());
        let response = attachment.get(fixture.ctx(), &get).await.unwrap();
        assert_eq!(response.body_text(), "hello");
        assert_eq!(response.header(header::ETAG), Some(etag.as_str()));
        assert_eq!(
            response.header(header::CONTENT_DISPOSITION),
            Some("attachment;filename=notes.txt")
        );

        let response = attachment
            .put(fixture.ctx(), &upload(&attachment, "hello again"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_ne!(response.header(header::ETAG), Some(etag.as_str()));

        let delete = DavRequest::new(DavMethod::Delete, attachment.url());
        let response = attachment.delete(fixture.ctx(), &delete).await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(!attachment.exists());
        assert_eq!(
            attachment.get(fixture.ctx(), &get).await.unwrap_err().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_oversized_upload_fails_on_close() {
        let fixture = Fixture::new();
        fixture.store.set_max_attachment_size(4).await;
        let mut attachment = legacy(&fixture, "big.bin").await;

        let error = attachment
            .put(fixture.ctx(), &upload(&attachment, "too many bytes"))
            .await
            .unwrap_err();
        assert_eq!(error.element(), Some(&precondition::MAX_ATTACHMENT_SIZE));
        assert!(!attachment.exists());
        let stored = fixture
            .store
            .attachment(&attachment.object().key, "big.bin")
            .await
            .unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_quota_is_insufficient_storage() {
        let fixture = Fixture::new();
        fixture.store.set_quota("alice", 3).await;
        let mut attachment = legacy(&fixture, "a.bin").await;
        let error = attachment
            .put(fixture.ctx(), &upload(&attachment, "12345"))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[tokio::test]
    async fn test_locked_upload_is_unavailable() {
        let fixture = Fixture::new();
        let mut attachment = legacy(&fixture, "a.bin").await;
        fixture.store.lock(&attachment.url()).await;
        let error = attachment
            .put(fixture.ctx(), &upload(&attachment, "x"))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_managed_names_reject_legacy_writes() {
        let fixture = Fixture::new();
        let object = stored_event(&fixture, "e1").await;
        let added = fixture
            .store
            .add_managed_attachment(object.key(), "text/plain", "m.txt", Bytes::from_static(b"m"))
            .await
            .unwrap();
        let info = fixture.store.object(object.key()).await.unwrap().unwrap();

        let mut attachment = AttachmentResource::locate(
            &fixture.store,
            AttachmentMode::Dropbox,
            info.clone(),
            &added.name,
        )
        .await
        .unwrap();
        assert!(attachment.is_managed());
        let error = attachment
            .put(fixture.ctx(), &upload(&attachment, "x"))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
        let delete = DavRequest::new(DavMethod::Delete, attachment.url());
        let error = attachment.delete(fixture.ctx(), &delete).await.unwrap_err();
        assert_eq!(error.status(), StatusCode::FORBIDDEN);

        let managed = AttachmentResource::locate(
            &fixture.store,
            AttachmentMode::Managed,
            info,
            &added.name,
        )
        .await
        .unwrap();
        assert!(managed.url().contains("/attachments/"));
        let get = DavRequest::new(DavMethod::Get, managed.url());
        assert_eq!(managed.get(fixture.ctx(), &get).await.unwrap().body_text(), "m");
    }

    #[tokio::test]
    async fn test_copy_respects_overwrite() {
        let fixture = Fixture::new();
        let mut source = legacy(&fixture, "a.txt").await;
        source.put(fixture.ctx(), &upload(&source, "abc")).await.unwrap();
        let info = source.object().clone();
        let mut target =
            AttachmentResource::locate(&fixture.store, AttachmentMode::Dropbox, info.clone(), "b.txt")
                .await
                .unwrap();

        let copy = DavRequest::new(DavMethod::Copy, source.url());
        let response = source.copy_to(fixture.ctx(), &copy, &mut target).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);

        let refuse = copy.clone().with_header(header::OVERWRITE, "F");
        let error = source.copy_to(fixture.ctx(), &refuse, &mut target).await.unwrap_err();
        assert_eq!(error.status(), StatusCode::PRECONDITION_FAILED);
        let store = &fixture.store;
        let data = store.read_attachment(&info.key, "b.txt").await.unwrap();
        assert_eq!(&data[..], b"abc");
    }
}
