//! Sharing notifications of a calendar home.
//!
//! The notification collection is read-only from the protocol side: the
//! sharing subsystem creates entries and clients read or delete them.

use super::Context;
use crate::acl::Privilege;
use crate::error::{DavError, DavResult};
use crate::mapping;
use crate::multistatus::XML_CONTENT_TYPE;
use crate::precondition::{check_standard, collection_etag};
use crate::protocol::{DavMethod, DavRequest, DavResponse, header};
use crate::resource::version::EntityTag;
use crate::storage::{NotificationInfo, Store, StoreError};
use http::StatusCode;
use log::{debug, info};

fn notifications_url(home: &str) -> String {
    format!("/calendars/__uids__/{home}/notification/")
}

/// The `notification/` collection of a home.
#[derive(Debug, Clone)]
pub struct NotificationCollection {
    home: String,
    sync_token: String,
}

impl NotificationCollection {
    pub async fn locate<S: Store>(store: &S, home: &str) -> DavResult<Self> {
        let sync_token = store.notifications_sync_token(home).await?;
        Ok(Self {
            home: home.to_string(),
            sync_token,
        })
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn url(&self) -> String {
        notifications_url(&self.home)
    }

    pub fn sync_token(&self) -> &str {
        &self.sync_token
    }

    pub async fn children<S: Store>(&self, store: &S) -> DavResult<Vec<String>> {
        Ok(store.notification_names(&self.home).await?)
    }

    pub async fn child<S: Store>(&self, store: &S, name: &str) -> DavResult<NotificationResource> {
        let info = store.notification(&self.home, name).await?;
        Ok(NotificationResource {
            home: self.home.clone(),
            name: name.to_string(),
            info,
        })
    }

    /// Plain listing of notification names, tagged with the sync token.
    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        ctx.require(request, &self.url(), Privilege::Read)?;
        let etag = collection_etag(&self.sync_token);
        check_standard(request, true, Some(&etag), None)?;

        let names = self.children(ctx.store).await?;
        let body = if request.method == DavMethod::Head {
            String::new()
        } else {
            names.iter().map(|name| format!("{name}\n")).collect()
        };
        let mut response = DavResponse::with_body(StatusCode::OK, "text/plain; charset=utf-8", body);
        response.set_header(header::ETAG, etag.to_string());
        response.set_header(header::CTAG, &self.sync_token);
        Ok(response)
    }

    pub fn proppatch(&self) -> DavResult<DavResponse> {
        Err(DavError::forbidden("Properties cannot be changed on notifications"))
    }
}

/// One notification, possibly already processed and removed.
#[derive(Debug, Clone)]
pub struct NotificationResource {
    home: String,
    name: String,
    info: Option<NotificationInfo>,
}

impl NotificationResource {
    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> String {
        format!("{}{}", notifications_url(&self.home), self.name)
    }

    pub fn exists(&self) -> bool {
        self.info.is_some()
    }

    pub fn info(&self) -> Option<&NotificationInfo> {
        self.info.as_ref()
    }

    pub fn etag(&self) -> Option<EntityTag> {
        self.info
            .as_ref()
            .map(|info| EntityTag::from_content(info.xml.as_bytes()))
    }

    /// Render the notification document. A notification removed since it
    /// was located is reported as missing.
    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        if !self.exists() {
            return Err(DavError::not_found(format!("Notification not found: {}", self.name)));
        }
        ctx.require(request, &self.url(), Privilege::Read)?;
        let current = ctx
            .store
            .notification(&self.home, &self.name)
            .await
            .map_err(|err| ctx.map(err, mapping::notification))?
            .ok_or_else(|| {
                debug!("Notification {} vanished", self.name);
                DavError::Status(StatusCode::NOT_FOUND)
            })?;

        let etag = EntityTag::from_content(current.xml.as_bytes());
        check_standard(request, true, Some(&etag), None)?;
        let body = if request.method == DavMethod::Head {
            String::new()
        } else {
            current.xml
        };
        let mut response = DavResponse::with_body(StatusCode::OK, XML_CONTENT_TYPE, body);
        response.set_header(header::ETAG, etag.to_string());
        Ok(response)
    }

    pub async fn delete<S: Store>(&mut self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        if !self.exists() {
            return Err(DavError::not_found(format!("Notification not found: {}", self.name)));
        }
        ctx.require(request, &notifications_url(&self.home), Privilege::Unbind)?;
        check_standard(request, true, self.etag().as_ref(), None)?;

        match ctx.store.remove_notification(&self.home, &self.name).await {
            Ok(()) => {
                info!("Removed notification {} of {}", self.name, self.home);
                self.info = None;
                Ok(DavResponse::new(StatusCode::NO_CONTENT))
            }
            Err(StoreError::LockTimeout) => Err(DavError::conflict(format!(
                "Resource: {} currently in use on the server.",
                self.url()
            ))),
            Err(err) => Err(ctx.map(err, mapping::notification)),
        }
    }

    pub fn proppatch(&self) -> DavResult<DavResponse> {
        Err(DavError::forbidden("Properties cannot be changed on notifications"))
    }
}
