//! Attachment collections under a calendar home.
//!
//! Both `dropbox/` (legacy) and `attachments/` (managed) homes hold one
//! child collection per calendar item, named by the item's dropbox id. The
//! children are synthetic: they exist as long as the item exists and is not
//! in the trash, and their ACLs are derived from the item's attendees rather
//! than stored.

use super::{AttachmentMode, AttachmentResource, attachments_home_url, dropbox_home_url};
use crate::acl::{self, Acl, Privilege};
use crate::error::{DavError, DavResult};
use crate::protocol::{DavMethod, DavRequest, DavResponse};
use crate::resource::{Bindable, Context};
use crate::storage::{ObjectInfo, Store};
use http::StatusCode;
use log::{debug, info, trace};

fn home_url(mode: AttachmentMode, home: &str) -> String {
    match mode {
        AttachmentMode::Dropbox => dropbox_home_url(home),
        AttachmentMode::Managed => attachments_home_url(home),
    }
}

fn listing(request: &DavRequest, names: &[String]) -> DavResponse {
    let body: String = if request.method == DavMethod::Head {
        String::new()
    } else {
        names.iter().map(|name| format!("{name}\n")).collect()
    };
    DavResponse::with_body(StatusCode::OK, "text/plain; charset=utf-8", body)
}

async fn live_object<S: Store>(store: &S, home: &str, dropbox_id: &str) -> DavResult<Option<ObjectInfo>> {
    trace!("Resolving dropbox {} of {}", dropbox_id, home);
    Ok(store
        .object_for_dropbox(home, dropbox_id)
        .await?
        .filter(|object| !object.in_trash))
}

/// `dropbox/` or `attachments/` of a calendar home.
#[derive(Debug, Clone)]
pub struct AttachmentHome {
    mode: AttachmentMode,
    home: String,
}

impl AttachmentHome {
    pub fn new(mode: AttachmentMode, home: impl Into<String>) -> Self {
        Self {
            mode,
            home: home.into(),
        }
    }

    pub fn mode(&self) -> AttachmentMode {
        self.mode
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    /// Dropbox ids of live items that carry attachments.
    pub async fn children<S: Store>(&self, store: &S) -> DavResult<Vec<String>> {
        let mut children = Vec::new();
        for id in store.dropbox_ids(&self.home).await? {
            match live_object(store, &self.home, &id).await? {
                Some(object) if object.attachment_count > 0 => children.push(id),
                _ => trace!("Hiding dropbox {}", id),
            }
        }
        Ok(children)
    }

    pub async fn child<S: Store>(&self, store: &S, dropbox_id: &str) -> DavResult<AttachmentCollection> {
        Ok(AttachmentCollection {
            mode: self.mode,
            home: self.home.clone(),
            dropbox_id: dropbox_id.to_string(),
            object: live_object(store, &self.home, dropbox_id).await?,
        })
    }

    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        ctx.require(request, &self.url(), Privilege::Read)?;
        let children: Vec<String> = self
            .children(ctx.store)
            .await?
            .into_iter()
            .map(|id| format!("{id}/"))
            .collect();
        Ok(listing(request, &children))
    }

    /// The home ACL: full access for the owner on dropboxes, read access on
    /// managed attachments.
    pub fn acl<S: Store>(&self, ctx: Context<'_, S>) -> Acl {
        match self.mode {
            AttachmentMode::Dropbox => {
                acl::collection_acl(&self.home, &[], ctx.config.enable_proxy_principals, ctx.delegation)
            }
            AttachmentMode::Managed => {
                acl::attachments_home_acl(&self.home, ctx.config.enable_proxy_principals)
            }
        }
    }
}

impl Bindable for AttachmentHome {
    fn url(&self) -> String {
        home_url(self.mode, &self.home)
    }

    fn exists(&self) -> bool {
        true
    }
}

/// Attachments of one item. Unbound when no live item owns the dropbox id.
#[derive(Debug, Clone)]
pub struct AttachmentCollection {
    mode: AttachmentMode,
    home: String,
    dropbox_id: String,
    object: Option<ObjectInfo>,
}

impl AttachmentCollection {
    pub fn mode(&self) -> AttachmentMode {
        self.mode
    }

    pub fn dropbox_id(&self) -> &str {
        &self.dropbox_id
    }

    /// The item the attachments belong to.
    pub fn object(&self) -> Option<&ObjectInfo> {
        self.object.as_ref()
    }

    fn require_object(&self) -> DavResult<&ObjectInfo> {
        self.object.as_ref().ok_or_else(|| {
            debug!("No item owns dropbox {}", self.dropbox_id);
            DavError::forbidden(format!("No such dropbox: {}", self.url()))
        })
    }

    /// Resource for a child attachment; `None` when there is no item to
    /// attach to.
    pub async fn child<S: Store>(&self, store: &S, name: &str) -> DavResult<Option<AttachmentResource>> {
        match &self.object {
            Some(object) => Ok(Some(
                AttachmentResource::locate(store, self.mode, object.clone(), name).await?,
            )),
            None => Ok(None),
        }
    }

    /// Names of the attachments stored in this mode.
    pub async fn children<S: Store>(&self, store: &S) -> DavResult<Vec<String>> {
        let object = self.require_object()?;
        let mut names = Vec::new();
        for name in store.attachment_names(&object.key).await? {
            let managed = store
                .attachment(&object.key, &name)
                .await?
                .map(|info| info.is_managed())
                .unwrap_or(false);
            if managed == (self.mode == AttachmentMode::Managed) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub async fn get<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        self.require_object()?;
        ctx.require(request, &self.url(), Privilege::Read)?;
        let names = self.children(ctx.store).await?;
        Ok(listing(request, &names))
    }

    /// MKCOL. Dropboxes are implicit, so creating one succeeds without doing
    /// anything; managed attachment collections cannot be created.
    pub fn mkcol(&self) -> DavResult<DavResponse> {
        match (self.mode, self.exists()) {
            (AttachmentMode::Managed, _) => Err(DavError::forbidden(
                "Cannot create a managed attachment collection",
            )),
            (AttachmentMode::Dropbox, true) => Err(DavError::method_not_allowed(format!(
                "Resource already exists: {}",
                self.url()
            ))),
            (AttachmentMode::Dropbox, false) => {
                debug!("Accepting MKCOL of implicit dropbox {}", self.url());
                Ok(DavResponse::new(StatusCode::CREATED))
            }
        }
    }

    pub fn mkcalendar(&self) -> DavResult<DavResponse> {
        Err(DavError::forbidden("Cannot create a calendar here"))
    }

    /// DELETE succeeds without removing anything; attachments go away with
    /// their item.
    pub fn delete(&self) -> DavResult<DavResponse> {
        self.require_object()?;
        debug!("Ignoring DELETE of {}", self.url());
        Ok(DavResponse::new(StatusCode::NO_CONTENT))
    }

    /// Effective ACL derived from the item's attendees and its calendar's
    /// invites.
    pub async fn acl<S: Store>(&self, ctx: Context<'_, S>) -> DavResult<Acl> {
        let object = self.require_object()?;
        let calendar = object.key.collection();
        let owner = ctx
            .store
            .collection(calendar)
            .await?
            .map(|info| info.owner_uid)
            .unwrap_or_else(|| self.home.clone());
        let invites = ctx.store.invites(calendar).await?;
        let proxies = ctx.config.enable_proxy_principals;
        Ok(match self.mode {
            AttachmentMode::Dropbox => acl::dropbox_acl(
                &owner,
                object,
                &invites,
                proxies,
                ctx.config.attendees_can_manage_attachments,
            ),
            AttachmentMode::Managed => {
                acl::attachments_child_acl(&owner, object, &invites, proxies, ctx.delegation)
            }
        })
    }

    /// ACL method: the request is validated against the item's attendees
    /// and never stored.
    pub fn simulate_acl<S: Store>(&self, ctx: Context<'_, S>, request: &DavRequest) -> DavResult<DavResponse> {
        let object = self.require_object()?;
        ctx.require(request, &self.url(), Privilege::WriteAcl)?;
        acl::simulate_dropbox_acl(&request.body, &object.attendees)?;
        info!("Accepted simulated ACL on {}", self.url());
        Ok(DavResponse::new(StatusCode::OK))
    }
}

impl Bindable for AttachmentCollection {
    fn url(&self) -> String {
        format!("{}{}/", home_url(self.mode, &self.home), self.dropbox_id)
    }

    fn exists(&self) -> bool {
        self.object.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::tests::stored_event;
    use crate::resource::test_support::{Fixture, scheduled_event};
    use crate::resource::ObjectResource;
    use crate::protocol::header;
    use bytes::Bytes;

    const ACL_BOB: &str = r#"<D:acl xmlns:D="DAV:"><D:ace><D:principal><D:href>/principals/__uids__/bob/</D:href></D:principal><D:grant><D:privilege><D:read/></D:privilege></D:grant></D:ace></D:acl>"#;
    const ACL_MALLORY: &str = r#"<D:acl xmlns:D="DAV:"><D:ace><D:principal><D:href>/principals/__uids__/mallory/</D:href></D:principal><D:grant><D:privilege><D:read/></D:privilege></D:grant></D:ace></D:acl>"#;

    async fn with_attachment(fixture: &Fixture, object: &ObjectResource) -> String {
        let info = object.info().unwrap().clone();
        let mut attachment =
            AttachmentResource::locate(&fixture.store, AttachmentMode::Dropbox, info.clone(), "a.txt")
                .await
                .unwrap();
        let upload = DavRequest::new(DavMethod::Put, attachment.url())
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_body("a");
        attachment.put(fixture.ctx(), &upload).await.unwrap();
        info.dropbox_id
    }

    #[tokio::test]
    async fn test_home_lists_items_with_attachments() {
        let fixture = Fixture::new();
        let bare = stored_event(&fixture, "bare").await;
        let attached = stored_event(&fixture, "attached").await;
        let id = with_attachment(&fixture, &attached).await;

        let home = AttachmentHome::new(AttachmentMode::Dropbox, "alice");
        let children = home.children(&fixture.store).await.unwrap();
        assert_eq!(children, vec![id.clone()]);
        assert!(!children.contains(&bare.info().unwrap().dropbox_id));

        fixture.store.move_to_trash(attached.key()).await.unwrap();
        assert!(home.children(&fixture.store).await.unwrap().is_empty());
        let child = home.child(&fixture.store, &id).await.unwrap();
        assert!(!child.exists());
    }

    #[tokio::test]
    async fn test_missing_dropbox_sentinel() {
        let fixture = Fixture::new();
        let dropboxes = AttachmentHome::new(AttachmentMode::Dropbox, "alice");
        let missing = dropboxes.child(&fixture.store, "nothing.dropbox").await.unwrap();
        assert!(!missing.exists());

        let get = DavRequest::new(DavMethod::Get, missing.url());
        assert_eq!(
            missing.get(fixture.ctx(), &get).await.unwrap_err().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(missing.mkcalendar().unwrap_err().status(), StatusCode::FORBIDDEN);
        assert_eq!(missing.mkcol().unwrap().status, StatusCode::CREATED);
        assert!(missing.child(&fixture.store, "a.txt").await.unwrap().is_none());

        let managed = AttachmentHome::new(AttachmentMode::Managed, "alice");
        let missing = managed.child(&fixture.store, "nothing.dropbox").await.unwrap();
        assert_eq!(missing.mkcol().unwrap_err().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_listing_separates_modes() {
        let fixture = Fixture::new();
        let object = stored_event(&fixture, "e1").await;
        let id = with_attachment(&fixture, &object).await;
        fixture
            .store
            .add_managed_attachment(object.key(), "text/plain", "m.txt", Bytes::from_static(b"m"))
            .await
            .unwrap();

        let dropbox = AttachmentHome::new(AttachmentMode::Dropbox, "alice")
            .child(&fixture.store, &id)
            .await
            .unwrap();
        assert_eq!(dropbox.children(&fixture.store).await.unwrap(), vec!["a.txt"]);
        let managed = AttachmentHome::new(AttachmentMode::Managed, "alice")
            .child(&fixture.store, &id)
            .await
            .unwrap();
        assert_eq!(managed.children(&fixture.store).await.unwrap(), vec!["m.txt"]);
        assert_eq!(dropbox.delete().unwrap().status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_simulated_acl_checks_attendees() {
        let fixture = Fixture::new();
        let key = crate::storage::CollectionKey::new(crate::storage::StoreKind::Calendar, "alice", "work");
        let parent = fixture.store.create_collection(&key, None).await.unwrap();
        let mut object = ObjectResource::unbound(parent, "s.ics");
        let put = DavRequest::new(DavMethod::Put, object.url())
            .with_header(header::CONTENT_TYPE, "text/calendar")
            .with_body(scheduled_event("s1"));
        object.put(fixture.ctx(), &put).await.unwrap();

        let dropbox = AttachmentHome::new(AttachmentMode::Dropbox, "alice")
            .child(&fixture.store, &object.info().unwrap().dropbox_id)
            .await
            .unwrap();
        let allowed = DavRequest::new(DavMethod::Acl, dropbox.url()).with_body(ACL_BOB);
        assert_eq!(
            dropbox.simulate_acl(fixture.ctx(), &allowed).unwrap().status,
            StatusCode::OK
        );
        let denied = DavRequest::new(DavMethod::Acl, dropbox.url()).with_body(ACL_MALLORY);
        assert_eq!(
            dropbox.simulate_acl(fixture.ctx(), &denied).unwrap_err().status(),
            StatusCode::FORBIDDEN
        );

        let acl = dropbox.acl(fixture.ctx()).await.unwrap();
        assert!(acl.grants("/principals/__uids__/bob/", Privilege::Read));
        assert!(!acl.grants("/principals/__uids__/bob/", Privilege::Write));
    }
}
