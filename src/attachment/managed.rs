//! Managed attachment actions: `POST ?action=attachment-add|update|remove`
//! on a calendar object.

use super::{DEFAULT_CONTENT_TYPE, attachments_home_url, limit_error};
use crate::acl::Privilege;
use crate::error::{DavError, DavResult, ErrorElement, precondition};
use crate::mapping;
use crate::precondition::check_object;
use crate::protocol::{DavRequest, DavResponse, header};
use crate::resource::{Bindable, Context, ObjectResource};
use crate::storage::{ManagedAttachment, Store, StoreError};
use http::StatusCode;
use log::{debug, info};

/// Recurrence id naming the master instance.
const MASTER_RID: &str = "M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedAction {
    Add,
    Update,
    Remove,
}

impl ManagedAction {
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "attachment-add" => Some(ManagedAction::Add),
            "attachment-update" => Some(ManagedAction::Update),
            "attachment-remove" => Some(ManagedAction::Remove),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedAction::Add => "attachment-add",
            ManagedAction::Update => "attachment-update",
            ManagedAction::Remove => "attachment-remove",
        }
    }

    /// Element reported when the store rejects this action.
    fn error_element(&self) -> ErrorElement {
        match self {
            ManagedAction::Add => precondition::VALID_ATTACHMENT_ADD,
            ManagedAction::Update => precondition::VALID_ATTACHMENT_UPDATE,
            ManagedAction::Remove => precondition::VALID_ATTACHMENT_REMOVE,
        }
    }
}

/// Only the master instance can be targeted; per-instance attachments are
/// not supported.
fn check_rids(request: &DavRequest) -> DavResult<()> {
    let Some(rids) = request.query_param("rid") else {
        return Ok(());
    };
    for rid in rids.split(',').map(str::trim) {
        if rid != MASTER_RID {
            debug!("Rejecting attachment rid '{}'", rid);
            return Err(DavError::precondition_with(
                precondition::VALID_RID_PARAMETER,
                "The rid parameter in the request-URI contains an invalid value",
            ));
        }
    }
    Ok(())
}

fn managed_id(request: &DavRequest) -> DavResult<&str> {
    request
        .query_param("managed-id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            DavError::precondition_with(
                precondition::VALID_MANAGED_ID_PARAMETER,
                "The managed-id parameter is missing from the request-URI",
            )
        })
}

fn action_error<S: Store>(ctx: Context<'_, S>, err: StoreError, action: ManagedAction) -> DavError {
    if let Some(limit) = limit_error(&err) {
        return limit;
    }
    ctx.mapper.map_chain(
        err,
        &[mapping::attachment_action, mapping::attachment],
        Some(action.error_element()),
    )
}

/// Run a managed attachment action against `object`.
pub async fn post<S: Store>(
    object: &mut ObjectResource,
    ctx: Context<'_, S>,
    request: &DavRequest,
    action: ManagedAction,
) -> DavResult<DavResponse> {
    if !ctx.config.enable_managed_attachments {
        return Err(DavError::forbidden("Managed attachments are not enabled"));
    }
    let info = object.require_bound()?;
    ctx.require(request, &object.url(), Privilege::Write)?;
    check_object(request, Some(info), ctx.config.schedule_tag_compatibility)?;
    check_rids(request)?;

    let content_type = request
        .content_type()
        .map(|media| media.to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    let filename = request
        .content_disposition_filename()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("{} on {}", action.as_str(), object.url());

    let (status, attachment) = match action {
        ManagedAction::Add => {
            let added = ctx
                .store
                .add_managed_attachment(object.key(), &content_type, &filename, request.body.clone())
                .await
                .map_err(|err| action_error(ctx, err, action))?;
            (StatusCode::CREATED, Some(added))
        }
        ManagedAction::Update => {
            let id = managed_id(request)?;
            let updated = ctx
                .store
                .update_managed_attachment(
                    object.key(),
                    id,
                    &content_type,
                    &filename,
                    request.body.clone(),
                )
                .await
                .map_err(|err| action_error(ctx, err, action))?;
            (StatusCode::NO_CONTENT, Some(updated))
        }
        ManagedAction::Remove => {
            let id = managed_id(request)?;
            ctx.store
                .remove_managed_attachment(object.key(), id)
                .await
                .map_err(|err| action_error(ctx, err, action))?;
            (StatusCode::NO_CONTENT, None)
        }
    };

    if object.metadata().is_schedule_object() {
        object.in_new_transaction(ctx.store).await?;
    } else {
        object.rebind(ctx.store).await?;
    }

    let mut response = DavResponse::new(status);
    if let Some(attachment) = &attachment {
        set_attachment_headers(&mut response, object, attachment);
    }
    if let Some(etag) = object.etag() {
        response.set_header(header::ETAG, etag.to_string());
    }
    if let Some(tag) = object.schedule_tag() {
        response.set_header(header::SCHEDULE_TAG, tag);
    }
    Ok(object
        .process_prefer(ctx, request, request.header(header::ACCEPT), response)
        .await)
}

fn set_attachment_headers(response: &mut DavResponse, object: &ObjectResource, attachment: &ManagedAttachment) {
    let location = format!(
        "{}{}/{}",
        attachments_home_url(object.key().home()),
        attachment.dropbox_id,
        attachment.name
    );
    response.set_header(header::LOCATION, location);
    response.set_header(header::CAL_MANAGED_ID, &attachment.managed_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::tests::stored_event;
    use crate::config::BridgeConfig;
    use crate::protocol::DavMethod;
    use crate::resource::test_support::Fixture;

    fn action(object: &ObjectResource, query: &str, body: &'static str) -> DavRequest {
        DavRequest::new(DavMethod::Post, format!("{}?{}", object.url(), query))
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_header(header::CONTENT_DISPOSITION, "attachment;filename=notes.txt")
            .with_body(body)
    }

    #[test]
    fn test_actions() {
        assert_eq!(ManagedAction::from_action("attachment-add"), Some(ManagedAction::Add));
        assert_eq!(ManagedAction::from_action("attachment-remove"), Some(ManagedAction::Remove));
        assert_eq!(ManagedAction::from_action("split"), None);
        assert_eq!(ManagedAction::Update.as_str(), "attachment-update");
    }

    #[tokio::test]
    async fn test_add_update_remove() {
        let fixture = Fixture::new();
        let mut object = stored_event(&fixture, "e1").await;
        let before = object.etag().unwrap();

        let response = object
            .post(fixture.ctx(), &action(&object, "action=attachment-add", "v1"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        let managed_id = response.header(header::CAL_MANAGED_ID).unwrap().to_string();
        let location = response.header(header::LOCATION).unwrap();
        assert!(location.starts_with("/calendars/__uids__/alice/attachments/"));
        assert!(location.ends_with("/notes.txt"));
        assert_ne!(object.etag().unwrap(), before);
        assert!(String::from_utf8_lossy(&object.info().unwrap().data).contains(&managed_id));

        let update = action(
            &object,
            &format!("action=attachment-update&managed-id={managed_id}"),
            "v2",
        );
        let response = object.post(fixture.ctx(), &update).await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.header(header::CAL_MANAGED_ID), Some(managed_id.as_str()));

        let remove = action(
            &object,
            &format!("action=attachment-remove&managed-id={managed_id}"),
            "",
        );
        let response = object.post(fixture.ctx(), &remove).await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(!String::from_utf8_lossy(&object.info().unwrap().data).contains(&managed_id));
    }

    #[tokio::test]
    async fn test_parameter_errors() {
        let fixture = Fixture::new();
        let mut object = stored_event(&fixture, "e1").await;

        let error = object
            .post(fixture.ctx(), &action(&object, "action=attachment-update", "x"))
            .await
            .unwrap_err();
        assert_eq!(error.element(), Some(&precondition::VALID_MANAGED_ID_PARAMETER));

        let error = object
            .post(fixture.ctx(), &action(&object, "action=attachment-add&rid=20240101T000000Z", "x"))
            .await
            .unwrap_err();
        assert_eq!(error.element(), Some(&precondition::VALID_RID_PARAMETER));

        let response = object
            .post(fixture.ctx(), &action(&object, "action=attachment-add&rid=M", "x"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);

        let error = object
            .post(
                fixture.ctx(),
                &action(&object, "action=attachment-update&managed-id=unknown", "x"),
            )
            .await
            .unwrap_err();
        assert_eq!(error.element(), Some(&precondition::VALID_MANAGED_ID_PARAMETER));

        let error = object
            .post(
                fixture.ctx(),
                &action(&object, "action=attachment-remove&managed-id=unknown", ""),
            )
            .await
            .unwrap_err();
        assert_eq!(error.element(), Some(&precondition::VALID_ATTACHMENT_REMOVE));
    }

    #[tokio::test]
    async fn test_limits_and_flag() {
        let fixture = Fixture::new();
        fixture.store.set_max_attachment_size(2).await;
        let mut object = stored_event(&fixture, "e1").await;
        let error = object
            .post(fixture.ctx(), &action(&object, "action=attachment-add", "large"))
            .await
            .unwrap_err();
        assert_eq!(error.element(), Some(&precondition::MAX_ATTACHMENT_SIZE));

        let disabled = Fixture::with_config(BridgeConfig {
            enable_managed_attachments: false,
            ..BridgeConfig::default()
        });
        let mut object = stored_event(&disabled, "e2").await;
        let error = object
            .post(disabled.ctx(), &action(&object, "action=attachment-add", "x"))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
    }
}
