//! Managed attachment actions and legacy dropbox resources.

use crate::common::{CALENDAR, bridge, bridge_with_config, calendar_key, event, get, put_event};
use dav_store_bridge::protocol::header;
use dav_store_bridge::storage::Store;
use dav_store_bridge::{BridgeConfig, DavMethod, DavRequest};
use http::StatusCode;

fn action(url: &str, query: &str, body: &'static str) -> DavRequest {
    DavRequest::new(DavMethod::Post, format!("{url}?{query}"))
        .with_header(header::CONTENT_TYPE, "text/plain")
        .with_header(header::CONTENT_DISPOSITION, "attachment;filename=agenda.txt")
        .with_body(body)
}

#[tokio::test]
async fn test_managed_attachment_lifecycle() {
    let bridge = bridge().await;
    put_event(&bridge, "e1.ics", event("e1")).await;
    let url = format!("{CALENDAR}e1.ics");
    let before = get(&bridge, &url).await.header(header::ETAG).map(str::to_string);

    let response = bridge
        .handle(action(&url, "action=attachment-add", "first draft"))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    let location = response.header(header::LOCATION).unwrap().to_string();
    let managed_id = response.header(header::CAL_MANAGED_ID).unwrap().to_string();
    assert!(location.starts_with("/calendars/__uids__/alice/attachments/"));
    assert_ne!(response.header(header::ETAG).map(str::to_string), before);

    let attachment = get(&bridge, &location).await;
    assert_eq!(attachment.status, StatusCode::OK);
    assert_eq!(attachment.body_text(), "first draft");

    let update = format!("action=attachment-update&managed-id={managed_id}");
    let response = bridge.handle(action(&url, &update, "final")).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let remove = format!("action=attachment-remove&managed-id={managed_id}");
    let response = bridge.handle(action(&url, &remove, "")).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_managed_actions_validate_parameters() {
    let bridge = bridge().await;
    put_event(&bridge, "e1.ics", event("e1")).await;
    let url = format!("{CALENDAR}e1.ics");

    let response = bridge
        .handle(action(&url, "action=attachment-update", "x"))
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(response.body_text().contains("valid-managed-id-parameter"));

    let response = bridge.handle(action(&url, "action=explode", "x")).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(response.body_text().contains("valid-action-parameter"));

    let disabled = bridge_with_config(BridgeConfig {
        enable_managed_attachments: false,
        ..BridgeConfig::default()
    })
    .await;
    put_event(&disabled, "e1.ics", event("e1")).await;
    let response = disabled
        .handle(action(&url, "action=attachment-add", "x"))
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_dropbox_put_get_delete() {
    let bridge = bridge().await;
    put_event(&bridge, "e1.ics", event("e1")).await;
    let dropbox_id = bridge
        .store()
        .object(&calendar_key().object("e1.ics"))
        .await
        .unwrap()
        .unwrap()
        .dropbox_id;
    let url = format!("/calendars/__uids__/alice/dropbox/{dropbox_id}/minutes.txt");

    let put = DavRequest::new(DavMethod::Put, &url)
        .with_header(header::CONTENT_TYPE, "text/plain")
        .with_body("minutes");
    assert_eq!(bridge.handle(put).await.status, StatusCode::CREATED);

    let response = get(&bridge, &url).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body_text(), "minutes");

    let listing = get(&bridge, format!("/calendars/__uids__/alice/dropbox/{dropbox_id}/")).await;
    assert_eq!(listing.status, StatusCode::OK);

    let delete = DavRequest::new(DavMethod::Delete, &url);
    assert_eq!(bridge.handle(delete).await.status, StatusCode::NO_CONTENT);
    assert_eq!(get(&bridge, &url).await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dropbox_collections_are_server_managed() {
    let bridge = bridge().await;
    put_event(&bridge, "e1.ics", event("e1")).await;
    let dropbox_id = bridge
        .store()
        .object(&calendar_key().object("e1.ics"))
        .await
        .unwrap()
        .unwrap()
        .dropbox_id;
    let collection = format!("/calendars/__uids__/alice/dropbox/{dropbox_id}/");
    let attachment = format!("{collection}minutes.txt");
    let put = DavRequest::new(DavMethod::Put, &attachment).with_body("minutes");
    assert_eq!(bridge.handle(put).await.status, StatusCode::CREATED);

    let response = bridge
        .handle(DavRequest::new(DavMethod::Delete, &collection))
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(get(&bridge, &attachment).await.status, StatusCode::OK);

    let response = bridge
        .handle(DavRequest::new(DavMethod::Mkcalendar, &collection))
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let response = bridge
        .handle(DavRequest::new(DavMethod::Mkcol, "/calendars/__uids__/alice/dropbox/"))
        .await;
    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);

    let orphan = DavRequest::new(
        DavMethod::Put,
        "/calendars/__uids__/alice/dropbox/nothing.dropbox/a.txt",
    )
    .with_body("x");
    assert_eq!(bridge.handle(orphan).await.status, StatusCode::CONFLICT);
}
