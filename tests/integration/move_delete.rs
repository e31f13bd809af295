//! DELETE and MOVE of collections and objects.

use crate::common::{
    ADDRESS_BOOK, CALENDAR, bridge, calendar_key, card, event, get, hrefs, put_card, put_event,
};
use dav_store_bridge::protocol::header;
use dav_store_bridge::storage::{CollectionKey, Store, StoreKind};
use dav_store_bridge::{DavMethod, DavRequest};
use http::StatusCode;

fn moving(from: impl AsRef<str>, to: impl AsRef<str>) -> DavRequest {
    DavRequest::new(DavMethod::Move, from).with_header(header::DESTINATION, to)
}

#[tokio::test]
async fn test_delete_collection_cascades() {
    let bridge = bridge().await;
    put_event(&bridge, "a.ics", event("a")).await;
    put_event(&bridge, "b.ics", event("b")).await;

    let response = bridge.handle(DavRequest::new(DavMethod::Delete, CALENDAR)).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(bridge.store().collection(&calendar_key()).await.unwrap().is_none());
    assert_eq!(get(&bridge, format!("{CALENDAR}a.ics")).await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_collection_reports_failed_children() {
    let bridge = bridge().await;
    put_event(&bridge, "a.ics", event("a")).await;
    put_event(&bridge, "b.ics", event("b")).await;
    let locked = format!("{CALENDAR}b.ics");
    bridge.store().fail_removal(&locked).await;

    let response = bridge.handle(DavRequest::new(DavMethod::Delete, CALENDAR)).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(hrefs(&response), vec![locked]);
}

#[tokio::test]
async fn test_delete_collection_depth() {
    let bridge = bridge().await;
    let shallow = DavRequest::new(DavMethod::Delete, CALENDAR).with_header(header::DEPTH, "0");
    assert_eq!(bridge.handle(shallow).await.status, StatusCode::BAD_REQUEST);

    let deep = DavRequest::new(DavMethod::Delete, CALENDAR).with_header(header::DEPTH, "infinity");
    assert_eq!(bridge.handle(deep).await.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_delete_object_with_stale_etag() {
    let bridge = bridge().await;
    put_event(&bridge, "a.ics", event("a")).await;
    let url = format!("{CALENDAR}a.ics");

    let stale = DavRequest::new(DavMethod::Delete, &url).with_header(header::IF_MATCH, "\"stale\"");
    assert_eq!(bridge.handle(stale).await.status, StatusCode::PRECONDITION_FAILED);

    let response = bridge.handle(DavRequest::new(DavMethod::Delete, &url)).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    let response = bridge.handle(DavRequest::new(DavMethod::Delete, &url)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rename_calendar() {
    let bridge = bridge().await;
    put_event(&bridge, "a.ics", event("a")).await;
    let renamed = "/calendars/__uids__/alice/renamed/";

    let response = bridge.handle(moving(CALENDAR, renamed)).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(get(&bridge, format!("{renamed}a.ics")).await.status, StatusCode::OK);
    assert_eq!(get(&bridge, CALENDAR).await.status, StatusCode::NOT_FOUND);

    let elsewhere = moving(renamed, "/calendars/__uids__/bob/renamed/");
    assert_eq!(bridge.handle(elsewhere).await.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_address_books_cannot_be_renamed() {
    let bridge = bridge().await;
    put_card(&bridge, "ann.vcf", card("ann")).await;
    let response = bridge
        .handle(moving(ADDRESS_BOOK, "/addressbooks/__uids__/alice/people/"))
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(get(&bridge, format!("{ADDRESS_BOOK}ann.vcf")).await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_move_object_overwrite_rules() {
    let bridge = bridge().await;
    let home = CollectionKey::new(StoreKind::Calendar, "alice", "home");
    bridge.store().create_collection(&home, None).await.unwrap();
    put_event(&bridge, "a.ics", event("a")).await;
    put_event(&bridge, "b.ics", event("b")).await;
    let source = format!("{CALENDAR}a.ics");

    let onto_existing = moving(&source, format!("{CALENDAR}b.ics"));
    assert_eq!(bridge.handle(onto_existing).await.status, StatusCode::FORBIDDEN);
    let no_overwrite = moving(&source, format!("{CALENDAR}b.ics")).with_header(header::OVERWRITE, "F");
    assert_eq!(
        bridge.handle(no_overwrite).await.status,
        StatusCode::PRECONDITION_FAILED
    );

    let destination = home.object("a.ics").url();
    let response = bridge.handle(moving(&source, &destination)).await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.header(header::LOCATION), Some(destination.as_str()));
    assert_eq!(get(&bridge, &source).await.status, StatusCode::NOT_FOUND);
    assert!(get(&bridge, &destination).await.body_text().contains("UID:a"));
}

#[tokio::test]
async fn test_move_object_needs_destination() {
    let bridge = bridge().await;
    put_event(&bridge, "a.ics", event("a")).await;
    let response = bridge
        .handle(DavRequest::new(DavMethod::Move, format!("{CALENDAR}a.ics")))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let missing_parent = moving(
        format!("{CALENDAR}a.ics"),
        "/calendars/__uids__/alice/nowhere/a.ics",
    );
    assert_eq!(bridge.handle(missing_parent).await.status, StatusCode::FORBIDDEN);
}
