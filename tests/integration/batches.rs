//! Simple and CRUD batch POSTs through the bridge.

use crate::common::{
    CALENDAR, bridge, bridge_with_authorizer, bridge_with_config, calendar_key, event, get, hrefs,
    put_event, response_count,
};
use dav_store_bridge::acl::{Authorizer, Privilege, StaticAuthorizer};
use dav_store_bridge::protocol::header;
use dav_store_bridge::storage::Store;
use dav_store_bridge::{BridgeConfig, DavMethod, DavRequest};
use http::StatusCode;

/// Denies exactly one privilege everywhere, without aggregate expansion.
struct DenyOnly(Privilege);

impl Authorizer for DenyOnly {
    fn allowed(&self, _principal: Option<&str>, _url: &str, privilege: Privilege) -> bool {
        privilege != self.0
    }
}

fn simple_batch(body: String) -> DavRequest {
    DavRequest::new(DavMethod::Post, CALENDAR)
        .with_header(header::CONTENT_TYPE, "text/calendar")
        .with_body(body)
}

fn multiput(resources: &[String]) -> DavRequest {
    let body = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<M:multiput xmlns:M="http://me.com/_namespace/" xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">{}</M:multiput>"#,
        resources.concat()
    );
    DavRequest::new(DavMethod::Post, CALENDAR)
        .with_header(header::CONTENT_TYPE, "text/xml")
        .with_body(body)
}

fn create(data: &str) -> String {
    format!("<M:resource><D:set><D:prop><C:calendar-data>{data}</C:calendar-data></D:prop></D:set></M:resource>")
}

fn update(href: &str, data: &str, etag: &str) -> String {
    format!(
        "<M:resource><D:href>{href}</D:href><D:set><D:prop><C:calendar-data>{data}</C:calendar-data></D:prop></D:set><M:if-match><D:getetag>{etag}</D:getetag></M:if-match></M:resource>"
    )
}

fn delete(href: &str) -> String {
    format!("<M:resource><D:href>{href}</D:href><M:delete/></M:resource>")
}

#[tokio::test]
async fn test_simple_batch_creates_every_item() {
    let bridge = bridge().await;
    let body = format!("{}{}{}", event("a"), event("b"), event("c"));

    let response = bridge.handle(simple_batch(body)).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(response_count(&response), 3);
    assert!(response.header(header::CTAG).is_some());

    let names = bridge.store().list_objects(&calendar_key()).await.unwrap();
    assert_eq!(names.len(), 3);
    for href in hrefs(&response) {
        assert!(href.starts_with(CALENDAR));
        assert_eq!(get(&bridge, &href).await.status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_simple_batch_isolates_bad_items() {
    let bridge = bridge().await;
    let broken = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:no uid\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
    let body = format!("{}{}{}", event("a"), broken, event("c"));

    let response = bridge.handle(simple_batch(body)).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(response_count(&response), 3);

    let names = bridge.store().list_objects(&calendar_key()).await.unwrap();
    assert_eq!(names.len(), 2);
}

#[tokio::test]
async fn test_batch_limits() {
    let config = BridgeConfig {
        max_simple_batch_resources: 2,
        ..BridgeConfig::default()
    };
    let bridge = bridge_with_config(config).await;
    let body = format!("{}{}{}", event("a"), event("b"), event("c"));
    let response = bridge.handle(simple_batch(body)).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(bridge.store().list_objects(&calendar_key()).await.unwrap().is_empty());

    let disabled = bridge_with_config(BridgeConfig {
        enable_batch_upload: false,
        ..BridgeConfig::default()
    })
    .await;
    let response = disabled.handle(simple_batch(event("a"))).await;
    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_crud_batch_reports_in_request_order() {
    let bridge = bridge().await;
    let first = put_event(&bridge, "a.ics", event("a")).await;
    let etag = first.header(header::ETAG).unwrap().to_string();
    put_event(&bridge, "b.ics", event("b")).await;

    let a_url = format!("{CALENDAR}a.ics");
    let b_url = format!("{CALENDAR}b.ics");
    let changed = event("a").replace("SUMMARY:a", "SUMMARY:changed");
    let request = multiput(&[
        create(&event("c")),
        update(&a_url, &changed, &etag),
        delete(&b_url),
    ]);

    let response = bridge.handle(request).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    let hrefs = hrefs(&response);
    assert_eq!(hrefs.len(), 3);
    assert!(hrefs[0].starts_with(CALENDAR));
    assert_eq!(hrefs[1], a_url);
    assert_eq!(hrefs[2], b_url);

    assert!(get(&bridge, &a_url).await.body_text().contains("SUMMARY:changed"));
    assert_eq!(get(&bridge, &b_url).await.status, StatusCode::NOT_FOUND);
    assert_eq!(get(&bridge, &hrefs[0]).await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_crud_update_with_stale_etag_fails_alone() {
    let bridge = bridge().await;
    put_event(&bridge, "a.ics", event("a")).await;
    let a_url = format!("{CALENDAR}a.ics");
    let changed = event("a").replace("SUMMARY:a", "SUMMARY:changed");

    let response = bridge
        .handle(multiput(&[update(&a_url, &changed, "\"stale\""), create(&event("d"))]))
        .await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert!(response.body_text().contains("HTTP/1.1 412"));
    assert!(get(&bridge, &a_url).await.body_text().contains("SUMMARY:a"));
    assert_eq!(bridge.store().list_objects(&calendar_key()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_crud_batch_rejects_malformed_documents() {
    let bridge = bridge().await;
    let request = DavRequest::new(DavMethod::Post, CALENDAR)
        .with_header(header::CONTENT_TYPE, "text/xml")
        .with_body(r#"<D:prop xmlns:D="DAV:"/>"#);
    assert_eq!(bridge.handle(request).await.status, StatusCode::BAD_REQUEST);

    let request = DavRequest::new(DavMethod::Post, CALENDAR)
        .with_header(header::CONTENT_TYPE, "application/json")
        .with_body("{}");
    assert_eq!(
        bridge.handle(request).await.status,
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    );
}

#[tokio::test]
async fn test_crud_batch_needs_write_on_the_collection() {
    let bridge = bridge_with_authorizer(StaticAuthorizer::new().deny_all(CALENDAR, Privilege::Write)).await;
    let response = bridge.handle(multiput(&[create(&event("c"))])).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(response.body_text().contains("need-privileges"));
    assert!(bridge.store().list_objects(&calendar_key()).await.unwrap().is_empty());

    let bridge = bridge_with_authorizer(StaticAuthorizer::new().deny_all(CALENDAR, Privilege::Unbind)).await;
    let response = bridge.handle(multiput(&[delete(&format!("{CALENDAR}a.ics"))])).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_crud_delete_without_unbind_fails_every_item() {
    let bridge = bridge_with_authorizer(DenyOnly(Privilege::Unbind)).await;
    put_event(&bridge, "a.ics", event("a")).await;
    let a_url = format!("{CALENDAR}a.ics");
    let missing_url = format!("{CALENDAR}missing.ics");

    let response = bridge
        .handle(multiput(&[delete(&a_url), delete(&missing_url)]))
        .await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(hrefs(&response), vec![a_url.clone(), missing_url]);
    let text = response.body_text();
    assert_eq!(text.matches("HTTP/1.1 403").count(), 2);
    assert_eq!(text.matches("<D:need-privileges/>").count(), 2);
    assert!(!text.contains("HTTP/1.1 404"));
    assert_eq!(get(&bridge, &a_url).await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_crud_create_without_bind_fails_every_item() {
    let bridge = bridge_with_authorizer(DenyOnly(Privilege::Bind)).await;

    let response = bridge
        .handle(multiput(&[create(&event("c")), create(&event("d"))]))
        .await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(response_count(&response), 2);
    let text = response.body_text();
    assert_eq!(text.matches("HTTP/1.1 403").count(), 2);
    assert_eq!(text.matches("<D:need-privileges/>").count(), 2);
    assert!(bridge.store().list_objects(&calendar_key()).await.unwrap().is_empty());
}
