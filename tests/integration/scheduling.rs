//! Schedule-tag preconditions on scheduling objects.

use crate::common::{
    CALENDAR, bridge, bridge_with_config, calendar_key, event, get, put, put_event, scheduled_event,
};
use dav_store_bridge::BridgeConfig;
use dav_store_bridge::protocol::header;
use http::StatusCode;

#[tokio::test]
async fn test_scheduling_objects_carry_a_schedule_tag() {
    let bridge = bridge().await;
    let response = put_event(&bridge, "s.ics", scheduled_event("s1")).await;
    assert_eq!(response.status, StatusCode::CREATED);

    let response = get(&bridge, format!("{CALENDAR}s.ics")).await;
    assert!(response.header(header::SCHEDULE_TAG).is_some());

    put_event(&bridge, "plain.ics", event("p1")).await;
    let response = get(&bridge, format!("{CALENDAR}plain.ics")).await;
    assert!(response.header(header::SCHEDULE_TAG).is_none());
}

#[tokio::test]
async fn test_if_schedule_tag_match() {
    let bridge = bridge().await;
    put_event(&bridge, "s.ics", scheduled_event("s1")).await;
    let url = format!("{CALENDAR}s.ics");
    let tag = get(&bridge, &url)
        .await
        .header(header::SCHEDULE_TAG)
        .unwrap()
        .to_string();

    let stale = put(&url, "text/calendar", scheduled_event("s1"))
        .with_header(header::IF_SCHEDULE_TAG_MATCH, "\"stale\"");
    assert_eq!(bridge.handle(stale).await.status, StatusCode::PRECONDITION_FAILED);

    let current = put(&url, "text/calendar", scheduled_event("s1"))
        .with_header(header::IF_SCHEDULE_TAG_MATCH, &tag);
    assert!(bridge.handle(current).await.status.is_success());
}

#[tokio::test]
async fn test_stale_schedule_tag_with_representation() {
    let bridge = bridge().await;
    put_event(&bridge, "s.ics", scheduled_event("s1")).await;
    let url = format!("{CALENDAR}s.ics");

    let request = put(&url, "text/calendar", scheduled_event("s1"))
        .with_header(header::IF_SCHEDULE_TAG_MATCH, "\"stale\"")
        .with_header(header::PREFER, "return=representation");
    let response = bridge.handle(request).await;
    assert_eq!(response.status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(response.header(header::CONTENT_LOCATION), Some(url.as_str()));
    assert!(response.body_text().contains("UID:s1"));
}

#[tokio::test]
async fn test_stale_etag_on_scheduling_object() {
    let bridge = bridge_with_config(BridgeConfig {
        schedule_tag_compatibility: false,
        ..BridgeConfig::default()
    })
    .await;
    put_event(&bridge, "s.ics", scheduled_event("s1")).await;
    let url = format!("{CALENDAR}s.ics");

    let request = put(&url, "text/calendar", scheduled_event("s1"))
        .with_header(header::IF_MATCH, "\"stale\"");
    assert_eq!(bridge.handle(request).await.status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_etag_from_before_a_scheduling_update() {
    for (compatibility, expected_success) in [(true, true), (false, false)] {
        let bridge = bridge_with_config(BridgeConfig {
            schedule_tag_compatibility: compatibility,
            ..BridgeConfig::default()
        })
        .await;
        put_event(&bridge, "s.ics", scheduled_event("s1")).await;
        let url = format!("{CALENDAR}s.ics");
        let before = get(&bridge, &url)
            .await
            .header(header::ETAG)
            .unwrap()
            .to_string();

        let rescheduled = scheduled_event("s1").replace("ORGANIZER", "SUMMARY:moved\r\nORGANIZER");
        bridge
            .store()
            .apply_scheduling_update(&calendar_key().object("s.ics"), &rescheduled)
            .await
            .unwrap();
        let after = get(&bridge, &url).await;
        assert_ne!(after.header(header::ETAG), Some(before.as_str()));
        assert!(after.body_text().contains("SUMMARY:moved"));

        let request = put(&url, "text/calendar", scheduled_event("s1")).with_header(header::IF_MATCH, &before);
        let status = bridge.handle(request).await.status;
        if expected_success {
            assert!(status.is_success(), "compatibility on gave {status}");
        } else {
            assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        }
    }
}
