//! Contact groups whose members arrive in the same batch.

use crate::common::{
    ADDRESS_BOOK, address_book_key, bridge, card, get, group, put_card, response_count,
};
use dav_store_bridge::protocol::header;
use dav_store_bridge::storage::Store;
use dav_store_bridge::{DavMethod, DavRequest};
use http::StatusCode;

fn card_batch(items: &[String]) -> DavRequest {
    DavRequest::new(DavMethod::Post, ADDRESS_BOOK)
        .with_header(header::CONTENT_TYPE, "text/vcard")
        .with_body(items.concat())
}

#[tokio::test]
async fn test_group_before_its_members() {
    let bridge = bridge().await;
    let request = card_batch(&[group("team", &["ann", "bob"]), card("ann"), card("bob")]);

    let response = bridge.handle(request).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(response_count(&response), 3);
    let body = response.body_text();
    let team = body.find("<CS:uid>team</CS:uid>").unwrap();
    let ann = body.find("<CS:uid>ann</CS:uid>").unwrap();
    assert!(team < ann);

    let names = bridge.store().list_objects(&address_book_key()).await.unwrap();
    assert_eq!(names.len(), 3);
}

#[tokio::test]
async fn test_groups_referencing_each_other() {
    let bridge = bridge().await;
    let request = card_batch(&[group("outer", &["inner"]), group("inner", &["outer"])]);

    let response = bridge.handle(request).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    let names = bridge.store().list_objects(&address_book_key()).await.unwrap();
    assert_eq!(names.len(), 2);
}

#[tokio::test]
async fn test_group_with_unknown_member_is_rejected() {
    let bridge = bridge().await;
    let request = card_batch(&[
        group("lonely", &["nobody"]),
        card("ann"),
        group("chained", &["lonely"]),
    ]);

    let response = bridge.handle(request).await;
    assert_eq!(response.status, StatusCode::MULTI_STATUS);
    assert_eq!(response_count(&response), 3);
    let names = bridge.store().list_objects(&address_book_key()).await.unwrap();
    assert_eq!(names.len(), 1);
}

#[tokio::test]
async fn test_group_of_existing_members_needs_no_batch() {
    let bridge = bridge().await;
    assert_eq!(put_card(&bridge, "ann.vcf", card("ann")).await.status, StatusCode::CREATED);
    let response = put_card(&bridge, "team.vcf", group("team", &["ann"])).await;
    assert_eq!(response.status, StatusCode::CREATED);

    let response = get(&bridge, format!("{ADDRESS_BOOK}team.vcf")).await;
    assert!(response.body_text().contains("urn:uuid:ann"));
}
