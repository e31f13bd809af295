//! Shared helpers for the bridge integration tests.
//!
//! Everything here goes through [`Bridge::handle`] so the tests exercise
//! routing, dispatch and error rendering the way a host would.

use dav_store_bridge::acl::Authorizer;
use dav_store_bridge::protocol::header;
use dav_store_bridge::storage::{CollectionKey, InMemoryStore, Store, StoreKind};
use dav_store_bridge::{Bridge, BridgeBuilder, BridgeConfig, DavMethod, DavRequest, DavResponse};

pub const CALENDAR: &str = "/calendars/__uids__/alice/work/";
pub const ADDRESS_BOOK: &str = "/addressbooks/__uids__/alice/contacts/";

pub fn event(uid: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:20240101T100000Z\r\nSUMMARY:{uid}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
    )
}

/// An organizer-side event with an attendee, which the store treats as a
/// scheduling object.
pub fn scheduled_event(uid: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:20240101T100000Z\r\nORGANIZER:urn:x-uid:alice\r\nATTENDEE:urn:x-uid:bob\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
    )
}

pub fn card(uid: &str) -> String {
    format!("BEGIN:VCARD\r\nVERSION:3.0\r\nUID:{uid}\r\nFN:{uid}\r\nEND:VCARD\r\n")
}

pub fn group(uid: &str, members: &[&str]) -> String {
    let members: String = members
        .iter()
        .map(|member| format!("X-ADDRESSBOOKSERVER-MEMBER:urn:uuid:{member}\r\n"))
        .collect();
    format!(
        "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:{uid}\r\nFN:{uid}\r\nX-ADDRESSBOOKSERVER-KIND:group\r\n{members}END:VCARD\r\n"
    )
}

pub fn calendar_key() -> CollectionKey {
    CollectionKey::new(StoreKind::Calendar, "alice", "work")
}

pub fn address_book_key() -> CollectionKey {
    CollectionKey::new(StoreKind::AddressBook, "alice", "contacts")
}

/// Bridge over a store holding alice's `work` calendar and `contacts`
/// address book.
pub async fn bridge() -> Bridge<InMemoryStore> {
    bridge_with_config(BridgeConfig::default()).await
}

pub async fn bridge_with_config(config: BridgeConfig) -> Bridge<InMemoryStore> {
    BridgeBuilder::new(seeded_store().await)
        .with_config(config)
        .build()
        .expect("Failed to build bridge")
}

/// Same fixtures as [`bridge`], with access decided by `authorizer`.
pub async fn bridge_with_authorizer(authorizer: impl Authorizer + 'static) -> Bridge<InMemoryStore> {
    BridgeBuilder::new(seeded_store().await)
        .with_authorizer(authorizer)
        .build()
        .expect("Failed to build bridge")
}

async fn seeded_store() -> InMemoryStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = InMemoryStore::new();
    store
        .create_collection(&calendar_key(), None)
        .await
        .expect("Failed to create calendar");
    store
        .create_collection(&address_book_key(), None)
        .await
        .expect("Failed to create address book");
    store
}

pub fn put(url: impl AsRef<str>, content_type: &str, body: String) -> DavRequest {
    DavRequest::new(DavMethod::Put, url)
        .with_header(header::CONTENT_TYPE, content_type)
        .with_body(body)
}

pub async fn put_event(bridge: &Bridge<InMemoryStore>, name: &str, data: String) -> DavResponse {
    bridge
        .handle(put(format!("{CALENDAR}{name}"), "text/calendar", data))
        .await
}

pub async fn put_card(bridge: &Bridge<InMemoryStore>, name: &str, data: String) -> DavResponse {
    bridge
        .handle(put(format!("{ADDRESS_BOOK}{name}"), "text/vcard", data))
        .await
}

pub async fn get(bridge: &Bridge<InMemoryStore>, url: impl AsRef<str>) -> DavResponse {
    bridge.handle(DavRequest::new(DavMethod::Get, url)).await
}

/// Number of `D:response` elements in a multistatus body.
pub fn response_count(response: &DavResponse) -> usize {
    response.body_text().matches("<D:response>").count()
}

/// Href of every `D:response`, in document order.
pub fn hrefs(response: &DavResponse) -> Vec<String> {
    let body = response.body_text();
    body.split("<D:href>")
        .skip(1)
        .filter_map(|rest| rest.split("</D:href>").next())
        .map(str::to_string)
        .collect()
}
