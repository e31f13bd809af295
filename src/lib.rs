//! CalDAV/CardDAV resource bridge for Rust.
//!
//! Maps protocol-level resources (calendar and address book homes,
//! collections, object resources, attachments and notifications) onto a
//! transactional backend store. The bridge owns request semantics:
//! preconditions, access checks, batch editing, sharing-aware deletion and
//! the translation of store failures into protocol errors.
//!
//! # Core Components
//!
//! - [`Bridge`] - Entry point translating one [`DavRequest`] into a [`DavResponse`]
//! - [`storage::Store`] - Trait implemented by backend stores
//! - [`resource`] - Collection, object and notification resources
//! - [`batch`] - Simple, CRUD and contact-group batch editing
//! - [`attachment`] - Managed and legacy dropbox attachments
//!
//! # Quick Start
//!
//! ```rust
//! use dav_store_bridge::{Bridge, DavMethod, DavRequest};
//! use dav_store_bridge::protocol::header;
//! use dav_store_bridge::storage::InMemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = Bridge::new(InMemoryStore::new())?;
//!
//! let calendar = "/calendars/__uids__/alice/work/";
//! let response = bridge.handle(DavRequest::new(DavMethod::Mkcalendar, calendar)).await;
//! assert_eq!(response.status.as_u16(), 201);
//!
//! let event = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:standup\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
//! let put = DavRequest::new(DavMethod::Put, format!("{calendar}standup.ics"))
//!     .with_header(header::CONTENT_TYPE, "text/calendar")
//!     .with_body(event);
//! let response = bridge.handle(put).await;
//! assert_eq!(response.status.as_u16(), 201);
//! assert!(response.header(header::ETAG).is_some());
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod attachment;
pub mod batch;
pub mod bridge;
pub mod component;
pub mod config;
pub mod error;
pub mod mapping;
pub mod move_delete;
pub mod multistatus;
pub mod precondition;
pub mod protocol;
pub mod resource;
pub mod storage;
pub mod xml;

// Re-export commonly used types for convenience
pub use bridge::{Bridge, BridgeBuilder};
pub use config::BridgeConfig;
pub use error::{DavError, DavResult};
pub use protocol::{DavMethod, DavRequest, DavResponse};
pub use storage::{InMemoryStore, Store, StoreError};
