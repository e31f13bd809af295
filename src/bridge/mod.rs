//! Request entry point of the bridge.
//!
//! A [`Bridge`] resolves the request path against the URL layout described
//! in [`routing`], binds the addressed resource to the store and runs the
//! handler for the request method.
//!
//! # Module Organization
//!
//! * [`core`] - the `Bridge` value, resource resolution and error rendering
//! * [`builder`] - configuration of collaborators before construction
//! * [`routing`] - request paths to resource addresses
//! * `dispatch` - method handlers for each resolved resource

pub mod builder;
pub mod core;
mod dispatch;
pub mod routing;

pub use builder::BridgeBuilder;
pub use core::Bridge;
pub use routing::{Route, route};
