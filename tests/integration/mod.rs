//! End-to-end request flows.

pub mod attachments;
pub mod batches;
pub mod groups;
pub mod move_delete;
pub mod properties;
pub mod scheduling;
