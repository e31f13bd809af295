//! Bridge configuration.
//!
//! [`BridgeConfig`] gathers the feature switches and limits consulted while
//! translating requests. Hosts usually hold a process-wide configuration
//! document already; [`BridgeConfig::from_json`] accepts the relevant subset of
//! it, and every field has a default so partial documents work.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime switches and limits for the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeConfig {
    /// Window added to "now" for the `Retry-After` header on retryable failures.
    pub transaction_retry_seconds: u64,

    /// Treat `If-Match` writes on scheduling objects as smart merges and accept
    /// any historical schedule entity tag.
    pub schedule_tag_compatibility: bool,

    /// Allow PATCH on calendar object resources.
    pub enable_calendar_patch: bool,

    /// Allow the managed attachment POST actions.
    pub enable_managed_attachments: bool,

    /// Attendees get write access to an item's dropbox, not just read.
    pub attendees_can_manage_attachments: bool,

    /// Accept simple and CRUD batch POSTs on collections.
    pub enable_batch_upload: bool,

    /// Advertised `max-resources` limit for a collection.
    pub max_resources_per_collection: Option<usize>,

    pub max_simple_batch_resources: usize,
    pub max_simple_batch_bytes: usize,
    pub max_crud_batch_resources: usize,
    pub max_crud_batch_bytes: usize,

    /// Calendars may only hold a single component type (VEVENT or VTODO).
    pub restrict_calendars_to_one_component_type: bool,

    /// Expand ACLs with calendar-proxy-read/write principals.
    pub enable_proxy_principals: bool,

    /// Limit reported in `max-attendees-per-instance` errors.
    pub max_attendees_per_instance: Option<usize>,

    /// Limit reported in `max-instances` errors.
    pub max_allowed_instances: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transaction_retry_seconds: 300,
            schedule_tag_compatibility: true,
            enable_calendar_patch: false,
            enable_managed_attachments: true,
            attendees_can_manage_attachments: false,
            enable_batch_upload: true,
            max_resources_per_collection: None,
            max_simple_batch_resources: 100,
            max_simple_batch_bytes: 10 * 1024 * 1024,
            max_crud_batch_resources: 100,
            max_crud_batch_bytes: 10 * 1024 * 1024,
            restrict_calendars_to_one_component_type: true,
            enable_proxy_principals: true,
            max_attendees_per_instance: Some(100),
            max_allowed_instances: Some(3000),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl BridgeConfig {
    /// Parse configuration from a JSON document and validate it.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that limits are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_batch_upload {
            for (field, value) in [
                ("max-simple-batch-resources", self.max_simple_batch_resources),
                ("max-crud-batch-resources", self.max_crud_batch_resources),
                ("max-simple-batch-bytes", self.max_simple_batch_bytes),
                ("max-crud-batch-bytes", self.max_crud_batch_bytes),
            ] {
                if value == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: field.to_string(),
                        message: "must be greater than zero when batch upload is enabled"
                            .to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The retry window as a duration.
    pub fn retry_window(&self) -> Duration {
        Duration::from_secs(self.transaction_retry_seconds)
    }
}
