//! Builder for configuring [`Bridge`] instances.

use super::core::Bridge;
use crate::acl::{AllowAll, Authorizer, DelegationResolver, StaticDelegation};
use crate::component::{ComponentParser, TextComponentParser};
use crate::config::{BridgeConfig, ConfigError};
use crate::mapping::ExceptionMapper;
use crate::storage::Store;
use std::sync::Arc;

/// Builder for configuring and creating a [`Bridge`].
///
/// Starts from the default configuration, the line-oriented
/// [`TextComponentParser`], an authorizer that allows everything and a
/// delegation resolver with no entries.
///
/// # Examples
///
/// ```rust
/// use dav_store_bridge::BridgeBuilder;
/// use dav_store_bridge::acl::{Privilege, StaticAuthorizer};
/// use dav_store_bridge::config::BridgeConfig;
/// use dav_store_bridge::storage::InMemoryStore;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BridgeConfig {
///     enable_calendar_patch: true,
///     ..BridgeConfig::default()
/// };
/// let bridge = BridgeBuilder::new(InMemoryStore::new())
///     .with_config(config)
///     .with_authorizer(StaticAuthorizer::new().deny_all("/calendars/", Privilege::WriteAcl))
///     .build()?;
/// assert!(bridge.config().enable_calendar_patch);
/// # Ok(())
/// # }
/// ```
pub struct BridgeBuilder<S> {
    store: S,
    config: BridgeConfig,
    parser: Arc<dyn ComponentParser>,
    authorizer: Arc<dyn Authorizer>,
    delegation: Arc<dyn DelegationResolver>,
}

impl<S: Store> BridgeBuilder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: BridgeConfig::default(),
            parser: Arc::new(TextComponentParser),
            authorizer: Arc::new(AllowAll),
            delegation: Arc::new(StaticDelegation::new()),
        }
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the component parser, e.g. with a full iCalendar/vCard
    /// implementation.
    pub fn with_parser(mut self, parser: impl ComponentParser + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Privilege engine consulted before every mutation and read.
    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Resolver for `direct`-mode shares.
    pub fn with_delegation(mut self, delegation: impl DelegationResolver + 'static) -> Self {
        self.delegation = Arc::new(delegation);
        self
    }

    /// Validate the configuration and create the bridge.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a configured limit is unusable.
    pub fn build(self) -> Result<Bridge<S>, ConfigError> {
        self.config.validate()?;
        Ok(Bridge {
            store: self.store,
            mapper: ExceptionMapper::new(&self.config),
            config: self.config,
            parser: self.parser,
            authorizer: self.authorizer,
            delegation: self.delegation,
        })
    }
}
