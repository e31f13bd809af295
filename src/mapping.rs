//! Translation of backend store failures into protocol errors.
//!
//! Each resource kind owns one or more exception maps. A map is a function that
//! matches a [`StoreError`] and names the [`Strategy`] used to build the client
//! response, or returns `None` when the failure is not one the resource expects.
//! Unmapped failures surface as a generic server error.
//!
//! Creates and updates use a different map from moves because a name collision
//! means different things in the two contexts.
//!
//! # Example Usage
//!
//! ```rust
//! use dav_store_bridge::config::BridgeConfig;
//! use dav_store_bridge::mapping::{ExceptionMapper, calendar_object};
//! use dav_store_bridge::storage::StoreError;
//! use http::StatusCode;
//!
//! let mapper = ExceptionMapper::new(&BridgeConfig::default());
//! let error = mapper.map(StoreError::LockTimeout, calendar_object);
//! assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
//!
//! let error = mapper.map(StoreError::internal("disk on fire"), calendar_object);
//! assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
//! ```

use crate::config::BridgeConfig;
use crate::error::{DavError, ErrorElement, precondition};
use crate::storage::StoreError;
use chrono::{Duration, Utc};
use http::StatusCode;
use log::warn;

/// How a mapped store failure is turned into a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// 403 with free text; `None` uses the store error's own message
    Forbidden(Option<&'static str>),
    /// 403 with a structured error body
    Precondition(ErrorElement),
    /// 403 with a structured error body chosen by the caller
    PreconditionAtCall,
    /// 503 with `Retry-After` set to now plus the configured retry window
    Unavailable(&'static str),
    /// The given status and nothing else
    StatusOnly(StatusCode),
}

/// An exception map.
pub type ErrorMap = fn(&StoreError) -> Option<Strategy>;

const LOCK_TIMED_OUT: &str = "Lock timed out.";
const CROSS_POD_FAILED: &str = "Cross-pod request failed.";

/// Map for calendar and address-book collections.
pub fn collection(err: &StoreError) -> Option<Strategy> {
    match err {
        StoreError::LockTimeout => Some(Strategy::Unavailable(LOCK_TIMED_OUT)),
        StoreError::AlreadyInTrash => Some(Strategy::Precondition(precondition::NOT_IN_TRASH)),
        StoreError::FailedCrossPodRequest => Some(Strategy::Unavailable(CROSS_POD_FAILED)),
        _ => None,
    }
}

/// Map for creating and updating calendar objects.
pub fn calendar_object(err: &StoreError) -> Option<Strategy> {
    use precondition::*;
    let element = match err {
        StoreError::ObjectNameNotAllowed { .. } | StoreError::ObjectNameAlreadyExists { .. } => {
            return Some(Strategy::Forbidden(None));
        }
        StoreError::LockTimeout => return Some(Strategy::Unavailable(LOCK_TIMED_OUT)),
        StoreError::FailedCrossPodRequest => return Some(Strategy::Unavailable(CROSS_POD_FAILED)),
        StoreError::TooManyObjectResources => MAX_RESOURCES,
        StoreError::ObjectTooBig => CALDAV_MAX_RESOURCE_SIZE,
        StoreError::InvalidObjectResource { .. }
        | StoreError::InvalidPerUserDataMerge
        | StoreError::InvalidOverriddenInstance => VALID_CALENDAR_DATA,
        StoreError::InvalidComponentForStore { .. } => VALID_CALENDAR_OBJECT_RESOURCE,
        StoreError::InvalidComponentType { .. } => SUPPORTED_CALENDAR_COMPONENT,
        StoreError::TooManyAttendees => MAX_ATTENDEES_PER_INSTANCE,
        StoreError::TooManyInstances => MAX_INSTANCES,
        StoreError::InvalidCalendarAccess => VALID_ACCESS_RESTRICTION,
        StoreError::ValidOrganizer => VALID_ORGANIZER,
        StoreError::UidExists { .. } | StoreError::InvalidUid => CALDAV_NO_UID_CONFLICT,
        StoreError::UidExistsElsewhere { .. } => UNIQUE_SCHEDULING_OBJECT_RESOURCE,
        StoreError::AttendeeAllowed => ATTENDEE_ALLOWED,
        StoreError::AttachmentStoreValidManagedId { .. } => VALID_MANAGED_ID,
        StoreError::ShareeAllowed => SHAREE_PRIVILEGE_NEEDED,
        StoreError::DuplicatePrivateComments => NO_DUPLICATE_PRIVATE_COMMENTS,
        StoreError::UnknownTimezone { .. } => VALID_TIMEZONE,
        StoreError::AlreadyInTrash => NOT_IN_TRASH,
        _ => return None,
    };
    Some(Strategy::Precondition(element))
}

/// Map for moving calendar objects between calendars.
pub fn calendar_object_move(err: &StoreError) -> Option<Strategy> {
    match err {
        StoreError::ObjectNameNotAllowed { .. } | StoreError::ObjectNameAlreadyExists { .. } => {
            Some(Strategy::Forbidden(None))
        }
        StoreError::TooManyObjectResources => Some(Strategy::Precondition(precondition::MAX_RESOURCES)),
        StoreError::InvalidResourceMove => Some(Strategy::Precondition(precondition::VALID_MOVE)),
        StoreError::InvalidComponentType { .. } => {
            Some(Strategy::Precondition(precondition::SUPPORTED_CALENDAR_COMPONENT))
        }
        StoreError::LockTimeout => Some(Strategy::Unavailable(LOCK_TIMED_OUT)),
        _ => None,
    }
}

/// Failures whose element depends on the attachment action being performed.
pub fn attachment_action(err: &StoreError) -> Option<Strategy> {
    match err {
        StoreError::AttachmentStoreFailed | StoreError::InvalidAttachmentOperation { .. } => {
            Some(Strategy::PreconditionAtCall)
        }
        _ => None,
    }
}

/// Managed attachment failures with a fixed element.
pub fn attachment(err: &StoreError) -> Option<Strategy> {
    match err {
        StoreError::AttachmentStoreValidManagedId { .. } => {
            Some(Strategy::Precondition(precondition::VALID_MANAGED_ID_PARAMETER))
        }
        StoreError::AttachmentRemoveFailed => {
            Some(Strategy::Precondition(precondition::VALID_ATTACHMENT_REMOVE))
        }
        _ => None,
    }
}

/// Map for creating and updating address-book objects.
pub fn addressbook_object(err: &StoreError) -> Option<Strategy> {
    use precondition::*;
    let element = match err {
        StoreError::ObjectNameNotAllowed { .. } | StoreError::ObjectNameAlreadyExists { .. } => {
            return Some(Strategy::Forbidden(None));
        }
        StoreError::LockTimeout => return Some(Strategy::Unavailable(LOCK_TIMED_OUT)),
        StoreError::FailedCrossPodRequest => return Some(Strategy::Unavailable(CROSS_POD_FAILED)),
        StoreError::KindChangeNotAllowed => {
            return Some(Strategy::Forbidden(Some("vCard kind may not be changed")));
        }
        StoreError::GroupWithUnsharedAddressNotAllowed { .. } => {
            return Some(Strategy::Forbidden(Some(
                "Sharee cannot add unshared group members",
            )));
        }
        StoreError::TooManyObjectResources => MAX_RESOURCES,
        StoreError::ObjectTooBig => CARDDAV_MAX_RESOURCE_SIZE,
        StoreError::InvalidObjectResource { .. } | StoreError::InvalidPerUserDataMerge => {
            VALID_ADDRESS_DATA
        }
        StoreError::InvalidComponentForStore { .. } => VALID_ADDRESSBOOK_OBJECT_RESOURCE,
        StoreError::UidExists { .. } | StoreError::InvalidUid => CARDDAV_NO_UID_CONFLICT,
        _ => return None,
    };
    Some(Strategy::Precondition(element))
}

/// Map for moving address-book objects.
pub fn addressbook_object_move(err: &StoreError) -> Option<Strategy> {
    match err {
        StoreError::ObjectNameNotAllowed { .. } | StoreError::ObjectNameAlreadyExists { .. } => {
            Some(Strategy::Forbidden(None))
        }
        StoreError::TooManyObjectResources => Some(Strategy::Precondition(precondition::MAX_RESOURCES)),
        StoreError::InvalidResourceMove => Some(Strategy::Precondition(precondition::VALID_MOVE)),
        StoreError::LockTimeout => Some(Strategy::Unavailable(LOCK_TIMED_OUT)),
        _ => None,
    }
}

/// Map for sharing notifications.
pub fn notification(err: &StoreError) -> Option<Strategy> {
    match err {
        StoreError::ConcurrentModification | StoreError::NoSuchObject { .. } => {
            Some(Strategy::StatusOnly(StatusCode::NOT_FOUND))
        }
        _ => None,
    }
}

/// Applies exception maps using the configured retry window and limits.
#[derive(Debug, Clone)]
pub struct ExceptionMapper {
    retry_window: Duration,
    max_attendees_per_instance: Option<usize>,
    max_allowed_instances: Option<usize>,
}

impl ExceptionMapper {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            retry_window: Duration::seconds(config.transaction_retry_seconds as i64),
            max_attendees_per_instance: config.max_attendees_per_instance,
            max_allowed_instances: config.max_allowed_instances,
        }
    }

    /// Translate `err` with one map; unmapped failures become
    /// [`DavError::Internal`].
    pub fn map(&self, err: StoreError, map: ErrorMap) -> DavError {
        self.map_chain(err, &[map], None)
    }

    /// Try each map in order. `argument` is the element used by
    /// [`Strategy::PreconditionAtCall`].
    pub fn map_chain(
        &self,
        err: StoreError,
        maps: &[ErrorMap],
        argument: Option<ErrorElement>,
    ) -> DavError {
        match self.try_map(&err, maps, argument) {
            Some(mapped) => mapped,
            None => {
                warn!("Unmapped store failure: {}", err);
                DavError::from(err)
            }
        }
    }

    /// Like [`map_chain`](Self::map_chain) but returns `None` for unmapped
    /// failures so the caller can decide.
    pub fn try_map(
        &self,
        err: &StoreError,
        maps: &[ErrorMap],
        argument: Option<ErrorElement>,
    ) -> Option<DavError> {
        let strategy = maps.iter().find_map(|map| map(err))?;
        warn!("Store failure mapped to {:?}: {}", strategy, err);
        Some(self.apply(strategy, err, argument))
    }

    fn apply(&self, strategy: Strategy, err: &StoreError, argument: Option<ErrorElement>) -> DavError {
        match strategy {
            Strategy::Forbidden(message) => match message {
                Some(message) => DavError::forbidden(message),
                None => DavError::forbidden(err.to_string()),
            },
            Strategy::Precondition(element) => {
                DavError::precondition_with(self.with_limit(element), err.to_string())
            }
            Strategy::PreconditionAtCall => match argument {
                Some(element) => DavError::precondition_with(element, err.to_string()),
                None => DavError::forbidden(err.to_string()),
            },
            Strategy::Unavailable(message) => {
                DavError::unavailable(message, Utc::now() + self.retry_window)
            }
            Strategy::StatusOnly(status) => DavError::Status(status),
        }
    }

    /// Limit elements carry the configured limit as their text.
    fn with_limit(&self, element: ErrorElement) -> ErrorElement {
        let limit = if element == precondition::MAX_ATTENDEES_PER_INSTANCE {
            self.max_attendees_per_instance
        } else if element == precondition::MAX_INSTANCES {
            self.max_allowed_instances
        } else {
            None
        };
        match limit {
            Some(limit) => element.with_text(limit.to_string()),
            None => element,
        }
    }
}
