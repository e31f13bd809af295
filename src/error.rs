//! Protocol error types for the DAV store bridge.
//!
//! Every failure that reaches a client is a [`DavError`]. Backend failures arrive
//! as [`StoreError`](crate::storage::StoreError) values and are translated by the
//! exception maps in [`crate::mapping`]; anything the maps do not recognise becomes
//! [`DavError::Internal`].
//!
//! Structured failures carry an [`ErrorElement`], the qualified name of the
//! violated precondition, rendered as a `DAV:error` body.

use crate::protocol::{DavResponse, header};
use chrono::{DateTime, Utc};
use http::StatusCode;
use std::fmt;

/// XML namespaces used in error bodies and multistatus documents.
pub mod ns {
    pub const DAV: &str = "DAV:";
    pub const CALDAV: &str = "urn:ietf:params:xml:ns:caldav";
    pub const CARDDAV: &str = "urn:ietf:params:xml:ns:carddav";
    pub const CALENDARSERVER: &str = "http://calendarserver.org/ns/";
    pub const MOBILEME: &str = "http://me.com/_namespace/";
}

/// Qualified name of a protocol precondition, optionally with text content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorElement {
    pub namespace: &'static str,
    pub name: &'static str,
    pub text: Option<String>,
}

impl ErrorElement {
    pub const fn new(namespace: &'static str, name: &'static str) -> Self {
        Self {
            namespace,
            name,
            text: None,
        }
    }

    /// Attach text content, e.g. the configured limit for `max-instances`.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

impl fmt::Display for ErrorElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.name)
    }
}

/// Named preconditions referenced by the exception maps and resource handlers.
pub mod precondition {
    use super::{ErrorElement, ns};

    pub const VALID_CALENDAR_DATA: ErrorElement = ErrorElement::new(ns::CALDAV, "valid-calendar-data");
    pub const VALID_CALENDAR_OBJECT_RESOURCE: ErrorElement =
        ErrorElement::new(ns::CALDAV, "valid-calendar-object-resource");
    pub const SUPPORTED_CALENDAR_DATA: ErrorElement =
        ErrorElement::new(ns::CALDAV, "supported-calendar-data");
    pub const SUPPORTED_CALENDAR_COMPONENT: ErrorElement =
        ErrorElement::new(ns::CALDAV, "supported-calendar-component");
    pub const CALDAV_MAX_RESOURCE_SIZE: ErrorElement = ErrorElement::new(ns::CALDAV, "max-resource-size");
    pub const MAX_ATTENDEES_PER_INSTANCE: ErrorElement =
        ErrorElement::new(ns::CALDAV, "max-attendees-per-instance");
    pub const MAX_INSTANCES: ErrorElement = ErrorElement::new(ns::CALDAV, "max-instances");
    pub const CALDAV_NO_UID_CONFLICT: ErrorElement = ErrorElement::new(ns::CALDAV, "no-uid-conflict");
    pub const UNIQUE_SCHEDULING_OBJECT_RESOURCE: ErrorElement =
        ErrorElement::new(ns::CALDAV, "unique-scheduling-object-resource");
    pub const ATTENDEE_ALLOWED: ErrorElement = ErrorElement::new(ns::CALDAV, "attendee-allowed");
    pub const VALID_TIMEZONE: ErrorElement = ErrorElement::new(ns::CALDAV, "valid-timezone");
    pub const VALID_MANAGED_ID: ErrorElement = ErrorElement::new(ns::CALDAV, "valid-managed-id");
    pub const VALID_MANAGED_ID_PARAMETER: ErrorElement =
        ErrorElement::new(ns::CALDAV, "valid-managed-id-parameter");
    pub const VALID_RID_PARAMETER: ErrorElement = ErrorElement::new(ns::CALDAV, "valid-rid-parameter");
    pub const VALID_ACTION_PARAMETER: ErrorElement =
        ErrorElement::new(ns::CALDAV, "valid-action-parameter");
    pub const VALID_ATTACHMENT_ADD: ErrorElement = ErrorElement::new(ns::CALDAV, "valid-attachment-add");
    pub const VALID_ATTACHMENT_UPDATE: ErrorElement =
        ErrorElement::new(ns::CALDAV, "valid-attachment-update");
    pub const VALID_ATTACHMENT_REMOVE: ErrorElement =
        ErrorElement::new(ns::CALDAV, "valid-attachment-remove");
    pub const MAX_ATTACHMENT_SIZE: ErrorElement = ErrorElement::new(ns::CALDAV, "max-attachment-size");

    pub const VALID_ADDRESS_DATA: ErrorElement = ErrorElement::new(ns::CARDDAV, "valid-address-data");
    pub const VALID_ADDRESSBOOK_OBJECT_RESOURCE: ErrorElement =
        ErrorElement::new(ns::CARDDAV, "valid-addressbook-object-resource");
    pub const SUPPORTED_ADDRESS_DATA: ErrorElement =
        ErrorElement::new(ns::CARDDAV, "supported-address-data");
    pub const CARDDAV_MAX_RESOURCE_SIZE: ErrorElement =
        ErrorElement::new(ns::CARDDAV, "max-resource-size");
    pub const CARDDAV_NO_UID_CONFLICT: ErrorElement = ErrorElement::new(ns::CARDDAV, "no-uid-conflict");

    pub const MAX_RESOURCES: ErrorElement = ErrorElement::new(ns::CALENDARSERVER, "max-resources");
    pub const VALID_ACCESS_RESTRICTION: ErrorElement =
        ErrorElement::new(ns::CALENDARSERVER, "valid-access-restriction");
    pub const VALID_ORGANIZER: ErrorElement = ErrorElement::new(ns::CALENDARSERVER, "valid-organizer");
    pub const SHAREE_PRIVILEGE_NEEDED: ErrorElement =
        ErrorElement::new(ns::CALENDARSERVER, "sharee-privilege-needed");
    pub const NO_DUPLICATE_PRIVATE_COMMENTS: ErrorElement =
        ErrorElement::new(ns::CALENDARSERVER, "no-duplicate-private-comments");
    pub const NOT_IN_TRASH: ErrorElement = ErrorElement::new(ns::CALENDARSERVER, "not-in-trash");
    pub const VALID_MOVE: ErrorElement = ErrorElement::new(ns::CALENDARSERVER, "valid-move");
    pub const VALID_SPLIT: ErrorElement = ErrorElement::new(ns::CALENDARSERVER, "valid-split");

    pub const QUOTA_NOT_EXCEEDED: ErrorElement = ErrorElement::new(ns::DAV, "quota-not-exceeded");
    pub const NEED_PRIVILEGES: ErrorElement = ErrorElement::new(ns::DAV, "need-privileges");
}

/// Error returned by every bridge operation.
///
/// Each variant maps to exactly one HTTP status (see [`DavError::status`]),
/// except [`DavError::Precondition`] and [`DavError::Status`] which carry theirs.
#[derive(Debug, thiserror::Error)]
pub enum DavError {
    /// The targeted resource is not bound to a backend object
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Policy violation described by free text
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// A named precondition was violated
    #[error("Precondition {element} violated (status {status})")]
    Precondition {
        status: StatusCode,
        element: ErrorElement,
        message: Option<String>,
    },

    /// A conditional request header did not match
    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Lock contention or a failed federated call; the client may retry
    #[error("Service unavailable: {message} (retry after {retry_after})")]
    Unavailable {
        message: String,
        retry_after: DateTime<Utc>,
    },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Method not allowed: {message}")]
    MethodNotAllowed { message: String },

    #[error("Unsupported media type: {message}")]
    UnsupportedMediaType { message: String },

    #[error("Not acceptable: {message}")]
    NotAcceptable { message: String },

    #[error("Unprocessable entity: {message}")]
    Unprocessable { message: String },

    /// Bare status with no body
    #[error("HTTP status {0}")]
    Status(StatusCode),

    /// A store failure that no exception map recognised
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// A complete replacement response, e.g. a representation returned in
    /// place of a precondition failure
    #[error("Replacement response with status {}", .0.status)]
    Response(Box<DavResponse>),
}

/// Result type for bridge operations.
pub type DavResult<T> = Result<T, DavError>;

impl DavError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Forbidden with a structured error body.
    pub fn precondition(element: ErrorElement) -> Self {
        Self::Precondition {
            status: StatusCode::FORBIDDEN,
            element,
            message: None,
        }
    }

    /// Forbidden with a structured error body and a description.
    pub fn precondition_with(element: ErrorElement, message: impl Into<String>) -> Self {
        Self::Precondition {
            status: StatusCode::FORBIDDEN,
            element,
            message: Some(message.into()),
        }
    }

    /// Structured error body with a status other than 403.
    pub fn precondition_status(status: StatusCode, element: ErrorElement) -> Self {
        Self::Precondition {
            status,
            element,
            message: None,
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>, retry_after: DateTime<Utc>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retry_after,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::MethodNotAllowed {
            message: message.into(),
        }
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::UnsupportedMediaType {
            message: message.into(),
        }
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::NotAcceptable {
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::Unprocessable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The HTTP status this error renders with.
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::NotFound { .. } => StatusCode::NOT_FOUND,
            DavError::Forbidden { .. } => StatusCode::FORBIDDEN,
            DavError::Precondition { status, .. } => *status,
            DavError::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            DavError::Conflict { .. } => StatusCode::CONFLICT,
            DavError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DavError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            DavError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            DavError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::NotAcceptable { .. } => StatusCode::NOT_ACCEPTABLE,
            DavError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DavError::Status(status) => *status,
            DavError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::Response(response) => response.status,
        }
    }

    /// The structured precondition element, if this error carries one.
    pub fn element(&self) -> Option<&ErrorElement> {
        match self {
            DavError::Precondition { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn is_precondition_failed(&self) -> bool {
        self.status() == StatusCode::PRECONDITION_FAILED
    }

    /// Render the error as a protocol response.
    pub fn into_response(self) -> DavResponse {
        let status = self.status();
        match self {
            DavError::Response(response) => *response,
            DavError::Status(status) => DavResponse::new(status),
            DavError::Precondition {
                status,
                element,
                message,
            } => DavResponse::error_element(status, &element, message.as_deref()),
            DavError::Unavailable {
                message,
                retry_after,
            } => {
                let mut response = DavResponse::text(status, message);
                response.set_header(header::RETRY_AFTER, http_date(&retry_after));
                response
            }
            DavError::NotFound { message }
            | DavError::Forbidden { message }
            | DavError::PreconditionFailed { message }
            | DavError::Conflict { message }
            | DavError::BadRequest { message }
            | DavError::MethodNotAllowed { message }
            | DavError::UnsupportedMediaType { message }
            | DavError::NotAcceptable { message }
            | DavError::Unprocessable { message }
            | DavError::Internal { message } => DavResponse::text(status, message),
        }
    }
}

impl From<crate::storage::StoreError> for DavError {
    fn from(err: crate::storage::StoreError) -> Self {
        DavError::internal(err.to_string())
    }
}

/// Format an instant as an RFC 7231 HTTP-date.
pub fn http_date(instant: &DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
