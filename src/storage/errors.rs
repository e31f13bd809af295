//! Tagged failures returned by the backend store.
//!
//! The backend never panics or throws; every failure is one of these variants.
//! The bridge decides what each variant means for a given resource kind and
//! operation (see [`crate::mapping`]), so the variants describe what went wrong
//! in store terms only.

use std::collections::BTreeSet;

/// Errors returned by [`Store`](super::Store) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The addressed object does not exist (or no longer exists).
    #[error("No such object: {name}")]
    NoSuchObject { name: String },

    #[error("Object resource name not allowed: {name}")]
    ObjectNameNotAllowed { name: String },

    #[error("Object resource name already exists: {name}")]
    ObjectNameAlreadyExists { name: String },

    /// A collection (or an unaccepted share) already occupies the name.
    #[error("Home child name already exists: {name}")]
    HomeChildNameAlreadyExists { name: String },

    #[error("Too many object resources in collection")]
    TooManyObjectResources,

    #[error("Object resource too big")]
    ObjectTooBig,

    #[error("Invalid object resource: {message}")]
    InvalidObjectResource { message: String },

    #[error("Invalid component for store: {message}")]
    InvalidComponentForStore { message: String },

    #[error("Component type not supported by collection: {component}")]
    InvalidComponentType { component: String },

    #[error("Too many attendees")]
    TooManyAttendees,

    #[error("Invalid calendar access restriction")]
    InvalidCalendarAccess,

    #[error("Organizer is not valid")]
    ValidOrganizer,

    #[error("UID already exists: {uid}")]
    UidExists { uid: String },

    #[error("UID may not change")]
    InvalidUid,

    #[error("UID exists in another calendar: {uid}")]
    UidExistsElsewhere { uid: String },

    #[error("Per-user data could not be merged")]
    InvalidPerUserDataMerge,

    #[error("Attendee not allowed")]
    AttendeeAllowed,

    #[error("Invalid overridden instance")]
    InvalidOverriddenInstance,

    #[error("Too many recurrence instances")]
    TooManyInstances,

    #[error("Sharee privilege needed")]
    ShareeAllowed,

    #[error("Duplicate private comments")]
    DuplicatePrivateComments,

    #[error("Unknown time zone: {tzid}")]
    UnknownTimezone { tzid: String },

    /// Resource lock could not be obtained before the store's timeout.
    #[error("Lock timed out")]
    LockTimeout,

    #[error("Resource is already in the trash")]
    AlreadyInTrash,

    /// A call to another node failed; only the failure signal is surfaced.
    #[error("Cross-pod request failed")]
    FailedCrossPodRequest,

    #[error("Invalid resource move")]
    InvalidResourceMove,

    #[error("Invalid split: {message}")]
    InvalidSplit { message: String },

    /// The object was deleted as a side effect of storing it (e.g. a
    /// scheduling cancel).
    #[error("Resource deleted by the store")]
    ResourceDeleted,

    #[error("Attachment store failed")]
    AttachmentStoreFailed,

    #[error("Invalid attachment operation: {message}")]
    InvalidAttachmentOperation { message: String },

    #[error("Invalid managed attachment id: {managed_id}")]
    AttachmentStoreValidManagedId { managed_id: String },

    #[error("Attachment remove failed")]
    AttachmentRemoveFailed,

    #[error("Attachment size too large")]
    AttachmentSizeTooLarge,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Dropbox attachments not allowed on managed attachment resources")]
    AttachmentDropboxNotAllowed,

    #[error("vCard kind may not be changed")]
    KindChangeNotAllowed,

    /// A group references members that are not visible to the writer; the
    /// missing member UIDs are carried so a batch can retry after co-adding.
    #[error("Group references members that are not visible: {missing:?}")]
    GroupWithUnsharedAddressNotAllowed { missing: BTreeSet<String> },

    #[error("Concurrent modification")]
    ConcurrentModification,

    #[error("Property cannot be changed: {name}")]
    PropertyChangeNotAllowed { name: String },

    #[error("Invalid patch data: {message}")]
    InvalidPatchData { message: String },

    #[error("Patch could not be applied: {message}")]
    InvalidPatchApply { message: String },

    #[error("Storage I/O failure: {message}")]
    Io { message: String },

    #[error("Store failure: {message}")]
    Internal { message: String },
}

impl StoreError {
    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal {
            message: message.into(),
        }
    }

    pub fn no_such_object(name: impl Into<String>) -> Self {
        StoreError::NoSuchObject { name: name.into() }
    }

    /// Lock contention and federated failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout | StoreError::FailedCrossPodRequest
        )
    }
}
