//! Error types for ics-server.

use ics_core::changeset::ChangeSetError;
use ics_core::{DecodeError, EncodeError};
use ics_types::{ErrorCode, ReplicaGuid, WireError};

/// Main error type for ics-server operations.
#[derive(Debug, thiserror::Error)]
pub enum IcsError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed wire structure.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// Malformed or inconsistent change set.
    #[error("change set error: {0}")]
    ChangeSet(#[from] ChangeSetError),

    /// FastTransfer encoding failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// FastTransfer decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The handle is not open on this connection.
    #[error("invalid handle: {0}")]
    InvalidHandle(u32),

    /// The handle refers to the wrong kind of object.
    #[error("handle {handle} is not a {expected}")]
    WrongObjectType {
        /// The handle.
        handle: u32,
        /// Kind of object the operation needs.
        expected: &'static str,
    },

    /// A request argument is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A replica GUID has no local replica id.
    #[error("unknown replica: {0}")]
    UnknownReplica(ReplicaGuid),

    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not supported on this object.
    #[error("not supported: {0}")]
    NoSupport(&'static str),

    /// A state upload is already in progress.
    #[error("state upload already in progress")]
    UploadInProgress,

    /// Continue or End without a Begin.
    #[error("no state upload in progress")]
    NoUploadInProgress,

    /// The connection has too many open handles.
    #[error("handle limit reached: {limit}")]
    TooManyHandles {
        /// Configured limit.
        limit: usize,
    },

    /// The server has too many connections.
    #[error("connection limit reached: {limit}")]
    TooManyConnections {
        /// Configured limit.
        limit: usize,
    },

    /// The connection id is not registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(u64),
}

impl IcsError {
    /// MAPI status code reported for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            IcsError::Store(e) => e.error_code(),
            IcsError::Wire(_) | IcsError::Decode(_) | IcsError::InvalidParameter(_) => {
                ErrorCode::InvalidParameter
            }
            IcsError::ChangeSet(ChangeSetError::Regression { .. }) => ErrorCode::InvalidParameter,
            IcsError::ChangeSet(ChangeSetError::UnknownReplicaId(_))
            | IcsError::ChangeSet(ChangeSetError::UnknownReplicaGuid(_)) => ErrorCode::NotFound,
            IcsError::ChangeSet(_) => ErrorCode::CorruptData,
            IcsError::InvalidHandle(_) | IcsError::UnknownConnection(_) => ErrorCode::NullObject,
            IcsError::WrongObjectType { .. } => ErrorCode::InvalidObject,
            IcsError::UnknownReplica(_) | IcsError::NotFound(_) => ErrorCode::NotFound,
            IcsError::NoSupport(_) => ErrorCode::NoSupport,
            IcsError::NoUploadInProgress => ErrorCode::NotInitialized,
            IcsError::TooManyHandles { .. } => ErrorCode::NotEnoughMemory,
            IcsError::Config(_)
            | IcsError::Encode(_)
            | IcsError::UploadInProgress
            | IcsError::TooManyConnections { .. } => ErrorCode::CallFailed,
        }
    }
}

/// Store layer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Object not found.
    #[error("object not found: {what}")]
    NotFound {
        /// Description of the missing object.
        what: String,
    },

    /// Object already exists.
    #[error("object already exists: {what}")]
    AlreadyExists {
        /// Description of the existing object.
        what: String,
    },

    /// The backend cannot perform the operation.
    #[error("operation not supported by backend: {0}")]
    NoSupport(&'static str),

    /// The counter space of the local replica is used up.
    #[error("global counter space exhausted")]
    CountersExhausted,

    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        StoreError::NotFound {
            what: what.to_string(),
        }
    }

    /// MAPI status code reported for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound { .. } => ErrorCode::NotFound,
            StoreError::NoSupport(_) => ErrorCode::NoSupport,
            StoreError::AlreadyExists { .. }
            | StoreError::CountersExhausted
            | StoreError::Backend(_) => ErrorCode::CallFailed,
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, IcsError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
