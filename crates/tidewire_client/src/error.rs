//! Error types for the sync client.

use thiserror::Error;
use tidewire_protocol::CodecError;
use tidewire_storage::StorageError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations.
///
/// Errors are `Clone` so a single response can complete several waiters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// A public API argument was invalid. These are programmer errors.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation needs a live connection.
    #[error("client is offline")]
    Offline,

    /// Deletion needs a server round trip.
    #[error("deleting while offline is not supported")]
    DeleteOffline,

    /// The connection was closed for good.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The server refused the credentials; a retry with new ones may succeed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server refuses further authentication attempts.
    #[error("too many authentication attempts")]
    TooManyAuthAttempts,

    /// The server gave up waiting for authentication.
    #[error("authentication timed out")]
    AuthenticationTimeout,

    /// The server rejected the connection challenge.
    #[error("connection challenge denied")]
    ChallengeDenied,

    /// A write was based on a version the server already has.
    #[error("version conflict on {name}: {reason}")]
    VersionConflict {
        /// Record name.
        name: String,
        /// Server-provided reason.
        reason: String,
    },

    /// The server refused a write.
    #[error("write to {name} denied: {action}")]
    WriteDenied {
        /// Record name.
        name: String,
        /// Action reported by the server.
        action: String,
    },

    /// The server refused a read or subscription.
    #[error("request for {name} denied: {action}")]
    RequestDenied {
        /// Record, event or procedure name.
        name: String,
        /// Action reported by the server.
        action: String,
    },

    /// The record does not exist on the server.
    #[error("record {0} not found")]
    NotFound(String),

    /// A version conflict could not be resolved by any merge strategy.
    #[error("unresolved conflict on {name}: {reason}")]
    UnresolvedConflict {
        /// Record name.
        name: String,
        /// Why the merge failed.
        reason: String,
    },

    /// The record is read-only on this client.
    #[error("record {0} is read-only")]
    ReadOnly(String),

    /// The record was discarded or deleted.
    #[error("record {0} has been destroyed")]
    RecordDestroyed(String),

    /// No response arrived in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A remote procedure failed.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// An RPC response was completed twice.
    #[error("rpc {0} has already been completed")]
    RpcAlreadyCompleted(String),

    /// Offline storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl ClientError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns true if the same operation may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Offline
                | ClientError::DeleteOffline
                | ClientError::Timeout(_)
                | ClientError::AuthenticationFailed(_)
                | ClientError::VersionConflict { .. }
        )
    }

    /// Returns true if the error was caused by missing connectivity.
    pub fn is_offline(&self) -> bool {
        matches!(self, ClientError::Offline | ClientError::DeleteOffline)
    }
}
