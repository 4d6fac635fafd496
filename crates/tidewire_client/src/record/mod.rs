//! Shared versioned records.
//!
//! One [`record_core::RecordCore`] exists per record name. Public handles
//! ([`Record`], [`List`], [`AnonymousRecord`]) reference it by name and core
//! id and keep it alive through explicit reference counting.

mod anonymous;
mod dirty;
mod handle;
mod handler;
mod list;
mod merge;
mod record_core;
mod single_notifier;
mod write_ack;

pub use anonymous::AnonymousRecord;
pub use handle::{Record, Records};
pub use list::List;
pub use merge::{MergeContext, MergeStrategy};
pub use record_core::RecordState;

pub(crate) use handler::RecordHandler;

use crate::error::ClientResult;
use serde_json::{Map, Value};
use tidewire_protocol::Message;
use tidewire_storage::NO_VERSION;

/// Identifies one incarnation of a record core.
///
/// A name can be reused after its core was destroyed; handles and scheduled
/// tasks carry the id so they never touch a newer core by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct CoreId(pub(crate) u64);

/// The remote side of a version conflict.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RemoteRecord {
    pub version: i64,
    /// `None` when the record does not exist remotely.
    pub data: Option<Value>,
    /// Correlation id of the write that caused the conflict.
    pub correlation_id: Option<String>,
}

impl RemoteRecord {
    /// A record that is gone on the server.
    pub fn deleted() -> Self {
        Self {
            version: NO_VERSION,
            data: None,
            correlation_id: None,
        }
    }

    pub fn from_message(message: &Message) -> Self {
        Self {
            version: message.version.unwrap_or(NO_VERSION),
            data: message.data.clone(),
            correlation_id: message.correlation_id.clone(),
        }
    }
}

/// Result of a merge strategy: merged data, `None` to delete, or a reason
/// the conflict could not be resolved.
pub(crate) type MergeOutcome = Result<Option<Value>, String>;

/// Completion of a write.
pub(crate) type WriteCallback = Box<dyn FnOnce(ClientResult<()>) + Send>;

/// Completion of a delete.
pub(crate) type DeleteCallback = Box<dyn FnOnce(ClientResult<()>) + Send>;

/// Lifecycle notifications delivered to record handles.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// The record finished loading.
    Ready,
    /// The record was unsubscribed after its last handle went away.
    Discarded,
    /// The record was deleted.
    Deleted,
    /// The server refused a request for the record.
    Error {
        /// Action reported by the server.
        action: String,
        /// Action of the refused request, if known.
        original_action: Option<String>,
    },
    /// Another client started or stopped providing the record.
    HasProviderChanged(bool),
}

/// Data and version of a record as read from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    /// Record version.
    pub version: i64,
    /// Record data.
    pub data: Value,
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Combines several write completions into one.
pub(crate) fn join_callbacks(callbacks: Vec<WriteCallback>) -> Option<WriteCallback> {
    if callbacks.is_empty() {
        return None;
    }
    Some(Box::new(move |result: ClientResult<()>| {
        for callback in callbacks {
            callback(result.clone());
        }
    }))
}
