//! Work scheduled on the timer registry.

use crate::bulk::BulkKind;
use crate::record::{CoreId, MergeOutcome, RemoteRecord};
use crate::timeout_registry::TimeoutKey;

/// A delayed or idle continuation.
///
/// Timers store these values instead of closures; the client core matches on
/// them when they come due.
pub(crate) enum Task {
    /// Periodic liveness check.
    Heartbeat,
    /// Open a new endpoint after backoff.
    Reconnect,
    /// The offline buffer window ran out.
    ExitLimbo,
    /// A request was not answered in time.
    RequestTimeout(TimeoutKey),
    /// Send batched subscriptions.
    BulkFlush(BulkKind),
    /// Persist the dirty index.
    DirtyFlush,
    /// Read the dirty index from storage.
    LoadDirtyIndex,
    /// Read a record snapshot from storage.
    LoadRecord { name: String, core: CoreId },
    /// The discard grace period of a record ran out.
    DiscardRecord { name: String, core: CoreId },
    /// A merge strategy produced a result.
    MergeResolved {
        name: String,
        core: CoreId,
        remote: RemoteRecord,
        outcome: MergeOutcome,
    },
    /// Run a callback on the next idle turn.
    Idle(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Heartbeat => f.write_str("Heartbeat"),
            Task::Reconnect => f.write_str("Reconnect"),
            Task::ExitLimbo => f.write_str("ExitLimbo"),
            Task::RequestTimeout(key) => f.debug_tuple("RequestTimeout").field(key).finish(),
            Task::BulkFlush(kind) => f.debug_tuple("BulkFlush").field(kind).finish(),
            Task::DirtyFlush => f.write_str("DirtyFlush"),
            Task::LoadDirtyIndex => f.write_str("LoadDirtyIndex"),
            Task::LoadRecord { name, .. } => f.debug_tuple("LoadRecord").field(name).finish(),
            Task::DiscardRecord { name, .. } => {
                f.debug_tuple("DiscardRecord").field(name).finish()
            }
            Task::MergeResolved { name, .. } => {
                f.debug_tuple("MergeResolved").field(name).finish()
            }
            Task::Idle(_) => f.write_str("Idle"),
        }
    }
}
