//! Deferred delivery of user callbacks and client events.
//!
//! Components never call user code while the client is locked. They push
//! work into the [`Outbox`], and the client runs it after releasing the lock,
//! so callbacks may call back into the client.

use crate::client::Client;
use crate::connection::ConnectionState;
use serde_json::Value;
use tidewire_protocol::Topic;
use tracing::{error, warn};

/// Work deferred until the client lock is released.
pub(crate) type Deferred = Box<dyn FnOnce(&Client) + Send>;

/// Diagnostic categories reported through [`ClientEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A message was sent while the connection was closed.
    IsClosed,
    /// No traffic arrived within twice the heartbeat interval.
    HeartbeatTimeout,
    /// The transport reported an error.
    ConnectionError,
    /// A message arrived that nothing was waiting for.
    UnsolicitedMessage,
    /// Incoming bytes could not be parsed.
    MessageParseError,
    /// The server refused a request.
    MessageDenied,
    /// A request was not acknowledged in time.
    AckTimeout,
    /// A request was not answered in time.
    ResponseTimeout,
    /// A response referenced an unknown correlation id.
    UnknownCorrelationId,
    /// Authentication attempts exhausted.
    TooManyAuthAttempts,
    /// The server stopped waiting for authentication.
    AuthenticationTimeout,
    /// A record could not be loaded from offline storage.
    RecordLoadError,
    /// A version conflict could not be resolved.
    RecordVersionExists,
    /// A write was attempted on a read-only record.
    RecordReadOnlyMode,
    /// A record deletion was not confirmed in time.
    RecordDeleteTimeout,
    /// Offline storage failed.
    StorageError,
    /// The event name was already subscribed.
    MultipleSubscriptions,
    /// The event name was not subscribed.
    NotSubscribed,
    /// The pattern is already listened to.
    ListenerExists,
    /// The pattern is not listened to.
    NotListening,
    /// The server rejected a listen pattern.
    InvalidListenRegex,
    /// The procedure is already provided.
    ProviderExists,
    /// The procedure is not provided.
    NotProviding,
}

/// Observable client-level notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state changed.
    ConnectionStateChanged(ConnectionState),
    /// Something went wrong that no caller is waiting for.
    Error {
        /// Topic the error belongs to.
        topic: Topic,
        /// Error category.
        kind: ErrorKind,
        /// Human-readable detail.
        detail: String,
    },
    /// Reconnection gave up after this many attempts.
    MaxReconnectionAttemptsReached(u32),
    /// The server sent different client data on login.
    ClientDataChanged(Option<Value>),
    /// Re-authentication after a reconnect failed.
    ReauthenticationFailure(String),
}

pub(crate) enum OutboxItem {
    Event(ClientEvent),
    Call(Box<dyn FnOnce() + Send>),
    WithClient(Deferred),
}

/// Queue of work to run once the client lock is released.
#[derive(Default)]
pub(crate) struct Outbox {
    items: Vec<OutboxItem>,
}

impl Outbox {
    /// Queues a closure that receives the client.
    pub fn push(&mut self, deferred: impl FnOnce(&Client) + Send + 'static) {
        self.items.push(OutboxItem::WithClient(Box::new(deferred)));
    }

    /// Queues a closure that does not need the client.
    pub fn call(&mut self, f: impl FnOnce() + Send + 'static) {
        self.items.push(OutboxItem::Call(Box::new(f)));
    }

    /// Queues a client event.
    pub fn event(&mut self, event: ClientEvent) {
        self.items.push(OutboxItem::Event(event));
    }

    /// Logs an error and reports it as a client event.
    pub fn error(&mut self, topic: Topic, kind: ErrorKind, detail: impl Into<String>) {
        let detail = detail.into();
        error!(%topic, ?kind, %detail, "client error");
        self.event(ClientEvent::Error {
            topic,
            kind,
            detail,
        });
    }

    /// Logs a warning and reports it as a client event.
    pub fn warn(&mut self, topic: Topic, kind: ErrorKind, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(%topic, ?kind, %detail, "client warning");
        self.event(ClientEvent::Error {
            topic,
            kind,
            detail,
        });
    }

    /// Takes every queued item, leaving the outbox empty.
    pub fn take(&mut self) -> Vec<OutboxItem> {
        std::mem::take(&mut self.items)
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[cfg(test)]
    pub fn events(&self) -> Vec<ClientEvent> {
        self.items
            .iter()
            .filter_map(|item| match item {
                OutboxItem::Event(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn calls(&self) -> usize {
        self.items
            .iter()
            .filter(|item| !matches!(item, OutboxItem::Event(_)))
            .count()
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("items", &self.items.len())
            .finish()
    }
}
