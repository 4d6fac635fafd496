//! Publish and subscribe on named events.

use crate::bulk::{BulkKind, BulkSubscription};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::emitter::{Emitter, Listener, ListenerId};
use crate::error::{ClientError, ClientResult};
use crate::listen::{ListenCallback, ListenResponse, PatternListener};
use crate::outbox::ErrorKind;
use crate::services::Services;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tidewire_protocol::{Action, EventAction, Message, Topic};
use tracing::trace;

/// Event subscriptions, pattern listeners and the limbo buffer.
pub(crate) struct EventHandler {
    emitter: Emitter<String, Value>,
    listener: PatternListener,
    limbo: Vec<Message>,
    bulk: BulkSubscription,
}

impl EventHandler {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            emitter: Emitter::new(),
            listener: PatternListener::new(),
            limbo: Vec::new(),
            bulk: BulkSubscription::new(BulkKind::Event, config.subscription_interval),
        }
    }

    pub fn listener_mut(&mut self) -> &mut PatternListener {
        &mut self.listener
    }

    /// Registers `callback` for `name`. Only the first local subscriber
    /// reaches the server.
    pub fn subscribe(
        &mut self,
        name: &str,
        callback: Listener<Value>,
        cx: &mut Services<'_>,
    ) -> ClientResult<ListenerId> {
        validate(name)?;
        if !self.emitter.has_listeners(&name.to_string()) && cx.is_connected() {
            self.bulk.subscribe(name, cx);
        }
        Ok(self.emitter.on(name.to_string(), None, callback))
    }

    /// Removes one callback, or all of them. The server is told once the
    /// last one is gone.
    pub fn unsubscribe(
        &mut self,
        name: &str,
        id: Option<ListenerId>,
        cx: &mut Services<'_>,
    ) -> ClientResult<()> {
        validate(name)?;
        let key = name.to_string();
        if !self.emitter.has_listeners(&key) {
            cx.outbox.warn(
                Topic::Event,
                ErrorKind::NotSubscribed,
                format!("not subscribed to {name}"),
            );
            return Ok(());
        }
        match id {
            Some(id) => {
                self.emitter.off(&key, id);
            }
            None => {
                self.emitter.off_key(&key, None);
            }
        }
        if !self.emitter.has_listeners(&key) && cx.is_connected() {
            self.bulk.unsubscribe(name, cx);
        }
        Ok(())
    }

    /// Publishes to the server and to local subscribers. While in limbo the
    /// message waits for the connection to come back.
    pub fn emit(&mut self, name: &str, data: Option<Value>, cx: &mut Services<'_>) -> ClientResult<()> {
        validate(name)?;
        let mut message = Message::named(EventAction::Emit, name);
        if let Some(data) = data.clone() {
            message = message.with_data(data);
        }
        if cx.is_connected() {
            cx.send(message);
        } else if cx.in_limbo() {
            trace!(%name, "buffering emit while in limbo");
            self.limbo.push(message);
        }
        self.emitter
            .emit(&name.to_string(), data.unwrap_or(Value::Null), cx.outbox);
        Ok(())
    }

    pub fn listen(
        &mut self,
        pattern: &str,
        callback: ListenCallback,
        cx: &mut Services<'_>,
    ) -> ClientResult<()> {
        self.listener.listen(pattern, callback, cx)
    }

    pub fn unlisten(&mut self, pattern: &str, cx: &mut Services<'_>) -> ClientResult<()> {
        self.listener.unlisten(pattern, cx)
    }

    pub fn handle(&mut self, message: Message, cx: &mut Services<'_>) {
        if message.is_ack {
            cx.remove_timeout(&message);
            return;
        }
        let Action::Event(action) = message.action else {
            return;
        };
        match action {
            EventAction::Emit => {
                let Some(name) = message.name else {
                    cx.outbox.error(
                        Topic::Event,
                        ErrorKind::UnsolicitedMessage,
                        "emit without a name",
                    );
                    return;
                };
                self.emitter
                    .emit(&name, message.data.unwrap_or(Value::Null), cx.outbox);
            }
            EventAction::MessageDenied | EventAction::MessagePermissionError => {
                cx.remove_timeout(&message);
                cx.outbox.error(
                    Topic::Event,
                    ErrorKind::MessageDenied,
                    format!("{action} for {}", message.name.unwrap_or_default()),
                );
            }
            EventAction::MultipleSubscriptions | EventAction::NotSubscribed => {
                let (original, kind) = if action == EventAction::MultipleSubscriptions {
                    (EventAction::Subscribe, ErrorKind::MultipleSubscriptions)
                } else {
                    (EventAction::Unsubscribe, ErrorKind::NotSubscribed)
                };
                let name = message.name.clone().unwrap_or_default();
                cx.remove_timeout(&message.with_original_action(original));
                cx.outbox
                    .warn(Topic::Event, kind, format!("{action} for {name}"));
            }
            EventAction::SubscriptionForPatternFound | EventAction::SubscriptionForPatternRemoved => {
                self.listener.handle(message, cx);
            }
            EventAction::InvalidListenRegex => cx.outbox.error(
                Topic::Event,
                ErrorKind::InvalidListenRegex,
                message.name.unwrap_or_default(),
            ),
            EventAction::NotListening => cx.outbox.warn(
                Topic::Event,
                ErrorKind::NotListening,
                message.name.unwrap_or_default(),
            ),
            other => cx.outbox.error(
                Topic::Event,
                ErrorKind::UnsolicitedMessage,
                format!("unexpected {other}"),
            ),
        }
    }

    pub fn flush_bulk(&mut self, cx: &mut Services<'_>) {
        self.bulk.flush(cx);
    }

    pub fn on_connection_lost(&mut self, cx: &mut Services<'_>) {
        self.bulk.on_connection_lost(cx);
        self.listener.on_connection_lost(cx.outbox);
    }

    /// Re-subscribes every name, re-listens every pattern and sends what was
    /// emitted in limbo.
    pub fn on_reestablished(&mut self, cx: &mut Services<'_>) {
        let names = self.event_names();
        self.bulk.subscribe_list(names.iter().map(String::as_str), cx);
        self.listener.on_reestablished(cx);
        for message in std::mem::take(&mut self.limbo) {
            cx.send(message);
        }
    }

    /// Limbo ran out: buffered emits are dropped.
    pub fn on_exit_limbo(&mut self) {
        self.limbo.clear();
    }

    /// Subscribed names in sorted order.
    pub fn event_names(&self) -> Vec<String> {
        let mut names = self.emitter.event_names();
        names.sort();
        names
    }
}

fn validate(name: &str) -> ClientResult<()> {
    if name.is_empty() {
        return Err(ClientError::invalid_argument("event name must not be empty"));
    }
    Ok(())
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("names", &self.event_names())
            .field("listener", &self.listener)
            .field("limbo", &self.limbo.len())
            .finish()
    }
}

/// Event operations of a [`Client`].
#[derive(Clone, Debug)]
pub struct Events {
    client: Client,
}

impl Events {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Calls `callback` with the data of every event named `name`.
    pub fn subscribe(
        &self,
        name: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ClientResult<ListenerId> {
        let callback: Listener<Value> = Arc::new(callback);
        self.client
            .with_services(|cx, h| h.events.subscribe(name, callback, cx))
    }

    /// Removes the callback `id`, or every callback for `name`.
    pub fn unsubscribe(&self, name: &str, id: Option<ListenerId>) -> ClientResult<()> {
        self.client
            .with_services(|cx, h| h.events.unsubscribe(name, id, cx))
    }

    /// Publishes an event. Local subscribers receive it as well.
    pub fn emit(&self, name: &str, data: Option<Value>) -> ClientResult<()> {
        self.client
            .with_services(|cx, h| h.events.emit(name, data, cx))
    }

    /// Listens for subscriptions matching `pattern`.
    pub fn listen(
        &self,
        pattern: &str,
        callback: impl Fn(&str, ListenResponse) + Send + Sync + 'static,
    ) -> ClientResult<()> {
        let callback: ListenCallback = Arc::new(callback);
        self.client
            .with_services(|cx, h| h.events.listen(pattern, callback, cx))
    }

    /// Stops listening for `pattern`.
    pub fn unlisten(&self, pattern: &str) -> ClientResult<()> {
        self.client
            .with_services(|cx, h| h.events.unlisten(pattern, cx))
    }

    /// Names with at least one local subscriber.
    pub fn event_names(&self) -> Vec<String> {
        self.client.inspect(|core| core.events().event_names())
    }
}
