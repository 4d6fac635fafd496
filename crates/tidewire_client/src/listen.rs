//! Pattern listening.
//!
//! A listener is told whenever another client subscribes to a name matching
//! its pattern, and decides whether to provide that subscription.

use crate::client::Client;
use crate::error::{ClientError, ClientResult};
use crate::outbox::{ErrorKind, Outbox};
use crate::services::Services;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tidewire_protocol::{Action, EventAction, Message, Topic};
use tracing::debug;

/// Called with the matched subscription name and a way to answer.
pub type ListenCallback = Arc<dyn Fn(&str, ListenResponse) + Send + Sync>;

type StopCallback = Box<dyn FnOnce(&str) + Send>;

/// The answer to a matched subscription.
#[derive(Clone)]
pub struct ListenResponse {
    client: Client,
    pattern: String,
    subscription: String,
}

impl ListenResponse {
    /// The pattern that matched.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The subscription name that matched.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Starts providing the subscription.
    pub fn accept(&self) {
        self.answer(EventAction::ListenAccept);
    }

    /// Declines the subscription; the server may ask another listener.
    pub fn reject(&self) {
        self.answer(EventAction::ListenReject);
    }

    /// Runs `callback` when the subscription goes away or the connection
    /// drops.
    pub fn on_stop(&self, callback: impl FnOnce(&str) + Send + 'static) {
        let subscription = self.subscription.clone();
        self.client.with_services(|_, handlers| {
            handlers
                .events
                .listener_mut()
                .set_stop_callback(subscription, Box::new(callback))
        });
    }

    fn answer(&self, action: EventAction) {
        let message = Message::named(action, self.pattern.clone())
            .with_subscription(self.subscription.clone());
        self.client.with_services(|cx, _| cx.send(message));
    }
}

impl fmt::Debug for ListenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenResponse")
            .field("pattern", &self.pattern)
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Listen patterns and the stop callbacks of accepted subscriptions.
#[derive(Default)]
pub(crate) struct PatternListener {
    listeners: BTreeMap<String, ListenCallback>,
    stop_callbacks: HashMap<String, StopCallback>,
}

impl PatternListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(
        &mut self,
        pattern: &str,
        callback: ListenCallback,
        cx: &mut Services<'_>,
    ) -> ClientResult<()> {
        if pattern.is_empty() {
            return Err(ClientError::invalid_argument("pattern must not be empty"));
        }
        if self.listeners.contains_key(pattern) {
            cx.outbox.warn(
                Topic::Event,
                ErrorKind::ListenerExists,
                format!("already listening to {pattern}"),
            );
            return Ok(());
        }
        self.listeners.insert(pattern.to_string(), callback);
        send(EventAction::Listen, pattern, cx);
        Ok(())
    }

    pub fn unlisten(&mut self, pattern: &str, cx: &mut Services<'_>) -> ClientResult<()> {
        if pattern.is_empty() {
            return Err(ClientError::invalid_argument("pattern must not be empty"));
        }
        if self.listeners.remove(pattern).is_none() {
            cx.outbox.warn(
                Topic::Event,
                ErrorKind::NotListening,
                format!("not listening to {pattern}"),
            );
            return Ok(());
        }
        send(EventAction::Unlisten, pattern, cx);
        Ok(())
    }

    pub fn set_stop_callback(&mut self, subscription: String, callback: StopCallback) {
        self.stop_callbacks.insert(subscription, callback);
    }

    /// Handles a pattern match or removal.
    pub fn handle(&mut self, message: Message, cx: &mut Services<'_>) {
        let (Some(pattern), Some(subscription)) = (message.name, message.subscription) else {
            cx.outbox.error(
                Topic::Event,
                ErrorKind::UnsolicitedMessage,
                format!("{} without pattern or subscription", message.action),
            );
            return;
        };
        match message.action {
            Action::Event(EventAction::SubscriptionForPatternFound) => {
                let Some(callback) = self.listeners.get(&pattern).cloned() else {
                    debug!(%pattern, "match for a pattern no longer listened to");
                    return;
                };
                cx.outbox.push(move |client| {
                    let response = ListenResponse {
                        client: client.clone(),
                        pattern,
                        subscription: subscription.clone(),
                    };
                    callback(&subscription, response);
                });
            }
            Action::Event(EventAction::SubscriptionForPatternRemoved) => {
                if let Some(callback) = self.stop_callbacks.remove(&subscription) {
                    cx.outbox.call(move || callback(&subscription));
                }
            }
            action => cx.outbox.error(
                Topic::Event,
                ErrorKind::UnsolicitedMessage,
                format!("unexpected listen message {action}"),
            ),
        }
    }

    pub fn patterns(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    /// Every provided subscription stops with the connection.
    pub fn on_connection_lost(&mut self, outbox: &mut Outbox) {
        for (subscription, callback) in self.stop_callbacks.drain() {
            outbox.call(move || callback(&subscription));
        }
    }

    pub fn on_reestablished(&mut self, cx: &mut Services<'_>) {
        for pattern in self.listeners.keys() {
            send(EventAction::Listen, pattern, cx);
        }
    }
}

fn send(action: EventAction, pattern: &str, cx: &mut Services<'_>) {
    let message = Message::named(action, pattern);
    cx.add_timeout(&message, ErrorKind::AckTimeout, None);
    cx.send(message);
}

impl fmt::Debug for PatternListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternListener")
            .field("patterns", &self.listeners.keys().collect::<Vec<_>>())
            .field("providing", &self.stop_callbacks.len())
            .finish()
    }
}
