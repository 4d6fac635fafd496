//! Deadlines for outstanding requests.
//!
//! A request is keyed by topic, action and either its correlation id or its
//! name. A response removes the deadline of the request it answers; expiry
//! produces an [`Expired`] entry that the client reports.

use crate::outbox::ErrorKind;
use crate::task::Task;
use crate::timer::{TimerRef, TimerRegistry};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tidewire_protocol::{Action, Message};
use tracing::trace;

/// Identifies one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TimeoutKey(String);

impl TimeoutKey {
    fn new(action: Action, message: &Message) -> Self {
        let id = message
            .correlation_id
            .as_deref()
            .or(message.name.as_deref())
            .unwrap_or_default();
        Self(format!("{}{}_{}", action.topic(), action.as_str(), id))
    }

    /// Key of a request message.
    pub fn for_request(message: &Message) -> Self {
        Self::new(message.timeout_action(), message)
    }

    /// Key of the request that `message` responds to.
    pub fn for_response(message: &Message) -> Self {
        let action = message
            .original_action
            .unwrap_or_else(|| message.action.request_for_response());
        Self::new(action, message)
    }
}

impl fmt::Display for TimeoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deadline that ran out.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expired {
    pub message: Message,
    pub kind: ErrorKind,
}

#[derive(Debug)]
struct Entry {
    timer: TimerRef,
    message: Message,
    kind: ErrorKind,
}

/// Tracks request deadlines.
#[derive(Debug, Default)]
pub(crate) struct TimeoutRegistry {
    entries: HashMap<TimeoutKey, Entry>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a deadline for `message`, replacing any previous one with the
    /// same key.
    pub fn add(
        &mut self,
        message: &Message,
        kind: ErrorKind,
        duration: Duration,
        timers: &mut dyn TimerRegistry<Task>,
        now: Duration,
    ) -> TimeoutKey {
        let key = TimeoutKey::for_request(message);
        self.clear(&key, timers);
        let timer = timers.add(now, duration, Task::RequestTimeout(key.clone()));
        trace!(%key, ?duration, "request deadline started");
        self.entries.insert(
            key.clone(),
            Entry {
                timer,
                message: message.clone(),
                kind,
            },
        );
        key
    }

    /// Stops the deadline of the request answered by `message`.
    pub fn remove(&mut self, message: &Message, timers: &mut dyn TimerRegistry<Task>) -> bool {
        self.clear(&TimeoutKey::for_response(message), timers)
    }

    /// Stops a deadline by key.
    pub fn clear(&mut self, key: &TimeoutKey, timers: &mut dyn TimerRegistry<Task>) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                timers.remove(entry.timer);
                true
            }
            None => false,
        }
    }

    /// Consumes a deadline whose timer fired.
    pub fn fire(&mut self, key: &TimeoutKey) -> Option<Expired> {
        self.entries.remove(key).map(|entry| Expired {
            message: entry.message,
            kind: entry.kind,
        })
    }

    /// Drops every deadline; nothing on a dead connection can be answered.
    pub fn on_connection_lost(&mut self, timers: &mut dyn TimerRegistry<Task>) {
        for (_, entry) in self.entries.drain() {
            timers.remove(entry.timer);
        }
    }

    pub fn contains(&self, key: &TimeoutKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::NativeTimerRegistry;
    use tidewire_protocol::{EventAction, RecordAction};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn response_clears_request_deadline() {
        let mut timers = NativeTimerRegistry::new();
        let mut registry = TimeoutRegistry::new();
        let request = Message::named(RecordAction::Read, "doc");
        registry.add(&request, ErrorKind::ResponseTimeout, ms(100), &mut timers, ms(0));
        assert_eq!(registry.len(), 1);

        let response = Message::named(RecordAction::ReadResponse, "doc");
        assert!(registry.remove(&response, &mut timers));
        assert_eq!(registry.len(), 0);
        assert!(timers.take_due(ms(500)).is_empty());
    }

    #[test]
    fn correlation_id_wins_over_name() {
        let request = Message::new(EventAction::Subscribe)
            .with_names(vec!["a".into()])
            .with_correlation_id("3");
        assert_eq!(TimeoutKey::for_request(&request).to_string(), "EVENTSUBSCRIBE_3");

        let ack = Message::new(EventAction::Subscribe)
            .with_correlation_id("3")
            .ack();
        assert_eq!(TimeoutKey::for_response(&ack), TimeoutKey::for_request(&request));
    }

    #[test]
    fn original_action_keys_error_responses() {
        let request = Message::named(RecordAction::Delete, "doc");
        let denied = Message::named(RecordAction::MessageDenied, "doc")
            .with_original_action(RecordAction::Delete);
        assert_eq!(TimeoutKey::for_response(&denied), TimeoutKey::for_request(&request));
    }

    #[test]
    fn expired_deadline_fires_once() {
        let mut timers = NativeTimerRegistry::new();
        let mut registry = TimeoutRegistry::new();
        let request = Message::named(RecordAction::Head, "doc");
        let key = registry.add(&request, ErrorKind::AckTimeout, ms(10), &mut timers, ms(0));

        let due = timers.take_due(ms(10));
        assert!(matches!(due.as_slice(), [Task::RequestTimeout(k)] if *k == key));
        let expired = registry.fire(&key).unwrap();
        assert_eq!(expired.kind, ErrorKind::AckTimeout);
        assert_eq!(expired.message, request);
        assert!(registry.fire(&key).is_none());
    }

    #[test]
    fn adding_twice_replaces_deadline() {
        let mut timers = NativeTimerRegistry::new();
        let mut registry = TimeoutRegistry::new();
        let request = Message::named(RecordAction::Head, "doc");
        registry.add(&request, ErrorKind::AckTimeout, ms(10), &mut timers, ms(0));
        registry.add(&request, ErrorKind::AckTimeout, ms(50), &mut timers, ms(0));
        assert_eq!(registry.len(), 1);
        assert_eq!(timers.pending(), 1);
        assert!(timers.take_due(ms(20)).is_empty());
    }

    #[test]
    fn connection_loss_clears_everything() {
        let mut timers = NativeTimerRegistry::new();
        let mut registry = TimeoutRegistry::new();
        for name in ["a", "b", "c"] {
            let request = Message::named(RecordAction::Read, name);
            registry.add(&request, ErrorKind::ResponseTimeout, ms(10), &mut timers, ms(0));
        }
        registry.on_connection_lost(&mut timers);
        assert_eq!(registry.len(), 0);
        assert_eq!(timers.pending(), 0);
    }
}
