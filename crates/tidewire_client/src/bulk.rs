//! Batching of subscribe and unsubscribe intents.
//!
//! With a zero interval every intent goes out as its own message. Otherwise
//! intents collect until the flush timer fires, and a subscribe followed by
//! an unsubscribe of the same name (or the reverse) cancels out without
//! touching the wire.

use crate::outbox::ErrorKind;
use crate::services::Services;
use crate::task::Task;
use crate::timer::TimerRef;
use std::time::Duration;
use tidewire_protocol::{Action, EventAction, Message, RecordAction, RpcAction};
use tracing::trace;

/// Which subscription stream a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BulkKind {
    Event,
    Rpc,
    RecordCreateAndRead,
    RecordRead,
    RecordHead,
}

impl BulkKind {
    fn actions(self) -> (Action, Action) {
        match self {
            BulkKind::Event => (EventAction::Subscribe.into(), EventAction::Unsubscribe.into()),
            BulkKind::Rpc => (RpcAction::Provide.into(), RpcAction::Unprovide.into()),
            BulkKind::RecordCreateAndRead => (
                RecordAction::SubscribeCreateAndRead.into(),
                RecordAction::Unsubscribe.into(),
            ),
            BulkKind::RecordRead => (
                RecordAction::SubscribeAndRead.into(),
                RecordAction::Unsubscribe.into(),
            ),
            BulkKind::RecordHead => (
                RecordAction::SubscribeAndHead.into(),
                RecordAction::Unsubscribe.into(),
            ),
        }
    }

    /// Events and providers wait for an acknowledgement of each batch.
    fn tracks_acks(self) -> bool {
        matches!(self, BulkKind::Event | BulkKind::Rpc)
    }
}

/// Batches subscription intents for one [`BulkKind`].
#[derive(Debug)]
pub(crate) struct BulkSubscription {
    kind: BulkKind,
    subscribe_action: Action,
    unsubscribe_action: Action,
    interval: Duration,
    subscribe_names: Vec<String>,
    unsubscribe_names: Vec<String>,
    timer: Option<TimerRef>,
    correlation: u64,
}

impl BulkSubscription {
    pub fn new(kind: BulkKind, interval: Duration) -> Self {
        let (subscribe_action, unsubscribe_action) = kind.actions();
        Self {
            kind,
            subscribe_action,
            unsubscribe_action,
            interval,
            subscribe_names: Vec::new(),
            unsubscribe_names: Vec::new(),
            timer: None,
            correlation: 0,
        }
    }

    pub fn subscribe(&mut self, name: &str, cx: &mut Services<'_>) {
        if self.interval.is_zero() {
            self.send(self.subscribe_action, vec![name.to_string()], cx);
            return;
        }
        if remove(&mut self.unsubscribe_names, name) {
            return;
        }
        if !self.subscribe_names.iter().any(|n| n == name) {
            self.subscribe_names.push(name.to_string());
        }
        self.register_flush(cx);
    }

    pub fn subscribe_list<'n>(
        &mut self,
        names: impl IntoIterator<Item = &'n str>,
        cx: &mut Services<'_>,
    ) {
        for name in names {
            self.subscribe(name, cx);
        }
    }

    pub fn unsubscribe(&mut self, name: &str, cx: &mut Services<'_>) {
        if self.interval.is_zero() {
            self.send(self.unsubscribe_action, vec![name.to_string()], cx);
            return;
        }
        if remove(&mut self.subscribe_names, name) {
            return;
        }
        if !self.unsubscribe_names.iter().any(|n| n == name) {
            self.unsubscribe_names.push(name.to_string());
        }
        self.register_flush(cx);
    }

    /// Sends everything collected since the last flush.
    pub fn flush(&mut self, cx: &mut Services<'_>) {
        self.timer = None;
        if !cx.is_connected() {
            self.on_connection_lost(cx);
            return;
        }
        if !self.subscribe_names.is_empty() {
            let names = std::mem::take(&mut self.subscribe_names);
            self.send(self.subscribe_action, names, cx);
        }
        if !self.unsubscribe_names.is_empty() {
            let names = std::mem::take(&mut self.unsubscribe_names);
            self.send(self.unsubscribe_action, names, cx);
        }
    }

    /// Forgets every queued intent; they are re-issued on reconnect.
    pub fn on_connection_lost(&mut self, cx: &mut Services<'_>) {
        self.correlation = 0;
        cx.cancel(&mut self.timer);
        self.subscribe_names.clear();
        self.unsubscribe_names.clear();
    }

    fn register_flush(&mut self, cx: &mut Services<'_>) {
        let pending = self.timer.map_or(false, |timer| cx.timers.has(timer));
        if !pending {
            self.timer = Some(cx.schedule(self.interval, Task::BulkFlush(self.kind)));
        }
    }

    fn send(&mut self, action: Action, names: Vec<String>, cx: &mut Services<'_>) {
        let correlation_id = self.correlation.to_string();
        self.correlation += 1;
        trace!(kind = ?self.kind, %action, count = names.len(), "sending bulk subscription");
        let message = Message::new(action)
            .with_names(names)
            .with_correlation_id(correlation_id);
        if self.kind.tracks_acks() {
            cx.add_timeout(&message, ErrorKind::AckTimeout, None);
        }
        cx.send(message);
    }

    #[cfg(test)]
    pub fn queued(&self) -> (&[String], &[String]) {
        (&self.subscribe_names, &self.unsubscribe_names)
    }
}

fn remove(names: &mut Vec<String>, name: &str) -> bool {
    match names.iter().position(|n| n == name) {
        Some(index) => {
            names.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::timer::TimerRegistry;

    #[test]
    fn zero_interval_sends_immediately() {
        let mut harness = Harness::connected();
        let mut bulk = BulkSubscription::new(BulkKind::Event, Duration::ZERO);
        bulk.subscribe("a", &mut harness.services());
        bulk.unsubscribe("a", &mut harness.services());

        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].action, Action::Event(EventAction::Subscribe));
        assert_eq!(sent[0].names, Some(vec!["a".to_string()]));
        assert_eq!(sent[0].correlation_id.as_deref(), Some("0"));
        assert_eq!(sent[1].action, Action::Event(EventAction::Unsubscribe));
        assert_eq!(sent[1].correlation_id.as_deref(), Some("1"));
        assert_eq!(harness.timeouts.len(), 2);
    }

    #[test]
    fn batches_until_flush() {
        let mut harness = Harness::connected();
        let mut bulk = BulkSubscription::new(BulkKind::Rpc, Duration::from_millis(10));
        bulk.subscribe_list(["a", "b", "c"], &mut harness.services());
        assert!(harness.sent().is_empty());
        assert_eq!(harness.timers.pending(), 1);

        bulk.flush(&mut harness.services());
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Rpc(RpcAction::Provide));
        assert_eq!(
            sent[0].names,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn opposite_intents_cancel_out() {
        let mut harness = Harness::connected();
        let mut bulk = BulkSubscription::new(BulkKind::Event, Duration::from_millis(10));
        bulk.subscribe("a", &mut harness.services());
        bulk.unsubscribe("a", &mut harness.services());
        bulk.unsubscribe("b", &mut harness.services());
        assert_eq!(bulk.queued(), (&[][..], &["b".to_string()][..]));

        bulk.flush(&mut harness.services());
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Event(EventAction::Unsubscribe));
    }

    #[test]
    fn record_batches_do_not_track_acks() {
        let mut harness = Harness::connected();
        let mut bulk = BulkSubscription::new(BulkKind::RecordHead, Duration::ZERO);
        bulk.subscribe("doc", &mut harness.services());
        assert_eq!(
            harness.sent()[0].action,
            Action::Record(RecordAction::SubscribeAndHead)
        );
        assert_eq!(harness.timeouts.len(), 0);
    }

    #[test]
    fn flush_while_disconnected_drops_intents() {
        let mut harness = Harness::disconnected();
        let mut bulk = BulkSubscription::new(BulkKind::Event, Duration::from_millis(10));
        bulk.subscribe("a", &mut harness.services());
        bulk.flush(&mut harness.services());
        assert_eq!(bulk.queued(), (&[][..], &[][..]));
        assert!(harness.sent().is_empty());
    }
}
