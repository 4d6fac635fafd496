//! Completion tracking for writes that asked for an acknowledgement.

use super::WriteCallback;
use crate::error::ClientError;
use crate::outbox::Outbox;
use crate::services::Services;
use std::collections::HashMap;
use tidewire_protocol::{Action, Message, RecordAction};
use tracing::trace;

pub(crate) struct WriteAckService {
    callbacks: HashMap<String, (String, WriteCallback)>,
    count: u64,
}

impl WriteAckService {
    pub fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
            count: 1,
        }
    }

    /// Sends a write and remembers its callback under a fresh correlation id.
    pub fn send(&mut self, mut message: Message, callback: WriteCallback, cx: &mut Services<'_>) {
        if !cx.is_connected() {
            cx.outbox.call(move || callback(Err(ClientError::Offline)));
            return;
        }
        let correlation_id = self.count.to_string();
        self.count += 1;
        let name = message.name.clone().unwrap_or_default();
        trace!(record = %name, %correlation_id, "write awaiting ack");
        message.correlation_id = Some(correlation_id.clone());
        message.is_write_ack = true;
        self.callbacks.insert(correlation_id, (name, callback));
        cx.send(message);
    }

    /// Completes the write `message` acknowledges or refuses.
    pub fn receive(&mut self, message: &Message, outbox: &mut Outbox) -> bool {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            return false;
        };
        let Some((name, callback)) = self.callbacks.remove(correlation_id) else {
            return false;
        };
        // Version conflicts are completed by the record once it has merged.
        let result = match message.action {
            _ if message.is_error => Err(ClientError::WriteDenied {
                name,
                action: message.action.as_str().to_string(),
            }),
            Action::Record(RecordAction::MessageDenied)
            | Action::Record(RecordAction::MessagePermissionError)
            | Action::Record(RecordAction::RecordUpdateError) => Err(ClientError::WriteDenied {
                name,
                action: message.action.as_str().to_string(),
            }),
            _ => Ok(()),
        };
        outbox.call(move || callback(result));
        true
    }

    /// Fails one pending write.
    pub fn fail(&mut self, correlation_id: &str, err: ClientError, outbox: &mut Outbox) {
        if let Some((_, callback)) = self.callbacks.remove(correlation_id) {
            outbox.call(move || callback(Err(err)));
        }
    }

    /// Hands a pending write's callback to someone else.
    pub fn take(&mut self, correlation_id: &str) -> Option<WriteCallback> {
        self.callbacks
            .remove(correlation_id)
            .map(|(_, callback)| callback)
    }

    /// Writes in flight on a dead connection will never be acknowledged.
    pub fn on_connection_lost(&mut self, outbox: &mut Outbox) {
        for (_, (_, callback)) in self.callbacks.drain() {
            outbox.call(move || callback(Err(ClientError::Offline)));
        }
    }

    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }
}

impl Default for WriteAckService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteAckService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAckService")
            .field("pending", &self.callbacks.len())
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientResult;
    use crate::outbox::OutboxItem;
    use crate::testing::Harness;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<ClientResult<()>>>>, WriteCallback) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (results, Box::new(move |r| sink.lock().push(r)))
    }

    fn run_calls(harness: &mut Harness) {
        for item in harness.outbox.take() {
            if let OutboxItem::Call(f) = item {
                f();
            }
        }
    }

    #[test]
    fn acknowledged_write_succeeds() {
        let mut harness = Harness::connected();
        let mut acks = WriteAckService::new();
        let (results, callback) = recorder();
        acks.send(
            Message::named(RecordAction::Update, "doc").with_version(2),
            callback,
            &mut harness.services(),
        );
        let sent = harness.sent();
        assert_eq!(sent[0].correlation_id.as_deref(), Some("1"));
        assert!(sent[0].is_write_ack);

        let ack = Message::named(RecordAction::WriteAcknowledgement, "doc").with_correlation_id("1");
        assert!(acks.receive(&ack, &mut harness.outbox));
        run_calls(&mut harness);
        assert_eq!(*results.lock(), vec![Ok(())]);
        assert_eq!(acks.pending(), 0);
    }

    #[test]
    fn denial_fails_only_its_own_write() {
        let mut harness = Harness::connected();
        let mut acks = WriteAckService::new();
        let (results, first) = recorder();
        let second = {
            let sink = Arc::clone(&results);
            Box::new(move |r| sink.lock().push(r)) as WriteCallback
        };
        acks.send(Message::named(RecordAction::Patch, "doc"), first, &mut harness.services());
        acks.send(Message::named(RecordAction::Patch, "doc"), second, &mut harness.services());

        let mut denied = Message::named(RecordAction::MessageDenied, "doc").with_correlation_id("1");
        denied.is_error = true;
        acks.receive(&denied, &mut harness.outbox);
        run_calls(&mut harness);

        assert_eq!(
            *results.lock(),
            vec![Err(ClientError::WriteDenied {
                name: "doc".into(),
                action: "MESSAGE_DENIED".into()
            })]
        );
        assert_eq!(acks.pending(), 1);
    }

    #[test]
    fn offline_write_fails_immediately() {
        let mut harness = Harness::disconnected();
        let mut acks = WriteAckService::new();
        let (results, callback) = recorder();
        acks.send(Message::named(RecordAction::Update, "doc"), callback, &mut harness.services());
        run_calls(&mut harness);
        assert_eq!(*results.lock(), vec![Err(ClientError::Offline)]);
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn connection_loss_fails_pending() {
        let mut harness = Harness::connected();
        let mut acks = WriteAckService::new();
        let (results, callback) = recorder();
        acks.send(Message::named(RecordAction::Update, "doc"), callback, &mut harness.services());
        acks.on_connection_lost(&mut harness.outbox);
        run_calls(&mut harness);
        assert_eq!(*results.lock(), vec![Err(ClientError::Offline)]);
    }

    #[test]
    fn unknown_correlation_is_ignored() {
        let mut harness = Harness::connected();
        let mut acks = WriteAckService::new();
        let ack = Message::named(RecordAction::WriteAcknowledgement, "doc").with_correlation_id("9");
        assert!(!acks.receive(&ack, &mut harness.outbox));
        assert!(acks.take("9").is_none());
    }
}
