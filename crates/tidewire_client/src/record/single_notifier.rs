//! One outstanding request per record name, shared by every waiter.
//!
//! Public waiters get the response through the outbox. Record cores register
//! as internal waiters instead and are routed to by the record handler.

use crate::error::{ClientError, ClientResult};
use crate::outbox::{ErrorKind, Outbox};
use crate::services::Services;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tidewire_protocol::{Message, RecordAction};
use tracing::trace;

pub(crate) type NotifierCallback = Box<dyn FnOnce(ClientResult<Message>) + Send>;

pub(crate) struct SingleNotifier {
    action: RecordAction,
    timeout: Duration,
    requests: HashMap<String, Vec<NotifierCallback>>,
    internal: HashSet<String>,
    limbo: Vec<String>,
}

impl SingleNotifier {
    pub fn new(action: RecordAction, timeout: Duration) -> Self {
        Self {
            action,
            timeout,
            requests: HashMap::new(),
            internal: HashSet::new(),
            limbo: Vec::new(),
        }
    }

    /// Requests `name`, joining an outstanding request if there is one.
    pub fn request(&mut self, name: &str, callback: NotifierCallback, cx: &mut Services<'_>) {
        if let Some(waiting) = self.requests.get_mut(name) {
            waiting.push(callback);
            return;
        }
        if cx.is_connected() {
            self.send(name, cx);
        } else if cx.in_limbo() {
            trace!(action = %self.action, record = %name, "request buffered");
            self.limbo.push(name.to_string());
        } else {
            cx.outbox.call(move || callback(Err(ClientError::Offline)));
            return;
        }
        self.requests.insert(name.to_string(), vec![callback]);
    }

    /// Marks a record core as waiting for the next response for `name`.
    pub fn register(&mut self, name: &str) {
        self.internal.insert(name.to_string());
    }

    /// Completes every waiter of the response's name. Returns true if a
    /// record core was waiting too.
    pub fn receive(&mut self, message: &Message, cx: &mut Services<'_>) -> bool {
        cx.remove_timeout(message);
        let Some(name) = message.name.as_deref() else {
            return false;
        };
        let internal = self.internal.remove(name);
        for callback in self.requests.remove(name).unwrap_or_default() {
            let message = message.clone();
            cx.outbox.call(move || callback(Ok(message)));
        }
        internal
    }

    /// Fails the public waiters of `name`.
    pub fn fail(&mut self, name: &str, err: ClientError, outbox: &mut Outbox) -> bool {
        let Some(callbacks) = self.requests.remove(name) else {
            return false;
        };
        for callback in callbacks {
            let err = err.clone();
            outbox.call(move || callback(Err(err)));
        }
        true
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.requests.contains_key(name)
    }

    pub fn on_connection_lost(&mut self, outbox: &mut Outbox) {
        let names: Vec<String> = self.requests.keys().cloned().collect();
        for name in names {
            self.fail(&name, ClientError::Offline, outbox);
        }
        self.limbo.clear();
    }

    /// The buffer window closed before the connection came back.
    pub fn on_exit_limbo(&mut self, outbox: &mut Outbox) {
        for name in std::mem::take(&mut self.limbo) {
            self.fail(&name, ClientError::Offline, outbox);
        }
    }

    pub fn on_reestablished(&mut self, cx: &mut Services<'_>) {
        for name in std::mem::take(&mut self.limbo) {
            if self.requests.contains_key(&name) {
                self.send(&name, cx);
            }
        }
    }

    fn send(&mut self, name: &str, cx: &mut Services<'_>) {
        let message = Message::named(self.action, name);
        cx.add_timeout(&message, ErrorKind::ResponseTimeout, Some(self.timeout));
        cx.send(message);
    }
}

impl std::fmt::Debug for SingleNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleNotifier")
            .field("action", &self.action)
            .field("requests", &self.requests.len())
            .field("internal", &self.internal)
            .field("limbo", &self.limbo)
            .finish()
    }
}
