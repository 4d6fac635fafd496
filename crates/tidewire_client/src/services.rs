//! Borrowed views of the shared client machinery.
//!
//! Components do not hold references to each other. The client core lends
//! them what they need for the duration of one call.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::ids::IdGenerator;
use crate::outbox::{ErrorKind, Outbox};
use crate::task::Task;
use crate::timeout_registry::{TimeoutKey, TimeoutRegistry};
use crate::timer::{TimerRef, TimerRegistry};
use std::time::Duration;
use tidewire_protocol::Message;
use tidewire_storage::OfflineStore;

/// What the connection itself needs: timers and the outbox.
pub(crate) struct Env<'a> {
    pub config: &'a ClientConfig,
    pub now: Duration,
    pub timers: &'a mut dyn TimerRegistry<Task>,
    pub outbox: &'a mut Outbox,
}

impl Env<'_> {
    pub fn schedule(&mut self, delay: Duration, task: Task) -> TimerRef {
        self.timers.add(self.now, delay, task)
    }

    /// Cancels the timer in `slot`, if any.
    pub fn cancel(&mut self, slot: &mut Option<TimerRef>) {
        if let Some(timer) = slot.take() {
            self.timers.remove(timer);
        }
    }
}

/// Everything a topic handler may touch while handling one call.
pub(crate) struct Services<'a> {
    pub config: &'a ClientConfig,
    pub now: Duration,
    pub connection: &'a mut Connection,
    pub timers: &'a mut dyn TimerRegistry<Task>,
    pub timeouts: &'a mut TimeoutRegistry,
    pub storage: &'a dyn OfflineStore,
    pub ids: &'a dyn IdGenerator,
    pub outbox: &'a mut Outbox,
}

impl Services<'_> {
    pub fn env(&mut self) -> Env<'_> {
        Env {
            config: self.config,
            now: self.now,
            timers: &mut *self.timers,
            outbox: &mut *self.outbox,
        }
    }

    /// Sends through the connection. Dropped and reported when closed.
    pub fn send(&mut self, message: Message) {
        let mut env = Env {
            config: self.config,
            now: self.now,
            timers: &mut *self.timers,
            outbox: &mut *self.outbox,
        };
        self.connection.send_message(message, &mut env);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn in_limbo(&self) -> bool {
        self.connection.is_in_limbo()
    }

    /// Starts a request deadline. Nothing is tracked while disconnected.
    pub fn add_timeout(
        &mut self,
        message: &Message,
        kind: ErrorKind,
        duration: Option<Duration>,
    ) -> Option<TimeoutKey> {
        if !self.connection.is_connected() {
            return None;
        }
        let duration = duration.unwrap_or(self.config.subscription_timeout);
        Some(
            self.timeouts
                .add(message, kind, duration, &mut *self.timers, self.now),
        )
    }

    /// Stops the deadline of the request `message` answers.
    pub fn remove_timeout(&mut self, message: &Message) {
        self.timeouts.remove(message, &mut *self.timers);
    }

    /// Stops the deadline in `slot`, if any.
    pub fn clear_timeout(&mut self, slot: &mut Option<TimeoutKey>) {
        if let Some(key) = slot.take() {
            self.timeouts.clear(&key, &mut *self.timers);
        }
    }

    pub fn schedule(&mut self, delay: Duration, task: Task) -> TimerRef {
        self.timers.add(self.now, delay, task)
    }

    /// Cancels the timer in `slot`, if any.
    pub fn cancel(&mut self, slot: &mut Option<TimerRef>) {
        if let Some(timer) = slot.take() {
            self.timers.remove(timer);
        }
    }

    /// Queues a task for the next idle turn.
    pub fn idle(&mut self, task: Task) {
        self.timers.request_idle(task);
    }

    /// Runs `f` on the next idle turn, outside the client lock.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.timers.request_idle(Task::Idle(Box::new(f)));
    }
}
