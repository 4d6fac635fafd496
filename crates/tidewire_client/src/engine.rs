//! The sans-IO client engine.
//!
//! [`ClientCore`] owns every component and is driven from outside: transport
//! events arrive on a channel, time is passed in, and user-visible work is
//! left in the outbox for the caller to run after releasing its lock.

use crate::bulk::BulkKind;
use crate::config::{ClientConfig, TimerStrategy};
use crate::connection::{AuthCallback, Connection, ConnectionState, LifecycleHook, ResumeCallback};
use crate::error::ClientResult;
use crate::event::EventHandler;
use crate::ids::IdGenerator;
use crate::outbox::{ErrorKind, Outbox, OutboxItem};
use crate::record::{MergeStrategy, RecordHandler};
use crate::rpc::RpcHandler;
use crate::services::{Env, Services};
use crate::task::Task;
use crate::timeout_registry::TimeoutRegistry;
use crate::timer::{IntervalTimerRegistry, NativeTimerRegistry, TimerRegistry};
use crate::transport::{EndpointEvent, TransportFactory};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tidewire_protocol::{Message, Topic};
use tidewire_storage::{NoopStore, OfflineStore};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Everything [`ClientCore::new`] needs besides the config.
pub(crate) struct CoreParts {
    pub url: String,
    pub factory: Arc<dyn TransportFactory>,
    pub storage: Arc<dyn OfflineStore>,
    pub ids: Arc<dyn IdGenerator>,
    pub merge_strategy: Option<MergeStrategy>,
    pub notify: Arc<Notify>,
}

/// The topic handlers, borrowed next to [`Services`].
pub(crate) struct Handlers<'a> {
    pub records: &'a mut RecordHandler,
    pub events: &'a mut EventHandler,
    pub rpc: &'a mut RpcHandler,
}

pub(crate) struct ClientCore {
    config: ClientConfig,
    timers: Box<dyn TimerRegistry<Task>>,
    timeouts: TimeoutRegistry,
    connection: Connection,
    storage: Arc<dyn OfflineStore>,
    ids: Arc<dyn IdGenerator>,
    outbox: Outbox,
    rx: mpsc::UnboundedReceiver<EndpointEvent>,
    records: RecordHandler,
    events: EventHandler,
    rpc: RpcHandler,
}

impl ClientCore {
    pub fn new(config: ClientConfig, parts: CoreParts, now: Duration) -> ClientResult<Self> {
        let mut timers: Box<dyn TimerRegistry<Task>> = match config.timer_strategy {
            TimerStrategy::Native => Box::new(NativeTimerRegistry::new()),
            TimerStrategy::Interval { resolution } => Box::new(IntervalTimerRegistry::new(resolution)),
        };
        let storage: Arc<dyn OfflineStore> = if config.offline_enabled {
            parts.storage
        } else {
            Arc::new(NoopStore::new())
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let mut outbox = Outbox::default();
        let connection = {
            let mut env = Env {
                config: &config,
                now,
                timers: timers.as_mut(),
                outbox: &mut outbox,
            };
            Connection::new(&parts.url, parts.factory, tx, parts.notify, &mut env)?
        };
        timers.request_idle(Task::LoadDirtyIndex);

        let records = RecordHandler::new(&config, parts.merge_strategy);
        let events = EventHandler::new(&config);
        let rpc = RpcHandler::new(&config);
        debug!(url = %connection.url(), "client core created");
        Ok(Self {
            config,
            timers,
            timeouts: TimeoutRegistry::new(),
            connection,
            storage,
            ids: parts.ids,
            outbox,
            rx,
            records,
            events,
            rpc,
        })
    }

    /// Lends out the shared services and the topic handlers at once.
    pub fn split(&mut self, now: Duration) -> (Services<'_>, Handlers<'_>) {
        let services = Services {
            config: &self.config,
            now,
            connection: &mut self.connection,
            timers: self.timers.as_mut(),
            timeouts: &mut self.timeouts,
            storage: self.storage.as_ref(),
            ids: self.ids.as_ref(),
            outbox: &mut self.outbox,
        };
        let handlers = Handlers {
            records: &mut self.records,
            events: &mut self.events,
            rpc: &mut self.rpc,
        };
        (services, handlers)
    }

    /// Runs `f` with the connection and an environment borrowed next to it.
    fn with_connection<R>(
        &mut self,
        now: Duration,
        f: impl FnOnce(&mut Connection, &mut Env<'_>) -> R,
    ) -> R {
        let mut env = Env {
            config: &self.config,
            now,
            timers: self.timers.as_mut(),
            outbox: &mut self.outbox,
        };
        f(&mut self.connection, &mut env)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn client_data(&self) -> Option<&Value> {
        self.connection.client_data()
    }

    pub fn records(&self) -> &RecordHandler {
        &self.records
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    pub fn rpc(&self) -> &RpcHandler {
        &self.rpc
    }

    pub fn login(&mut self, params: Option<Value>, callback: AuthCallback, now: Duration) {
        self.with_connection(now, |connection, env| {
            connection.authenticate(params, callback, env)
        });
    }

    pub fn pause(&mut self, now: Duration) {
        self.with_connection(now, |connection, env| connection.pause(env));
    }

    pub fn resume(&mut self, callback: ResumeCallback, now: Duration) {
        self.with_connection(now, |connection, env| connection.resume(callback, env));
    }

    /// Persists the dirty index and shuts the connection down.
    pub fn close(&mut self, now: Duration) {
        {
            let (mut cx, handlers) = self.split(now);
            handlers.records.flush_dirty(&mut cx);
        }
        self.with_connection(now, |connection, env| connection.close(env));
    }

    /// Processes transport events and due tasks until nothing is left.
    /// Returns true if anything ran.
    pub fn pump(&mut self, now: Duration) -> bool {
        let mut worked = false;
        loop {
            let mut progressed = false;
            while let Ok((id, event)) = self.rx.try_recv() {
                progressed = true;
                let forwarded = self.with_connection(now, |connection, env| {
                    connection.handle_transport_event(id, event, env)
                });
                self.settle(now);
                for message in forwarded {
                    self.dispatch(message, now);
                }
            }
            let tasks = self.timers.take_due(now);
            if tasks.is_empty() && !progressed {
                break;
            }
            for task in tasks {
                self.run_task(task, now);
                self.settle(now);
            }
            worked = true;
        }
        worked
    }

    /// Time until the next timer may fire, measured from `now`.
    pub fn next_wakeup(&self, now: Duration) -> Option<Duration> {
        self.timers
            .next_deadline(now)
            .map(|deadline| deadline.saturating_sub(now))
    }

    pub fn take_outbox(&mut self) -> Vec<OutboxItem> {
        self.outbox.take()
    }

    /// Fans out connection lifecycle hooks to the topic handlers.
    pub fn settle(&mut self, now: Duration) {
        loop {
            let hooks = self.connection.take_hooks();
            if hooks.is_empty() {
                return;
            }
            for hook in hooks {
                trace!(?hook, "lifecycle hook");
                let Self {
                    config,
                    timers,
                    timeouts,
                    connection,
                    storage,
                    ids,
                    outbox,
                    records,
                    events,
                    rpc,
                    ..
                } = self;
                let mut cx = Services {
                    config,
                    now,
                    connection,
                    timers: timers.as_mut(),
                    timeouts,
                    storage: storage.as_ref(),
                    ids: ids.as_ref(),
                    outbox,
                };
                match hook {
                    LifecycleHook::Lost => {
                        cx.timeouts.on_connection_lost(&mut *cx.timers);
                        records.on_services_lost(&mut cx);
                        events.on_connection_lost(&mut cx);
                        rpc.on_connection_lost(&mut cx);
                        records.on_cores_lost(&mut cx);
                    }
                    LifecycleHook::Reestablished => {
                        records.on_reestablished(&mut cx);
                        events.on_reestablished(&mut cx);
                        rpc.on_reestablished(&mut cx);
                    }
                    LifecycleHook::ExitLimbo => {
                        records.on_exit_limbo(&mut cx);
                        events.on_exit_limbo();
                        rpc.on_exit_limbo(&mut cx);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, message: Message, now: Duration) {
        let (mut cx, handlers) = self.split(now);
        match message.topic() {
            Topic::Record => handlers.records.handle(message, &mut cx),
            Topic::Event => handlers.events.handle(message, &mut cx),
            Topic::Rpc => handlers.rpc.handle(message, &mut cx),
            topic => cx.outbox.warn(
                topic,
                ErrorKind::UnsolicitedMessage,
                format!("no handler for {}", message.action),
            ),
        }
    }

    fn run_task(&mut self, task: Task, now: Duration) {
        match task {
            Task::Heartbeat => self.with_connection(now, |c, env| c.on_heartbeat(env)),
            Task::Reconnect => self.with_connection(now, |c, env| c.on_reconnect(env)),
            Task::ExitLimbo => self.connection.on_exit_limbo(),
            Task::RequestTimeout(key) => {
                let Some(expired) = self.timeouts.fire(&key) else {
                    return;
                };
                let (mut cx, handlers) = self.split(now);
                cx.outbox.warn(
                    expired.message.topic(),
                    expired.kind,
                    format!("no response to {} ({key})", expired.message.action),
                );
                handlers.records.on_timeout(&expired, &mut cx);
            }
            Task::BulkFlush(kind) => {
                let (mut cx, handlers) = self.split(now);
                match kind {
                    BulkKind::Event => handlers.events.flush_bulk(&mut cx),
                    BulkKind::Rpc => handlers.rpc.flush_bulk(&mut cx),
                    _ => handlers.records.flush_bulk(kind, &mut cx),
                }
            }
            Task::DirtyFlush => {
                let (mut cx, handlers) = self.split(now);
                handlers.records.flush_dirty(&mut cx);
            }
            Task::LoadDirtyIndex => {
                let (mut cx, handlers) = self.split(now);
                handlers.records.load_dirty_index(&mut cx);
            }
            Task::LoadRecord { name, core } => {
                let (mut cx, handlers) = self.split(now);
                handlers.records.load_record(&name, core, &mut cx);
            }
            Task::DiscardRecord { name, core } => {
                let (mut cx, handlers) = self.split(now);
                handlers.records.discard(&name, core, &mut cx);
            }
            Task::MergeResolved {
                name,
                core,
                remote,
                outcome,
            } => {
                let (mut cx, handlers) = self.split(now);
                handlers
                    .records
                    .merge_resolved(&name, core, remote, outcome, &mut cx);
            }
            Task::Idle(f) => self.outbox.call(f),
        }
    }
}

impl std::fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCore")
            .field("state", &self.connection.state())
            .field("records", &self.records.len())
            .field("timeouts", &self.timeouts.len())
            .field("timers", &self.timers.pending())
            .finish()
    }
}
