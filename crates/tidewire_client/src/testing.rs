//! Test scaffolding: a connection wired to a mock network with manual time.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::ids::SequentialIdGenerator;
use crate::outbox::Outbox;
use crate::services::{Env, Services};
use crate::task::Task;
use crate::timeout_registry::TimeoutRegistry;
use crate::timer::{NativeTimerRegistry, TimerRegistry};
use crate::transport::{EndpointEvent, MockNetwork};
use std::sync::Arc;
use std::time::Duration;
use tidewire_protocol::{AuthAction, ConnectionAction, Message};
use tidewire_storage::InMemoryStore;
use tokio::sync::{mpsc, Notify};

pub(crate) struct Harness {
    pub config: ClientConfig,
    pub now: Duration,
    pub timers: NativeTimerRegistry<Task>,
    pub timeouts: TimeoutRegistry,
    pub connection: Connection,
    pub storage: InMemoryStore,
    pub ids: SequentialIdGenerator,
    pub outbox: Outbox,
    pub network: MockNetwork,
    rx: mpsc::UnboundedReceiver<EndpointEvent>,
}

impl Harness {
    pub fn new(config: ClientConfig) -> Self {
        let network = MockNetwork::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut timers = NativeTimerRegistry::new();
        let mut outbox = Outbox::default();
        let connection = {
            let mut env = Env {
                config: &config,
                now: Duration::ZERO,
                timers: &mut timers,
                outbox: &mut outbox,
            };
            Connection::new(
                "localhost",
                network.factory(),
                tx,
                Arc::new(Notify::new()),
                &mut env,
            )
            .unwrap()
        };
        Self {
            config,
            now: Duration::ZERO,
            timers,
            timeouts: TimeoutRegistry::new(),
            connection,
            storage: InMemoryStore::new(),
            ids: SequentialIdGenerator::default(),
            outbox,
            network,
            rx,
        }
    }

    /// A harness whose endpoint exists but has not opened yet.
    pub fn disconnected() -> Self {
        Self::new(ClientConfig::new())
    }

    /// A harness past the handshake with timers, outbox and wire cleared.
    pub fn connected() -> Self {
        Self::connected_with(ClientConfig::new())
    }

    pub fn connected_with(config: ClientConfig) -> Self {
        let mut harness = Self::new(config);
        harness.handshake();
        assert_eq!(harness.connection.state(), ConnectionState::Open);
        harness.timers.close();
        harness.outbox.take();
        harness.connection.take_hooks();
        harness.network.take_sent();
        harness
    }

    pub fn env(&mut self) -> Env<'_> {
        Env {
            config: &self.config,
            now: self.now,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
        }
    }

    /// Runs `f` with the connection and an environment borrowed from the harness.
    pub fn with_connection<R>(&mut self, f: impl FnOnce(&mut Connection, &mut Env<'_>) -> R) -> R {
        let mut env = Env {
            config: &self.config,
            now: self.now,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
        };
        f(&mut self.connection, &mut env)
    }

    pub fn services(&mut self) -> Services<'_> {
        Services {
            config: &self.config,
            now: self.now,
            connection: &mut self.connection,
            timers: &mut self.timers,
            timeouts: &mut self.timeouts,
            storage: &self.storage,
            ids: &self.ids,
            outbox: &mut self.outbox,
        }
    }

    /// Messages sent since the last call.
    pub fn sent(&mut self) -> Vec<Message> {
        self.network.take_sent()
    }

    /// Feeds pending transport events to the connection until none are left.
    /// Returns the messages meant for other topics.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut forwarded = Vec::new();
        while let Ok((id, event)) = self.rx.try_recv() {
            let mut env = Env {
                config: &self.config,
                now: self.now,
                timers: &mut self.timers,
                outbox: &mut self.outbox,
            };
            forwarded.extend(self.connection.handle_transport_event(id, event, &mut env));
        }
        forwarded
    }

    /// Opens the latest endpoint and completes the login.
    pub fn handshake(&mut self) {
        self.network.open();
        self.drain();
        self.network.deliver([Message::new(ConnectionAction::Accept)]);
        self.drain();
        if self.connection.state() == ConnectionState::AwaitingAuthentication {
            self.with_connection(|c, env| c.authenticate(None, Box::new(|_| {}), env));
        }
        self.network.deliver([Message::new(AuthAction::AuthSuccessful)]);
        self.drain();
    }

    /// Advances time and returns the tasks that came due.
    pub fn advance(&mut self, by: Duration) -> Vec<Task> {
        self.now += by;
        self.timers.take_due(self.now)
    }

    /// Advances time and runs connection tasks. Other tasks are returned.
    pub fn run_connection_timers(&mut self, by: Duration) -> Vec<Task> {
        let mut rest = Vec::new();
        for task in self.advance(by) {
            let mut env = Env {
                config: &self.config,
                now: self.now,
                timers: &mut self.timers,
                outbox: &mut self.outbox,
            };
            match task {
                Task::Heartbeat => self.connection.on_heartbeat(&mut env),
                Task::Reconnect => self.connection.on_reconnect(&mut env),
                Task::ExitLimbo => self.connection.on_exit_limbo(),
                other => rest.push(other),
            }
        }
        self.drain();
        rest
    }
}
