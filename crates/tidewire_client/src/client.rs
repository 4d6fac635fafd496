//! The public client facade.
//!
//! [`Client`] is a cheap handle around the shared engine. Every call locks
//! the engine, lets it run until quiescent, and then executes the callbacks
//! and events it produced with the lock released, so callbacks may call back
//! into the client.

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::engine::{ClientCore, CoreParts, Handlers};
use crate::error::{ClientError, ClientResult};
use crate::event::Events;
use crate::ids::{IdGenerator, UidGenerator};
use crate::outbox::{ClientEvent, OutboxItem};
use crate::record::{MergeStrategy, Records};
use crate::rpc::Rpc;
use crate::services::Services;
use crate::transport::TransportFactory;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidewire_storage::{InMemoryStore, OfflineStore};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type EventListener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Longest the driver sleeps when no timer is pending.
const IDLE_WAKEUP: Duration = Duration::from_secs(60);

struct Inner {
    core: Mutex<ClientCore>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    listeners: Mutex<Vec<EventListener>>,
    closed: AtomicBool,
}

/// A handle to a real-time sync client.
///
/// Clones share the same connection, records and subscriptions.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Starts building a client for `url`.
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Authenticates, opening the connection first if it is lazy.
    ///
    /// `callback` receives the client data sent by the server.
    pub fn login_with(
        &self,
        params: Option<Value>,
        callback: impl FnOnce(ClientResult<Option<Value>>) + Send + 'static,
    ) {
        self.with_core(|core, now| core.login(params, Box::new(callback), now));
    }

    /// Authenticates and waits for the result.
    pub async fn login(&self, params: Option<Value>) -> ClientResult<Option<Value>> {
        completion(|done| {
            self.login_with(params, done);
            Ok(())
        })
        .await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.core.lock().connection_state()
    }

    /// Client data received with the last successful login.
    pub fn client_data(&self) -> Option<Value> {
        self.inner.core.lock().client_data().cloned()
    }

    /// Goes offline until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.with_core(|core, now| core.pause(now));
    }

    /// Reconnects after a pause. `callback` receives the next auth result.
    pub fn resume_with(&self, callback: impl FnOnce(ClientResult<()>) + Send + 'static) {
        self.with_core(|core, now| core.resume(Box::new(callback), now));
    }

    /// Reconnects after a pause and waits for re-authentication.
    pub async fn resume(&self) -> ClientResult<()> {
        completion(|done| {
            self.resume_with(done);
            Ok(())
        })
        .await
    }

    /// Persists dirty records and closes the connection for good.
    pub fn close(&self) {
        info!("closing client");
        self.inner.closed.store(true, Ordering::SeqCst);
        self.with_core(|core, now| core.close(now));
    }

    /// Registers a listener for client events.
    pub fn on_event(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    /// The record API.
    pub fn records(&self) -> Records {
        Records::new(self.clone())
    }

    /// The event API.
    pub fn events(&self) -> Events {
        Events::new(self.clone())
    }

    /// The RPC API.
    pub fn rpc(&self) -> Rpc {
        Rpc::new(self.clone())
    }

    /// Processes pending transport events and due timers. Returns true if
    /// anything ran.
    pub fn pump(&self) -> bool {
        let (worked, items) = {
            let mut core = self.inner.core.lock();
            let now = self.inner.clock.now();
            core.settle(now);
            let worked = core.pump(now);
            (worked, core.take_outbox())
        };
        self.run(items);
        worked
    }

    /// Time until the next timer may fire.
    pub fn next_wakeup(&self) -> Option<Duration> {
        let now = self.inner.clock.now();
        self.inner.core.lock().next_wakeup(now)
    }

    /// Drives the client on the current tokio runtime.
    ///
    /// The driver wakes on transport activity or when the next timer is due.
    /// It stops once the client is closed or every handle is dropped.
    pub fn spawn_driver(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let notify = Arc::clone(&self.inner.notify);
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = Client { inner };
                client.pump();
                if client.inner.closed.load(Ordering::SeqCst)
                    && client.connection_state() == ConnectionState::Closed
                {
                    debug!("client closed, driver stopping");
                    break;
                }
                let wakeup = client.next_wakeup().unwrap_or(IDLE_WAKEUP);
                drop(client);
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(wakeup) => {}
                }
            }
        })
    }

    /// Locks the engine, runs `f`, lets the engine settle and then runs the
    /// work it produced with the lock released.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut ClientCore, Duration) -> R) -> R {
        let (result, items) = {
            let mut core = self.inner.core.lock();
            let now = self.inner.clock.now();
            let result = f(&mut core, now);
            core.settle(now);
            core.pump(now);
            (result, core.take_outbox())
        };
        self.run(items);
        self.inner.notify.notify_one();
        result
    }

    /// Like [`with_core`](Self::with_core), with the services and topic
    /// handlers split out.
    pub(crate) fn with_services<R>(
        &self,
        f: impl FnOnce(&mut Services<'_>, Handlers<'_>) -> R,
    ) -> R {
        self.with_core(|core, now| {
            let (mut cx, handlers) = core.split(now);
            f(&mut cx, handlers)
        })
    }

    /// Reads engine state without running anything.
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&ClientCore) -> R) -> R {
        f(&self.inner.core.lock())
    }

    fn run(&self, items: Vec<OutboxItem>) {
        if items.is_empty() {
            return;
        }
        for item in items {
            match item {
                OutboxItem::Event(event) => {
                    let listeners = self.inner.listeners.lock().clone();
                    for listener in listeners {
                        listener(&event);
                    }
                }
                OutboxItem::Call(f) => f(),
                OutboxItem::WithClient(f) => f(self),
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Turns a callback-style operation into a future.
///
/// A callback that is dropped without being called means the client went
/// away, which is reported as [`ClientError::ConnectionClosed`].
pub(crate) async fn completion<T, F>(start: F) -> ClientResult<T>
where
    T: Send + 'static,
    F: FnOnce(Box<dyn FnOnce(ClientResult<T>) + Send>) -> ClientResult<()>,
{
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }))?;
    rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
}

/// Builds a [`Client`].
pub struct ClientBuilder {
    url: String,
    config: ClientConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    storage: Option<Arc<dyn OfflineStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    merge_strategy: Option<MergeStrategy>,
}

impl ClientBuilder {
    /// Creates a builder with the default configuration and a
    /// remote-wins merge strategy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: ClientConfig::default(),
            factory: None,
            storage: None,
            clock: None,
            ids: None,
            merge_strategy: Some(MergeStrategy::remote_wins()),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how endpoints are opened. Required.
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets the offline store. Only used with `offline_enabled`.
    pub fn storage(mut self, storage: Arc<dyn OfflineStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Sets the strategy used when no name or pattern strategy applies.
    /// `None` leaves such conflicts unresolved.
    pub fn merge_strategy(mut self, strategy: Option<MergeStrategy>) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Creates the client. Unless `lazy_connect` is set, the first endpoint
    /// starts opening right away.
    pub fn build(self) -> ClientResult<Client> {
        let factory = self
            .factory
            .ok_or_else(|| ClientError::invalid_argument("a transport factory is required"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let notify = Arc::new(Notify::new());
        let parts = CoreParts {
            url: self.url,
            factory,
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            ids: self.ids.unwrap_or_else(|| Arc::new(UidGenerator::new())),
            merge_strategy: self.merge_strategy,
            notify: Arc::clone(&notify),
        };
        let core = ClientCore::new(self.config, parts, clock.now())?;
        let client = Client {
            inner: Arc::new(Inner {
                core: Mutex::new(core),
                clock,
                notify,
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        client.pump();
        Ok(client)
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::MockNetwork;
    use tidewire_protocol::{AuthAction, ConnectionAction, Message};

    fn client(network: &MockNetwork, clock: &ManualClock) -> Client {
        Client::builder("localhost:6020")
            .transport(network.factory())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_a_transport() {
        let err = Client::builder("localhost").build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn build_rejects_http_urls() {
        let network = MockNetwork::new();
        let err = Client::builder("http://localhost")
            .transport(network.factory())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn login_reports_client_data() {
        let network = MockNetwork::new();
        let clock = ManualClock::new();
        let client = client(&network, &clock);
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        client.login_with(Some(serde_json::json!({"user": "ada"})), move |r| {
            *sink.lock() = Some(r)
        });

        network.open();
        network.deliver([Message::new(ConnectionAction::Accept)]);
        client.pump();
        assert_eq!(client.connection_state(), ConnectionState::Authenticating);

        let mut success = Message::new(AuthAction::AuthSuccessful);
        success.data = Some(serde_json::json!({"id": 7}));
        network.deliver([success]);
        client.pump();

        assert_eq!(client.connection_state(), ConnectionState::Open);
        assert_eq!(*result.lock(), Some(Ok(Some(serde_json::json!({"id": 7})))));
        assert_eq!(client.client_data(), Some(serde_json::json!({"id": 7})));
    }

    #[test]
    fn events_reach_listeners_outside_the_lock() {
        let network = MockNetwork::new();
        let clock = ManualClock::new();
        let client = client(&network, &clock);
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let handle = client.clone();
        client.on_event(move |event| {
            if let ClientEvent::ConnectionStateChanged(state) = event {
                // Calling back in must not deadlock.
                handle.connection_state();
                sink.lock().push(*state);
            }
        });
        network.open();
        client.pump();
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::AwaitingConnection, ConnectionState::Challenging]
        );
    }

    #[test]
    fn next_wakeup_follows_timers() {
        let network = MockNetwork::new();
        let clock = ManualClock::new();
        let client = client(&network, &clock);
        assert_eq!(client.next_wakeup(), None);

        network.fail("refused");
        client.pump();
        assert_eq!(client.connection_state(), ConnectionState::Reconnecting);
        assert!(client.next_wakeup().is_some());
    }

    #[test]
    fn close_closes_the_endpoint() {
        let network = MockNetwork::new();
        let clock = ManualClock::new();
        let client = client(&network, &clock);
        network.open();
        client.pump();
        client.close();
        assert!(network.is_closed());
        // The mock endpoint reports the close before `close` returns.
        assert_eq!(client.connection_state(), ConnectionState::Closed);
        client.pump();
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn async_login_resolves_through_the_driver() {
        let network = MockNetwork::new();
        let client = Client::builder("localhost")
            .transport(network.factory())
            .build()
            .unwrap();
        let driver = client.spawn_driver();
        network.open();
        network.deliver([Message::new(ConnectionAction::Accept)]);
        let login = tokio::spawn({
            let client = client.clone();
            async move { client.login(None).await }
        });
        for _ in 0..200 {
            if client.connection_state() == ConnectionState::Authenticating {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.connection_state(), ConnectionState::Authenticating);
        network.deliver([Message::new(AuthAction::AuthSuccessful)]);
        let result = tokio::time::timeout(Duration::from_secs(5), login)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(None));
        client.close();
        network.drop_connection();
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .unwrap()
            .unwrap();
    }
}
