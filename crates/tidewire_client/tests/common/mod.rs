//! Shared setup for the integration tests: a client on a mock network with a
//! manual clock.

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tidewire_client::{
    Client, ClientConfig, ConnectionState, ManualClock, Message, MockNetwork, OfflineStore,
    SequentialIdGenerator,
};
use tidewire_protocol::{Action, AuthAction, ConnectionAction};
use tracing_subscriber::EnvFilter;

/// Routes client logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Setup {
    pub client: Client,
    pub network: MockNetwork,
    pub clock: ManualClock,
}

impl Setup {
    /// A client that is connected and logged in, with an empty wire log.
    pub fn connected(config: ClientConfig) -> Self {
        Self::connect(Self::new(config))
    }

    pub fn connected_with_storage(config: ClientConfig, storage: Arc<dyn OfflineStore>) -> Self {
        Self::connect(Self::with_storage(config, storage))
    }

    fn connect(setup: Self) -> Self {
        setup.client.login_with(Some(json!({"user": "tester"})), |_| {});
        setup.handshake();
        assert_eq!(setup.client.connection_state(), ConnectionState::Open);
        setup.network.take_sent();
        setup
    }

    /// A client whose first endpoint has not opened yet.
    pub fn new(config: ClientConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_storage(config: ClientConfig, storage: Arc<dyn OfflineStore>) -> Self {
        Self::build(config, Some(storage))
    }

    fn build(config: ClientConfig, storage: Option<Arc<dyn OfflineStore>>) -> Self {
        init_tracing();
        let network = MockNetwork::new();
        let clock = ManualClock::new();
        let mut builder = Client::builder("localhost:6020")
            .config(config)
            .transport(network.factory())
            .clock(Arc::new(clock.clone()))
            .id_generator(Arc::new(SequentialIdGenerator::new("id-")));
        if let Some(storage) = storage {
            builder = builder.storage(storage);
        }
        let client = builder.build().unwrap();
        Self {
            client,
            network,
            clock,
        }
    }

    /// Opens the newest endpoint and answers the challenge and login.
    pub fn handshake(&self) {
        self.network.open();
        self.client.pump();
        self.network.deliver([Message::new(ConnectionAction::Accept)]);
        self.client.pump();
        if self.client.connection_state() == ConnectionState::AwaitingAuthentication {
            self.client.login_with(None, |_| {});
        }
        self.network
            .deliver([Message::new(AuthAction::AuthSuccessful).with_data(json!({"id": 7}))]);
        self.client.pump();
    }

    /// Drops the connection and waits, one second at a time, for the next
    /// endpoint. Does not complete the handshake.
    pub fn lose_connection(&self) {
        let before = self.network.connections();
        self.network.drop_connection();
        self.client.pump();
        for _ in 0..30 {
            if self.network.connections() > before {
                return;
            }
            self.advance(Duration::from_secs(1));
        }
        panic!("client never reconnected");
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.client.pump();
    }

    /// Delivers messages from the server and lets the client process them.
    pub fn deliver(&self, messages: impl IntoIterator<Item = Message>) {
        self.network.deliver(messages);
        self.client.pump();
    }

    pub fn sent(&self) -> Vec<Message> {
        self.network.take_sent()
    }

    /// Sent messages with the given action.
    pub fn sent_with(&self, action: impl Into<Action>) -> Vec<Message> {
        let action = action.into();
        self.sent()
            .into_iter()
            .filter(|message| message.action == action)
            .collect()
    }
}
