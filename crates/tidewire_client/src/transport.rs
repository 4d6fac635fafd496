//! Transport layer abstraction.
//!
//! The client never touches sockets. A [`TransportFactory`] opens an endpoint
//! for a url and reports what happens to it through a [`TransportSink`]. The
//! client drains those events on its own schedule, so transports may run on
//! any thread.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tidewire_protocol::{Message, ParseResult};
use tokio::sync::{mpsc, Notify};

/// Something that happened to an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The endpoint is connected.
    Opened,
    /// The endpoint closed.
    Closed,
    /// The endpoint failed.
    Error(String),
    /// Messages arrived, already decoded.
    Messages(Vec<ParseResult>),
}

pub(crate) type EndpointEvent = (u64, TransportEvent);

/// Delivers events of one endpoint to the client.
#[derive(Debug, Clone)]
pub struct TransportSink {
    endpoint: u64,
    tx: mpsc::UnboundedSender<EndpointEvent>,
    notify: Arc<Notify>,
}

impl TransportSink {
    pub(crate) fn new(
        endpoint: u64,
        tx: mpsc::UnboundedSender<EndpointEvent>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            endpoint,
            tx,
            notify,
        }
    }

    /// Reports an event. Events sent after the client is gone are dropped.
    pub fn send(&self, event: TransportEvent) {
        if self.tx.send((self.endpoint, event)).is_ok() {
            self.notify.notify_one();
        }
    }

    /// Reports that the endpoint connected.
    pub fn opened(&self) {
        self.send(TransportEvent::Opened);
    }

    /// Reports that the endpoint closed.
    pub fn closed(&self) {
        self.send(TransportEvent::Closed);
    }

    /// Reports a transport failure.
    pub fn error(&self, error: impl Into<String>) {
        self.send(TransportEvent::Error(error.into()));
    }

    /// Reports decoded messages.
    pub fn messages(&self, messages: Vec<ParseResult>) {
        self.send(TransportEvent::Messages(messages));
    }
}

/// An open (or opening) endpoint.
pub trait Transport: Send {
    /// Sends a message. Encoding is up to the transport.
    fn send(&mut self, message: &Message);

    /// Closes the endpoint. The transport reports [`TransportEvent::Closed`]
    /// once it is down.
    fn close(&mut self);

    /// Time since anything was received.
    fn time_since_last_message(&self) -> Duration;
}

/// Opens endpoints.
pub trait TransportFactory: Send + Sync {
    /// Starts connecting to `url`. Progress is reported through `sink`.
    fn connect(
        &self,
        url: &str,
        heartbeat_interval: Duration,
        sink: TransportSink,
    ) -> Box<dyn Transport>;
}

#[derive(Debug)]
struct MockEndpoint {
    url: String,
    sink: TransportSink,
    sent: Vec<Message>,
    closed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    endpoints: Vec<MockEndpoint>,
    silence: Duration,
}

/// A scriptable in-memory network for testing.
///
/// Every endpoint opened through [`MockNetwork::factory`] is recorded. Tests
/// drive the latest endpoint with [`open`](Self::open),
/// [`deliver`](Self::deliver), [`fail`](Self::fail) and
/// [`drop_connection`](Self::drop_connection), and inspect what the client
/// sent with [`sent`](Self::sent).
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<MockState>>,
}

impl MockNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a factory that opens endpoints on this network.
    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(MockTransportFactory {
            network: self.clone(),
        })
    }

    /// Number of endpoints opened so far.
    pub fn connections(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Urls of every endpoint, oldest first.
    pub fn urls(&self) -> Vec<String> {
        self.state
            .lock()
            .endpoints
            .iter()
            .map(|endpoint| endpoint.url.clone())
            .collect()
    }

    /// Returns true if the latest endpoint was closed by the client.
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .endpoints
            .last()
            .map_or(false, |endpoint| endpoint.closed)
    }

    fn latest_sink(&self) -> Option<TransportSink> {
        self.state
            .lock()
            .endpoints
            .last()
            .map(|endpoint| endpoint.sink.clone())
    }

    /// Opens the latest endpoint.
    pub fn open(&self) {
        if let Some(sink) = self.latest_sink() {
            sink.opened();
        }
    }

    /// Delivers messages to the latest endpoint.
    pub fn deliver(&self, messages: impl IntoIterator<Item = Message>) {
        self.deliver_results(messages.into_iter().map(Ok).collect());
    }

    /// Delivers raw parse results, including parse errors.
    pub fn deliver_results(&self, results: Vec<ParseResult>) {
        if let Some(sink) = self.latest_sink() {
            sink.messages(results);
        }
    }

    /// Fails the latest endpoint.
    pub fn fail(&self, error: &str) {
        if let Some(sink) = self.latest_sink() {
            sink.error(error);
        }
    }

    /// Closes the latest endpoint from the remote side.
    pub fn drop_connection(&self) {
        if let Some(sink) = self.latest_sink() {
            sink.closed();
        }
    }

    /// Sets what every endpoint reports as time since the last message.
    pub fn set_silence(&self, silence: Duration) {
        self.state.lock().silence = silence;
    }

    /// Every message sent by the client, oldest first.
    pub fn sent(&self) -> Vec<Message> {
        self.state
            .lock()
            .endpoints
            .iter()
            .flat_map(|endpoint| endpoint.sent.iter().cloned())
            .collect()
    }

    /// Returns and forgets every message sent so far.
    pub fn take_sent(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        state
            .endpoints
            .iter_mut()
            .flat_map(|endpoint| std::mem::take(&mut endpoint.sent))
            .collect()
    }
}

/// Factory that opens [`MockTransport`] endpoints on a [`MockNetwork`].
#[derive(Debug)]
pub struct MockTransportFactory {
    network: MockNetwork,
}

impl TransportFactory for MockTransportFactory {
    fn connect(
        &self,
        url: &str,
        _heartbeat_interval: Duration,
        sink: TransportSink,
    ) -> Box<dyn Transport> {
        let mut state = self.network.state.lock();
        state.endpoints.push(MockEndpoint {
            url: url.to_string(),
            sink,
            sent: Vec::new(),
            closed: false,
        });
        Box::new(MockTransport {
            network: self.network.clone(),
            index: state.endpoints.len() - 1,
        })
    }
}

/// One endpoint of a [`MockNetwork`].
#[derive(Debug)]
pub struct MockTransport {
    network: MockNetwork,
    index: usize,
}

impl Transport for MockTransport {
    fn send(&mut self, message: &Message) {
        let mut state = self.network.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(self.index) {
            endpoint.sent.push(message.clone());
        }
    }

    fn close(&mut self) {
        let sink = {
            let mut state = self.network.state.lock();
            let Some(endpoint) = state.endpoints.get_mut(self.index) else {
                return;
            };
            if endpoint.closed {
                return;
            }
            endpoint.closed = true;
            endpoint.sink.clone()
        };
        sink.closed();
    }

    fn time_since_last_message(&self) -> Duration {
        self.network.state.lock().silence
    }
}
