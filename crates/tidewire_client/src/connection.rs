//! Connection lifecycle.
//!
//! The connection owns the transport endpoint and drives the handshake:
//! open, challenge, authenticate. It watches liveness with a heartbeat,
//! reconnects with linear backoff and tracks the limbo window in which
//! callers may buffer work after the connection dropped.
//!
//! Connection and auth topic messages are consumed here. Everything else is
//! returned to the client core for dispatch.

use crate::error::{ClientError, ClientResult};
use crate::outbox::{ClientEvent, ErrorKind};
use crate::services::Env;
use crate::state_machine::{StateMachine, Transition};
use crate::task::Task;
use crate::timer::TimerRef;
use crate::transport::{EndpointEvent, Transport, TransportEvent, TransportFactory, TransportSink};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tidewire_protocol::{
    Action, AuthAction, ConnectionAction, Message, ParseResult, Topic,
};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// State of the connection to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Closed,
    /// Setting up.
    Initialising,
    /// Waiting for the transport to open.
    AwaitingConnection,
    /// Waiting for the server to answer the challenge.
    Challenging,
    /// Moving to the endpoint the server redirected to.
    Redirecting,
    /// The server refused the challenge.
    ChallengeDenied,
    /// Waiting for credentials.
    AwaitingAuthentication,
    /// Waiting for the server to check credentials.
    Authenticating,
    /// The server refuses further authentication attempts.
    TooManyAuthAttempts,
    /// The server gave up waiting for credentials.
    AuthenticationTimeout,
    /// Connected and authenticated.
    Open,
    /// Connection lost, waiting to retry.
    Reconnecting,
    /// Going offline on request.
    Pausing,
    /// Offline on request.
    Offline,
    /// Shutting down.
    Closing,
}

impl ConnectionState {
    /// Returns the protocol name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Initialising => "INITIALISING",
            ConnectionState::AwaitingConnection => "AWAITING_CONNECTION",
            ConnectionState::Challenging => "CHALLENGING",
            ConnectionState::Redirecting => "REDIRECTING",
            ConnectionState::ChallengeDenied => "CHALLENGE_DENIED",
            ConnectionState::AwaitingAuthentication => "AWAITING_AUTHENTICATION",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
            ConnectionState::AuthenticationTimeout => "AUTHENTICATION_TIMEOUT",
            ConnectionState::Open => "OPEN",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Pausing => "PAUSING",
            ConnectionState::Offline => "OFFLINE",
            ConnectionState::Closing => "CLOSING",
        }
    }

    /// Returns true for states the connection never leaves on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionState::ChallengeDenied
                | ConnectionState::TooManyAuthAttempts
                | ConnectionState::AuthenticationTimeout
        )
    }

    fn fatal_error(&self) -> Option<ClientError> {
        match self {
            ConnectionState::ChallengeDenied => Some(ClientError::ChallengeDenied),
            ConnectionState::TooManyAuthAttempts => Some(ClientError::TooManyAuthAttempts),
            ConnectionState::AuthenticationTimeout => Some(ClientError::AuthenticationTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Initialised,
    Connected,
    Challenge,
    Authenticate,
    Reconnect,
    ChallengeAccepted,
    ChallengeDenied,
    Redirected,
    TooManyAuthAttempts,
    Close,
    Closed,
    UnsuccessfulLogin,
    SuccessfulLogin,
    Error,
    Lost,
    Pause,
    Offline,
    Resume,
    AuthenticationTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    AwaitingAuthentication,
}

use ConnectionState as S;

static TRANSITIONS: &[Transition<ConnectionState, Step, Hook>] = &[
    Transition::new(Step::Initialised, S::Closed, S::Initialising),
    Transition::new(Step::Connected, S::Initialising, S::AwaitingConnection),
    Transition::new(Step::Connected, S::Redirecting, S::AwaitingConnection),
    Transition::new(Step::Connected, S::Reconnecting, S::AwaitingConnection),
    Transition::new(Step::Challenge, S::AwaitingConnection, S::Challenging),
    Transition::new(Step::Redirected, S::Challenging, S::Redirecting),
    Transition::new(Step::ChallengeDenied, S::Challenging, S::ChallengeDenied),
    Transition::handled(
        Step::ChallengeAccepted,
        S::Challenging,
        S::AwaitingAuthentication,
        Hook::AwaitingAuthentication,
    ),
    Transition::new(Step::AuthenticationTimeout, S::AwaitingConnection, S::AuthenticationTimeout),
    Transition::new(Step::AuthenticationTimeout, S::AwaitingAuthentication, S::AuthenticationTimeout),
    Transition::new(Step::Authenticate, S::AwaitingAuthentication, S::Authenticating),
    Transition::new(Step::UnsuccessfulLogin, S::Authenticating, S::AwaitingAuthentication),
    Transition::new(Step::SuccessfulLogin, S::Authenticating, S::Open),
    Transition::new(Step::TooManyAuthAttempts, S::Authenticating, S::TooManyAuthAttempts),
    Transition::new(Step::TooManyAuthAttempts, S::AwaitingAuthentication, S::TooManyAuthAttempts),
    Transition::new(Step::Reconnect, S::Reconnecting, S::Reconnecting),
    Transition::new(Step::Closed, S::Closing, S::Closed),
    Transition::new(Step::Offline, S::Pausing, S::Offline),
    Transition::from_any(Step::Error, S::Reconnecting),
    Transition::from_any(Step::Lost, S::Reconnecting),
    Transition::from_any(Step::Resume, S::Reconnecting),
    Transition::from_any(Step::Pause, S::Pausing),
    Transition::from_any(Step::Close, S::Closing),
];

/// Connection events other components react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleHook {
    /// The connection dropped; the limbo window started.
    Lost,
    /// The connection is open again (or for the first time).
    Reestablished,
    /// The limbo window ran out before the connection came back.
    ExitLimbo,
}

/// Completion of a login.
pub(crate) type AuthCallback = Box<dyn FnOnce(ClientResult<Option<Value>>) + Send>;

/// Completion of a resume.
pub(crate) type ResumeCallback = Box<dyn FnOnce(ClientResult<()>) + Send>;

const INVALID_AUTHENTICATION_DETAILS: &str = "INVALID_AUTHENTICATION_DETAILS";

/// Normalizes a server url.
///
/// Bare hosts get the `ws://` scheme, and urls without a path get
/// `default_path`. Only `ws` and `wss` are accepted.
pub(crate) fn parse_url(url: &str, default_path: &str) -> ClientResult<String> {
    let url = url.trim();
    let url = if let Some(rest) = url.strip_prefix("//") {
        format!("ws://{rest}")
    } else if url.contains("://") {
        let scheme = url.split("://").next().unwrap_or_default();
        if scheme != "ws" && scheme != "wss" {
            return Err(ClientError::invalid_argument(format!(
                "only ws and wss are supported, got {scheme}"
            )));
        }
        url.to_string()
    } else {
        format!("ws://{url}")
    };

    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(ClientError::invalid_argument(format!("invalid url {url}")));
    };
    let (host, tail) = match rest.find(['/', '?']) {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    if host.is_empty() {
        return Err(ClientError::invalid_argument(format!("invalid url {url}")));
    }
    let tail = if tail.is_empty() || tail == "/" {
        default_path.to_string()
    } else if tail.starts_with('?') {
        format!("{default_path}{tail}")
    } else {
        tail.to_string()
    };
    Ok(format!("{scheme}://{host}{tail}"))
}

/// The connection to the server.
pub(crate) struct Connection {
    machine: StateMachine<ConnectionState, Step, Hook>,
    factory: Arc<dyn TransportFactory>,
    tx: mpsc::UnboundedSender<EndpointEvent>,
    notify: Arc<Notify>,
    endpoint: Option<Box<dyn Transport>>,
    endpoint_id: u64,
    endpoint_open: bool,
    original_url: String,
    url: String,
    auth_params: Option<Value>,
    auth_callback: Option<AuthCallback>,
    resume_callback: Option<ResumeCallback>,
    client_data: Option<Value>,
    heartbeat: Option<TimerRef>,
    reconnect: Option<TimerRef>,
    reconnect_attempt: u32,
    limbo: Option<TimerRef>,
    in_limbo: bool,
    is_reconnecting: bool,
    first_open: bool,
    lost_since_open: bool,
    hooks: Vec<LifecycleHook>,
}

impl Connection {
    /// Creates the connection and, unless lazy, opens the first endpoint.
    pub fn new(
        url: &str,
        factory: Arc<dyn TransportFactory>,
        tx: mpsc::UnboundedSender<EndpointEvent>,
        notify: Arc<Notify>,
        env: &mut Env<'_>,
    ) -> ClientResult<Self> {
        let original_url = parse_url(url, &env.config.path)?;
        let mut connection = Self {
            machine: StateMachine::new("connection", ConnectionState::Closed, TRANSITIONS),
            factory,
            tx,
            notify,
            endpoint: None,
            endpoint_id: 0,
            endpoint_open: false,
            url: original_url.clone(),
            original_url,
            auth_params: None,
            auth_callback: None,
            resume_callback: None,
            client_data: None,
            heartbeat: None,
            reconnect: None,
            reconnect_attempt: 0,
            limbo: None,
            in_limbo: true,
            is_reconnecting: false,
            first_open: true,
            lost_since_open: false,
            hooks: Vec::new(),
        };
        connection.transition(Step::Initialised, env);
        if !env.config.lazy_connect {
            connection.create_endpoint(env);
        }
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_in_limbo(&self) -> bool {
        self.in_limbo
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn client_data(&self) -> Option<&Value> {
        self.client_data.as_ref()
    }

    /// Takes the lifecycle hooks raised since the last call, in order.
    pub fn take_hooks(&mut self) -> Vec<LifecycleHook> {
        std::mem::take(&mut self.hooks)
    }

    /// Stores credentials and sends them as soon as the server accepts the
    /// challenge. Opens the first endpoint of a lazy connection.
    pub fn authenticate(
        &mut self,
        params: Option<Value>,
        callback: AuthCallback,
        env: &mut Env<'_>,
    ) {
        if let Some(err) = self.state().fatal_error() {
            env.outbox.error(
                Topic::Connection,
                ErrorKind::IsClosed,
                format!("cannot authenticate in state {}", self.state()),
            );
            env.outbox.call(move || callback(Err(err)));
            return;
        }

        self.auth_params = Some(params.unwrap_or_else(|| Value::Object(Map::new())));
        self.auth_callback = Some(callback);

        if self.state() == ConnectionState::AwaitingAuthentication {
            self.send_auth_params(env);
        }
        if self.endpoint.is_none() {
            self.create_endpoint(env);
        }
    }

    /// Sends a message. Messages are dropped, never queued, while the
    /// connection is shutting down or no endpoint is open.
    pub fn send_message(&mut self, message: Message, env: &mut Env<'_>) {
        if matches!(self.state(), ConnectionState::Closed | ConnectionState::Closing) {
            env.outbox.error(
                Topic::Connection,
                ErrorKind::IsClosed,
                format!("dropped {} while {}", message.action, self.state()),
            );
            return;
        }
        if !self.endpoint_open {
            trace!(action = %message.action, state = %self.state(), "no open endpoint, dropping message");
            return;
        }
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.send(&message);
        }
    }

    /// Announces the shutdown and closes the endpoint.
    pub fn close(&mut self, env: &mut Env<'_>) {
        env.cancel(&mut self.heartbeat);
        env.cancel(&mut self.reconnect);
        self.send_message(Message::new(ConnectionAction::Closing), env);
        self.transition(Step::Close, env);
        match self.endpoint.as_mut() {
            Some(endpoint) if self.endpoint_open => endpoint.close(),
            _ => {
                self.endpoint = None;
                self.transition(Step::Closed, env);
            }
        }
    }

    /// Goes offline until [`resume`](Self::resume).
    pub fn pause(&mut self, env: &mut Env<'_>) {
        self.transition(Step::Pause, env);
        env.cancel(&mut self.heartbeat);
        env.cancel(&mut self.reconnect);
        match self.endpoint.as_mut() {
            Some(endpoint) if self.endpoint_open => endpoint.close(),
            _ => {
                self.transition(Step::Offline, env);
            }
        }
    }

    /// Reconnects after a pause. `callback` receives the next auth result.
    pub fn resume(&mut self, callback: ResumeCallback, env: &mut Env<'_>) {
        self.transition(Step::Resume, env);
        self.resume_callback = Some(callback);
        self.try_reconnect(env);
    }

    /// Handles an event of endpoint `id`. Returns the messages other topics
    /// should see.
    pub fn handle_transport_event(
        &mut self,
        id: u64,
        event: TransportEvent,
        env: &mut Env<'_>,
    ) -> Vec<Message> {
        if id != self.endpoint_id {
            trace!(endpoint = id, current = self.endpoint_id, "ignoring stale endpoint event");
            return Vec::new();
        }
        match event {
            TransportEvent::Opened => self.on_open(env),
            TransportEvent::Closed => self.on_down(Step::Lost, env),
            TransportEvent::Error(error) => {
                env.outbox.error(
                    Topic::Connection,
                    ErrorKind::ConnectionError,
                    format!("{} unreachable: {error}", self.original_url),
                );
                self.on_down(Step::Error, env);
            }
            TransportEvent::Messages(results) => return self.on_messages(results, env),
        }
        Vec::new()
    }

    /// Heartbeat timer fired.
    pub fn on_heartbeat(&mut self, env: &mut Env<'_>) {
        self.heartbeat = None;
        if self.endpoint_open {
            self.check_heartbeat(env);
        }
    }

    /// Reconnect backoff elapsed.
    pub fn on_reconnect(&mut self, env: &mut Env<'_>) {
        self.reconnect = None;
        if matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        if self.state() != ConnectionState::Redirecting {
            self.url = self.original_url.clone();
        }
        self.create_endpoint(env);
    }

    /// Limbo timer fired.
    pub fn on_exit_limbo(&mut self) {
        self.limbo = None;
        if self.in_limbo {
            debug!("offline buffer window expired");
            self.in_limbo = false;
            self.hooks.push(LifecycleHook::ExitLimbo);
        }
    }

    fn transition(&mut self, step: Step, env: &mut Env<'_>) -> bool {
        let Some(change) = self.machine.transition(step) else {
            return false;
        };
        if change.changed() {
            self.on_state_changed(change.from, change.to, env);
        }
        if let Some(Hook::AwaitingAuthentication) = change.handler {
            if self.auth_params.is_some() {
                self.send_auth_params(env);
            }
        }
        true
    }

    fn on_state_changed(&mut self, from: ConnectionState, to: ConnectionState, env: &mut Env<'_>) {
        debug!(%from, %to, "connection state changed");
        env.outbox.event(ClientEvent::ConnectionStateChanged(to));

        if to == ConnectionState::Reconnecting {
            self.is_reconnecting = true;
            if from != ConnectionState::Closed && !self.lost_since_open {
                info!(url = %self.url, "connection lost");
                self.lost_since_open = true;
                self.in_limbo = true;
                self.hooks.push(LifecycleHook::Lost);
                env.cancel(&mut self.limbo);
                self.limbo = Some(env.schedule(env.config.offline_buffer_timeout, Task::ExitLimbo));
            }
        } else if to == ConnectionState::Open && (self.is_reconnecting || self.first_open) {
            info!(url = %self.url, "connection established");
            self.first_open = false;
            self.is_reconnecting = false;
            self.lost_since_open = false;
            self.in_limbo = false;
            env.cancel(&mut self.limbo);
            self.hooks.push(LifecycleHook::Reestablished);
        }
    }

    fn create_endpoint(&mut self, env: &mut Env<'_>) {
        if let Some(mut previous) = self.endpoint.take() {
            if self.endpoint_open {
                previous.close();
            }
        }
        self.endpoint_id += 1;
        self.endpoint_open = false;
        debug!(url = %self.url, endpoint = self.endpoint_id, "opening endpoint");
        let sink = TransportSink::new(self.endpoint_id, self.tx.clone(), Arc::clone(&self.notify));
        self.endpoint = Some(
            self.factory
                .connect(&self.url, env.config.heartbeat_interval, sink),
        );
    }

    fn on_open(&mut self, env: &mut Env<'_>) {
        self.endpoint_open = true;
        self.clear_reconnect(env);
        self.check_heartbeat(env);
        self.transition(Step::Connected, env);
        let challenge = Message::new(ConnectionAction::Challenge)
            .with_url(self.original_url.clone());
        let challenge = Message {
            protocol_version: Some(env.config.protocol_version.clone()),
            sdk_version: Some(env.config.sdk_version.clone()),
            sdk_type: Some(env.config.sdk_type.clone()),
            ..challenge
        };
        self.send_message(challenge, env);
        self.transition(Step::Challenge, env);
    }

    /// Shared path of transport close and transport error.
    fn on_down(&mut self, step: Step, env: &mut Env<'_>) {
        env.cancel(&mut self.heartbeat);
        self.endpoint_open = false;
        match self.state() {
            ConnectionState::Redirecting => self.create_endpoint(env),
            ConnectionState::Closing => {
                self.endpoint = None;
                self.transition(Step::Closed, env);
            }
            ConnectionState::Pausing => {
                self.transition(Step::Offline, env);
            }
            state if state.is_fatal() => {}
            ConnectionState::Closed | ConnectionState::Offline => {}
            _ => {
                self.transition(step, env);
                self.try_reconnect(env);
            }
        }
    }

    fn check_heartbeat(&mut self, env: &mut Env<'_>) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        let tolerance = env.config.heartbeat_interval * 2;
        let silence = endpoint.time_since_last_message();
        if silence > tolerance {
            env.cancel(&mut self.heartbeat);
            env.outbox.error(
                Topic::Connection,
                ErrorKind::HeartbeatTimeout,
                format!("no message for {silence:?}"),
            );
            endpoint.close();
            return;
        }
        self.heartbeat = Some(env.schedule(env.config.heartbeat_interval, Task::Heartbeat));
    }

    fn try_reconnect(&mut self, env: &mut Env<'_>) {
        if self.reconnect.is_some() {
            return;
        }
        let config = env.config;
        let policy = &config.reconnect;
        if self.reconnect_attempt < policy.max_attempts {
            let delay = policy.delay_for_attempt(self.reconnect_attempt);
            self.transition(Step::Reconnect, env);
            debug!(attempt = self.reconnect_attempt, ?delay, "scheduling reconnect");
            self.reconnect = Some(env.schedule(delay, Task::Reconnect));
            self.reconnect_attempt += 1;
            return;
        }

        warn!(attempts = self.reconnect_attempt, "giving up reconnecting");
        env.outbox
            .event(ClientEvent::MaxReconnectionAttemptsReached(self.reconnect_attempt));
        self.clear_reconnect(env);
        self.close(env);
    }

    fn clear_reconnect(&mut self, env: &mut Env<'_>) {
        env.cancel(&mut self.reconnect);
        self.reconnect_attempt = 0;
    }

    fn on_messages(&mut self, results: Vec<ParseResult>, env: &mut Env<'_>) -> Vec<Message> {
        let mut forward = Vec::new();
        for result in results {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    env.outbox.error(
                        Topic::Parser,
                        ErrorKind::MessageParseError,
                        format!("{}: {}", err.action, err.description),
                    );
                    continue;
                }
            };
            let action = message.action;
            match action {
                Action::Connection(action) => self.handle_connection_message(action, message, env),
                Action::Auth(action) => self.handle_auth_message(action, message, env),
                _ => forward.push(message),
            }
        }
        forward
    }

    fn handle_connection_message(
        &mut self,
        action: ConnectionAction,
        message: Message,
        env: &mut Env<'_>,
    ) {
        match action {
            ConnectionAction::Ping => {
                self.send_message(Message::new(ConnectionAction::Pong), env);
            }
            ConnectionAction::Accept => {
                self.transition(Step::ChallengeAccepted, env);
            }
            ConnectionAction::Reject => {
                warn!(url = %self.url, "connection challenge denied");
                self.transition(Step::ChallengeDenied, env);
                self.fail_auth(ClientError::ChallengeDenied, env);
                self.close_endpoint();
            }
            ConnectionAction::Redirect => {
                let Some(url) = message.url else {
                    env.outbox.error(
                        Topic::Connection,
                        ErrorKind::UnsolicitedMessage,
                        "redirect without url",
                    );
                    return;
                };
                info!(%url, "redirected");
                self.url = url;
                self.transition(Step::Redirected, env);
                self.close_endpoint();
            }
            ConnectionAction::AuthenticationTimeout => {
                self.transition(Step::AuthenticationTimeout, env);
                env.outbox.error(
                    Topic::Connection,
                    ErrorKind::AuthenticationTimeout,
                    "server stopped waiting for authentication",
                );
                self.fail_auth(ClientError::AuthenticationTimeout, env);
            }
            ConnectionAction::Pong => {}
            other => trace!(action = %other, "ignoring connection message"),
        }
    }

    fn handle_auth_message(&mut self, action: AuthAction, message: Message, env: &mut Env<'_>) {
        match action {
            AuthAction::TooManyAuthAttempts => {
                self.transition(Step::TooManyAuthAttempts, env);
                env.outbox.error(
                    Topic::Auth,
                    ErrorKind::TooManyAuthAttempts,
                    "too many authentication attempts",
                );
                self.fail_auth(ClientError::TooManyAuthAttempts, env);
            }
            AuthAction::AuthUnsuccessful => {
                self.transition(Step::UnsuccessfulLogin, env);
                let reason = message
                    .reason
                    .unwrap_or_else(|| INVALID_AUTHENTICATION_DETAILS.to_string());
                if let Some(callback) = self.resume_callback.take() {
                    let err = ClientError::AuthenticationFailed(reason.clone());
                    env.outbox.call(move || callback(Err(err)));
                }
                match self.auth_callback.take() {
                    Some(callback) => {
                        let err = ClientError::AuthenticationFailed(reason);
                        env.outbox.call(move || callback(Err(err)));
                    }
                    None => env.outbox.event(ClientEvent::ReauthenticationFailure(reason)),
                }
            }
            AuthAction::AuthSuccessful => {
                self.transition(Step::SuccessfulLogin, env);
                self.update_client_data(message.data, env);
                if let Some(callback) = self.resume_callback.take() {
                    env.outbox.call(move || callback(Ok(())));
                }
                if let Some(callback) = self.auth_callback.take() {
                    let data = self.client_data.clone();
                    env.outbox.call(move || callback(Ok(data)));
                }
            }
            AuthAction::Request => trace!("ignoring auth request from server"),
        }
    }

    fn fail_auth(&mut self, err: ClientError, env: &mut Env<'_>) {
        if let Some(callback) = self.resume_callback.take() {
            let err = err.clone();
            env.outbox.call(move || callback(Err(err)));
        }
        if let Some(callback) = self.auth_callback.take() {
            env.outbox.call(move || callback(Err(err)));
        }
    }

    fn close_endpoint(&mut self) {
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.close();
        }
    }

    fn send_auth_params(&mut self, env: &mut Env<'_>) {
        self.transition(Step::Authenticate, env);
        let mut message = Message::new(AuthAction::Request);
        message.data = self.auth_params.clone();
        self.send_message(message, env);
    }

    fn update_client_data(&mut self, data: Option<Value>, env: &mut Env<'_>) {
        let data = data.filter(|value| !value.is_null());
        let is_empty = match &data {
            None => true,
            Some(Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        };
        if self.client_data.is_none() && is_empty {
            return;
        }
        if self.client_data != data {
            self.client_data = data.clone();
            env.outbox.event(ClientEvent::ClientDataChanged(data));
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("url", &self.url)
            .field("endpoint", &self.endpoint_id)
            .field("in_limbo", &self.in_limbo)
            .field("reconnect_attempt", &self.reconnect_attempt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ReconnectConfig};
    use crate::outbox::OutboxItem;
    use crate::testing::Harness;
    use crate::timer::TimerRegistry;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn states(harness: &mut Harness) -> Vec<ConnectionState> {
        harness
            .outbox
            .take()
            .into_iter()
            .filter_map(|item| match item {
                OutboxItem::Event(ClientEvent::ConnectionStateChanged(state)) => Some(state),
                _ => None,
            })
            .collect()
    }

    fn run_calls(harness: &mut Harness) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        for item in harness.outbox.take() {
            match item {
                OutboxItem::Call(call) => call(),
                OutboxItem::Event(event) => events.push(event),
                OutboxItem::WithClient(_) => {}
            }
        }
        events
    }

    #[test]
    fn parses_urls() {
        assert_eq!(parse_url("localhost:6020", "/sync").unwrap(), "ws://localhost:6020/sync");
        assert_eq!(parse_url("//host", "/sync").unwrap(), "ws://host/sync");
        assert_eq!(parse_url("wss://host/", "/sync").unwrap(), "wss://host/sync");
        assert_eq!(parse_url("ws://host/custom", "/sync").unwrap(), "ws://host/custom");
        assert_eq!(parse_url("ws://host?x=1", "/sync").unwrap(), "ws://host/sync?x=1");
        assert!(parse_url("http://host", "/sync").is_err());
        assert!(parse_url("https://host", "/sync").is_err());
        assert!(parse_url("ws://", "/sync").is_err());
    }

    #[test]
    fn handshake_reaches_open() {
        let mut harness = Harness::disconnected();
        assert_eq!(harness.connection.state(), ConnectionState::Initialising);
        assert_eq!(harness.network.connections(), 1);

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        harness.with_connection(|c, env| {
            c.authenticate(
                Some(json!({"user": "ada"})),
                Box::new(move |r| *sink.lock() = Some(r)),
                env,
            )
        });

        harness.network.open();
        harness.drain();
        let challenge = harness.network.take_sent();
        assert_eq!(challenge[0].action, Action::Connection(ConnectionAction::Challenge));
        assert_eq!(challenge[0].sdk_type.as_deref(), Some("rust"));
        assert_eq!(harness.connection.state(), ConnectionState::Challenging);

        harness.network.deliver([Message::new(ConnectionAction::Accept)]);
        harness.drain();
        let auth = harness.network.take_sent();
        assert_eq!(auth[0].action, Action::Auth(AuthAction::Request));
        assert_eq!(auth[0].data, Some(json!({"user": "ada"})));
        assert_eq!(harness.connection.state(), ConnectionState::Authenticating);

        harness.network.deliver([
            Message::new(AuthAction::AuthSuccessful).with_data(json!({"role": "admin"}))
        ]);
        harness.drain();
        assert!(harness.connection.is_connected());
        assert!(!harness.connection.is_in_limbo());
        assert_eq!(harness.connection.take_hooks(), vec![LifecycleHook::Reestablished]);

        let events = run_calls(&mut harness);
        assert!(events.contains(&ClientEvent::ClientDataChanged(Some(json!({"role": "admin"})))));
        assert_eq!(*result.lock(), Some(Ok(Some(json!({"role": "admin"})))));
    }

    #[test]
    fn unsuccessful_login_can_retry() {
        let mut harness = Harness::disconnected();
        harness.network.open();
        harness.network.deliver([Message::new(ConnectionAction::Accept)]);
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::AwaitingAuthentication);

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        harness.with_connection(|c, env| {
            c.authenticate(None, Box::new(move |r| *sink.lock() = Some(r)), env)
        });
        harness.network.deliver([Message::new(AuthAction::AuthUnsuccessful)]);
        harness.drain();
        run_calls(&mut harness);

        assert_eq!(harness.connection.state(), ConnectionState::AwaitingAuthentication);
        assert_eq!(
            *result.lock(),
            Some(Err(ClientError::AuthenticationFailed(
                INVALID_AUTHENTICATION_DETAILS.into()
            )))
        );
        assert!(ClientError::AuthenticationFailed(String::new()).is_retryable());
    }

    #[test]
    fn rejected_challenge_is_final() {
        let mut harness = Harness::disconnected();
        harness.network.open();
        harness.network.deliver([Message::new(ConnectionAction::Reject)]);
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::ChallengeDenied);
        assert!(harness.network.is_closed());

        // The close that follows does not trigger a reconnect.
        assert_eq!(harness.timers.pending(), 0);
        assert_eq!(harness.connection.state(), ConnectionState::ChallengeDenied);

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        harness.outbox.take();
        harness.with_connection(|c, env| {
            c.authenticate(None, Box::new(move |r| *sink.lock() = Some(r)), env)
        });
        run_calls(&mut harness);
        assert_eq!(*result.lock(), Some(Err(ClientError::ChallengeDenied)));
    }

    #[test]
    fn too_many_auth_attempts_is_final() {
        let mut harness = Harness::disconnected();
        harness.network.open();
        harness.network.deliver([Message::new(ConnectionAction::Accept)]);
        harness.drain();
        harness.with_connection(|c, env| c.authenticate(None, Box::new(|_| {}), env));
        harness.network.deliver([Message::new(AuthAction::TooManyAuthAttempts)]);
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::TooManyAuthAttempts);

        harness.network.drop_connection();
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::TooManyAuthAttempts);
    }

    #[test]
    fn redirect_opens_new_endpoint_then_reconnects_to_original() {
        let mut harness = Harness::disconnected();
        harness.network.open();
        harness.network.deliver([
            Message::new(ConnectionAction::Redirect).with_url("ws://other/sync")
        ]);
        // Closing the old endpoint leads to the redirected one.
        harness.drain();
        assert_eq!(harness.network.urls().last().map(String::as_str), Some("ws://other/sync"));

        harness.network.open();
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::Challenging);

        harness.network.drop_connection();
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::Reconnecting);
        harness.run_connection_timers(Duration::ZERO);
        assert_eq!(
            harness.network.urls().last().map(String::as_str),
            Some("ws://localhost/tidewire")
        );
    }

    #[test]
    fn lost_fires_once_per_outage_and_limbo_expires() {
        let mut harness = Harness::connected();
        harness.network.drop_connection();
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::Reconnecting);
        assert!(harness.connection.is_in_limbo());
        assert_eq!(harness.connection.take_hooks(), vec![LifecycleHook::Lost]);

        // Reconnect attempt fails again: no second loss.
        harness.run_connection_timers(Duration::ZERO);
        harness.network.fail("refused");
        harness.drain();
        assert!(harness.connection.take_hooks().is_empty());

        harness.run_connection_timers(harness.config.offline_buffer_timeout);
        assert!(!harness.connection.is_in_limbo());
        assert_eq!(harness.connection.take_hooks(), vec![LifecycleHook::ExitLimbo]);
    }

    #[test]
    fn reconnect_reestablishes_and_resets_attempts() {
        let mut harness = Harness::connected();
        harness.network.drop_connection();
        harness.drain();
        harness.connection.take_hooks();

        harness.run_connection_timers(Duration::ZERO);
        assert_eq!(harness.network.connections(), 2);
        harness.handshake();
        assert!(harness.connection.is_connected());
        assert_eq!(harness.connection.take_hooks(), vec![LifecycleHook::Reestablished]);
        assert_eq!(harness.connection.reconnect_attempt, 0);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let config = ClientConfig::new().with_reconnect(
            ReconnectConfig::new(3).with_interval_increment(Duration::from_millis(10)),
        );
        let mut harness = Harness::new(config);
        harness.network.open();
        harness.drain();
        harness.outbox.take();

        let mut reached = Vec::new();
        for _ in 0..4 {
            harness.network.fail("refused");
            harness.drain();
            for event in harness.outbox.events() {
                if let ClientEvent::MaxReconnectionAttemptsReached(n) = event {
                    reached.push(n);
                }
            }
            harness.outbox.take();
            harness.run_connection_timers(Duration::from_millis(100));
        }

        assert_eq!(reached, vec![3]);
        assert_eq!(harness.connection.state(), ConnectionState::Closed);
        assert_eq!(harness.network.connections(), 4);
    }

    #[test]
    fn heartbeat_timeout_closes_endpoint() {
        let mut harness = Harness::disconnected();
        harness.network.open();
        harness.drain();
        harness.outbox.take();

        harness.network.set_silence(harness.config.heartbeat_interval * 3);
        harness.run_connection_timers(harness.config.heartbeat_interval);
        assert!(harness.network.is_closed());
        assert!(harness
            .outbox
            .events()
            .iter()
            .any(|e| matches!(e, ClientEvent::Error { kind: ErrorKind::HeartbeatTimeout, .. })));

        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn ping_is_answered() {
        let mut harness = Harness::connected();
        harness.network.deliver([Message::new(ConnectionAction::Ping)]);
        harness.drain();
        let sent = harness.network.take_sent();
        assert_eq!(sent, vec![Message::new(ConnectionAction::Pong)]);
    }

    #[test]
    fn close_goes_through_closing() {
        let mut harness = Harness::connected();
        harness.with_connection(|c, env| c.close(env));
        assert_eq!(harness.connection.state(), ConnectionState::Closing);
        assert_eq!(
            harness.network.take_sent(),
            vec![Message::new(ConnectionAction::Closing)]
        );
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::Closed);

        harness.with_connection(|c, env| {
            c.send_message(Message::new(ConnectionAction::Ping), env)
        });
        assert!(harness
            .outbox
            .events()
            .iter()
            .any(|e| matches!(e, ClientEvent::Error { kind: ErrorKind::IsClosed, .. })));
    }

    #[test]
    fn pause_and_resume() {
        let mut harness = Harness::connected();
        harness.with_connection(|c, env| c.pause(env));
        harness.drain();
        assert_eq!(harness.connection.state(), ConnectionState::Offline);
        assert_eq!(
            states(&mut harness),
            vec![ConnectionState::Pausing, ConnectionState::Offline]
        );

        let resumed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&resumed);
        harness.with_connection(|c, env| {
            c.resume(Box::new(move |r| *sink.lock() = Some(r)), env)
        });
        assert_eq!(harness.connection.state(), ConnectionState::Reconnecting);
        harness.run_connection_timers(Duration::ZERO);
        harness.handshake();
        run_calls(&mut harness);
        assert_eq!(*resumed.lock(), Some(Ok(())));
    }

    #[test]
    fn parse_errors_are_reported() {
        let mut harness = Harness::connected();
        harness.network.deliver_results(vec![Err(tidewire_protocol::ParseError::new(
            tidewire_protocol::ParserAction::MessageParseError,
            b"junk",
            "bad frame",
        ))]);
        let forwarded = harness.drain();
        assert!(forwarded.is_empty());
        assert!(harness.outbox.events().iter().any(|e| matches!(
            e,
            ClientEvent::Error { topic: Topic::Parser, kind: ErrorKind::MessageParseError, .. }
        )));
    }

    #[test]
    fn other_topics_are_forwarded() {
        let mut harness = Harness::connected();
        let emit = Message::named(tidewire_protocol::EventAction::Emit, "chat");
        harness.network.deliver([emit.clone()]);
        assert_eq!(harness.drain(), vec![emit]);
    }
}
