//! Remote procedure calls.
//!
//! A client can provide procedures other clients invoke, and make requests
//! that the server routes to a provider. Requests are correlated by id; a
//! lost connection fails every outstanding request with
//! [`ClientError::Offline`].

use crate::bulk::{BulkKind, BulkSubscription};
use crate::client::{completion, Client};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::outbox::ErrorKind;
use crate::services::Services;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tidewire_protocol::{Action, Message, RpcAction, Topic};
use tracing::{debug, trace};

/// Serves a procedure: receives the request data and the response handle.
pub type Provider = Arc<dyn Fn(&Value, RpcResponse) + Send + Sync>;

/// Completion of a request.
pub(crate) type MakeCallback = Box<dyn FnOnce(ClientResult<Value>) + Send>;

struct Outstanding {
    name: String,
    callback: MakeCallback,
}

struct Queued {
    correlation_id: String,
    name: String,
    data: Option<Value>,
    callback: MakeCallback,
}

/// Providers, outstanding requests and requests made in limbo.
pub(crate) struct RpcHandler {
    rpcs: HashMap<String, Outstanding>,
    providers: HashMap<String, Provider>,
    limbo: Vec<Queued>,
    bulk: BulkSubscription,
}

impl RpcHandler {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            rpcs: HashMap::new(),
            providers: HashMap::new(),
            limbo: Vec::new(),
            bulk: BulkSubscription::new(BulkKind::Rpc, config.subscription_interval),
        }
    }

    pub fn provide(&mut self, name: &str, provider: Provider, cx: &mut Services<'_>) -> ClientResult<()> {
        validate(name)?;
        if self.providers.contains_key(name) {
            return Err(ClientError::invalid_argument(format!(
                "rpc {name} is already provided"
            )));
        }
        self.providers.insert(name.to_string(), provider);
        if cx.is_connected() {
            self.bulk.subscribe(name, cx);
        }
        Ok(())
    }

    pub fn unprovide(&mut self, name: &str, cx: &mut Services<'_>) -> ClientResult<()> {
        validate(name)?;
        if self.providers.remove(name).is_none() {
            cx.outbox.warn(
                Topic::Rpc,
                ErrorKind::NotProviding,
                format!("rpc {name} is not provided"),
            );
            return Ok(());
        }
        if cx.is_connected() {
            self.bulk.unsubscribe(name, cx);
        }
        Ok(())
    }

    /// Sends a request, queues it while in limbo, or fails it as offline.
    pub fn make(
        &mut self,
        name: &str,
        data: Option<Value>,
        callback: MakeCallback,
        cx: &mut Services<'_>,
    ) -> ClientResult<()> {
        validate(name)?;
        let correlation_id = cx.ids.next_id();
        if cx.is_connected() {
            self.send_request(correlation_id, name.to_string(), data, callback, cx);
        } else if cx.in_limbo() {
            trace!(%name, %correlation_id, "queueing rpc while in limbo");
            self.limbo.push(Queued {
                correlation_id,
                name: name.to_string(),
                data,
                callback,
            });
        } else {
            cx.outbox.call(move || callback(Err(ClientError::Offline)));
        }
        Ok(())
    }

    fn send_request(
        &mut self,
        correlation_id: String,
        name: String,
        data: Option<Value>,
        callback: MakeCallback,
        cx: &mut Services<'_>,
    ) {
        let mut message =
            Message::named(RpcAction::Request, name.clone()).with_correlation_id(correlation_id.clone());
        if let Some(data) = data {
            message = message.with_data(data);
        }
        cx.send(message);
        self.rpcs.insert(correlation_id, Outstanding { name, callback });
    }

    pub fn handle(&mut self, message: Message, cx: &mut Services<'_>) {
        let Action::Rpc(action) = message.action else {
            return;
        };
        if action == RpcAction::Request {
            self.respond_to(message, cx);
            return;
        }
        if message.is_ack {
            cx.remove_timeout(&message);
            return;
        }
        let original = match message.original_action {
            Some(Action::Rpc(original)) => Some(original),
            _ => None,
        };
        match action {
            RpcAction::MessageDenied | RpcAction::MessagePermissionError => match original {
                Some(RpcAction::Provide | RpcAction::Unprovide) => {
                    cx.remove_timeout(&message);
                    let name = message.name.unwrap_or_default();
                    self.providers.remove(&name);
                    cx.outbox.error(
                        Topic::Rpc,
                        ErrorKind::MessageDenied,
                        format!("{action} for provider {name}"),
                    );
                }
                _ => {
                    if let Some(rpc) = self.take_rpc(&message, cx) {
                        let err = ClientError::RequestDenied {
                            name: rpc.name,
                            action: action.as_str().to_string(),
                        };
                        let callback = rpc.callback;
                        cx.outbox.call(move || callback(Err(err)));
                    }
                }
            },
            RpcAction::MultipleProvider | RpcAction::NotProvided => {
                let (original, kind) = if action == RpcAction::MultipleProvider {
                    (RpcAction::Provide, ErrorKind::ProviderExists)
                } else {
                    (RpcAction::Unprovide, ErrorKind::NotProviding)
                };
                let name = message.name.clone().unwrap_or_default();
                cx.remove_timeout(&message.with_original_action(original));
                cx.outbox.warn(Topic::Rpc, kind, format!("{action} for {name}"));
            }
            RpcAction::Accept => {
                if self.find_rpc(&message, cx) {
                    debug!(correlation_id = ?message.correlation_id, "rpc accepted");
                }
            }
            RpcAction::Response
            | RpcAction::RequestError
            | RpcAction::ResponseTimeout
            | RpcAction::AcceptTimeout
            | RpcAction::NoRpcProvider => {
                let data = message.data.clone();
                let Some(rpc) = self.take_rpc(&message, cx) else {
                    return;
                };
                let result = match action {
                    RpcAction::Response => Ok(data.unwrap_or(Value::Null)),
                    RpcAction::RequestError => Err(ClientError::Rpc(error_text(data))),
                    _ => Err(ClientError::Rpc(action.as_str().to_string())),
                };
                let callback = rpc.callback;
                cx.outbox.call(move || callback(result));
            }
            other => cx.outbox.error(
                Topic::Rpc,
                ErrorKind::UnsolicitedMessage,
                format!("unexpected {other}"),
            ),
        }
    }

    /// Hands a request to its provider, or rejects it when nothing provides
    /// the name.
    fn respond_to(&mut self, message: Message, cx: &mut Services<'_>) {
        let (Some(name), Some(correlation_id)) = (message.name, message.correlation_id) else {
            cx.outbox.error(
                Topic::Rpc,
                ErrorKind::UnsolicitedMessage,
                "request without name or correlation id",
            );
            return;
        };
        let Some(provider) = self.providers.get(&name).cloned() else {
            debug!(%name, "rejecting request for a procedure not provided");
            cx.send(Message::named(RpcAction::Reject, name).with_correlation_id(correlation_id));
            return;
        };
        let data = message.data.unwrap_or(Value::Null);
        cx.outbox.push(move |client| {
            let response = RpcResponse::new(client.clone(), name, correlation_id);
            provider(&data, response.clone());
            response.auto_accept();
        });
    }

    fn find_rpc(&self, message: &Message, cx: &mut Services<'_>) -> bool {
        let found = message
            .correlation_id
            .as_ref()
            .is_some_and(|id| self.rpcs.contains_key(id));
        if !found {
            unknown_correlation(message, cx);
        }
        found
    }

    fn take_rpc(&mut self, message: &Message, cx: &mut Services<'_>) -> Option<Outstanding> {
        let rpc = message
            .correlation_id
            .as_ref()
            .and_then(|id| self.rpcs.remove(id));
        if rpc.is_none() {
            unknown_correlation(message, cx);
        }
        rpc
    }

    pub fn flush_bulk(&mut self, cx: &mut Services<'_>) {
        self.bulk.flush(cx);
    }

    /// Outstanding requests cannot be answered on a new connection.
    pub fn on_connection_lost(&mut self, cx: &mut Services<'_>) {
        self.bulk.on_connection_lost(cx);
        for (_, rpc) in self.rpcs.drain() {
            let callback = rpc.callback;
            cx.outbox.call(move || callback(Err(ClientError::Offline)));
        }
    }

    pub fn on_reestablished(&mut self, cx: &mut Services<'_>) {
        let names = self.provider_names();
        self.bulk.subscribe_list(names.iter().map(String::as_str), cx);
        for queued in std::mem::take(&mut self.limbo) {
            self.send_request(
                queued.correlation_id,
                queued.name,
                queued.data,
                queued.callback,
                cx,
            );
        }
    }

    pub fn on_exit_limbo(&mut self, cx: &mut Services<'_>) {
        for queued in self.limbo.drain(..) {
            let callback = queued.callback;
            cx.outbox.call(move || callback(Err(ClientError::Offline)));
        }
    }

    /// Provided names in sorted order.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

fn validate(name: &str) -> ClientResult<()> {
    if name.is_empty() {
        return Err(ClientError::invalid_argument("rpc name must not be empty"));
    }
    Ok(())
}

fn unknown_correlation(message: &Message, cx: &mut Services<'_>) {
    cx.outbox.error(
        Topic::Rpc,
        ErrorKind::UnknownCorrelationId,
        format!(
            "{} for unknown correlation id {}",
            message.action,
            message.correlation_id.as_deref().unwrap_or_default()
        ),
    );
}

fn error_text(data: Option<Value>) -> String {
    match data {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => RpcAction::RequestError.as_str().to_string(),
    }
}

impl fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandler")
            .field("providers", &self.provider_names())
            .field("outstanding", &self.rpcs.len())
            .field("limbo", &self.limbo.len())
            .finish()
    }
}

#[derive(Debug)]
struct ResponseState {
    accepted: bool,
    completed: bool,
    auto_accept: bool,
}

/// Answers one incoming request.
///
/// Unless [`set_auto_accept`](Self::set_auto_accept) turned it off, the
/// request is accepted as soon as the provider returns.
#[derive(Clone)]
pub struct RpcResponse {
    client: Client,
    name: String,
    correlation_id: String,
    state: Arc<Mutex<ResponseState>>,
}

impl RpcResponse {
    fn new(client: Client, name: String, correlation_id: String) -> Self {
        Self {
            client,
            name,
            correlation_id,
            state: Arc::new(Mutex::new(ResponseState {
                accepted: false,
                completed: false,
                auto_accept: true,
            })),
        }
    }

    /// Name of the requested procedure.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Turns automatic acceptance on or off.
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.state.lock().auto_accept = auto_accept;
    }

    /// Tells the requester the request is being worked on. Idempotent.
    pub fn accept(&self) {
        {
            let mut state = self.state.lock();
            if state.accepted {
                return;
            }
            state.accepted = true;
        }
        self.send_message(RpcAction::Accept, None);
    }

    /// Declines the request; the server may route it to another provider.
    pub fn reject(&self) -> ClientResult<()> {
        self.complete()?;
        self.send_message(RpcAction::Reject, None);
        Ok(())
    }

    /// Fails the request with `error`.
    pub fn error(&self, error: impl Into<String>) -> ClientResult<()> {
        self.complete()?;
        self.send_message(RpcAction::RequestError, Some(Value::String(error.into())));
        Ok(())
    }

    /// Completes the request with `data`, accepting it first if needed.
    pub fn send(&self, data: Value) -> ClientResult<()> {
        if self.state.lock().completed {
            return Err(ClientError::RpcAlreadyCompleted(self.name.clone()));
        }
        self.accept();
        self.complete()?;
        self.send_message(RpcAction::Response, Some(data));
        Ok(())
    }

    fn complete(&self) -> ClientResult<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Err(ClientError::RpcAlreadyCompleted(self.name.clone()));
        }
        state.completed = true;
        state.accepted = true;
        state.auto_accept = false;
        Ok(())
    }

    fn auto_accept(&self) {
        let auto = self.state.lock().auto_accept;
        if auto {
            self.accept();
        }
    }

    fn send_message(&self, action: RpcAction, data: Option<Value>) {
        let mut message = Message::named(action, self.name.clone())
            .with_correlation_id(self.correlation_id.clone());
        if let Some(data) = data {
            message = message.with_data(data);
        }
        self.client.with_services(|cx, _| cx.send(message));
    }
}

impl fmt::Debug for RpcResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcResponse")
            .field("name", &self.name)
            .field("correlation_id", &self.correlation_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// RPC operations of a [`Client`].
#[derive(Clone, Debug)]
pub struct Rpc {
    client: Client,
}

impl Rpc {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Serves `name` with `provider`. Fails if `name` is already provided.
    pub fn provide(
        &self,
        name: &str,
        provider: impl Fn(&Value, RpcResponse) + Send + Sync + 'static,
    ) -> ClientResult<()> {
        let provider: Provider = Arc::new(provider);
        self.client
            .with_services(|cx, h| h.rpc.provide(name, provider, cx))
    }

    pub fn unprovide(&self, name: &str) -> ClientResult<()> {
        self.client.with_services(|cx, h| h.rpc.unprovide(name, cx))
    }

    /// Invokes `name` and calls `callback` with the result.
    pub fn make_with(
        &self,
        name: &str,
        data: Option<Value>,
        callback: impl FnOnce(ClientResult<Value>) + Send + 'static,
    ) -> ClientResult<()> {
        let callback: MakeCallback = Box::new(callback);
        self.client
            .with_services(|cx, h| h.rpc.make(name, data, callback, cx))
    }

    /// Invokes `name` and waits for the result.
    pub async fn make(&self, name: &str, data: Option<Value>) -> ClientResult<Value> {
        completion(|done| self.make_with(name, data, done)).await
    }

    /// Names this client provides.
    pub fn provider_names(&self) -> Vec<String> {
        self.client.inspect(|core| core.rpc().provider_names())
    }
}
