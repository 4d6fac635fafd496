//! Protocol messages exchanged with the broker.
//!
//! Every message is a discriminated envelope keyed first by [`Topic`] and then
//! by a per-topic action enum. The topic is never stored separately: it is
//! derived from the [`Action`] variant, so a message can never carry an action
//! that does not belong to its topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Coarse message category used for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    /// Connection handshake and liveness.
    Connection,
    /// Authentication.
    Auth,
    /// Publish/subscribe events.
    Event,
    /// Versioned records.
    Record,
    /// Remote procedure calls.
    Rpc,
    /// Parser diagnostics.
    Parser,
}

impl Topic {
    /// Returns the wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Connection => "CONNECTION",
            Topic::Auth => "AUTH",
            Topic::Event => "EVENT",
            Topic::Record => "RECORD",
            Topic::Rpc => "RPC",
            Topic::Parser => "PARSER",
        }
    }

    /// Looks a topic up by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Topic::Connection,
            Topic::Auth,
            Topic::Event,
            Topic::Record,
            Topic::Rpc,
            Topic::Parser,
        ]
        .into_iter()
        .find(|topic| topic.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! action_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            /// Returns the wire name of the action.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

action_enum! {
    /// Actions of the [`Topic::Connection`] topic.
    ConnectionAction {
        /// Client challenge carrying url and SDK identity.
        Challenge => "CHALLENGE",
        /// Challenge accepted.
        Accept => "ACCEPT",
        /// Challenge rejected.
        Reject => "REJECT",
        /// Server asks the client to connect elsewhere.
        Redirect => "REDIRECT",
        /// Client is closing the connection.
        Closing => "CLOSING",
        /// Server confirms the close.
        Closed => "CLOSED",
        /// Heartbeat sent to check the connection is alive.
        Ping => "PING",
        /// Liveness answer.
        Pong => "PONG",
        /// Server gave up waiting for authentication.
        AuthenticationTimeout => "AUTHENTICATION_TIMEOUT",
    }
}

action_enum! {
    /// Actions of the [`Topic::Auth`] topic.
    AuthAction {
        /// Authentication parameters sent by the client.
        Request => "REQUEST",
        /// Authentication accepted.
        AuthSuccessful => "AUTH_SUCCESSFUL",
        /// Authentication refused; the client may retry.
        AuthUnsuccessful => "AUTH_UNSUCCESSFUL",
        /// Authentication refused for good.
        TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
    }
}

action_enum! {
    /// Actions of the [`Topic::Event`] topic.
    EventAction {
        /// Event payload.
        Emit => "EMIT",
        /// Subscribe to event names.
        Subscribe => "SUBSCRIBE",
        /// Unsubscribe from event names.
        Unsubscribe => "UNSUBSCRIBE",
        /// Start listening for subscriptions matching a pattern.
        Listen => "LISTEN",
        /// Stop listening for a pattern.
        Unlisten => "UNLISTEN",
        /// Listener accepts a matched subscription.
        ListenAccept => "LISTEN_ACCEPT",
        /// Listener rejects a matched subscription.
        ListenReject => "LISTEN_REJECT",
        /// A subscription matching a listened pattern appeared.
        SubscriptionForPatternFound => "SUBSCRIPTION_FOR_PATTERN_FOUND",
        /// A subscription matching a listened pattern went away.
        SubscriptionForPatternRemoved => "SUBSCRIPTION_FOR_PATTERN_REMOVED",
        /// Server refused the request.
        MessageDenied => "MESSAGE_DENIED",
        /// Permission check failed.
        MessagePermissionError => "MESSAGE_PERMISSION_ERROR",
        /// Name was already subscribed.
        MultipleSubscriptions => "MULTIPLE_SUBSCRIPTIONS",
        /// Name was not subscribed.
        NotSubscribed => "NOT_SUBSCRIBED",
        /// Listen pattern is not a valid regex on the server.
        InvalidListenRegex => "INVALID_LISTEN_REGEX",
        /// Pattern was not being listened to.
        NotListening => "NOT_LISTENING",
    }
}

action_enum! {
    /// Actions of the [`Topic::Record`] topic.
    RecordAction {
        /// Subscribe to a record.
        Subscribe => "SUBSCRIBE",
        /// Unsubscribe from a record.
        Unsubscribe => "UNSUBSCRIBE",
        /// Subscribe, creating the record if missing, and read it.
        SubscribeCreateAndRead => "SUBSCRIBECREATEANDREAD",
        /// Subscribe and read without creating.
        SubscribeAndRead => "SUBSCRIBEANDREAD",
        /// Subscribe and request only the version.
        SubscribeAndHead => "SUBSCRIBEANDHEAD",
        /// Read data and version.
        Read => "READ",
        /// Response to a read.
        ReadResponse => "READ_RESPONSE",
        /// Read the version only.
        Head => "HEAD",
        /// Response to a head.
        HeadResponse => "HEAD_RESPONSE",
        /// Replace the whole record.
        Update => "UPDATE",
        /// Set a value at a path.
        Patch => "PATCH",
        /// Remove a value at a path.
        Erase => "ERASE",
        /// Create the record with an initial value.
        CreateAndUpdate => "CREATEANDUPDATE",
        /// Delete the record.
        Delete => "DELETE",
        /// Delete completed for the requesting client.
        DeleteSuccess => "DELETE_SUCCESS",
        /// The record was deleted by someone.
        Deleted => "DELETED",
        /// Acknowledgement of a write sent with `is_write_ack`.
        WriteAcknowledgement => "WRITE_ACKNOWLEDGEMENT",
        /// The written version already exists on the server.
        VersionExists => "VERSION_EXISTS",
        /// Server refused the request.
        MessageDenied => "MESSAGE_DENIED",
        /// Permission check failed.
        MessagePermissionError => "MESSAGE_PERMISSION_ERROR",
        /// Server failed to apply an update.
        RecordUpdateError => "RECORD_UPDATE_ERROR",
        /// Record does not exist.
        RecordNotFound => "RECORD_NOT_FOUND",
        /// An active provider exists for the record.
        SubscriptionHasProvider => "SUBSCRIPTION_HAS_PROVIDER",
        /// No provider exists for the record.
        SubscriptionHasNoProvider => "SUBSCRIPTION_HAS_NO_PROVIDER",
        /// Server cache lookup timed out.
        CacheRetrievalTimeout => "CACHE_RETRIEVAL_TIMEOUT",
        /// Server storage lookup timed out.
        StorageRetrievalTimeout => "STORAGE_RETRIEVAL_TIMEOUT",
    }
}

action_enum! {
    /// Actions of the [`Topic::Rpc`] topic.
    RpcAction {
        /// Register as provider.
        Provide => "PROVIDE",
        /// Unregister as provider.
        Unprovide => "UNPROVIDE",
        /// Invoke a procedure.
        Request => "REQUEST",
        /// Provider accepted a request.
        Accept => "ACCEPT",
        /// Provider rejected a request.
        Reject => "REJECT",
        /// Result of a request.
        Response => "RESPONSE",
        /// Provider reported an error.
        RequestError => "REQUEST_ERROR",
        /// No response arrived in time.
        ResponseTimeout => "RESPONSE_TIMEOUT",
        /// No accept arrived in time.
        AcceptTimeout => "ACCEPT_TIMEOUT",
        /// Nobody provides the procedure.
        NoRpcProvider => "NO_RPC_PROVIDER",
        /// Server refused the request.
        MessageDenied => "MESSAGE_DENIED",
        /// Permission check failed.
        MessagePermissionError => "MESSAGE_PERMISSION_ERROR",
        /// Procedure was not provided by this client.
        NotProvided => "NOT_PROVIDED",
        /// Procedure is already provided by this client.
        MultipleProvider => "MULTIPLE_PROVIDER",
    }
}

action_enum! {
    /// Parser diagnostics for undecodable input.
    ParserAction {
        /// Bytes could not be decoded at all.
        MessageParseError => "MESSAGE_PARSE_ERROR",
        /// Topic is not known.
        UnknownTopic => "UNKNOWN_TOPIC",
        /// Action is not known for the topic.
        UnknownAction => "UNKNOWN_ACTION",
        /// Envelope decoded but its fields are malformed.
        InvalidMessage => "INVALID_MESSAGE",
    }
}

/// A topic-qualified action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Connection action.
    Connection(ConnectionAction),
    /// Auth action.
    Auth(AuthAction),
    /// Event action.
    Event(EventAction),
    /// Record action.
    Record(RecordAction),
    /// RPC action.
    Rpc(RpcAction),
}

impl Action {
    /// Returns the topic this action belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            Action::Connection(_) => Topic::Connection,
            Action::Auth(_) => Topic::Auth,
            Action::Event(_) => Topic::Event,
            Action::Record(_) => Topic::Record,
            Action::Rpc(_) => Topic::Rpc,
        }
    }

    /// Returns the wire name of the action without its topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Connection(a) => a.as_str(),
            Action::Auth(a) => a.as_str(),
            Action::Event(a) => a.as_str(),
            Action::Record(a) => a.as_str(),
            Action::Rpc(a) => a.as_str(),
        }
    }

    /// Maps a response action to the request action it answers.
    ///
    /// Actions that are acknowledged with the same action (for example an
    /// `is_ack` subscribe) map to themselves.
    pub fn request_for_response(&self) -> Action {
        match self {
            Action::Record(RecordAction::ReadResponse) => Action::Record(RecordAction::Read),
            Action::Record(RecordAction::HeadResponse) => Action::Record(RecordAction::Head),
            Action::Record(RecordAction::DeleteSuccess) => Action::Record(RecordAction::Delete),
            Action::Event(EventAction::ListenAccept) => Action::Event(EventAction::Listen),
            other => *other,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic(), self.as_str())
    }
}

impl From<ConnectionAction> for Action {
    fn from(action: ConnectionAction) -> Self {
        Action::Connection(action)
    }
}

impl From<AuthAction> for Action {
    fn from(action: AuthAction) -> Self {
        Action::Auth(action)
    }
}

impl From<EventAction> for Action {
    fn from(action: EventAction) -> Self {
        Action::Event(action)
    }
}

impl From<RecordAction> for Action {
    fn from(action: RecordAction) -> Self {
        Action::Record(action)
    }
}

impl From<RpcAction> for Action {
    fn from(action: RpcAction) -> Self {
        Action::Rpc(action)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A protocol message.
///
/// Only the fields relevant to the action are set; the rest stay `None` and
/// are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Topic-qualified action.
    pub action: Action,
    /// Record, event or procedure name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Names of a bulk subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    /// Structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Correlates a response with its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Record version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Path inside a record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Message acknowledges a request with the same action.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_ack: bool,
    /// Write expects a write acknowledgement.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_write_ack: bool,
    /// Message reports an error.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
    /// Action of the request an error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_action: Option<Action>,
    /// Human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Subscription name matched by a listen pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    /// Endpoint url (challenge and redirect).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Protocol version announced in the challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// SDK version announced in the challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    /// SDK type announced in the challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_type: Option<String>,
}

impl Message {
    /// Creates a message with only an action set.
    pub fn new(action: impl Into<Action>) -> Self {
        Self {
            action: action.into(),
            name: None,
            names: None,
            data: None,
            correlation_id: None,
            version: None,
            path: None,
            is_ack: false,
            is_write_ack: false,
            is_error: false,
            original_action: None,
            reason: None,
            subscription: None,
            url: None,
            protocol_version: None,
            sdk_version: None,
            sdk_type: None,
        }
    }

    /// Creates a message addressed to a name.
    pub fn named(action: impl Into<Action>, name: impl Into<String>) -> Self {
        Self::new(action).with_name(name)
    }

    /// Returns the topic of the message.
    pub fn topic(&self) -> Topic {
        self.action.topic()
    }

    /// Sets the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the bulk names.
    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }

    /// Sets the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the record version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the record path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the original action of an error or acknowledgement.
    pub fn with_original_action(mut self, action: impl Into<Action>) -> Self {
        self.original_action = Some(action.into());
        self
    }

    /// Sets the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets the listen subscription.
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Sets the url.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Marks the message as an acknowledgement.
    pub fn ack(mut self) -> Self {
        self.is_ack = true;
        self
    }

    /// Marks the message as an error.
    pub fn error(mut self) -> Self {
        self.is_error = true;
        self
    }

    /// Marks the write as requiring a write acknowledgement.
    pub fn write_ack(mut self) -> Self {
        self.is_write_ack = true;
        self
    }

    /// Returns the action used to key request timeouts.
    pub fn timeout_action(&self) -> Action {
        self.original_action.unwrap_or(self.action)
    }
}
