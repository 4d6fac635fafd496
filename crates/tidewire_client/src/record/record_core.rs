//! The shared state of one record.
//!
//! A core loads its last known state from offline storage, subscribes on the
//! server, applies remote writes in version order and sends local writes.
//! Version gaps and rejected writes move it into `Merging`, where a merge
//! strategy decides the outcome.

use super::handler::RecordServices;
use super::{
    empty_object, join_callbacks, CoreId, DeleteCallback, MergeOutcome, RecordEvent,
    RecordSnapshot, RemoteRecord, WriteCallback,
};
use crate::emitter::{Emitter, Listener, ListenerId, OwnerId};
use crate::error::{ClientError, ClientResult};
use crate::json_path;
use crate::outbox::ErrorKind;
use crate::services::Services;
use crate::state_machine::{StateMachine, Transition};
use crate::task::Task;
use crate::timeout_registry::TimeoutKey;
use crate::timer::TimerRef;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tidewire_protocol::{Action, Message, RecordAction, Topic};
use tidewire_storage::NO_VERSION;
use tracing::{debug, trace, warn};

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Reading the last known state from offline storage.
    LoadingOffline,
    /// Waiting for the first server read.
    Subscribing,
    /// Comparing the local version with the server after a reconnect.
    Resubscribing,
    /// Data is current and writes go out immediately.
    Ready,
    /// Resolving a version conflict.
    Merging,
    /// The last handle went away; waiting out the discard grace period.
    Unsubscribing,
    /// Discarded. Terminal.
    Unsubscribed,
    /// Waiting for the server to confirm a delete.
    Deleting,
    /// Deleted. Terminal.
    Deleted,
}

impl RecordState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::LoadingOffline => "LOADING_OFFLINE",
            RecordState::Subscribing => "SUBSCRIBING",
            RecordState::Resubscribing => "RESUBSCRIBING",
            RecordState::Ready => "READY",
            RecordState::Merging => "MERGING",
            RecordState::Unsubscribing => "UNSUBSCRIBING",
            RecordState::Unsubscribed => "UNSUBSCRIBED",
            RecordState::Deleting => "DELETING",
            RecordState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    SubscribeCreateAndRead,
    Loaded,
    ReadResponse,
    Subscribed,
    Resubscribe,
    Resubscribed,
    InvalidVersion,
    Merged,
    Delete,
    DeleteSuccess,
    DeleteFailed,
    Deleted,
    Unsubscribe,
    Subscribe,
    UnsubscribeForReal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Subscribing,
    Resubscribing,
    Ready,
    Deleted,
    Unsubscribed,
}

type Row = Transition<RecordState, Step, Hook>;

use RecordState as S;

static TRANSITIONS: &[Row] = &[
    Row::handled(Step::SubscribeCreateAndRead, S::LoadingOffline, S::Subscribing, Hook::Subscribing),
    Row::handled(Step::SubscribeCreateAndRead, S::Subscribing, S::Subscribing, Hook::Subscribing),
    Row::handled(Step::Loaded, S::LoadingOffline, S::Ready, Hook::Ready),
    Row::handled(Step::ReadResponse, S::Subscribing, S::Ready, Hook::Ready),
    Row::handled(Step::Subscribed, S::Resubscribing, S::Ready, Hook::Ready),
    Row::handled(Step::Resubscribed, S::Resubscribing, S::Ready, Hook::Ready),
    Row::handled(Step::Resubscribe, S::LoadingOffline, S::Resubscribing, Hook::Resubscribing),
    Row::handled(Step::Resubscribe, S::Ready, S::Resubscribing, Hook::Resubscribing),
    Row::handled(Step::Resubscribe, S::Merging, S::Resubscribing, Hook::Resubscribing),
    Row::handled(Step::Resubscribe, S::Resubscribing, S::Resubscribing, Hook::Resubscribing),
    Row::handled(Step::Resubscribe, S::Deleting, S::Resubscribing, Hook::Resubscribing),
    Row::new(Step::InvalidVersion, S::Ready, S::Merging),
    Row::new(Step::InvalidVersion, S::Resubscribing, S::Merging),
    Row::new(Step::InvalidVersion, S::Merging, S::Merging),
    Row::handled(Step::Merged, S::Merging, S::Ready, Hook::Ready),
    Row::new(Step::Unsubscribe, S::Ready, S::Unsubscribing),
    Row::new(Step::Unsubscribe, S::Merging, S::Unsubscribing),
    Row::new(Step::Subscribe, S::Unsubscribing, S::Ready),
    Row::terminal(
        Step::UnsubscribeForReal,
        Some(S::Unsubscribing),
        S::Unsubscribed,
        Some(Hook::Unsubscribed),
    ),
    Row::new(Step::Delete, S::Ready, S::Deleting),
    Row::new(Step::Delete, S::Merging, S::Deleting),
    Row::new(Step::Delete, S::Unsubscribing, S::Deleting),
    Row::new(Step::DeleteFailed, S::Deleting, S::Ready),
    Row::terminal(Step::DeleteSuccess, Some(S::Deleting), S::Deleted, Some(Hook::Deleted)),
    Row::terminal(Step::Deleted, None, S::Deleted, Some(Hook::Deleted)),
];

struct PendingWrite {
    path: Option<String>,
    data: Option<Value>,
    callback: Option<WriteCallback>,
}

enum ReadyAction {
    Callback(Box<dyn FnOnce() + Send>),
    Trigger { key: String, id: ListenerId },
    RemoveReference(OwnerId),
    Delete(DeleteCallback),
}

pub(crate) struct RecordCore {
    id: CoreId,
    name: String,
    machine: StateMachine<RecordState, Step, Hook>,
    version: Option<i64>,
    data: Value,
    read_only: bool,
    is_list: bool,
    is_ready: bool,
    loaded: bool,
    has_provider: bool,
    references: HashSet<OwnerId>,
    paths: Emitter<String, Value>,
    events: Emitter<(), RecordEvent>,
    pending_writes: Vec<PendingWrite>,
    ready_actions: Vec<ReadyAction>,
    response_timeout: Option<TimeoutKey>,
    delete_timeout: Option<TimeoutKey>,
    discard_timer: Option<TimerRef>,
    delete_callback: Option<DeleteCallback>,
    /// The last merge could not resolve the conflict.
    merge_failed: bool,
    destroyed: bool,
}

fn path_key(path: Option<&str>) -> String {
    path.unwrap_or_default().to_string()
}

fn key_path(key: &str) -> Option<&str> {
    (!key.is_empty()).then_some(key)
}

impl RecordCore {
    pub fn new(name: &str, id: CoreId, read_only: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            machine: StateMachine::new("record", S::LoadingOffline, TRANSITIONS),
            version: None,
            data: empty_object(),
            read_only,
            is_list: false,
            is_ready: false,
            loaded: false,
            has_provider: false,
            references: HashSet::new(),
            paths: Emitter::new(),
            events: Emitter::new(),
            pending_writes: Vec::new(),
            ready_actions: Vec::new(),
            response_timeout: None,
            delete_timeout: None,
            discard_timer: None,
            delete_callback: None,
            merge_failed: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RecordState {
        self.machine.state()
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn has_provider(&self) -> bool {
        self.has_provider
    }

    pub fn references(&self) -> usize {
        self.references.len()
    }

    /// Lists hold arrays; anything else received for them reads as empty.
    pub fn mark_list(&mut self) {
        self.is_list = true;
        if !self.data.is_array() && self.version.is_none() {
            self.data = Value::Array(Vec::new());
        }
    }

    pub fn get(&self, path: Option<&str>) -> Option<Value> {
        json_path::get(&self.data, path)
    }

    pub fn snapshot(&self) -> Option<RecordSnapshot> {
        match (self.is_ready, self.version) {
            (true, Some(version)) => Some(RecordSnapshot {
                version,
                data: self.data.clone(),
            }),
            _ => None,
        }
    }

    /// Starts loading once the dirty index is available.
    pub fn start(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if rs.dirty.when_loaded(&self.name, self.id) {
            cx.idle(Task::LoadRecord {
                name: self.name.clone(),
                core: self.id,
            });
        }
    }

    /// Applies the offline snapshot and decides how to reach the server.
    pub fn load(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if self.destroyed || self.loaded {
            return;
        }
        self.loaded = true;
        let snapshot = match cx.storage.get(&self.name) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                cx.outbox.error(
                    Topic::Record,
                    ErrorKind::RecordLoadError,
                    format!("cannot load {} from offline storage: {err}", self.name),
                );
                None
            }
        };
        let (version, data) = snapshot
            .map(|s| (s.version, s.data))
            .unwrap_or((NO_VERSION, Value::Null));
        trace!(record = %self.name, version, "offline snapshot loaded");

        if !cx.is_connected() {
            if version == NO_VERSION {
                if self.read_only {
                    debug!(record = %self.name, "read-only record waits for the server");
                    return;
                }
                self.version = Some(cx.config.initial_record_version);
                self.data = self.normalize(None);
                rs.dirty.set_dirty(&self.name, true, cx);
                self.save_record_to_offline(cx);
            } else {
                self.version = Some(version);
                self.data = self.normalize(Some(data));
            }
            self.transition(Step::Loaded, cx, rs);
            return;
        }

        if version == NO_VERSION && !rs.dirty.is_dirty(&self.name) {
            self.transition(Step::SubscribeCreateAndRead, cx, rs);
        } else {
            self.version = Some(version);
            self.data = self.normalize(Some(data));
            self.transition(Step::Resubscribe, cx, rs);
        }
    }

    fn normalize(&self, data: Option<Value>) -> Value {
        match data {
            Some(Value::Array(items)) => Value::Array(items),
            _ if self.is_list => Value::Array(Vec::new()),
            Some(data @ Value::Object(_)) => data,
            _ => empty_object(),
        }
    }

    fn transition(&mut self, step: Step, cx: &mut Services<'_>, rs: &mut RecordServices) -> bool {
        let Some(change) = self.machine.transition(step) else {
            return false;
        };
        trace!(record = %self.name, from = %change.from, to = %change.to, "record state changed");
        match change.handler {
            Some(Hook::Subscribing) => self.on_subscribing(cx, rs),
            Some(Hook::Resubscribing) => self.on_resubscribing(cx, rs),
            Some(Hook::Ready) => self.on_ready(cx, rs),
            Some(Hook::Deleted) => self.on_deleted(cx, rs),
            Some(Hook::Unsubscribed) => self.on_unsubscribed(cx, rs),
            None => {}
        }
        true
    }

    fn on_subscribing(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        rs.reads.register(&self.name);
        let timeout = cx.config.record_read_timeout;
        self.response_timeout = cx.add_timeout(
            &Message::named(RecordAction::Read, self.name.clone()),
            ErrorKind::ResponseTimeout,
            Some(timeout),
        );
        if self.read_only {
            rs.read.subscribe(&self.name, cx);
        } else {
            rs.create_and_read.subscribe(&self.name, cx);
        }
    }

    fn on_resubscribing(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        rs.heads.register(&self.name);
        let timeout = cx.config.record_read_timeout;
        self.response_timeout = cx.add_timeout(
            &Message::named(RecordAction::Head, self.name.clone()),
            ErrorKind::ResponseTimeout,
            Some(timeout),
        );
        rs.head.subscribe(&self.name, cx);
    }

    fn on_ready(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        cx.clear_timeout(&mut self.response_timeout);
        self.apply_pending_writes(cx, rs);
        let first = !self.is_ready;
        self.is_ready = true;
        let data = self.data.clone();
        self.apply_change(data, true, false, cx);

        for action in std::mem::take(&mut self.ready_actions) {
            match action {
                ReadyAction::Callback(callback) => cx.outbox.call(callback),
                ReadyAction::Trigger { key, id } => {
                    let value = self.get(key_path(&key)).unwrap_or(Value::Null);
                    self.paths.emit_to(&key, id, value, cx.outbox);
                }
                ReadyAction::RemoveReference(owner) => self.remove_reference_now(owner, cx, rs),
                ReadyAction::Delete(callback) => self.delete(callback, cx, rs),
            }
        }
        if first {
            self.events.emit(&(), RecordEvent::Ready, cx.outbox);
        }
    }

    /// Runs `callback` once the record is ready.
    pub fn when_ready(&mut self, callback: Box<dyn FnOnce() + Send>, cx: &mut Services<'_>) {
        if self.is_ready {
            cx.outbox.call(callback);
        } else {
            self.ready_actions.push(ReadyAction::Callback(callback));
        }
    }

    /// Registers a change callback for `path` (the whole record if `None`).
    pub fn subscribe(
        &mut self,
        path: Option<&str>,
        owner: OwnerId,
        callback: Listener<Value>,
        trigger_now: bool,
        cx: &mut Services<'_>,
    ) -> ListenerId {
        let key = path_key(path);
        let id = self.paths.on(key.clone(), Some(owner), callback);
        if trigger_now {
            if self.is_ready {
                let value = self.get(path).unwrap_or(Value::Null);
                self.paths.emit_to(&key, id, value, cx.outbox);
            } else {
                self.ready_actions.push(ReadyAction::Trigger { key, id });
            }
        }
        id
    }

    /// Removes one subscription, or every subscription of `owner` on `path`.
    pub fn unsubscribe(&mut self, path: Option<&str>, owner: OwnerId, id: Option<ListenerId>) {
        let key = path_key(path);
        match id {
            Some(id) => {
                self.paths.off(&key, id);
            }
            None => {
                self.paths.off_key(&key, Some(owner));
            }
        }
    }

    pub fn on_event(&mut self, owner: OwnerId, callback: Listener<RecordEvent>) -> ListenerId {
        self.events.on((), Some(owner), callback)
    }

    pub fn off_event(&mut self, id: ListenerId) -> bool {
        self.events.off(&(), id)
    }

    /// Writes `data` at `path`. `None` data erases the path.
    pub fn set(
        &mut self,
        path: Option<&str>,
        data: Option<Value>,
        callback: Option<WriteCallback>,
        cx: &mut Services<'_>,
        rs: &mut RecordServices,
    ) -> ClientResult<()> {
        let path = path.filter(|p| !p.is_empty());
        if path.is_none() && !matches!(data, Some(Value::Object(_)) | Some(Value::Array(_))) {
            return Err(ClientError::invalid_argument(
                "scalar values cannot be set without a path",
            ));
        }
        if self.destroyed {
            return Err(ClientError::RecordDestroyed(self.name.clone()));
        }
        if self.read_only {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::RecordReadOnlyMode,
                format!("attempted to set {} in read-only mode", self.name),
            );
            if let Some(callback) = callback {
                let err = ClientError::ReadOnly(self.name.clone());
                cx.outbox.call(move || callback(Err(err)));
            }
            return Ok(());
        }
        if !self.is_ready {
            self.pending_writes.push(PendingWrite {
                path: path.map(str::to_string),
                data,
                callback,
            });
            return Ok(());
        }

        let new_data = json_path::set(&self.data, path, data.clone());
        if new_data == self.data {
            if let Some(callback) = callback {
                cx.outbox.call(move || callback(Ok(())));
            }
            return Ok(());
        }
        self.apply_change(new_data, false, false, cx);
        self.commit(path, data, callback, cx, rs);
        Ok(())
    }

    /// Sends a local change, or keeps it dirty while offline.
    fn commit(
        &mut self,
        path: Option<&str>,
        data: Option<Value>,
        callback: Option<WriteCallback>,
        cx: &mut Services<'_>,
        rs: &mut RecordServices,
    ) {
        if cx.is_connected() {
            self.send_update(path, data, callback, cx, rs);
            if cx.config.save_updates_offline {
                self.save_record_to_offline(cx);
            }
        } else {
            if let Some(callback) = callback {
                cx.outbox.call(move || callback(Err(ClientError::Offline)));
            }
            self.save_update(cx, rs);
        }
    }

    fn apply_pending_writes(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if self.pending_writes.is_empty() {
            return;
        }
        let (new_data, callbacks) = self.fold_pending_writes(self.data.clone());
        let callback = join_callbacks(callbacks);
        if new_data == self.data {
            if let Some(callback) = callback {
                cx.outbox.call(move || callback(Ok(())));
            }
            return;
        }
        self.apply_change(new_data.clone(), false, false, cx);
        self.commit(None, Some(new_data), callback, cx, rs);
    }

    fn fold_pending_writes(&mut self, mut data: Value) -> (Value, Vec<WriteCallback>) {
        let mut callbacks = Vec::new();
        for write in std::mem::take(&mut self.pending_writes) {
            data = json_path::set(&data, write.path.as_deref(), write.data);
            callbacks.extend(write.callback);
        }
        (data, callbacks)
    }

    fn save_update(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if !rs.dirty.is_dirty(&self.name) {
            self.version = Some(self.version.map_or(cx.config.initial_record_version, |v| v + 1));
            rs.dirty.set_dirty(&self.name, true, cx);
        }
        self.save_record_to_offline(cx);
    }

    fn send_update(
        &mut self,
        path: Option<&str>,
        data: Option<Value>,
        callback: Option<WriteCallback>,
        cx: &mut Services<'_>,
        rs: &mut RecordServices,
    ) {
        if self.read_only {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::RecordReadOnlyMode,
                format!("attempted to send an update for {} in read-only mode", self.name),
            );
            return;
        }
        if rs.dirty.is_dirty(&self.name) {
            rs.dirty.set_dirty(&self.name, false, cx);
        } else {
            self.version = Some(self.version.map_or(cx.config.initial_record_version, |v| v + 1));
        }
        let version = self.version.unwrap_or(cx.config.initial_record_version);

        let message = match (path, data) {
            (Some(path), None) => Message::named(RecordAction::Erase, self.name.clone()).with_path(path),
            (Some(path), Some(data)) => Message::named(RecordAction::Patch, self.name.clone())
                .with_path(path)
                .with_data(data),
            (None, data) => Message::named(RecordAction::Update, self.name.clone())
                .with_data(data.unwrap_or_else(|| self.data.clone())),
        }
        .with_version(version);

        match callback {
            Some(callback) => rs.write_acks.send(message, callback, cx),
            None => cx.send(message),
        }
    }

    fn send_create_update(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        let version = cx.config.initial_record_version;
        self.version = Some(version);
        cx.send(
            Message::named(RecordAction::CreateAndUpdate, self.name.clone())
                .with_version(version)
                .with_data(self.data.clone()),
        );
        rs.dirty.set_dirty(&self.name, false, cx);
    }

    fn save_record_to_offline(&mut self, cx: &mut Services<'_>) {
        let Some(version) = self.version else {
            return;
        };
        if self.destroyed {
            return;
        }
        if let Err(err) = cx.storage.set(&self.name, version, &self.data) {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::StorageError,
                format!("cannot save {} offline: {err}", self.name),
            );
        }
    }

    /// Replaces the data and notifies path subscribers whose value changed.
    fn apply_change(&mut self, new_data: Value, force: bool, save: bool, cx: &mut Services<'_>) {
        if self.destroyed {
            return;
        }
        let old_data = std::mem::replace(&mut self.data, new_data);
        if save && cx.config.save_updates_offline {
            self.save_record_to_offline(cx);
        }
        for key in self.paths.event_names() {
            let path = key_path(&key);
            let new_value = json_path::get(&self.data, path);
            let old_value = json_path::get(&old_data, path);
            if new_value != old_value || (force && new_value.is_some()) {
                self.paths
                    .emit(&key, new_value.unwrap_or(Value::Null), cx.outbox);
            }
        }
    }

    /// Handles a record-topic message addressed to this record.
    pub fn handle(&mut self, message: Message, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if self.destroyed {
            return;
        }
        let Action::Record(action) = message.action else {
            return;
        };
        match action {
            RecordAction::Update | RecordAction::Patch | RecordAction::Erase => {
                self.apply_update(message, cx, rs)
            }
            RecordAction::DeleteSuccess => {
                cx.clear_timeout(&mut self.delete_timeout);
                self.transition(Step::DeleteSuccess, cx, rs);
            }
            RecordAction::Deleted => {
                self.transition(Step::Deleted, cx, rs);
            }
            RecordAction::VersionExists => {
                debug!(record = %self.name, remote = ?message.version, "version exists");
                self.transition(Step::InvalidVersion, cx, rs);
                self.recover(RemoteRecord::from_message(&message), cx, rs);
            }
            RecordAction::MessageDenied
            | RecordAction::MessagePermissionError
            | RecordAction::RecordUpdateError => self.handle_denied(message, cx, rs),
            RecordAction::SubscriptionHasProvider | RecordAction::SubscriptionHasNoProvider => {
                let has_provider = action == RecordAction::SubscriptionHasProvider;
                if has_provider != self.has_provider {
                    self.has_provider = has_provider;
                    self.events
                        .emit(&(), RecordEvent::HasProviderChanged(has_provider), cx.outbox);
                }
            }
            RecordAction::CacheRetrievalTimeout | RecordAction::StorageRetrievalTimeout => {
                cx.outbox.error(
                    Topic::Record,
                    ErrorKind::ResponseTimeout,
                    format!("{action} for {}", self.name),
                );
            }
            RecordAction::RecordNotFound => {
                cx.clear_timeout(&mut self.response_timeout);
                self.events.emit(
                    &(),
                    RecordEvent::Error {
                        action: action.as_str().to_string(),
                        original_action: message.original_action.map(|a| a.as_str().to_string()),
                    },
                    cx.outbox,
                );
            }
            other => {
                cx.outbox.warn(
                    Topic::Record,
                    ErrorKind::UnsolicitedMessage,
                    format!("{other} for {}", self.name),
                );
            }
        }
    }

    fn handle_denied(&mut self, message: Message, cx: &mut Services<'_>, rs: &mut RecordServices) {
        let original = message.original_action;
        if matches!(
            original,
            Some(Action::Record(
                RecordAction::SubscribeCreateAndRead
                    | RecordAction::SubscribeAndHead
                    | RecordAction::SubscribeAndRead
            ))
        ) {
            cx.clear_timeout(&mut self.response_timeout);
        }
        if message.is_write_ack {
            rs.write_acks.receive(&message, cx.outbox);
            return;
        }
        cx.outbox.error(
            Topic::Record,
            ErrorKind::MessageDenied,
            format!("{} for {}", message.action, self.name),
        );
        self.events.emit(
            &(),
            RecordEvent::Error {
                action: message.action.as_str().to_string(),
                original_action: original.map(|a| a.as_str().to_string()),
            },
            cx.outbox,
        );
        if original == Some(Action::Record(RecordAction::Delete)) {
            cx.clear_timeout(&mut self.delete_timeout);
            self.transition(Step::DeleteFailed, cx, rs);
            if let Some(callback) = self.delete_callback.take() {
                let err = ClientError::WriteDenied {
                    name: self.name.clone(),
                    action: message.action.as_str().to_string(),
                };
                cx.outbox.call(move || callback(Err(err)));
            }
        }
    }

    fn apply_update(&mut self, message: Message, cx: &mut Services<'_>, rs: &mut RecordServices) {
        match self.state() {
            S::Ready | S::Unsubscribing => {}
            S::Merging => {
                // An unresolved conflict is retried against the newer remote state.
                if self.merge_failed {
                    self.merge_failed = false;
                    self.send_read(cx, rs);
                }
                return;
            }
            state => {
                debug!(record = %self.name, %state, "remote write before ready, skipped");
                return;
            }
        }
        let Some(version) = message.version else {
            cx.outbox.warn(
                Topic::Record,
                ErrorKind::UnsolicitedMessage,
                format!("{} for {} without version", message.action, self.name),
            );
            return;
        };
        // Any gap is resolved from a full read, never from the update itself,
        // so a merge always sees the complete remote document.
        if let Some(local) = self.version {
            if local + 1 != version {
                debug!(record = %self.name, local, remote = version, "version gap");
                if self.transition(Step::InvalidVersion, cx, rs) {
                    self.send_read(cx, rs);
                }
                return;
            }
        }
        self.version = Some(version);

        let new_data = match message.action {
            Action::Record(RecordAction::Patch) => {
                json_path::set(&self.data, message.path.as_deref(), message.data)
            }
            Action::Record(RecordAction::Erase) => {
                json_path::set(&self.data, message.path.as_deref(), None)
            }
            _ => self.normalize(message.data),
        };
        self.apply_change(new_data, false, true, cx);
    }

    fn send_read(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        let message = Message::named(RecordAction::Read, self.name.clone());
        let timeout = cx.config.record_read_timeout;
        self.response_timeout = cx.add_timeout(&message, ErrorKind::ResponseTimeout, Some(timeout));
        rs.reads.register(&self.name);
        cx.send(message);
    }

    /// A read this core was waiting for arrived.
    pub fn handle_read_response(
        &mut self,
        message: Message,
        cx: &mut Services<'_>,
        rs: &mut RecordServices,
    ) {
        match self.state() {
            S::Merging => {
                cx.clear_timeout(&mut self.response_timeout);
                rs.dirty.set_dirty(&self.name, false, cx);
                self.recover(RemoteRecord::from_message(&message), cx, rs);
            }
            S::Subscribing => {
                self.version = message.version;
                self.data = self.normalize(message.data);
                self.transition(Step::ReadResponse, cx, rs);
            }
            state => debug!(record = %self.name, %state, "late read response"),
        }
    }

    /// A version check this core was waiting for arrived.
    pub fn handle_head_response(
        &mut self,
        message: Message,
        cx: &mut Services<'_>,
        rs: &mut RecordServices,
    ) {
        if self.state() != S::Resubscribing {
            debug!(record = %self.name, state = %self.state(), "late head response");
            return;
        }
        let remote = message.version.unwrap_or(NO_VERSION);
        let local = self.version.unwrap_or(NO_VERSION);

        if rs.dirty.is_dirty(&self.name) {
            if remote == NO_VERSION && local == cx.config.initial_record_version {
                self.send_create_update(cx, rs);
                self.transition(Step::Subscribed, cx, rs);
            } else if local == remote + 1 {
                self.send_update(None, Some(self.data.clone()), None, cx, rs);
                self.transition(Step::Resubscribed, cx, rs);
            } else {
                self.transition(Step::InvalidVersion, cx, rs);
                if remote == NO_VERSION {
                    self.recover(RemoteRecord::deleted(), cx, rs);
                } else {
                    self.send_read(cx, rs);
                }
            }
        } else if local == remote {
            self.transition(Step::Resubscribed, cx, rs);
        } else {
            self.transition(Step::InvalidVersion, cx, rs);
            if remote < local {
                self.recover(RemoteRecord::deleted(), cx, rs);
            } else {
                self.send_read(cx, rs);
            }
        }
    }

    fn recover(&mut self, remote: RemoteRecord, cx: &mut Services<'_>, rs: &mut RecordServices) {
        self.merge_failed = false;
        let local_version = self.version.unwrap_or(NO_VERSION);
        rs.merge
            .merge(&self.name, self.id, remote, local_version, &self.data, cx);
    }

    /// Applies the outcome of a merge strategy.
    pub fn on_record_recovered(
        &mut self,
        remote: RemoteRecord,
        outcome: MergeOutcome,
        cx: &mut Services<'_>,
        rs: &mut RecordServices,
    ) {
        if self.destroyed {
            return;
        }
        let conflicted = remote
            .correlation_id
            .as_deref()
            .and_then(|id| rs.write_acks.take(id));
        if self.state() != S::Merging {
            debug!(record = %self.name, state = %self.state(), "merge result no longer needed");
            if let Some(callback) = conflicted {
                let err = ClientError::VersionConflict {
                    name: self.name.clone(),
                    reason: "record changed while merging".to_string(),
                };
                cx.outbox.call(move || callback(Err(err)));
            }
            return;
        }

        let merged = match outcome {
            Err(reason) => {
                cx.outbox.error(
                    Topic::Record,
                    ErrorKind::RecordVersionExists,
                    format!("cannot merge {}: {reason}", self.name),
                );
                self.merge_failed = true;
                rs.dirty.set_dirty(&self.name, true, cx);
                if let Some(callback) = conflicted {
                    let err = ClientError::UnresolvedConflict {
                        name: self.name.clone(),
                        reason,
                    };
                    cx.outbox.call(move || callback(Err(err)));
                }
                return;
            }
            Ok(None) => {
                if let Some(callback) = conflicted {
                    let err = ClientError::RecordDestroyed(self.name.clone());
                    cx.outbox.call(move || callback(Err(err)));
                }
                if remote.version == NO_VERSION {
                    self.transition(Step::Deleted, cx, rs);
                } else if self.transition(Step::Delete, cx, rs) {
                    self.send_delete(cx, rs);
                }
                return;
            }
            Ok(Some(merged)) => merged,
        };

        // The rejected write only succeeds if the merge kept it.
        let conflicted = match conflicted {
            Some(callback) if merged != self.data => {
                let err = ClientError::VersionConflict {
                    name: self.name.clone(),
                    reason: format!("replaced by merge with remote version {}", remote.version),
                };
                cx.outbox.call(move || callback(Err(err)));
                None
            }
            other => other,
        };

        let remote_data = self.normalize(remote.data);
        let (merged, mut callbacks) = self.fold_pending_writes(merged);
        callbacks.extend(conflicted);
        let callback = join_callbacks(callbacks);

        if merged == remote_data {
            self.version = Some(remote.version);
            self.apply_change(merged, false, true, cx);
            self.transition(Step::Merged, cx, rs);
            if let Some(callback) = callback {
                cx.outbox.call(move || callback(Ok(())));
            }
            return;
        }
        if self.read_only {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::RecordReadOnlyMode,
                format!("merged data for {} cannot be written in read-only mode", self.name),
            );
            self.version = Some(remote.version);
            self.apply_change(remote_data, false, true, cx);
            self.transition(Step::Merged, cx, rs);
            if let Some(callback) = callback {
                let err = ClientError::ReadOnly(self.name.clone());
                cx.outbox.call(move || callback(Err(err)));
            }
            return;
        }

        self.apply_change(merged.clone(), false, false, cx);
        if remote.version == NO_VERSION {
            self.transition(Step::Merged, cx, rs);
            self.send_create_update(cx, rs);
            self.save_record_to_offline(cx);
            if let Some(callback) = callback {
                cx.outbox.call(move || callback(Ok(())));
            }
        } else {
            self.version = Some(remote.version);
            self.transition(Step::Merged, cx, rs);
            self.commit(None, Some(merged), callback, cx, rs);
        }
    }

    /// Deletes the record on the server.
    pub fn delete(&mut self, callback: DeleteCallback, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if self.destroyed {
            let err = ClientError::RecordDestroyed(self.name.clone());
            cx.outbox.call(move || callback(Err(err)));
            return;
        }
        if !cx.is_connected() {
            cx.outbox.call(move || callback(Err(ClientError::DeleteOffline)));
            return;
        }
        if !self.is_ready {
            self.ready_actions.push(ReadyAction::Delete(callback));
            return;
        }
        if self.delete_callback.is_some() || !self.transition(Step::Delete, cx, rs) {
            let err = ClientError::invalid_argument(format!(
                "cannot delete {} while {}",
                self.name,
                self.state()
            ));
            cx.outbox.call(move || callback(Err(err)));
            return;
        }
        self.delete_callback = Some(callback);
        self.send_delete(cx, rs);
    }

    fn send_delete(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if let Err(err) = cx.storage.delete(&self.name) {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::StorageError,
                format!("cannot delete {} offline: {err}", self.name),
            );
        }
        if cx.is_connected() {
            let message = Message::named(RecordAction::Delete, self.name.clone());
            let timeout = cx.config.record_delete_timeout;
            self.delete_timeout =
                cx.add_timeout(&message, ErrorKind::RecordDeleteTimeout, Some(timeout));
            cx.send(message);
        } else {
            self.transition(Step::DeleteSuccess, cx, rs);
        }
    }

    /// The server did not confirm the delete in time.
    pub fn on_delete_timeout(&mut self, cx: &mut Services<'_>) {
        self.delete_timeout = None;
        if let Some(callback) = self.delete_callback.take() {
            let err = ClientError::Timeout(RecordAction::Delete.as_str().to_string());
            cx.outbox.call(move || callback(Err(err)));
        }
    }

    fn on_deleted(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        debug!(record = %self.name, "record deleted");
        if let Err(err) = cx.storage.delete(&self.name) {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::StorageError,
                format!("cannot delete {} offline: {err}", self.name),
            );
        }
        rs.dirty.set_dirty(&self.name, false, cx);
        self.events.emit(&(), RecordEvent::Deleted, cx.outbox);
        if let Some(callback) = self.delete_callback.take() {
            cx.outbox.call(move || callback(Ok(())));
        }
        self.destroy(cx);
    }

    pub fn add_reference(&mut self, owner: OwnerId, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if self.references.is_empty() && self.state() == S::Unsubscribing {
            cx.cancel(&mut self.discard_timer);
            self.transition(Step::Subscribe, cx, rs);
        }
        self.references.insert(owner);
    }

    /// Drops a handle. The last one starts the discard grace period.
    pub fn remove_reference(&mut self, owner: OwnerId, cx: &mut Services<'_>, rs: &mut RecordServices) {
        if self.destroyed {
            return;
        }
        if !self.is_ready {
            self.ready_actions.push(ReadyAction::RemoveReference(owner));
            return;
        }
        self.remove_reference_now(owner, cx, rs);
    }

    fn remove_reference_now(&mut self, owner: OwnerId, cx: &mut Services<'_>, rs: &mut RecordServices) {
        self.references.remove(&owner);
        self.paths.off_owner(owner);
        self.events.off_owner(owner);
        if self.references.is_empty() && self.discard_timer.is_none() {
            let delay = cx.config.record_discard_timeout;
            self.discard_timer = Some(cx.schedule(
                delay,
                Task::DiscardRecord {
                    name: self.name.clone(),
                    core: self.id,
                },
            ));
            self.transition(Step::Unsubscribe, cx, rs);
        }
    }

    /// The discard grace period ran out.
    pub fn on_discard_timer(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        self.discard_timer = None;
        if !self.references.is_empty() || self.destroyed {
            return;
        }
        self.transition(Step::UnsubscribeForReal, cx, rs);
    }

    fn on_unsubscribed(&mut self, cx: &mut Services<'_>, _rs: &mut RecordServices) {
        debug!(record = %self.name, "record discarded");
        if cx.is_connected() {
            cx.send(
                Message::new(RecordAction::Unsubscribe)
                    .with_names(vec![self.name.clone()])
                    .with_correlation_id(self.name.clone()),
            );
        }
        self.events.emit(&(), RecordEvent::Discarded, cx.outbox);
        self.save_record_to_offline(cx);
        self.destroy(cx);
    }

    fn destroy(&mut self, cx: &mut Services<'_>) {
        cx.cancel(&mut self.discard_timer);
        cx.clear_timeout(&mut self.response_timeout);
        cx.clear_timeout(&mut self.delete_timeout);
        for write in std::mem::take(&mut self.pending_writes) {
            if let Some(callback) = write.callback {
                let err = ClientError::RecordDestroyed(self.name.clone());
                cx.outbox.call(move || callback(Err(err)));
            }
        }
        for action in std::mem::take(&mut self.ready_actions) {
            if let ReadyAction::Delete(callback) = action {
                let err = ClientError::RecordDestroyed(self.name.clone());
                cx.outbox.call(move || callback(Err(err)));
            }
        }
        self.paths.clear();
        self.events.clear();
        self.references.clear();
        self.is_ready = false;
        self.destroyed = true;
    }

    pub fn on_connection_lost(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        self.response_timeout = None;
        if self.state() == S::Deleting {
            self.delete_timeout = None;
            self.transition(Step::DeleteFailed, cx, rs);
            if let Some(callback) = self.delete_callback.take() {
                cx.outbox.call(move || callback(Err(ClientError::Offline)));
            }
        }
        self.save_record_to_offline(cx);
    }

    pub fn on_reestablished(&mut self, cx: &mut Services<'_>, rs: &mut RecordServices) {
        match self.state() {
            S::LoadingOffline => {
                if self.loaded {
                    self.transition(Step::SubscribeCreateAndRead, cx, rs);
                }
            }
            S::Subscribing => {
                self.transition(Step::SubscribeCreateAndRead, cx, rs);
            }
            S::Unsubscribing => {
                cx.cancel(&mut self.discard_timer);
                self.transition(Step::UnsubscribeForReal, cx, rs);
            }
            S::Ready | S::Merging | S::Resubscribing => {
                self.transition(Step::Resubscribe, cx, rs);
            }
            S::Deleting | S::Deleted | S::Unsubscribed => {
                warn!(record = %self.name, state = %self.state(), "reconnect in unexpected state");
            }
        }
    }
}

impl fmt::Debug for RecordCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCore")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("version", &self.version)
            .field("references", &self.references.len())
            .finish()
    }
}
