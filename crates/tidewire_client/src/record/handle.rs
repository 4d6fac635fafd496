//! Public record handles.

use super::handler::RecordServices;
use super::merge::MergeStrategy;
use super::record_core::{RecordCore, RecordState};
use super::{AnonymousRecord, CoreId, List, RecordEvent, RecordSnapshot, WriteCallback};
use crate::client::{completion, Client};
use crate::emitter::{Listener, ListenerId, OwnerId};
use crate::error::{ClientError, ClientResult};
use crate::services::Services;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tidewire_storage::NO_VERSION;

/// Record operations of a [`Client`].
#[derive(Clone, Debug)]
pub struct Records {
    client: Client,
}

impl Records {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns a handle to `name`, subscribing to it if no other handle
    /// exists.
    pub fn get_record(&self, name: &str) -> ClientResult<Record> {
        Record::open(&self.client, name, false)
    }

    /// Returns a list handle to `name`.
    pub fn get_list(&self, name: &str) -> ClientResult<List> {
        Record::open(&self.client, name, true).map(List::new)
    }

    /// Returns a handle that can be pointed at different records over time.
    pub fn get_anonymous_record(&self) -> AnonymousRecord {
        AnonymousRecord::new(self.client.clone())
    }

    /// Reads data and version once without subscribing.
    pub fn snapshot_with(
        &self,
        name: &str,
        callback: impl FnOnce(ClientResult<RecordSnapshot>) + Send + 'static,
    ) -> ClientResult<()> {
        let callback = Box::new(callback);
        self.client
            .with_services(|cx, h| h.records.snapshot(name, callback, cx))
    }

    pub async fn snapshot(&self, name: &str) -> ClientResult<RecordSnapshot> {
        completion(|done| self.snapshot_with(name, done)).await
    }

    /// Reads the version once; `-1` means the record does not exist.
    pub fn head_with(
        &self,
        name: &str,
        callback: impl FnOnce(ClientResult<i64>) + Send + 'static,
    ) -> ClientResult<()> {
        let callback = Box::new(callback);
        self.client
            .with_services(|cx, h| h.records.head(name, callback, cx))
    }

    pub async fn head(&self, name: &str) -> ClientResult<i64> {
        completion(|done| self.head_with(name, done)).await
    }

    /// Checks whether the record exists on the server.
    pub fn has_with(
        &self,
        name: &str,
        callback: impl FnOnce(ClientResult<bool>) + Send + 'static,
    ) -> ClientResult<()> {
        self.head_with(name, move |result| {
            callback(match result {
                Ok(version) => Ok(version != NO_VERSION),
                Err(ClientError::NotFound(_)) => Ok(false),
                Err(err) => Err(err),
            })
        })
    }

    pub async fn has(&self, name: &str) -> ClientResult<bool> {
        completion(|done| self.has_with(name, done)).await
    }

    /// Resolves conflicts on `name` with `strategy`.
    pub fn set_merge_strategy(&self, name: &str, strategy: MergeStrategy) {
        self.client
            .with_services(|_, h| h.records.set_merge_strategy(name, strategy));
    }

    /// Resolves conflicts on every name matching `pattern` with `strategy`.
    pub fn set_merge_strategy_by_pattern(
        &self,
        pattern: &str,
        strategy: MergeStrategy,
    ) -> ClientResult<()> {
        let pattern = Regex::new(pattern)
            .map_err(|err| ClientError::invalid_argument(format!("invalid pattern: {err}")))?;
        self.client
            .with_services(|_, h| h.records.set_merge_strategy_by_pattern(pattern, strategy));
        Ok(())
    }

    /// Replaces the strategy used when no name or pattern matches.
    pub fn set_default_merge_strategy(&self, strategy: Option<MergeStrategy>) {
        self.client
            .with_services(|_, h| h.records.set_default_merge_strategy(strategy));
    }

    /// Names with local changes the server has not confirmed.
    pub fn dirty_names(&self) -> Vec<String> {
        self.client.inspect(|core| core.records().dirty_names())
    }
}

/// A handle to one shared record.
///
/// Every handle holds a reference on the record; [`discard`](Self::discard)
/// releases it. Handles that are simply dropped keep the record subscribed
/// until the client closes.
pub struct Record {
    client: Client,
    name: String,
    core: CoreId,
    owner: OwnerId,
}

impl Record {
    pub(crate) fn open(client: &Client, name: &str, list: bool) -> ClientResult<Self> {
        let (core, owner) = client.with_services(|cx, h| {
            let owner = h.records.new_owner();
            h.records
                .get_core(name, owner, list, cx)
                .map(|core| (core, owner))
        })?;
        Ok(Self {
            client: client.clone(),
            name: name.to_string(),
            core,
            owner,
        })
    }

    fn with_core<R>(
        &self,
        f: impl FnOnce(&mut RecordCore, &mut Services<'_>, &mut RecordServices) -> R,
    ) -> ClientResult<R> {
        self.client
            .with_services(|cx, h| h.records.with_core(&self.name, self.core, cx, f))
    }

    fn read<R>(&self, f: impl FnOnce(&RecordCore) -> R) -> ClientResult<R> {
        self.client
            .inspect(|core| core.records().core(&self.name, self.core).map(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, or `None` once the record was discarded or deleted.
    pub fn state(&self) -> Option<RecordState> {
        self.read(RecordCore::state).ok()
    }

    pub fn version(&self) -> Option<i64> {
        self.read(RecordCore::version).ok().flatten()
    }

    pub fn is_ready(&self) -> bool {
        self.read(RecordCore::is_ready).unwrap_or(false)
    }

    pub fn is_destroyed(&self) -> bool {
        self.read(|_| ()).is_err()
    }

    /// True while another client provides this record.
    pub fn has_provider(&self) -> bool {
        self.read(RecordCore::has_provider).unwrap_or(false)
    }

    /// Value at `path`, or the whole record.
    pub fn get(&self, path: Option<&str>) -> Option<Value> {
        self.read(|core| core.get(path)).ok().flatten()
    }

    /// Writes `data` at `path`, or replaces the whole record.
    pub fn set(&self, path: Option<&str>, data: Value) -> ClientResult<()> {
        self.write(path, Some(data), None)
    }

    /// Like [`set`](Self::set), reporting when the server stored the write.
    pub fn set_with_callback(
        &self,
        path: Option<&str>,
        data: Value,
        callback: impl FnOnce(ClientResult<()>) + Send + 'static,
    ) -> ClientResult<()> {
        self.write(path, Some(data), Some(Box::new(callback)))
    }

    pub async fn set_with_ack(&self, path: Option<&str>, data: Value) -> ClientResult<()> {
        completion(|done| self.write(path, Some(data), Some(done))).await
    }

    /// Removes the value at `path`.
    pub fn erase(&self, path: &str) -> ClientResult<()> {
        if path.is_empty() {
            return Err(ClientError::invalid_argument("erase needs a path"));
        }
        self.write(Some(path), None, None)
    }

    pub(crate) fn write(
        &self,
        path: Option<&str>,
        data: Option<Value>,
        callback: Option<WriteCallback>,
    ) -> ClientResult<()> {
        self.with_core(|core, cx, rs| core.set(path, data, callback, cx, rs))?
    }

    /// Calls `callback` with the value at `path` whenever it changes.
    pub fn subscribe(
        &self,
        path: Option<&str>,
        callback: impl Fn(&Value) + Send + Sync + 'static,
        trigger_now: bool,
    ) -> ClientResult<ListenerId> {
        let callback: Listener<Value> = Arc::new(callback);
        self.subscribe_listener(path, callback, trigger_now)
    }

    pub(crate) fn subscribe_listener(
        &self,
        path: Option<&str>,
        callback: Listener<Value>,
        trigger_now: bool,
    ) -> ClientResult<ListenerId> {
        let owner = self.owner;
        self.with_core(|core, cx, _| core.subscribe(path, owner, callback, trigger_now, cx))
    }

    /// Removes one subscription, or all of this handle's on `path`.
    pub fn unsubscribe(&self, path: Option<&str>, id: Option<ListenerId>) -> ClientResult<()> {
        let owner = self.owner;
        self.with_core(|core, _, _| core.unsubscribe(path, owner, id))
    }

    /// Receives lifecycle notifications.
    pub fn on_event(
        &self,
        callback: impl Fn(&RecordEvent) + Send + Sync + 'static,
    ) -> ClientResult<ListenerId> {
        let owner = self.owner;
        let callback: Listener<RecordEvent> = Arc::new(callback);
        self.with_core(|core, _, _| core.on_event(owner, callback))
    }

    pub fn off_event(&self, id: ListenerId) -> ClientResult<bool> {
        self.with_core(|core, _, _| core.off_event(id))
    }

    /// Runs `callback` once the record has loaded.
    pub fn when_ready(&self, callback: impl FnOnce() + Send + 'static) -> ClientResult<()> {
        let callback = Box::new(callback);
        self.with_core(|core, cx, _| core.when_ready(callback, cx))
    }

    pub async fn ready(&self) -> ClientResult<()> {
        completion(|done| self.when_ready(move || done(Ok(())))).await
    }

    /// Deletes the record for every client.
    pub fn delete_with(
        &self,
        callback: impl FnOnce(ClientResult<()>) + Send + 'static,
    ) -> ClientResult<()> {
        let callback = Box::new(callback);
        self.with_core(|core, cx, rs| core.delete(callback, cx, rs))
    }

    pub async fn delete(&self) -> ClientResult<()> {
        completion(|done| self.delete_with(done)).await
    }

    /// Releases this handle's reference and every callback it registered.
    pub fn discard(self) -> ClientResult<()> {
        let owner = self.owner;
        self.with_core(|core, cx, rs| core.remove_reference(owner, cx, rs))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("core", &self.core)
            .field("owner", &self.owner)
            .finish()
    }
}
