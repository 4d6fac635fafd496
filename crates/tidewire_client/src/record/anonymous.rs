//! A record handle whose name can change.

use super::handle::Record;
use crate::client::Client;
use crate::emitter::Listener;
use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

struct Subscription {
    path: Option<String>,
    callback: Listener<Value>,
    trigger_now: bool,
}

/// Follows whichever record [`set_name`](Self::set_name) last pointed it at.
///
/// Subscriptions belong to the handle and move with it from record to record.
pub struct AnonymousRecord {
    client: Client,
    record: Option<Record>,
    subscriptions: Vec<Subscription>,
}

impl AnonymousRecord {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            record: None,
            subscriptions: Vec::new(),
        }
    }

    /// Name of the current record, if any.
    pub fn name(&self) -> Option<&str> {
        self.record.as_ref().map(Record::name)
    }

    /// Switches to `name`, releasing the previous record.
    pub fn set_name(&mut self, name: &str) -> ClientResult<()> {
        if self.name() == Some(name) {
            return Ok(());
        }
        let record = Record::open(&self.client, name, false)?;
        if let Some(previous) = self.record.take() {
            previous.discard()?;
        }
        for subscription in &self.subscriptions {
            record.subscribe_listener(
                subscription.path.as_deref(),
                Arc::clone(&subscription.callback),
                subscription.trigger_now,
            )?;
        }
        self.record = Some(record);
        Ok(())
    }

    fn current(&self) -> ClientResult<&Record> {
        self.record
            .as_ref()
            .ok_or_else(|| ClientError::invalid_argument("anonymous record has no name yet"))
    }

    pub fn is_ready(&self) -> bool {
        self.record.as_ref().is_some_and(Record::is_ready)
    }

    pub fn get(&self, path: Option<&str>) -> Option<Value> {
        self.record.as_ref().and_then(|record| record.get(path))
    }

    pub fn set(&self, path: Option<&str>, data: Value) -> ClientResult<()> {
        self.current()?.set(path, data)
    }

    pub async fn set_with_ack(&self, path: Option<&str>, data: Value) -> ClientResult<()> {
        self.current()?.set_with_ack(path, data).await
    }

    pub fn erase(&self, path: &str) -> ClientResult<()> {
        self.current()?.erase(path)
    }

    /// Subscribes to `path` on the current and every later record.
    pub fn subscribe(
        &mut self,
        path: Option<&str>,
        callback: impl Fn(&Value) + Send + Sync + 'static,
        trigger_now: bool,
    ) -> ClientResult<()> {
        let subscription = Subscription {
            path: path.map(str::to_string),
            callback: Arc::new(callback),
            trigger_now,
        };
        if let Some(record) = &self.record {
            record.subscribe_listener(path, Arc::clone(&subscription.callback), trigger_now)?;
        }
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Drops every subscription on `path`.
    pub fn unsubscribe(&mut self, path: Option<&str>) -> ClientResult<()> {
        self.subscriptions
            .retain(|subscription| subscription.path.as_deref() != path);
        match &self.record {
            Some(record) => record.unsubscribe(path, None),
            None => Ok(()),
        }
    }

    pub fn when_ready(&self, callback: impl FnOnce() + Send + 'static) -> ClientResult<()> {
        self.current()?.when_ready(callback)
    }

    pub async fn ready(&self) -> ClientResult<()> {
        self.current()?.ready().await
    }

    pub async fn delete(&self) -> ClientResult<()> {
        self.current()?.delete().await
    }

    /// Releases the current record and forgets every subscription.
    pub fn discard(mut self) -> ClientResult<()> {
        self.subscriptions.clear();
        match self.record.take() {
            Some(record) => record.discard(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for AnonymousRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousRecord")
            .field("record", &self.record)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
