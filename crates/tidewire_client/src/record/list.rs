//! A record holding an ordered list of record names.

use super::handle::Record;
use super::{RecordEvent, RecordState};
use crate::emitter::{Listener, ListenerId};
use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::sync::Arc;

/// A record whose data is a JSON array of record names.
///
/// Data that is not an array reads as an empty list.
#[derive(Debug)]
pub struct List {
    record: Record,
}

impl List {
    pub(crate) fn new(record: Record) -> Self {
        Self { record }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn state(&self) -> Option<RecordState> {
        self.record.state()
    }

    pub fn version(&self) -> Option<i64> {
        self.record.version()
    }

    pub fn is_ready(&self) -> bool {
        self.record.is_ready()
    }

    /// Current entries in order.
    pub fn entries(&self) -> Vec<String> {
        entries_of(self.record.get(None))
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Replaces every entry.
    pub fn set_entries(&self, entries: Vec<String>) -> ClientResult<()> {
        self.record.write(None, Some(to_value(entries)), None)
    }

    /// Like [`set_entries`](Self::set_entries), reporting when the server
    /// stored the write.
    pub fn set_entries_with_callback(
        &self,
        entries: Vec<String>,
        callback: impl FnOnce(ClientResult<()>) + Send + 'static,
    ) -> ClientResult<()> {
        self.record
            .write(None, Some(to_value(entries)), Some(Box::new(callback)))
    }

    /// Inserts `entry` at `index`, or appends it.
    pub fn add_entry(&self, entry: &str, index: Option<usize>) -> ClientResult<()> {
        let mut entries = self.entries();
        match checked_index(index, entries.len())? {
            Some(index) => entries.insert(index, entry.to_string()),
            None => entries.push(entry.to_string()),
        }
        self.set_entries(entries)
    }

    /// Removes every occurrence of `entry`, or only the one at `index`.
    pub fn remove_entry(&self, entry: &str, index: Option<usize>) -> ClientResult<()> {
        let entries = self.entries();
        let index = checked_index(index, entries.len())?;
        let kept = entries
            .into_iter()
            .enumerate()
            .filter(|(i, e)| e != entry || index.is_some_and(|index| index != *i))
            .map(|(_, e)| e)
            .collect();
        self.set_entries(kept)
    }

    /// Calls `callback` with all entries whenever the list changes.
    pub fn subscribe(
        &self,
        callback: impl Fn(&[String]) + Send + Sync + 'static,
        trigger_now: bool,
    ) -> ClientResult<ListenerId> {
        let listener: Listener<Value> = Arc::new(move |value: &Value| {
            callback(&entries_of(Some(value.clone())));
        });
        self.record.subscribe_listener(None, listener, trigger_now)
    }

    /// Removes one subscription, or all of this handle's.
    pub fn unsubscribe(&self, id: Option<ListenerId>) -> ClientResult<()> {
        self.record.unsubscribe(None, id)
    }

    pub fn on_event(
        &self,
        callback: impl Fn(&RecordEvent) + Send + Sync + 'static,
    ) -> ClientResult<ListenerId> {
        self.record.on_event(callback)
    }

    pub fn when_ready(&self, callback: impl FnOnce() + Send + 'static) -> ClientResult<()> {
        self.record.when_ready(callback)
    }

    pub async fn ready(&self) -> ClientResult<()> {
        self.record.ready().await
    }

    pub async fn delete(&self) -> ClientResult<()> {
        self.record.delete().await
    }

    pub fn discard(self) -> ClientResult<()> {
        self.record.discard()
    }
}

fn entries_of(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(name),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn to_value(entries: Vec<String>) -> Value {
    Value::Array(entries.into_iter().map(Value::String).collect())
}

/// An index may point at any entry or one past the end.
fn checked_index(index: Option<usize>, len: usize) -> ClientResult<Option<usize>> {
    match index {
        Some(index) if index > len => Err(ClientError::invalid_argument(format!(
            "index {index} is outside the {len} current entries"
        ))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_arrays_read_as_empty() {
        assert!(entries_of(Some(json!({"a": 1}))).is_empty());
        assert!(entries_of(None).is_empty());
        assert_eq!(entries_of(Some(json!(["a", 3, "b"]))), vec!["a", "b"]);
    }

    #[test]
    fn index_may_be_one_past_the_end() {
        assert_eq!(checked_index(Some(2), 2).unwrap(), Some(2));
        assert_eq!(checked_index(None, 0).unwrap(), None);
        assert!(checked_index(Some(3), 2).is_err());
    }
}
