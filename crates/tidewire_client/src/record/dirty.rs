//! Index of records with writes the server has not confirmed.
//!
//! The index lives in the offline store under its own key and is written
//! back with a debounce, so a burst of writes costs one store write.

use super::CoreId;
use crate::config::ClientConfig;
use crate::outbox::ErrorKind;
use crate::services::Services;
use crate::task::Task;
use crate::timer::TimerRef;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tidewire_protocol::Topic;
use tracing::{debug, trace};

#[derive(Debug)]
pub(crate) struct DirtyService {
    storage_key: String,
    flush_interval: Duration,
    dirty: BTreeSet<String>,
    loaded: bool,
    waiting: Vec<(String, CoreId)>,
    flush_timer: Option<TimerRef>,
}

impl DirtyService {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            storage_key: config.dirty_storage_key.clone(),
            flush_interval: config.dirty_flush_interval,
            dirty: BTreeSet::new(),
            loaded: false,
            waiting: Vec::new(),
            flush_timer: None,
        }
    }

    /// Reads the persisted index. Returns the cores that were waiting for it.
    pub fn load(&mut self, cx: &mut Services<'_>) -> Vec<(String, CoreId)> {
        if self.loaded {
            return Vec::new();
        }
        match cx.storage.get(&self.storage_key) {
            Ok(Some(snapshot)) => {
                if let Value::Array(names) = snapshot.data {
                    self.dirty.extend(
                        names
                            .into_iter()
                            .filter_map(|name| name.as_str().map(str::to_string)),
                    );
                }
            }
            Ok(None) => {}
            Err(err) => cx.outbox.error(
                Topic::Record,
                ErrorKind::StorageError,
                format!("cannot load dirty index: {err}"),
            ),
        }
        debug!(count = self.dirty.len(), "dirty index loaded");
        self.loaded = true;
        std::mem::take(&mut self.waiting)
    }

    /// Returns true if the index is loaded. Otherwise the core is remembered
    /// and handed back by [`load`](Self::load).
    pub fn when_loaded(&mut self, name: &str, core: CoreId) -> bool {
        if self.loaded {
            return true;
        }
        self.waiting.push((name.to_string(), core));
        false
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    pub fn set_dirty(&mut self, name: &str, dirty: bool, cx: &mut Services<'_>) {
        let changed = if dirty {
            self.dirty.insert(name.to_string())
        } else {
            self.dirty.remove(name)
        };
        if !changed {
            return;
        }
        trace!(record = %name, dirty, "dirty flag changed");
        let pending = self.flush_timer.map_or(false, |timer| cx.timers.has(timer));
        if !pending {
            self.flush_timer = Some(cx.schedule(self.flush_interval, Task::DirtyFlush));
        }
    }

    /// Persists the index now.
    pub fn flush(&mut self, cx: &mut Services<'_>) {
        cx.cancel(&mut self.flush_timer);
        let names = Value::Array(self.dirty.iter().cloned().map(Value::String).collect());
        if let Err(err) = cx.storage.set(&self.storage_key, 1, &names) {
            cx.outbox.error(
                Topic::Record,
                ErrorKind::StorageError,
                format!("cannot save dirty index: {err}"),
            );
        }
    }

    pub fn dirty_names(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }
}
