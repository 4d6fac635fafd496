//! Typed event emitter with owner tokens.

use crate::outbox::Outbox;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A registered callback.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Identifies the consumer that registered a callback.
///
/// Removing everything registered by one owner is how a discarded record
/// handle detaches from its shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub(crate) u64);

struct Entry<A> {
    id: ListenerId,
    owner: Option<OwnerId>,
    callback: Listener<A>,
}

/// Maps event keys to ordered callback lists.
pub(crate) struct Emitter<K, A> {
    listeners: HashMap<K, Vec<Entry<A>>>,
    next_id: u64,
}

impl<K, A> Emitter<K, A>
where
    K: Eq + Hash + Clone,
    A: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers `callback` for `key`.
    pub fn on(&mut self, key: K, owner: Option<OwnerId>, callback: Listener<A>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(key).or_default().push(Entry {
            id,
            owner,
            callback,
        });
        id
    }

    /// Removes one registration.
    pub fn off(&mut self, key: &K, id: ListenerId) -> bool {
        let Some(entries) = self.listeners.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.listeners.remove(key);
        }
        removed
    }

    /// Removes every registration for `key`, or only those of `owner`.
    pub fn off_key(&mut self, key: &K, owner: Option<OwnerId>) -> usize {
        let Some(entries) = self.listeners.get_mut(key) else {
            return 0;
        };
        let before = entries.len();
        match owner {
            Some(owner) => entries.retain(|entry| entry.owner != Some(owner)),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        if entries.is_empty() {
            self.listeners.remove(key);
        }
        removed
    }

    /// Removes every registration made by `owner`.
    pub fn off_owner(&mut self, owner: OwnerId) -> usize {
        let mut removed = 0;
        self.listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.owner != Some(owner));
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Queues a call of every callback registered for `key`.
    pub fn emit(&self, key: &K, arg: A, outbox: &mut Outbox) -> usize {
        let Some(entries) = self.listeners.get(key) else {
            return 0;
        };
        for entry in entries {
            let callback = Arc::clone(&entry.callback);
            let arg = arg.clone();
            outbox.call(move || callback(&arg));
        }
        entries.len()
    }

    /// Queues a call of one registration, if it still exists.
    pub fn emit_to(&self, key: &K, id: ListenerId, arg: A, outbox: &mut Outbox) -> bool {
        let callback = self
            .listeners
            .get(key)
            .and_then(|entries| entries.iter().find(|entry| entry.id == id))
            .map(|entry| Arc::clone(&entry.callback));
        match callback {
            Some(callback) => {
                outbox.call(move || callback(&arg));
                true
            }
            None => false,
        }
    }

    pub fn has_listeners(&self, key: &K) -> bool {
        self.listeners.contains_key(key)
    }

    /// Returns every key with at least one registration.
    pub fn event_names(&self) -> Vec<K> {
        self.listeners.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxItem;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<i32>>>, Listener<i32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |v: &i32| sink.lock().push(*v)))
    }

    fn run(outbox: &mut Outbox) {
        for item in outbox.take() {
            if let OutboxItem::Call(call) = item {
                call();
            }
        }
    }

    #[test]
    fn emits_in_registration_order() {
        let mut emitter = Emitter::new();
        let (seen, cb) = recorder();
        let first = Arc::clone(&cb);
        let second: Listener<i32> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |v: &i32| seen.lock().push(v * 10))
        };
        emitter.on("x", None, first);
        emitter.on("x", None, second);

        let mut outbox = Outbox::default();
        assert_eq!(emitter.emit(&"x", 2, &mut outbox), 2);
        run(&mut outbox);
        assert_eq!(*seen.lock(), vec![2, 20]);
    }

    #[test]
    fn off_removes_single_registration() {
        let mut emitter = Emitter::new();
        let (_, cb) = recorder();
        let id = emitter.on("x", None, cb);
        assert!(emitter.off(&"x", id));
        assert!(!emitter.off(&"x", id));
        assert!(!emitter.has_listeners(&"x"));
    }

    #[test]
    fn off_owner_spans_keys() {
        let mut emitter = Emitter::new();
        let (_, cb) = recorder();
        let owner = OwnerId(1);
        let other = OwnerId(2);
        emitter.on("a", Some(owner), Arc::clone(&cb));
        emitter.on("b", Some(owner), Arc::clone(&cb));
        emitter.on("b", Some(other), cb);

        assert_eq!(emitter.off_owner(owner), 2);
        assert_eq!(emitter.event_names(), vec!["b"]);
    }

    #[test]
    fn off_key_by_owner() {
        let mut emitter = Emitter::new();
        let (_, cb) = recorder();
        emitter.on("a", Some(OwnerId(1)), Arc::clone(&cb));
        emitter.on("a", Some(OwnerId(2)), Arc::clone(&cb));
        assert_eq!(emitter.off_key(&"a", Some(OwnerId(1))), 1);
        assert!(emitter.has_listeners(&"a"));
        assert_eq!(emitter.off_key(&"a", None), 1);
        assert!(!emitter.has_listeners(&"a"));
    }
}
