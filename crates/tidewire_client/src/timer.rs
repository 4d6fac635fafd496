//! Timer registries.
//!
//! Timers carry a task value instead of a closure. The owner drains due
//! tasks with [`TimerRegistry::take_due`] and dispatches them itself, which
//! keeps the registry free of borrows into the rest of the client.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerRef(u64);

/// Schedules and cancels delayed tasks.
pub trait TimerRegistry<T>: Send {
    /// Schedules `task` to fire `delay` after `now`.
    fn add(&mut self, now: Duration, delay: Duration, task: T) -> TimerRef;

    /// Cancels a timer. Returns false if it already fired or was cancelled.
    fn remove(&mut self, timer: TimerRef) -> bool;

    /// Returns true if the timer is still pending.
    fn has(&self, timer: TimerRef) -> bool;

    /// Queues a task for the next idle turn.
    fn request_idle(&mut self, task: T);

    /// Removes and returns idle tasks followed by every timer due at `now`.
    fn take_due(&mut self, now: Duration) -> Vec<T>;

    /// Returns the next time `take_due` could return something.
    fn next_deadline(&self, now: Duration) -> Option<Duration>;

    /// Drops every pending timer and idle task.
    fn close(&mut self);

    /// Returns the number of pending timers, excluding idle tasks.
    fn pending(&self) -> usize;
}

/// Registry that fires timers from one periodic sweep.
///
/// A timer fires at the first sweep after its delay elapsed, so its accuracy
/// is bounded by the sweep resolution.
#[derive(Debug)]
pub struct IntervalTimerRegistry<T> {
    resolution: Duration,
    last_sweep: Duration,
    timers: BTreeMap<u64, IntervalEntry<T>>,
    idle: VecDeque<T>,
    next_id: u64,
}

#[derive(Debug)]
struct IntervalEntry<T> {
    created: Duration,
    delay: Duration,
    task: T,
}

impl<T> IntervalTimerRegistry<T> {
    /// Creates a registry sweeping every `resolution`.
    pub fn new(resolution: Duration) -> Self {
        Self {
            resolution: resolution.max(Duration::from_millis(1)),
            last_sweep: Duration::ZERO,
            timers: BTreeMap::new(),
            idle: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<T: Send> TimerRegistry<T> for IntervalTimerRegistry<T> {
    fn add(&mut self, now: Duration, delay: Duration, task: T) -> TimerRef {
        self.next_id += 1;
        self.timers.insert(
            self.next_id,
            IntervalEntry {
                created: now,
                delay,
                task,
            },
        );
        TimerRef(self.next_id)
    }

    fn remove(&mut self, timer: TimerRef) -> bool {
        self.timers.remove(&timer.0).is_some()
    }

    fn has(&self, timer: TimerRef) -> bool {
        self.timers.contains_key(&timer.0)
    }

    fn request_idle(&mut self, task: T) {
        self.idle.push_back(task);
    }

    fn take_due(&mut self, now: Duration) -> Vec<T> {
        let mut due: Vec<T> = self.idle.drain(..).collect();
        if now < self.last_sweep + self.resolution {
            return due;
        }
        self.last_sweep = now;

        let expired: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.created) >= entry.delay)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.timers.remove(&id) {
                due.push(entry.task);
            }
        }
        due
    }

    fn next_deadline(&self, now: Duration) -> Option<Duration> {
        if !self.idle.is_empty() {
            return Some(now);
        }
        if self.timers.is_empty() {
            return None;
        }
        Some((self.last_sweep + self.resolution).max(now))
    }

    fn close(&mut self) {
        self.timers.clear();
        self.idle.clear();
    }

    fn pending(&self) -> usize {
        self.timers.len()
    }
}

/// Registry that fires every timer exactly at its own deadline.
#[derive(Debug)]
pub struct NativeTimerRegistry<T> {
    timers: BTreeMap<(Duration, u64), T>,
    deadlines: HashMap<u64, Duration>,
    idle: VecDeque<T>,
    next_id: u64,
}

impl<T> NativeTimerRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            deadlines: HashMap::new(),
            idle: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<T> Default for NativeTimerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> TimerRegistry<T> for NativeTimerRegistry<T> {
    fn add(&mut self, now: Duration, delay: Duration, task: T) -> TimerRef {
        self.next_id += 1;
        let deadline = now + delay;
        self.timers.insert((deadline, self.next_id), task);
        self.deadlines.insert(self.next_id, deadline);
        TimerRef(self.next_id)
    }

    fn remove(&mut self, timer: TimerRef) -> bool {
        match self.deadlines.remove(&timer.0) {
            Some(deadline) => self.timers.remove(&(deadline, timer.0)).is_some(),
            None => false,
        }
    }

    fn has(&self, timer: TimerRef) -> bool {
        self.deadlines.contains_key(&timer.0)
    }

    fn request_idle(&mut self, task: T) {
        self.idle.push_back(task);
    }

    fn take_due(&mut self, now: Duration) -> Vec<T> {
        let mut due: Vec<T> = self.idle.drain(..).collect();
        let expired: Vec<(Duration, u64)> = self
            .timers
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.deadlines.remove(&key.1);
            if let Some(task) = self.timers.remove(&key) {
                due.push(task);
            }
        }
        due
    }

    fn next_deadline(&self, now: Duration) -> Option<Duration> {
        if !self.idle.is_empty() {
            return Some(now);
        }
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    fn close(&mut self) {
        self.timers.clear();
        self.deadlines.clear();
        self.idle.clear();
    }

    fn pending(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn native_fires_at_deadline_in_order() {
        let mut timers = NativeTimerRegistry::new();
        timers.add(ms(0), ms(300), "late");
        timers.add(ms(0), ms(100), "early");

        assert!(timers.take_due(ms(99)).is_empty());
        assert_eq!(timers.take_due(ms(100)), vec!["early"]);
        assert_eq!(timers.next_deadline(ms(100)), Some(ms(300)));
        assert_eq!(timers.take_due(ms(1000)), vec!["late"]);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn native_remove_cancels() {
        let mut timers = NativeTimerRegistry::new();
        let timer = timers.add(ms(0), ms(10), 1);
        assert!(timers.has(timer));
        assert!(timers.remove(timer));
        assert!(!timers.remove(timer));
        assert!(!timers.has(timer));
        assert!(timers.take_due(ms(50)).is_empty());
    }

    #[test]
    fn idle_tasks_run_first() {
        let mut timers = NativeTimerRegistry::new();
        timers.add(ms(0), ms(0), "timer");
        timers.request_idle("idle");
        assert_eq!(timers.next_deadline(ms(5)), Some(ms(5)));
        assert_eq!(timers.take_due(ms(0)), vec!["idle", "timer"]);
    }

    #[test]
    fn interval_fires_only_on_sweeps() {
        let mut timers = IntervalTimerRegistry::new(ms(100));
        timers.add(ms(50), ms(100), "a");

        // Sweep at 100: only 50ms elapsed.
        assert!(timers.take_due(ms(100)).is_empty());
        // Between sweeps nothing fires even though the delay elapsed.
        assert!(timers.take_due(ms(160)).is_empty());
        assert_eq!(timers.next_deadline(ms(160)), Some(ms(200)));
        assert_eq!(timers.take_due(ms(200)), vec!["a"]);
    }

    #[test]
    fn interval_remove_and_close() {
        let mut timers = IntervalTimerRegistry::new(ms(10));
        let a = timers.add(ms(0), ms(5), "a");
        timers.add(ms(0), ms(5), "b");
        assert!(timers.remove(a));
        assert_eq!(timers.pending(), 1);

        timers.close();
        assert_eq!(timers.pending(), 0);
        assert_eq!(timers.next_deadline(ms(0)), None);
    }
}
