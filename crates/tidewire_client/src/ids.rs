//! Unique id generation for RPC correlation ids.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Produces unique ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Returns a new id.
    fn next_id(&self) -> String;
}

/// Generates `<base36 millis>-<random suffix>` ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UidGenerator;

impl UidGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for UidGenerator {
    fn next_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", to_base36(millis), &suffix[..12])
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Deterministic generator for tests: `<prefix>1`, `<prefix>2`, ...
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Creates a generator with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new("id-")
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}
