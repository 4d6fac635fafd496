//! Conflict resolution between local and remote record states.

use super::{CoreId, MergeOutcome, RemoteRecord};
use crate::services::Services;
use crate::task::Task;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Both sides of a conflict, as seen by a [`MergeStrategy`].
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Record name.
    pub name: &'a str,
    /// Local data.
    pub local: &'a Value,
    /// Local version.
    pub local_version: i64,
    /// Remote data, `None` if the record is gone remotely.
    pub remote: Option<&'a Value>,
    /// Remote version.
    pub remote_version: i64,
}

type MergeFn = dyn Fn(&MergeContext<'_>) -> MergeOutcome + Send + Sync;

/// Resolves a version conflict.
///
/// The function returns the merged data, `Ok(None)` to delete the record, or
/// an error reason if it cannot resolve the conflict. It runs while the
/// client is locked and must not call back into the client.
#[derive(Clone)]
pub struct MergeStrategy(Arc<MergeFn>);

impl MergeStrategy {
    /// Wraps a merge function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&MergeContext<'_>) -> Result<Option<Value>, String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Keeps the server's data. A record deleted remotely stays deleted.
    pub fn remote_wins() -> Self {
        Self::new(|cx| Ok(cx.remote.cloned()))
    }

    /// Keeps the local data.
    pub fn local_wins() -> Self {
        Self::new(|cx| Ok(Some(cx.local.clone())))
    }

    /// Runs the strategy.
    pub fn merge(&self, cx: &MergeContext<'_>) -> MergeOutcome {
        (self.0)(cx)
    }
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MergeStrategy")
    }
}

/// Picks the strategy for a record: exact name, then first matching pattern,
/// then the default.
#[derive(Debug, Default)]
pub(crate) struct MergeStrategyService {
    by_name: HashMap<String, MergeStrategy>,
    by_pattern: Vec<(Regex, MergeStrategy)>,
    default: Option<MergeStrategy>,
}

impl MergeStrategyService {
    pub fn new(default: Option<MergeStrategy>) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn set_for_name(&mut self, name: &str, strategy: MergeStrategy) {
        self.by_name.insert(name.to_string(), strategy);
    }

    /// Registers a strategy for names matching `pattern`. Registering the
    /// same pattern again replaces its strategy.
    pub fn set_for_pattern(&mut self, pattern: Regex, strategy: MergeStrategy) {
        match self
            .by_pattern
            .iter_mut()
            .find(|(existing, _)| existing.as_str() == pattern.as_str())
        {
            Some(entry) => entry.1 = strategy,
            None => self.by_pattern.push((pattern, strategy)),
        }
    }

    pub fn set_default(&mut self, strategy: Option<MergeStrategy>) {
        self.default = strategy;
    }

    fn strategy_for(&self, name: &str) -> Option<&MergeStrategy> {
        self.by_name
            .get(name)
            .or_else(|| {
                self.by_pattern
                    .iter()
                    .find(|(pattern, _)| pattern.is_match(name))
                    .map(|(_, strategy)| strategy)
            })
            .or(self.default.as_ref())
    }

    /// Resolves a conflict. The outcome is delivered to the core as an idle
    /// task, and is an error if no strategy applies.
    pub fn merge(
        &self,
        name: &str,
        core: CoreId,
        remote: RemoteRecord,
        local_version: i64,
        local: &Value,
        cx: &mut Services<'_>,
    ) {
        let outcome = match self.strategy_for(name) {
            Some(strategy) => strategy.merge(&MergeContext {
                name,
                local,
                local_version,
                remote: remote.data.as_ref(),
                remote_version: remote.version,
            }),
            None => Err(format!("no merge strategy for {name}")),
        };
        debug!(record = %name, local_version, remote_version = remote.version, ok = outcome.is_ok(), "merged");
        cx.idle(Task::MergeResolved {
            name: name.to_string(),
            core,
            remote,
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::timer::TimerRegistry;
    use serde_json::json;

    fn remote(version: i64, data: Value) -> RemoteRecord {
        RemoteRecord {
            version,
            data: Some(data),
            correlation_id: None,
        }
    }

    fn resolved(harness: &mut Harness) -> MergeOutcome {
        match harness.timers.take_due(harness.now).pop() {
            Some(Task::MergeResolved { outcome, .. }) => outcome,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lookup_order() {
        let mut harness = Harness::connected();
        let mut merge = MergeStrategyService::new(Some(MergeStrategy::remote_wins()));
        merge.set_for_pattern(Regex::new("^user/").unwrap(), MergeStrategy::local_wins());
        merge.set_for_name(
            "user/admin",
            MergeStrategy::new(|_| Ok(Some(json!("named")))),
        );

        let local = json!({"side": "local"});
        let remote_data = json!({"side": "remote"});
        for (name, expected) in [
            ("user/admin", json!("named")),
            ("user/7", local.clone()),
            ("doc", remote_data.clone()),
        ] {
            merge.merge(
                name,
                CoreId(1),
                remote(3, remote_data.clone()),
                2,
                &local,
                &mut harness.services(),
            );
            assert_eq!(resolved(&mut harness), Ok(Some(expected)));
        }
    }

    #[test]
    fn missing_strategy_resolves_to_an_error() {
        let mut harness = Harness::connected();
        let merge = MergeStrategyService::new(None);
        merge.merge(
            "doc",
            CoreId(1),
            remote(3, json!({})),
            2,
            &json!({}),
            &mut harness.services(),
        );
        assert_eq!(
            resolved(&mut harness),
            Err("no merge strategy for doc".to_string())
        );
    }

    #[test]
    fn remote_wins_keeps_remote_deletion() {
        let outcome = MergeStrategy::remote_wins().merge(&MergeContext {
            name: "doc",
            local: &json!({"a": 1}),
            local_version: 4,
            remote: None,
            remote_version: -1,
        });
        assert_eq!(outcome, Ok(None));
    }

    #[test]
    fn same_pattern_replaces() {
        let mut merge = MergeStrategyService::new(None);
        merge.set_for_pattern(Regex::new("^a").unwrap(), MergeStrategy::local_wins());
        merge.set_for_pattern(Regex::new("^a").unwrap(), MergeStrategy::remote_wins());
        assert_eq!(merge.by_pattern.len(), 1);
    }
}
