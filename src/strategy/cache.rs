//! Revisioned strategy config
//!
//! Gate thresholds and the compiled rule set are swapped as one unit. Readers
//! clone the current `Arc` and keep evaluating against it even if a newer
//! revision lands mid-decision.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::{GateConfig, MultiplierBounds};
use crate::core::{ConfigSource, Result};
use crate::supervisor::{ShutdownRx, spawn_supervised};

use super::gate::{EntryTracker, GateKeeper};
use super::rules::{RuleEngine, RuleRecord, RuleSet};

/// Raw revision as published by the config store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionPayload {
    pub revision: u64,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub rules: Vec<RuleRecord>,
}

/// Compiled, immutable strategy state for one revision
#[derive(Debug)]
pub struct StrategyRevision {
    pub revision: u64,
    pub gate: GateKeeper,
    pub rules: RuleEngine,
}

impl StrategyRevision {
    fn compile(payload: RevisionPayload, bounds: MultiplierBounds, entries: Arc<EntryTracker>) -> Self {
        let rules = RuleSet::compile(&payload.rules);
        if !rules.skipped().is_empty() {
            warn!(
                "Revision {}: {} rule(s) skipped: {:?}",
                payload.revision,
                rules.skipped().len(),
                rules.skipped()
            );
        }
        Self {
            revision: payload.revision,
            gate: GateKeeper::new(payload.gate, entries),
            rules: RuleEngine::new(rules, bounds),
        }
    }

    /// Routes outside a decision claim against the active revision's limit
    fn apply_entry_limits(&self, entries: &EntryTracker) {
        let gate = self.gate.limits();
        entries.configure(
            gate.concurrent_entries_per_market,
            Duration::from_secs(gate.entry_hold_secs),
        );
    }
}

/// Shared holder of the active revision
#[derive(Debug)]
pub struct ConfigCache {
    current: RwLock<Arc<StrategyRevision>>,
    bounds: MultiplierBounds,
    entries: Arc<EntryTracker>,
}

impl ConfigCache {
    pub fn new(initial: RevisionPayload, bounds: MultiplierBounds, entries: Arc<EntryTracker>) -> Self {
        let revision = StrategyRevision::compile(initial, bounds, entries.clone());
        revision.apply_entry_limits(&entries);
        info!(
            "📋 Strategy revision {} active ({} rules)",
            revision.revision,
            revision.rules.rule_set().len()
        );
        Self {
            current: RwLock::new(Arc::new(revision)),
            bounds,
            entries,
        }
    }

    /// Snapshot of the active revision
    pub fn current(&self) -> Arc<StrategyRevision> {
        self.current.read().clone()
    }

    pub fn revision(&self) -> u64 {
        self.current.read().revision
    }

    pub fn entries(&self) -> &Arc<EntryTracker> {
        &self.entries
    }

    /// Install a newer revision. Returns `false` for stale or repeated ones.
    pub fn install(&self, payload: RevisionPayload) -> bool {
        if payload.revision <= self.revision() {
            debug!(
                "Ignoring revision {} (active {})",
                payload.revision,
                self.revision()
            );
            return false;
        }

        // compile outside the lock
        let next = Arc::new(StrategyRevision::compile(payload, self.bounds, self.entries.clone()));

        let mut current = self.current.write();
        if next.revision <= current.revision {
            return false;
        }
        info!(
            "📋 Strategy revision {} → {} ({} rules)",
            current.revision,
            next.revision,
            next.rules.rule_set().len()
        );
        next.apply_entry_limits(&self.entries);
        *current = next;
        true
    }

    /// One poll of the source
    pub async fn refresh(&self, source: &dyn ConfigSource) -> Result<bool> {
        match source.newer_than(self.revision()).await? {
            Some(payload) => Ok(self.install(payload)),
            None => Ok(false),
        }
    }
}

/// Poll `source` every `period` until shutdown
pub fn spawn_config_refresher(
    cache: Arc<ConfigCache>,
    source: Arc<dyn ConfigSource>,
    period: Duration,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    spawn_supervised("config refresher", period, shutdown, move || {
        let cache = cache.clone();
        let source = source.clone();
        async move {
            cache.refresh(source.as_ref()).await?;
            Ok(())
        }
    })
}

/// In-memory config source; `publish` makes a new revision visible
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    latest: RwLock<Option<RevisionPayload>>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: RevisionPayload) {
        *self.latest.write() = Some(payload);
    }
}

#[async_trait::async_trait]
impl ConfigSource for StaticConfigSource {
    async fn newer_than(&self, current: u64) -> Result<Option<RevisionPayload>> {
        Ok(self
            .latest
            .read()
            .as_ref()
            .filter(|p| p.revision > current)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Market, Symbol};
    use crate::core::FeatureSnapshot;

    fn payload(revision: u64, size_mult: f64) -> RevisionPayload {
        RevisionPayload {
            revision,
            gate: GateConfig::default(),
            rules: vec![RuleRecord {
                rule_id: format!("R-{}", revision),
                rule_name: String::new(),
                rule_type: "ENTRY".into(),
                conditions: r#"{"f":"x","op":">","v":0}"#.into(),
                actions: format!(r#"{{"size_mult":{}}}"#, size_mult),
                priority: 1,
                enabled: true,
            }],
        }
    }

    fn cache() -> ConfigCache {
        ConfigCache::new(payload(1, 0.5), MultiplierBounds::default(), Arc::new(EntryTracker::new()))
    }

    #[test]
    fn test_install_is_monotonic() {
        let cache = cache();
        assert!(!cache.install(payload(1, 2.0)));
        assert!(cache.install(payload(3, 2.0)));
        assert!(!cache.install(payload(2, 1.5)));
        assert_eq!(cache.revision(), 3);
    }

    #[test]
    fn test_in_flight_reader_keeps_its_revision() {
        let cache = cache();
        let snap = FeatureSnapshot::from_pairs(Symbol::new("BTCUSDT"), Market::Fut, [("x", 1.0)]);

        let held = cache.current();
        cache.install(payload(2, 2.0));

        assert_eq!(held.rules.evaluate(&snap).0.size_mult, 0.5);
        assert_eq!(cache.current().rules.evaluate(&snap).0.size_mult, 2.0);
    }

    #[test]
    fn test_install_carries_entry_limit_to_tracker() {
        let cache = cache();
        assert_eq!(cache.entries().limit(), 1);

        let mut wider = payload(2, 1.0);
        wider.gate.concurrent_entries_per_market = 3;
        assert!(cache.install(wider));
        assert_eq!(cache.entries().limit(), 3);

        // stale revisions do not touch the limit
        let mut stale = payload(1, 1.0);
        stale.gate.concurrent_entries_per_market = 9;
        assert!(!cache.install(stale));
        assert_eq!(cache.entries().limit(), 3);
    }

    #[tokio::test]
    async fn test_refresh_from_source() {
        let cache = cache();
        let source = StaticConfigSource::new();
        assert!(!cache.refresh(&source).await.unwrap());

        source.publish(payload(5, 1.0));
        assert!(cache.refresh(&source).await.unwrap());
        assert!(!cache.refresh(&source).await.unwrap());
        assert_eq!(cache.revision(), 5);
    }
}
