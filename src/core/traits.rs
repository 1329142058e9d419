//! Collaborator traits - what the core consumes from the outside world

use async_trait::async_trait;

use crate::core::{FeatureSnapshot, Market, Result, Symbol};
use crate::strategy::cache::RevisionPayload;

/// Supplies feature snapshots for a (symbol, market, window)
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    async fn snapshot(&self, symbol: &Symbol, market: Market, window: &str)
        -> Result<FeatureSnapshot>;
}

/// Versioned source of the active rule set and gate thresholds
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Latest revision strictly newer than `current`, if any
    async fn newer_than(&self, current: u64) -> Result<Option<RevisionPayload>>;
}
