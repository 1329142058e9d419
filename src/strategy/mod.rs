//! Decision layers: L0 gate, L1 rules, L2 scorer and the merge step

pub mod cache;
pub mod gate;
pub mod merger;
pub mod rules;
pub mod scorer;

pub use cache::{ConfigCache, RevisionPayload, StaticConfigSource, StrategyRevision, spawn_config_refresher};
pub use gate::{EntrySlot, EntryTracker, GateContext, GateKeeper, GateVerdict};
pub use merger::DecisionMerger;
pub use rules::{CompareOp, Condition, RuleEngine, RuleRecord, RuleSet};
pub use scorer::{ConfidenceScorer, Prediction};
