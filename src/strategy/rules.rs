//! L1 rule engine
//!
//! Rules arrive as records whose condition and action payloads are JSON
//! strings. They are compiled once per config revision into an expression tree
//! of comparisons grouped under `allOf`, evaluated by a small recursive
//! interpreter. Records that fail to compile are skipped.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::config::MultiplierBounds;
use crate::core::{Decision, DecisionAction, FeatureSnapshot};

/// Comparison operator of a leaf condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl CompareOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Lt => lhs < rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Eq => lhs == rhs,
        }
    }
}

/// Condition tree: a leaf comparison or an AND group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    AllOf {
        #[serde(rename = "allOf")]
        all_of: Vec<Condition>,
    },
    Compare {
        #[serde(rename = "f")]
        feature: String,
        op: CompareOp,
        #[serde(rename = "v")]
        value: f64,
    },
}

impl Condition {
    /// A comparison against a missing or non-numeric feature does not match.
    pub fn matches(&self, snapshot: &FeatureSnapshot) -> bool {
        match self {
            Condition::AllOf { all_of } => all_of.iter().all(|c| c.matches(snapshot)),
            Condition::Compare { feature, op, value } => snapshot
                .number(feature)
                .is_some_and(|fv| op.apply(fv, *value)),
        }
    }
}

/// Multipliers a fired rule applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(default)]
    pub size_mult: Option<f64>,
    #[serde(default)]
    pub tp_mult: Option<f64>,
    #[serde(default)]
    pub sl_mult: Option<f64>,
}

impl RuleAction {
    fn is_valid(&self) -> bool {
        [self.size_mult, self.tp_mult, self.sl_mult]
            .into_iter()
            .flatten()
            .all(|m| m.is_finite() && m >= 0.0)
    }
}

/// Rule as stored by the config service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule_id: String,
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub rule_type: String,
    /// JSON condition tree
    pub conditions: String,
    /// JSON action payload
    pub actions: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i32,
    pub condition: Condition,
    pub action: RuleAction,
}

impl CompiledRule {
    pub fn compile(record: &RuleRecord) -> Result<Self, String> {
        let condition: Condition = serde_json::from_str(&record.conditions)
            .map_err(|e| format!("conditions: {}", e))?;
        let action: RuleAction =
            serde_json::from_str(&record.actions).map_err(|e| format!("actions: {}", e))?;
        if !action.is_valid() {
            return Err("actions: multipliers must be finite and non-negative".to_string());
        }
        Ok(Self {
            rule_id: record.rule_id.clone(),
            rule_name: record.rule_name.clone(),
            priority: record.priority,
            condition,
            action,
        })
    }
}

/// Compiled, enabled rules in ascending priority order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    skipped: Vec<String>,
}

impl RuleSet {
    pub fn compile(records: &[RuleRecord]) -> Self {
        let mut rules = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();

        for record in records.iter().filter(|r| r.enabled) {
            match CompiledRule::compile(record) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    warn!("Skipping rule {}: unparseable payload ({})", record.rule_id, e);
                    skipped.push(record.rule_id.clone());
                }
            }
        }

        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        Self { rules, skipped }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Ids of enabled records that failed to compile
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// L1 rule engine over one compiled rule set
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: RuleSet,
    bounds: MultiplierBounds,
}

impl RuleEngine {
    pub fn new(rules: RuleSet, bounds: MultiplierBounds) -> Self {
        Self { rules, bounds }
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rules
    }

    /// Compose every matching rule's multipliers and clamp the products.
    ///
    /// Returns the decision and the ids of fired rules in evaluation order.
    pub fn evaluate(&self, snapshot: &FeatureSnapshot) -> (Decision, Vec<String>) {
        let mut fired = Vec::new();
        let (mut size, mut tp, mut sl) = (1.0_f64, 1.0_f64, 1.0_f64);

        for rule in self.rules.rules() {
            if !rule.condition.matches(snapshot) {
                continue;
            }
            debug!("Rule {} fired on {}", rule.rule_id, snapshot.symbol);
            fired.push(rule.rule_id.clone());
            size *= rule.action.size_mult.unwrap_or(1.0);
            tp *= rule.action.tp_mult.unwrap_or(1.0);
            sl *= rule.action.sl_mult.unwrap_or(1.0);
        }

        let decision = Decision {
            action: DecisionAction::Open,
            size_mult: self.bounds.clamp_size(size),
            tp_mult: self.bounds.clamp_tp(tp),
            sl_mult: self.bounds.clamp_sl(sl),
            reason: format!("Rules fired: {:?}", fired),
        };
        (decision, fired)
    }
}
