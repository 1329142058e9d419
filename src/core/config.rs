//! Configuration - Type-safe config with documented defaults
//!
//! Loaded from TOML. Every section is optional; missing sections fall back to
//! the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::strategy::rules::{CompareOp, RuleRecord};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub gate: GateConfig,
    pub bounds: MultiplierBounds,
    pub scorer: ScorerConfig,
    pub intent: IntentConfig,
    pub execution: ExecutionConfig,
    pub treasury: TreasuryConfig,
    /// Seed rule set installed as revision `app.config_rev`
    pub rules: Vec<RuleRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Run mode: paper or live
    pub mode: RunMode,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    /// Revision number of the seed rule set
    pub config_rev: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            log_level: "info,chimera=debug".to_string(),
            config_rev: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
}

/// L0 gate thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub max_funding_abs: f64,
    pub spread_bp_limit: f64,
    pub depth_top1_usdt_min: f64,
    pub spot_quote_usdt_max: f64,
    pub fut_margin_usdt_max: f64,
    pub concurrent_entries_per_market: usize,
    /// How long a gate-approved entry holds its slot while waiting to be routed
    pub entry_hold_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_funding_abs: 0.0005,
            spread_bp_limit: 3.0,
            depth_top1_usdt_min: 200.0,
            spot_quote_usdt_max: 10_000.0,
            fut_margin_usdt_max: 5_000.0,
            concurrent_entries_per_market: 1,
            entry_hold_secs: 30,
        }
    }
}

/// Clamp ranges for decision multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplierBounds {
    pub size_min: f64,
    pub size_max: f64,
    pub tp_min: f64,
    pub tp_max: f64,
    pub sl_min: f64,
    pub sl_max: f64,
}

impl Default for MultiplierBounds {
    fn default() -> Self {
        Self {
            size_min: 0.1,
            size_max: 2.0,
            tp_min: 1.0,
            tp_max: 3.0,
            sl_min: 0.1,
            sl_max: 1.0,
        }
    }
}

impl MultiplierBounds {
    pub fn clamp_size(&self, v: f64) -> f64 {
        clamp_finite(v, self.size_min, self.size_max)
    }

    pub fn clamp_tp(&self, v: f64) -> f64 {
        clamp_finite(v, self.tp_min, self.tp_max)
    }

    pub fn clamp_sl(&self, v: f64) -> f64 {
        clamp_finite(v, self.sl_min, self.sl_max)
    }

    fn validate(&self) -> crate::core::Result<()> {
        let pairs = [
            ("size", self.size_min, self.size_max),
            ("tp", self.tp_min, self.tp_max),
            ("sl", self.sl_min, self.sl_max),
        ];
        for (name, lo, hi) in pairs {
            if !(lo.is_finite() && hi.is_finite()) || lo < 0.0 || lo > hi {
                return Err(crate::core::Error::Config(format!(
                    "invalid {} bounds [{}, {}]",
                    name, lo, hi
                )));
            }
        }
        Ok(())
    }
}

/// NaN collapses to the lower bound
fn clamp_finite(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_nan() { lo } else { v.max(lo).min(hi) }
}

/// One additive score bonus: applies when `feature <op> threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBonus {
    pub feature: String,
    pub op: CompareOp,
    pub threshold: f64,
    pub bonus: f64,
}

/// L2 confidence model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub baseline: f64,
    pub bonuses: Vec<ScoreBonus>,
    /// score strictly above → `strong_mult`
    pub strong_above: f64,
    pub strong_mult: f64,
    /// score at or above → `normal_mult`
    pub normal_from: f64,
    pub normal_mult: f64,
    /// score at or above → `reduced_mult`; below is a veto
    pub reduced_from: f64,
    pub reduced_mult: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        let bonus = |feature: &str, threshold: f64, bonus: f64| ScoreBonus {
            feature: feature.to_string(),
            op: CompareOp::Lt,
            threshold,
            bonus,
        };
        Self {
            baseline: 0.5,
            bonuses: vec![
                bonus("atr_pct", 1.0, 0.10),
                bonus("rv_pctile_30d", 0.25, 0.15),
                bonus("correlation", -0.3, 0.10),
            ],
            strong_above: 0.85,
            strong_mult: 1.2,
            normal_from: 0.6,
            normal_mult: 1.0,
            reduced_from: 0.4,
            reduced_mult: 0.5,
        }
    }
}

/// Sizing and default execution policy for generated intents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub base_margin_usdt: f64,
    pub default_leverage: u32,
    pub base_tp_pct: f64,
    pub base_sl_pct: f64,
    pub prefer_maker: bool,
    pub maker_wait_ms: u32,
    pub twap_slices: u32,
    /// SPOT only
    pub guard_stop_enable: bool,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            base_margin_usdt: 20.0,
            default_leverage: 20,
            base_tp_pct: 0.02,
            base_sl_pct: 0.01,
            prefer_maker: true,
            maker_wait_ms: 2000,
            twap_slices: 1,
            guard_stop_enable: false,
        }
    }
}

/// Execution engine pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How often a resting maker order is polled during the wait
    pub maker_poll_ms: u64,
    /// Pause between TWAP slices
    pub twap_interval_ms: u64,
    /// Guard-stop monitor tick
    pub monitor_interval_ms: u64,
    /// Config store polling period
    pub config_refresh_secs: u64,
    /// Retention of routed results and closed brackets / guard stops
    pub result_ttl_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            maker_poll_ms: 100,
            twap_interval_ms: 1000,
            monitor_interval_ms: 1000,
            config_refresh_secs: 60,
            result_ttl_secs: 3600,
        }
    }
}

/// Treasury transfer limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    pub min_transfer_usdt: f64,
    pub max_transfer_usdt: f64,
    /// Width of the time bucket folded into transfer idempotency keys
    pub bucket_secs: i64,
    /// Retention of completed transfer receipts
    pub receipt_ttl_secs: u64,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            min_transfer_usdt: 1.0,
            max_transfer_usdt: 10_000.0,
            bucket_secs: 60,
            receipt_ttl_secs: 3600,
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> crate::core::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::core::Error::Config(format!("Failed to read config: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::core::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::core::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::core::Result<()> {
        self.bounds.validate()?;
        if self.intent.base_margin_usdt <= 0.0 {
            return Err(crate::core::Error::Config(
                "intent.base_margin_usdt must be positive".into(),
            ));
        }
        if self.treasury.min_transfer_usdt > self.treasury.max_transfer_usdt {
            return Err(crate::core::Error::Config(
                "treasury.min_transfer_usdt exceeds max_transfer_usdt".into(),
            ));
        }
        if self.treasury.bucket_secs <= 0 {
            return Err(crate::core::Error::Config(
                "treasury.bucket_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.gate, GateConfig::default());
        assert_eq!(config.intent.default_leverage, 20);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_partial_sections_and_rules() {
        let config = Config::from_toml(
            r#"
            [gate]
            spread_bp_limit = 5.0

            [[rules]]
            rule_id = "R-001"
            conditions = '{"allOf":[{"f":"rv_pctile_30d","op":"<","v":0.25}]}'
            actions = '{"size_mult":1.2}'
            priority = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.gate.spread_bp_limit, 5.0);
        assert_eq!(config.gate.max_funding_abs, 0.0005);
        assert_eq!(config.rules.len(), 1);
        assert!(config.rules[0].enabled);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = Config::from_toml("[bounds]\nsize_min = 3.0\n").unwrap_err();
        assert!(matches!(err, crate::core::Error::Config(_)));
    }

    #[test]
    fn test_clamp_handles_nan() {
        let b = MultiplierBounds::default();
        assert_eq!(b.clamp_size(f64::NAN), 0.1);
        assert_eq!(b.clamp_size(5.0), 2.0);
        assert_eq!(b.clamp_tp(0.2), 1.0);
        assert_eq!(b.clamp_sl(0.5), 0.5);
    }
}
