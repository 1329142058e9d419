//! L2 confidence scorer
//!
//! Baseline score plus independent additive bonuses, each conditioned on one
//! feature comparison. The score maps onto a discrete size multiplier where
//! `0.0` vetoes the trade.

use crate::core::FeatureSnapshot;
use crate::core::config::ScorerConfig;

/// Score and derived confidence, both in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    config: ScorerConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn predict(&self, snapshot: &FeatureSnapshot) -> Prediction {
        let mut score = self.config.baseline;

        for bonus in &self.config.bonuses {
            if let Some(value) = snapshot.number(&bonus.feature) {
                if bonus.op.apply(value, bonus.threshold) {
                    score += bonus.bonus;
                }
            }
        }

        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Prediction {
            score,
            confidence: (score * 2.0).min(1.0),
        }
    }

    /// `>strong_above → strong`, `[normal_from, strong_above] → normal`,
    /// `[reduced_from, normal_from) → reduced`, below → `0.0`
    pub fn size_multiplier(&self, score: f64) -> f64 {
        let c = &self.config;
        if score > c.strong_above {
            c.strong_mult
        } else if score >= c.normal_from {
            c.normal_mult
        } else if score >= c.reduced_from {
            c.reduced_mult
        } else {
            0.0
        }
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(ScorerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ScoreBonus;
    use crate::core::{Market, Symbol};
    use crate::strategy::rules::CompareOp;

    fn snapshot(pairs: &[(&str, f64)]) -> FeatureSnapshot {
        FeatureSnapshot::from_pairs(
            Symbol::new("BTCUSDT"),
            Market::Fut,
            pairs.iter().map(|(k, v)| (*k, *v)),
        )
    }

    #[test]
    fn test_baseline_and_bonuses() {
        let scorer = ConfidenceScorer::default();

        let p = scorer.predict(&snapshot(&[]));
        assert_eq!(p.score, 0.5);
        assert_eq!(p.confidence, 1.0);

        let p = scorer.predict(&snapshot(&[("atr_pct", 0.5), ("rv_pctile_30d", 0.1), ("correlation", -0.5)]));
        assert!((p.score - 0.85).abs() < 1e-9);

        // conditions not met → no bonus
        let p = scorer.predict(&snapshot(&[("atr_pct", 2.0), ("correlation", 0.9)]));
        assert_eq!(p.score, 0.5);
    }

    #[test]
    fn test_score_is_clamped() {
        let mut config = ScorerConfig::default();
        config.baseline = 0.1;
        config.bonuses = vec![ScoreBonus {
            feature: "drawdown".into(),
            op: CompareOp::Gt,
            threshold: 0.0,
            bonus: -0.5,
        }];
        let p = ConfidenceScorer::new(config).predict(&snapshot(&[("drawdown", 0.2)]));
        assert_eq!(p.score, 0.0);
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn test_size_multiplier_breakpoints() {
        let s = ConfidenceScorer::default();
        assert_eq!(s.size_multiplier(0.9), 1.2);
        assert_eq!(s.size_multiplier(0.85), 1.0);
        assert_eq!(s.size_multiplier(0.6), 1.0);
        assert_eq!(s.size_multiplier(0.59), 0.5);
        assert_eq!(s.size_multiplier(0.4), 0.5);
        assert_eq!(s.size_multiplier(0.39), 0.0);
    }
}
