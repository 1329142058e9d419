//! Combines the L0/L1/L2 outputs into one decision

use crate::core::config::MultiplierBounds;
use crate::core::{Decision, DecisionAction};

use super::gate::GateVerdict;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionMerger {
    bounds: MultiplierBounds,
}

impl DecisionMerger {
    pub fn new(bounds: MultiplierBounds) -> Self {
        Self { bounds }
    }

    /// Gate failure wins, then an ML veto, then the rule × ML product.
    pub fn merge(
        &self,
        gate: &GateVerdict,
        rules: &Decision,
        fired: &[String],
        ml_score: f64,
        ml_size_mult: f64,
    ) -> Decision {
        if !gate.passed {
            return self.skip(gate.reason.clone());
        }

        if ml_size_mult == 0.0 {
            return self.skip("ML model recommends skip".to_string());
        }

        Decision {
            action: DecisionAction::Open,
            size_mult: self.bounds.clamp_size(rules.size_mult * ml_size_mult),
            tp_mult: self.bounds.clamp_tp(rules.tp_mult),
            sl_mult: self.bounds.clamp_sl(rules.sl_mult),
            reason: format!("Rules: {:?}, ML Score: {:.3}", fired, ml_score),
        }
    }

    /// `SKIP` carrying neutral multipliers
    pub fn skip(&self, reason: String) -> Decision {
        Decision {
            action: DecisionAction::Skip,
            size_mult: self.bounds.clamp_size(1.0),
            tp_mult: self.bounds.clamp_tp(1.0),
            sl_mult: self.bounds.clamp_sl(1.0),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed() -> GateVerdict {
        GateVerdict {
            passed: true,
            reason: "gate check passed".into(),
        }
    }

    fn rules(size: f64) -> Decision {
        Decision {
            action: DecisionAction::Open,
            size_mult: size,
            tp_mult: 2.0,
            sl_mult: 0.5,
            reason: String::new(),
        }
    }

    #[test]
    fn test_gate_failure_skips_with_gate_reason() {
        let gate = GateVerdict {
            passed: false,
            reason: "spread too wide: 5.00 bps > 3.00 bps".into(),
        };
        let d = DecisionMerger::default().merge(&gate, &rules(1.2), &[], 0.9, 1.2);
        assert_eq!(d.action, DecisionAction::Skip);
        assert_eq!(d.reason, gate.reason);
        assert_eq!(d.size_mult, 1.0);
    }

    #[test]
    fn test_ml_veto() {
        let d = DecisionMerger::default().merge(&passed(), &rules(2.0), &[], 0.2, 0.0);
        assert_eq!(d.action, DecisionAction::Skip);
        assert_eq!(d.reason, "ML model recommends skip");
    }

    #[test]
    fn test_open_composes_and_reclamps() {
        let fired = vec!["R-001".to_string()];
        let d = DecisionMerger::default().merge(&passed(), &rules(1.2), &fired, 0.75, 1.0);
        assert!(d.is_open());
        assert_eq!(d.size_mult, 1.2);
        assert_eq!(d.reason, "Rules: [\"R-001\"], ML Score: 0.750");

        let d = DecisionMerger::default().merge(&passed(), &rules(2.0), &fired, 0.9, 1.2);
        assert_eq!(d.size_mult, 2.0);
    }
}
