//! Pre-routing validation of order intents
//!
//! Structural checks (required fields, shapes, enum membership) run first and
//! fail with [`Error::Structural`]. Business rules run only on structurally
//! valid intents and fail with [`Error::BusinessRule`].

use rust_decimal::Decimal;

use crate::core::{Error, Market, OrderIntent, Result, Side};

pub const MAX_INTENT_ID_LEN: usize = 128;
pub const MAX_LEVERAGE: u32 = 125;
pub const MAX_TWAP_SLICES: u32 = 10;
pub const MAX_MAKER_WAIT_MS: u32 = 10_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct IntentValidator;

impl IntentValidator {
    pub fn new() -> Self {
        Self
    }

    /// Decode an intent from JSON. Unknown enum values and missing fields are
    /// structural failures.
    pub fn parse_json(&self, raw: &str) -> Result<OrderIntent> {
        let intent: OrderIntent =
            serde_json::from_str(raw).map_err(|e| Error::Structural(e.to_string()))?;
        self.validate(&intent)?;
        Ok(intent)
    }

    pub fn validate(&self, intent: &OrderIntent) -> Result<()> {
        self.check_structure(intent)?;
        self.check_business_rules(intent)
    }

    fn check_structure(&self, intent: &OrderIntent) -> Result<()> {
        if intent.intent_id.is_empty() || intent.intent_id.len() > MAX_INTENT_ID_LEN {
            return Err(Error::Structural(format!(
                "intent_id must be 1-{} characters",
                MAX_INTENT_ID_LEN
            )));
        }
        validate_symbol(intent.symbol.as_str())?;
        if !intent.notional_usdt.is_finite() || intent.notional_usdt <= 0.0 {
            return Err(Error::Structural(format!(
                "notional_usdt must be greater than 0, got {}",
                intent.notional_usdt
            )));
        }

        if let Some(qty) = intent.base_qty {
            if qty <= Decimal::ZERO {
                return Err(Error::Structural(format!(
                    "base_qty must be greater than 0, got {}",
                    qty
                )));
            }
        }

        let policy = &intent.exec_policy;
        for (name, pct) in [("tp_pct", policy.tp_pct), ("sl_pct", policy.sl_pct)] {
            if let Some(p) = pct {
                if !(p > 0.0 && p <= 1.0) {
                    return Err(Error::Structural(format!(
                        "{} must be in (0, 1], got {}",
                        name, p
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_business_rules(&self, intent: &OrderIntent) -> Result<()> {
        if intent.market == Market::Fut {
            match intent.leverage {
                None | Some(0) => {
                    return Err(Error::BusinessRule(
                        "leverage is required for FUT market".to_string(),
                    ));
                }
                Some(l) if l > MAX_LEVERAGE => {
                    return Err(Error::BusinessRule(format!(
                        "leverage must be between 1 and {}, got {}",
                        MAX_LEVERAGE, l
                    )));
                }
                _ => {}
            }
        } else if let Some(l) = intent.leverage {
            if l == 0 || l > MAX_LEVERAGE {
                return Err(Error::BusinessRule(format!(
                    "leverage must be between 1 and {}, got {}",
                    MAX_LEVERAGE, l
                )));
            }
        }

        // brackets and guard stops are only ever placed on SPOT fills
        let policy = &intent.exec_policy;
        if intent.market == Market::Fut {
            if policy.oco.is_some() {
                return Err(Error::BusinessRule(
                    "OCO is only supported for SPOT market".to_string(),
                ));
            }
            if policy.guard_stop_enable {
                return Err(Error::BusinessRule(
                    "guard stop is only supported for SPOT market".to_string(),
                ));
            }
        }

        if let Some(oco) = &policy.oco {
            let priced = |p: f64| p.is_finite() && p > 0.0;
            if !priced(oco.take_profit_px) || !priced(oco.stop_loss_px) {
                return Err(Error::BusinessRule(
                    "OCO requires valid take_profit_px and stop_loss_px".to_string(),
                ));
            }
            match intent.side {
                Side::Buy if oco.take_profit_px <= oco.stop_loss_px => {
                    return Err(Error::BusinessRule(
                        "for BUY orders, take_profit_px must be greater than stop_loss_px"
                            .to_string(),
                    ));
                }
                Side::Sell if oco.take_profit_px >= oco.stop_loss_px => {
                    return Err(Error::BusinessRule(
                        "for SELL orders, take_profit_px must be less than stop_loss_px"
                            .to_string(),
                    ));
                }
                _ => {}
            }
        }

        // 0 means "not set"
        if policy.twap_slices > MAX_TWAP_SLICES {
            return Err(Error::BusinessRule(format!(
                "TWAP slices must be between 1 and {}, got {}",
                MAX_TWAP_SLICES, policy.twap_slices
            )));
        }

        if policy.maker_wait_ms > MAX_MAKER_WAIT_MS {
            return Err(Error::BusinessRule(format!(
                "maker_wait_ms must be between 0 and {}, got {}",
                MAX_MAKER_WAIT_MS, policy.maker_wait_ms
            )));
        }

        Ok(())
    }
}

/// `^[A-Z0-9]+$`, at least three characters
pub fn validate_symbol(symbol: &str) -> Result<()> {
    let ok = symbol.len() >= 3
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(Error::Structural(format!(
            "symbol must match ^[A-Z0-9]+$ (min 3 chars), got {:?}",
            symbol
        )))
    }
}
