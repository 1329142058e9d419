//! Decision → OrderIntent

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::config::IntentConfig;
use crate::core::{
    Decision, Error, ExecPolicy, IntentKind, Market, Oco, OrderIntent, Result, Side, Symbol,
};

/// Where and how the decision will be traded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub signal_id: String,
    pub symbol: Symbol,
    pub market: Market,
    pub side: Side,
    pub kind: IntentKind,
    /// Last traded / mid price; SPOT brackets are priced off it
    pub reference_price: Option<f64>,
}

impl MarketContext {
    /// Intent ids are derived from the signal, so re-deciding the same
    /// signal yields the same idempotency key.
    pub fn intent_id(&self) -> String {
        format!("intent_{}_{}", self.signal_id, self.kind.to_string().to_lowercase())
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderIntentBuilder {
    config: IntentConfig,
}

impl OrderIntentBuilder {
    pub fn new(config: IntentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntentConfig {
        &self.config
    }

    /// Margin committed for a given size multiplier
    pub fn margin_for(&self, size_mult: f64) -> f64 {
        self.config.base_margin_usdt * size_mult
    }

    pub fn build(&self, decision: &Decision, ctx: &MarketContext) -> Result<OrderIntent> {
        if !decision.is_open() {
            return Err(Error::InvalidState(format!(
                "no intent for a SKIP decision ({})",
                decision.reason
            )));
        }

        let cfg = &self.config;
        let margin = self.margin_for(decision.size_mult);
        let (notional_usdt, leverage) = match ctx.market {
            Market::Fut => (margin * cfg.default_leverage as f64, Some(cfg.default_leverage)),
            Market::Spot => (margin, None),
        };

        let tp_pct = decision.tp_mult * cfg.base_tp_pct;
        let sl_pct = decision.sl_mult * cfg.base_sl_pct;

        let oco = match (ctx.market, ctx.reference_price) {
            (Market::Spot, Some(px)) if px > 0.0 => Some(bracket(ctx.side, px, tp_pct, sl_pct)),
            (Market::Spot, _) => {
                warn!(
                    "No reference price for {} SPOT signal {}; intent carries no OCO",
                    ctx.symbol, ctx.signal_id
                );
                None
            }
            (Market::Fut, _) => None,
        };

        let exec_policy = ExecPolicy {
            prefer_maker: cfg.prefer_maker,
            maker_wait_ms: cfg.maker_wait_ms,
            twap_slices: cfg.twap_slices,
            guard_stop_enable: cfg.guard_stop_enable && ctx.market == Market::Spot,
            tp_pct: Some(tp_pct),
            sl_pct: Some(sl_pct),
            oco,
        };

        let intent = OrderIntent {
            intent_id: ctx.intent_id(),
            symbol: ctx.symbol.clone(),
            market: ctx.market,
            kind: ctx.kind,
            side: ctx.side,
            notional_usdt,
            leverage,
            base_qty: None,
            exec_policy,
        };
        debug!(
            "Built intent {} {} {} {:.2} USDT",
            intent.intent_id, intent.side, intent.symbol, intent.notional_usdt
        );
        Ok(intent)
    }
}

/// TP beyond the reference price in the trade's favour, SL against it
fn bracket(side: Side, px: f64, tp_pct: f64, sl_pct: f64) -> Oco {
    match side {
        Side::Buy => Oco {
            take_profit_px: px * (1.0 + tp_pct),
            stop_loss_px: px * (1.0 - sl_pct),
        },
        Side::Sell => Oco {
            take_profit_px: px * (1.0 - tp_pct),
            stop_loss_px: px * (1.0 + sl_pct),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DecisionAction;

    fn decision(size: f64, tp: f64, sl: f64) -> Decision {
        Decision {
            action: DecisionAction::Open,
            size_mult: size,
            tp_mult: tp,
            sl_mult: sl,
            reason: String::new(),
        }
    }

    fn ctx(market: Market, side: Side) -> MarketContext {
        MarketContext {
            signal_id: "sig-1".into(),
            symbol: Symbol::new("BTCUSDT"),
            market,
            side,
            kind: IntentKind::Entry,
            reference_price: Some(50_000.0),
        }
    }

    #[test]
    fn test_fut_sizing() {
        let intent = OrderIntentBuilder::default()
            .build(&decision(1.2, 2.0, 0.5), &ctx(Market::Fut, Side::Buy))
            .unwrap();
        assert_eq!(intent.intent_id, "intent_sig-1_entry");
        assert_eq!(intent.leverage, Some(20));
        assert!((intent.notional_usdt - 480.0).abs() < 1e-9);
        assert!((intent.exec_policy.tp_pct.unwrap() - 0.04).abs() < 1e-12);
        assert!((intent.exec_policy.sl_pct.unwrap() - 0.005).abs() < 1e-12);
        assert!(intent.exec_policy.oco.is_none());
        assert!(intent.exec_policy.prefer_maker);
        assert_eq!(intent.exec_policy.maker_wait_ms, 2000);
    }

    #[test]
    fn test_spot_bracket_is_side_consistent() {
        let b = OrderIntentBuilder::default();
        let buy = b.build(&decision(1.0, 1.0, 1.0), &ctx(Market::Spot, Side::Buy)).unwrap();
        let oco = buy.exec_policy.oco.unwrap();
        assert!(oco.take_profit_px > oco.stop_loss_px);
        assert!((oco.take_profit_px - 51_000.0).abs() < 1e-6);
        assert_eq!(buy.leverage, None);
        assert!((buy.notional_usdt - 20.0).abs() < 1e-9);

        let sell = b.build(&decision(1.0, 1.0, 1.0), &ctx(Market::Spot, Side::Sell)).unwrap();
        let oco = sell.exec_policy.oco.unwrap();
        assert!(oco.take_profit_px < oco.stop_loss_px);
    }

    #[test]
    fn test_skip_produces_no_intent() {
        let mut d = decision(1.0, 1.0, 1.0);
        d.action = DecisionAction::Skip;
        let err = OrderIntentBuilder::default()
            .build(&d, &ctx(Market::Fut, Side::Buy))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
