//! Decide → route entry points
//!
//! ```text
//! FeatureSnapshot → GateKeeper → RuleEngine → ConfidenceScorer → DecisionMerger
//!                → OrderIntentBuilder → IntentValidator → ExecutionEngine
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::core::config::{Config, MultiplierBounds};
use crate::core::{
    Decision, Error, FeatureProvider, FeatureSet, FeatureSnapshot, IntentKind, Market, OrderIntent,
    OrderResult, Result, Side, Symbol,
};
use crate::exchange::ExchangeAdapter;
use crate::execution::{ExecutionEngine, TransferReceipt, TransferRequest, Treasury};
use crate::intent::{IntentValidator, MarketContext, OrderIntentBuilder, validate_symbol};
use crate::strategy::{
    ConfigCache, ConfidenceScorer, DecisionMerger, EntryTracker, GateContext, RevisionPayload,
};
use crate::supervisor::ShutdownRx;

/// Window requested from the feature provider when a request carries no features
pub const DEFAULT_FEATURE_WINDOW: &str = "1h";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecideRequest {
    pub signal_id: String,
    pub symbol: Symbol,
    pub market: Market,
    pub side: Side,
    #[serde(default)]
    pub features: FeatureSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_price: Option<f64>,
    /// Decide only; no intents are built
    #[serde(default)]
    pub dry_run: bool,
}

impl DecideRequest {
    pub fn validate(&self) -> Result<()> {
        if self.signal_id.trim().is_empty() {
            return Err(Error::Structural("signal_id is required".into()));
        }
        validate_symbol(self.symbol.as_str())?;
        if let Some(px) = self.reference_price {
            if !px.is_finite() || px <= 0.0 {
                return Err(Error::Structural(format!(
                    "reference_price must be greater than 0, got {}",
                    px
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecideResponse {
    pub signal_id: String,
    pub decision: Decision,
    pub intents: Vec<OrderIntent>,
    pub fired_rules: Vec<String>,
    /// Absent when the gate rejected before scoring
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    /// Strategy revision the decision was made on
    pub config_rev: u64,
}

pub struct Pipeline {
    cache: Arc<ConfigCache>,
    bounds: MultiplierBounds,
    scorer: ConfidenceScorer,
    merger: DecisionMerger,
    builder: OrderIntentBuilder,
    validator: IntentValidator,
    engine: Arc<ExecutionEngine>,
    treasury: Treasury,
    features: Option<Arc<dyn FeatureProvider>>,
    audit: Arc<dyn AuditSink>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        exchange: Arc<dyn ExchangeAdapter>,
        audit: Arc<dyn AuditSink>,
        shutdown: ShutdownRx,
    ) -> Result<Self> {
        config.validate()?;

        let entries = Arc::new(EntryTracker::new());
        let cache = Arc::new(ConfigCache::new(
            RevisionPayload {
                revision: config.app.config_rev,
                gate: config.gate.clone(),
                rules: config.rules.clone(),
            },
            config.bounds,
            entries.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            exchange.clone(),
            config.execution.clone(),
            entries,
            audit.clone(),
            shutdown,
        ));

        Ok(Self {
            cache,
            bounds: config.bounds,
            scorer: ConfidenceScorer::new(config.scorer.clone()),
            merger: DecisionMerger::new(config.bounds),
            builder: OrderIntentBuilder::new(config.intent.clone()),
            validator: IntentValidator::new(),
            engine,
            treasury: Treasury::new(exchange, config.treasury.clone(), audit.clone()),
            features: None,
            audit,
        })
    }

    /// Fetch features for requests that arrive without any
    pub fn with_feature_provider(mut self, provider: Arc<dyn FeatureProvider>) -> Self {
        self.features = Some(provider);
        self
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn treasury(&self) -> &Treasury {
        &self.treasury
    }

    async fn snapshot_for(&self, req: &DecideRequest) -> Result<FeatureSnapshot> {
        match &self.features {
            Some(provider) if req.features.is_empty() => {
                provider
                    .snapshot(&req.symbol, req.market, DEFAULT_FEATURE_WINDOW)
                    .await
            }
            _ => Ok(FeatureSnapshot::new(
                req.symbol.clone(),
                req.market,
                req.features.clone(),
            )),
        }
    }

    /// Run the decision layers for one signal and build its intents.
    ///
    /// A gate failure is a `SKIP` response, not an error. Only malformed
    /// requests and intents that fail validation return `Err`. An OPEN entry
    /// holds its market's entry slot until it is routed or the hold lapses.
    pub async fn decide(&self, req: DecideRequest) -> Result<DecideResponse> {
        req.validate()?;
        let snapshot = self.snapshot_for(&req).await?;

        // one revision for the whole decision
        let revision = self.cache.current();

        let entry = MarketContext {
            signal_id: req.signal_id.clone(),
            symbol: req.symbol.clone(),
            market: req.market,
            side: req.side,
            kind: IntentKind::Entry,
            reference_price: req.reference_price,
        };
        let entry_id = entry.intent_id();
        let ctx = GateContext {
            symbol: req.symbol.clone(),
            market: req.market,
            planned_margin_usdt: self.builder.margin_for(self.bounds.size_max),
            // dry runs never route, so they only look at the count
            entry_id: (!req.dry_run).then(|| entry_id.clone()),
        };
        let verdict = revision.gate.check(&ctx, &snapshot);

        let (decision, fired_rules, prediction) = if verdict.passed {
            let (rules_decision, fired) = revision.rules.evaluate(&snapshot);
            let prediction = self.scorer.predict(&snapshot);
            let ml_mult = self.scorer.size_multiplier(prediction.score);
            let merged = self
                .merger
                .merge(&verdict, &rules_decision, &fired, prediction.score, ml_mult);
            (merged, fired, Some(prediction))
        } else {
            info!(
                "🚫 Gate rejected {} {} {}: {}",
                req.signal_id, req.symbol, req.market, verdict.reason
            );
            (self.merger.skip(verdict.reason.clone()), Vec::new(), None)
        };

        info!(
            "🧭 {} {} {} → {:?} size={:.2} ({})",
            req.signal_id, req.symbol, req.market, decision.action, decision.size_mult, decision.reason
        );
        self.audit.record(AuditEvent::Decision {
            signal_id: req.signal_id.clone(),
            symbol: req.symbol.clone(),
            market: req.market,
            decision: decision.clone(),
            fired_rules: fired_rules.clone(),
            score: prediction.map(|p| p.score).unwrap_or(0.0),
            config_rev: revision.revision,
        });

        let mut intents = Vec::new();
        if decision.is_open() && !req.dry_run {
            let intent = match self.builder.build(&decision, &entry) {
                Ok(intent) => intent,
                Err(e) => {
                    revision.gate.release(&entry_id);
                    return Err(e);
                }
            };
            if let Err(e) = self.validator.validate(&intent) {
                warn!("❌ Built intent {} failed validation: {}", intent.intent_id, e);
                revision.gate.release(&entry_id);
                self.audit.record(AuditEvent::IntentRejected {
                    intent_id: intent.intent_id.clone(),
                    error: e.to_body(),
                });
                return Err(e);
            }
            self.audit.record(AuditEvent::IntentBuilt {
                intent: intent.clone(),
            });
            intents.push(intent);
        } else if verdict.passed && !req.dry_run {
            // the merge turned the pass into a SKIP
            revision.gate.release(&entry_id);
        }

        Ok(DecideResponse {
            signal_id: req.signal_id,
            decision,
            intents,
            fired_rules,
            score: prediction.map(|p| p.score),
            confidence: prediction.map(|p| p.confidence),
            config_rev: revision.revision,
        })
    }

    pub async fn route(&self, intent: OrderIntent) -> Result<OrderResult> {
        self.engine.route(intent).await
    }

    /// Parse and route a JSON intent
    pub async fn route_json(&self, raw: &str) -> Result<OrderResult> {
        let intent = self.validator.parse_json(raw)?;
        self.engine.route(intent).await
    }

    /// Decide and route every resulting intent in order
    pub async fn decide_and_route(&self, req: DecideRequest) -> Result<(DecideResponse, Vec<OrderResult>)> {
        let response = self.decide(req).await?;
        let mut results = Vec::with_capacity(response.intents.len());
        for intent in &response.intents {
            results.push(self.engine.route(intent.clone()).await?);
        }
        Ok((response, results))
    }

    /// Cancel by exchange order id or client order id
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        self.engine.cancel(id).await
    }

    pub async fn transfer(&self, req: TransferRequest) -> Result<TransferReceipt> {
        self.treasury.transfer(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullSink;
    use crate::core::DecisionAction;
    use crate::exchange::PaperExchange;
    use crate::supervisor::shutdown_channel;

    fn pipeline() -> Pipeline {
        let (_tx, rx) = shutdown_channel();
        Pipeline::new(
            &Config::default(),
            Arc::new(PaperExchange::default()),
            Arc::new(NullSink),
            rx,
        )
        .unwrap()
    }

    fn request(features: &[(&str, f64)]) -> DecideRequest {
        DecideRequest {
            signal_id: "sig-1".into(),
            symbol: Symbol::new("BTCUSDT"),
            market: Market::Fut,
            side: Side::Buy,
            features: features
                .iter()
                .map(|(k, v)| (k.to_string(), (*v).into()))
                .collect(),
            reference_price: None,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_gate_skip_has_no_score() {
        let p = pipeline();
        let resp = p.decide(request(&[("funding_next", 0.001)])).await.unwrap();
        assert_eq!(resp.decision.action, DecisionAction::Skip);
        assert!(resp.decision.reason.starts_with("funding rate too high"));
        assert!(resp.intents.is_empty());
        assert!(resp.score.is_none());
        assert_eq!(resp.config_rev, 1);
    }

    #[tokio::test]
    async fn test_dry_run_builds_no_intents() {
        let p = pipeline();
        let mut req = request(&[("rv_pctile_30d", 0.1)]);
        req.dry_run = true;
        let resp = p.decide(req).await.unwrap();
        assert!(resp.decision.is_open());
        assert!(resp.intents.is_empty());
    }

    #[tokio::test]
    async fn test_open_builds_fut_intent() {
        let p = pipeline();
        let resp = p.decide(request(&[("rv_pctile_30d", 0.1)])).await.unwrap();
        assert_eq!(resp.intents.len(), 1);
        let intent = &resp.intents[0];
        assert_eq!(intent.intent_id, "intent_sig-1_entry");
        assert_eq!(intent.leverage, Some(20));
    }

    #[tokio::test]
    async fn test_malformed_request_rejected() {
        let p = pipeline();
        let mut req = request(&[]);
        req.signal_id = " ".into();
        assert!(p.decide(req).await.unwrap_err().is_validation());

        let raw = r#"{"signal_id":"s","symbol":"btc/usdt","market":"SPOT","side":"BUY"}"#;
        let req: DecideRequest = serde_json::from_str(raw).unwrap();
        assert!(p.decide(req).await.is_err());
    }
}
