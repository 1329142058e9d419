//! L0 gate - hard risk and liquidity limits checked before any sizing

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::GateConfig;
use crate::core::{FeatureSnapshot, Market, Symbol};

/// What the gate knows about the order being considered
#[derive(Debug, Clone, PartialEq)]
pub struct GateContext {
    pub symbol: Symbol,
    pub market: Market,
    /// Largest margin the decision could commit (USDT)
    pub planned_margin_usdt: f64,
    /// Intent that takes the entry slot when the gate passes; `None` checks
    /// the count without taking a slot
    pub entry_id: Option<String>,
}

/// Gate outcome. Missing features never fail a check.
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub passed: bool,
    pub reason: String,
}

impl GateVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: "gate check passed".to_string(),
        }
    }

    fn fail(reason: String) -> Self {
        Self {
            passed: false,
            reason,
        }
    }
}

/// Entries counted against the per-market limit, keyed by (symbol, market).
///
/// An entry is counted from the moment the gate approves it. Until it is
/// routed it is a hold keyed by intent id that lapses after the hold time;
/// once routing starts it is an [`EntrySlot`] released on drop. Every
/// check-and-count happens under one write lock.
#[derive(Debug)]
pub struct EntryTracker {
    inner: RwLock<Entries>,
}

#[derive(Debug)]
struct Entries {
    counts: HashMap<(Symbol, Market), usize>,
    holds: HashMap<String, Hold>,
    limit: usize,
    hold_for: Duration,
}

#[derive(Debug)]
struct Hold {
    key: (Symbol, Market),
    expires_at: Instant,
}

impl Entries {
    fn count(&self, key: &(Symbol, Market)) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    fn increment(&mut self, key: (Symbol, Market)) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    fn decrement(&mut self, key: &(Symbol, Market)) {
        if let Some(count) = self.counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(key);
            }
        }
    }

    fn expire_holds(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .holds
            .iter()
            .filter(|(_, h)| h.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(hold) = self.holds.remove(&id) {
                debug!("Entry hold for {} lapsed", id);
                self.decrement(&hold.key);
            }
        }
    }
}

impl Default for EntryTracker {
    fn default() -> Self {
        let gate = GateConfig::default();
        Self::with_limits(
            gate.concurrent_entries_per_market,
            Duration::from_secs(gate.entry_hold_secs),
        )
    }
}

impl EntryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limit: usize, hold_for: Duration) -> Self {
        Self {
            inner: RwLock::new(Entries {
                counts: HashMap::new(),
                holds: HashMap::new(),
                limit,
                hold_for,
            }),
        }
    }

    /// Apply the limits of a newly active config revision
    pub fn configure(&self, limit: usize, hold_for: Duration) {
        let mut inner = self.inner.write();
        inner.limit = limit;
        inner.hold_for = hold_for;
    }

    pub fn limit(&self) -> usize {
        self.inner.read().limit
    }

    /// Entries counted for `symbol`/`market`, lapsed holds excluded
    pub fn in_flight(&self, symbol: &Symbol, market: Market) -> usize {
        let inner = self.inner.read();
        let key = (symbol.clone(), market);
        let now = Instant::now();
        let lapsed = inner
            .holds
            .values()
            .filter(|h| h.key == key && h.expires_at <= now)
            .count();
        inner.count(&key).saturating_sub(lapsed)
    }

    /// Count a gate-approved entry for `intent_id` unless the market is at
    /// `limit`. Re-reserving an id that already holds a slot only extends the
    /// hold. Returns the current count when refused.
    pub fn reserve(&self, intent_id: &str, symbol: &Symbol, market: Market, limit: usize) -> std::result::Result<(), usize> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner.expire_holds(now);
        let expires_at = now + inner.hold_for;

        let key = (symbol.clone(), market);
        if let Some(hold) = inner.holds.get_mut(intent_id) {
            if hold.key == key {
                hold.expires_at = expires_at;
                return Ok(());
            }
        }

        let count = inner.count(&key);
        if count >= limit {
            return Err(count);
        }
        inner.increment(key.clone());
        inner.holds.insert(intent_id.to_string(), Hold { key, expires_at });
        Ok(())
    }

    /// Give back a hold that will not be routed
    pub fn release(&self, intent_id: &str) {
        let mut inner = self.inner.write();
        if let Some(hold) = inner.holds.remove(intent_id) {
            inner.decrement(&hold.key);
        }
    }

    /// Turn the hold for `intent_id` into a routing slot, or take a fresh
    /// slot when there is none and the market is below the active limit.
    /// Returns the current count when refused.
    pub fn claim(self: &Arc<Self>, intent_id: &str, symbol: &Symbol, market: Market) -> std::result::Result<EntrySlot, usize> {
        let mut inner = self.inner.write();
        inner.expire_holds(Instant::now());

        let key = (symbol.clone(), market);
        let held = inner
            .holds
            .get(intent_id)
            .is_some_and(|h| h.key == key);
        if held {
            inner.holds.remove(intent_id);
        } else {
            let count = inner.count(&key);
            if count >= inner.limit {
                return Err(count);
            }
            inner.increment(key.clone());
        }
        Ok(EntrySlot {
            tracker: Arc::clone(self),
            key,
        })
    }

    fn finish(&self, key: &(Symbol, Market)) {
        self.inner.write().decrement(key);
    }
}

/// Releases its in-flight count on drop
#[derive(Debug)]
pub struct EntrySlot {
    tracker: Arc<EntryTracker>,
    key: (Symbol, Market),
}

impl Drop for EntrySlot {
    fn drop(&mut self) {
        self.tracker.finish(&self.key);
    }
}

/// L0 gate keeper
#[derive(Debug, Clone)]
pub struct GateKeeper {
    limits: GateConfig,
    entries: Arc<EntryTracker>,
}

impl GateKeeper {
    pub fn new(limits: GateConfig, entries: Arc<EntryTracker>) -> Self {
        Self { limits, entries }
    }

    pub fn limits(&self) -> &GateConfig {
        &self.limits
    }

    /// Run the checks in order, stopping at the first failure. A pass with
    /// `ctx.entry_id` set holds an entry slot for that intent; give it back
    /// with [`release`](Self::release) if the intent is never routed.
    pub fn check(&self, ctx: &GateContext, features: &FeatureSnapshot) -> GateVerdict {
        let l = &self.limits;

        // 1. Funding rate cap
        if let Some(funding) = features.number("funding_next") {
            if funding.abs() > l.max_funding_abs {
                return GateVerdict::fail(format!(
                    "funding rate too high: {:.6} > {:.6}",
                    funding.abs(),
                    l.max_funding_abs
                ));
            }
        }

        // 2. Liquidity: spread
        if let Some(spread) = features.number("spread_bps") {
            if spread > l.spread_bp_limit {
                return GateVerdict::fail(format!(
                    "spread too wide: {:.2} bps > {:.2} bps",
                    spread, l.spread_bp_limit
                ));
            }
        }

        // 3. Liquidity: top-of-book depth
        if let Some(depth) = features.number("depth_top1_usdt") {
            if depth < l.depth_top1_usdt_min {
                return GateVerdict::fail(format!(
                    "insufficient depth: {:.2} USDT < {:.2} USDT",
                    depth, l.depth_top1_usdt_min
                ));
            }
        }

        // 4. Risk budget
        match ctx.market {
            Market::Spot if ctx.planned_margin_usdt > l.spot_quote_usdt_max => {
                return GateVerdict::fail(format!(
                    "spot notional budget exceeded: {:.2} USDT > {:.2} USDT",
                    ctx.planned_margin_usdt, l.spot_quote_usdt_max
                ));
            }
            Market::Fut if ctx.planned_margin_usdt > l.fut_margin_usdt_max => {
                return GateVerdict::fail(format!(
                    "futures margin budget exceeded: {:.2} USDT > {:.2} USDT",
                    ctx.planned_margin_usdt, l.fut_margin_usdt_max
                ));
            }
            _ => {}
        }

        // 5. Concurrent entries, counted atomically with the pass
        let limit = l.concurrent_entries_per_market;
        let admitted = match &ctx.entry_id {
            Some(id) => self.entries.reserve(id, &ctx.symbol, ctx.market, limit),
            None => match self.entries.in_flight(&ctx.symbol, ctx.market) {
                n if n >= limit => Err(n),
                _ => Ok(()),
            },
        };
        if let Err(in_flight) = admitted {
            return GateVerdict::fail(format!(
                "concurrent entries limit reached for {} {}: {} in flight (max {})",
                ctx.symbol, ctx.market, in_flight, limit
            ));
        }

        debug!("Gate passed for {} {}", ctx.symbol, ctx.market);
        GateVerdict::pass()
    }

    /// Give back the entry slot held for `intent_id`
    pub fn release(&self, intent_id: &str) {
        self.entries.release(intent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(market: Market, margin: f64) -> GateContext {
        GateContext {
            symbol: Symbol::new("BTCUSDT"),
            market,
            planned_margin_usdt: margin,
            entry_id: None,
        }
    }

    fn entry(id: &str) -> GateContext {
        GateContext {
            entry_id: Some(id.into()),
            ..ctx(Market::Spot, 10.0)
        }
    }

    fn snap(pairs: &[(&str, f64)]) -> FeatureSnapshot {
        FeatureSnapshot::from_pairs(
            Symbol::new("BTCUSDT"),
            Market::Fut,
            pairs.iter().map(|(k, v)| (*k, *v)),
        )
    }

    fn keeper() -> (GateKeeper, Arc<EntryTracker>) {
        let tracker = Arc::new(EntryTracker::new());
        (GateKeeper::new(GateConfig::default(), tracker.clone()), tracker)
    }

    #[test]
    fn test_funding_cap_dominates() {
        let (gk, _) = keeper();
        for funding in [0.00051, -0.001, 0.5] {
            let v = gk.check(
                &ctx(Market::Fut, 10.0),
                &snap(&[("funding_next", funding), ("spread_bps", 0.1), ("depth_top1_usdt", 1e9)]),
            );
            assert!(!v.passed);
            assert!(v.reason.starts_with("funding rate too high"));
        }
    }

    #[test]
    fn test_checks_short_circuit_in_order() {
        let (gk, _) = keeper();
        let v = gk.check(
            &ctx(Market::Fut, 10.0),
            &snap(&[("spread_bps", 5.0), ("depth_top1_usdt", 10.0)]),
        );
        assert!(v.reason.starts_with("spread too wide"));

        let v = gk.check(&ctx(Market::Fut, 10.0), &snap(&[("depth_top1_usdt", 10.0)]));
        assert!(v.reason.starts_with("insufficient depth"));
    }

    #[test]
    fn test_missing_features_are_not_applicable() {
        let (gk, _) = keeper();
        let v = gk.check(&ctx(Market::Spot, 10.0), &snap(&[]));
        assert!(v.passed, "{}", v.reason);
    }

    #[test]
    fn test_budget_per_market() {
        let (gk, _) = keeper();
        assert!(!gk.check(&ctx(Market::Spot, 10_001.0), &snap(&[])).passed);
        assert!(gk.check(&ctx(Market::Fut, 5_000.0), &snap(&[])).passed);
        assert!(!gk.check(&ctx(Market::Fut, 5_000.5), &snap(&[])).passed);
    }

    #[test]
    fn test_concurrent_entries_tracked_until_slot_dropped() {
        let (gk, tracker) = keeper();
        let c = ctx(Market::Fut, 10.0);

        let slot = tracker.claim("routing", &c.symbol, c.market).unwrap();
        let v = gk.check(&c, &snap(&[]));
        assert!(!v.passed);
        assert!(v.reason.contains("concurrent entries"));

        // other market unaffected
        assert!(gk.check(&ctx(Market::Spot, 10.0), &snap(&[])).passed);

        drop(slot);
        assert_eq!(tracker.in_flight(&c.symbol, c.market), 0);
        assert!(gk.check(&c, &snap(&[])).passed);
    }

    #[test]
    fn test_pass_holds_slot_until_claimed_or_released() {
        let (gk, tracker) = keeper();
        assert!(gk.check(&entry("intent_a_entry"), &snap(&[])).passed);
        assert_eq!(tracker.in_flight(&Symbol::new("BTCUSDT"), Market::Spot), 1);

        // a second approved entry cannot slip in before the first routes
        let second = gk.check(&entry("intent_b_entry"), &snap(&[]));
        assert!(!second.passed);
        assert!(second.reason.starts_with("concurrent entries limit reached"));

        // same intent again keeps its own hold
        assert!(gk.check(&entry("intent_a_entry"), &snap(&[])).passed);

        let slot = tracker
            .claim("intent_a_entry", &Symbol::new("BTCUSDT"), Market::Spot)
            .unwrap();
        assert_eq!(tracker.in_flight(&Symbol::new("BTCUSDT"), Market::Spot), 1);
        assert!(tracker.claim("intent_b_entry", &Symbol::new("BTCUSDT"), Market::Spot).is_err());
        drop(slot);

        assert!(gk.check(&entry("intent_b_entry"), &snap(&[])).passed);
        gk.release("intent_b_entry");
        assert_eq!(tracker.in_flight(&Symbol::new("BTCUSDT"), Market::Spot), 0);
    }

    #[test]
    fn test_failed_check_takes_no_slot() {
        let (gk, tracker) = keeper();
        let v = gk.check(&entry("intent_a_entry"), &snap(&[("spread_bps", 9.0)]));
        assert!(!v.passed);
        assert_eq!(tracker.in_flight(&Symbol::new("BTCUSDT"), Market::Spot), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_hold_lapses() {
        let tracker = Arc::new(EntryTracker::with_limits(1, Duration::from_secs(30)));
        let gk = GateKeeper::new(GateConfig::default(), tracker.clone());
        assert!(gk.check(&entry("intent_a_entry"), &snap(&[])).passed);
        assert!(!gk.check(&entry("intent_b_entry"), &snap(&[])).passed);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.in_flight(&Symbol::new("BTCUSDT"), Market::Spot), 0);
        assert!(gk.check(&entry("intent_b_entry"), &snap(&[])).passed);
        // the lapsed intent has to win the gate again before it can route
        assert!(tracker.claim("intent_a_entry", &Symbol::new("BTCUSDT"), Market::Spot).is_err());
    }
}
