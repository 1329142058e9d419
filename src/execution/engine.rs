//! Order routing state machine
//!
//! ```text
//! NEW → MAKER_PENDING → FILLED
//!                     → TAKER_FALLBACK → FILLED | PARTIALLY_FILLED | REJECTED
//!     (cancel / shutdown at any wait) → CANCELED | PARTIALLY_FILLED
//! ```
//!
//! Each TWAP slice runs the maker→taker path on its own; slices are strictly
//! sequential and an executed slice is never unwound.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::core::config::ExecutionConfig;
use crate::core::{
    Error, Fill, Market, Oco, OrderIntent, OrderResult, OrderStatus, Result, Side, Symbol,
};
use crate::exchange::{ExchangeAdapter, Execution, OrderAck, OrderRequest, round_qty};
use crate::intent::IntentValidator;
use crate::strategy::EntryTracker;
use crate::supervisor::{ShutdownRx, spawn_supervised, wait_for_shutdown};

use super::guard_stop::{GuardStop, GuardStopBook, GuardStopStatus};
use super::idempotency::{Acquired, IdempotencyGuard};
use super::oco::{Bracket, BracketBook, BracketStatus, Leg};

/// Remainders below this many USDT are not worth a taker order
const DUST_NOTIONAL: Decimal = dec!(0.01);

/// An intent currently being worked
struct ActiveRoute {
    cancel: watch::Sender<bool>,
    /// Venue orders placed for this intent
    orders: Vec<String>,
}

#[derive(Debug, Default)]
struct RouteRun {
    fills: Vec<Fill>,
    attempts: u32,
    completed: u32,
    order_ids: Vec<String>,
    rejection: Option<String>,
    cancelled: bool,
}

enum SliceEnd {
    Complete,
    Rejected(String),
    Cancelled,
}

pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeAdapter>,
    config: ExecutionConfig,
    validator: IntentValidator,
    entries: Arc<EntryTracker>,
    results: Arc<IdempotencyGuard<OrderResult>>,
    routes: RwLock<HashMap<String, ActiveRoute>>,
    brackets: BracketBook,
    guard_stops: GuardStopBook,
    audit: Arc<dyn AuditSink>,
    shutdown: ShutdownRx,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        config: ExecutionConfig,
        entries: Arc<EntryTracker>,
        audit: Arc<dyn AuditSink>,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            exchange,
            config,
            validator: IntentValidator::new(),
            entries,
            results: Arc::new(IdempotencyGuard::new()),
            routes: RwLock::new(HashMap::new()),
            brackets: BracketBook::new(),
            guard_stops: GuardStopBook::new(),
            audit,
            shutdown,
        }
    }

    pub fn brackets(&self) -> &BracketBook {
        &self.brackets
    }

    pub fn guard_stops(&self) -> &GuardStopBook {
        &self.guard_stops
    }

    /// Result of an already routed intent
    pub fn result(&self, intent_id: &str) -> Option<OrderResult> {
        self.results.get(intent_id)
    }

    pub fn active_routes(&self) -> usize {
        self.routes.read().len()
    }

    // ─────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────

    /// Route an intent at most once.
    ///
    /// Invalid intents fail without consuming the key. A second call with the
    /// same `intent_id`, concurrent or later, returns the first call's result.
    /// Entries take the slot the gate held for them, or a free one; with the
    /// market at its entry limit they fail with `Error::GateRejection`.
    pub async fn route(&self, intent: OrderIntent) -> Result<OrderResult> {
        if let Err(e) = self.validator.validate(&intent) {
            warn!("❌ Intent {} rejected: {}", intent.intent_id, e);
            self.audit.record(AuditEvent::IntentRejected {
                intent_id: intent.intent_id.clone(),
                error: e.to_body(),
            });
            return Err(e);
        }

        let ticket = match self.results.acquire(&intent.intent_id).await {
            Acquired::Done(previous) => {
                info!("♻️  Intent {} already routed ({})", intent.intent_id, previous.status);
                if intent.kind.opens_exposure() {
                    self.entries.release(&intent.intent_id);
                }
                return Ok(previous);
            }
            Acquired::Owner(ticket) => ticket,
        };

        let _entry = if intent.kind.opens_exposure() {
            match self.entries.claim(&intent.intent_id, &intent.symbol, intent.market) {
                Ok(slot) => Some(slot),
                Err(in_flight) => {
                    let e = Error::GateRejection(format!(
                        "concurrent entries limit reached for {} {}: {} in flight (max {})",
                        intent.symbol,
                        intent.market,
                        in_flight,
                        self.entries.limit()
                    ));
                    warn!("🚫 Intent {} not routed: {}", intent.intent_id, e);
                    self.audit.record(AuditEvent::IntentRejected {
                        intent_id: intent.intent_id.clone(),
                        error: e.to_body(),
                    });
                    // the ticket drops here, so the intent can be retried
                    return Err(e);
                }
            }
        } else {
            None
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.routes.write().insert(
            intent.intent_id.clone(),
            ActiveRoute {
                cancel: cancel_tx,
                orders: Vec::new(),
            },
        );
        info!(
            "🚀 Routing {} {} {} {} {:.2} USDT ({} slice(s), maker={})",
            intent.intent_id,
            intent.kind,
            intent.side,
            intent.symbol,
            intent.notional_usdt,
            intent.exec_policy.effective_slices(),
            intent.exec_policy.prefer_maker
        );

        let result = self.execute(&intent, cancel_rx).await;
        self.routes.write().remove(&intent.intent_id);

        info!(
            "🏁 {} → {} qty={} avg={} slices={}",
            intent.intent_id, result.status, result.executed_qty, result.avg_price, result.slice_attempts
        );
        self.audit.record(AuditEvent::OrderResult {
            intent_id: intent.intent_id.clone(),
            result: result.clone(),
        });
        ticket.complete(result.clone());
        Ok(result)
    }

    async fn execute(&self, intent: &OrderIntent, mut cancel: watch::Receiver<bool>) -> OrderResult {
        let mut shutdown = self.shutdown.clone();
        let mut run = RouteRun::default();
        let slices = intent.exec_policy.effective_slices();

        if intent.market == Market::Fut {
            if let Some(leverage) = intent.leverage {
                if let Err(e) = self.exchange.set_leverage(&intent.symbol, leverage).await {
                    run.rejection = Some(format!("set leverage failed: {}", e));
                    return self.finish(intent, run, slices).await;
                }
            }
        }

        if let Some(qty) = intent.base_qty {
            run.attempts = 1;
            match self.run_exit(intent, qty, &mut run).await {
                SliceEnd::Complete => run.completed = 1,
                SliceEnd::Rejected(reason) => {
                    warn!("⛔ {} exit rejected: {}", intent.intent_id, reason);
                    run.rejection = Some(reason);
                }
                SliceEnd::Cancelled => run.cancelled = true,
            }
            return self.finish(intent, run, 1).await;
        }

        let Some(notional) = Decimal::from_f64(intent.notional_usdt) else {
            run.rejection = Some(format!("notional {} not representable", intent.notional_usdt));
            return self.finish(intent, run, slices).await;
        };

        for (index, slice_notional) in split_notional(notional, slices).into_iter().enumerate() {
            let index = index as u32;
            if index > 0 {
                let pause = Duration::from_millis(self.config.twap_interval_ms);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stop_requested(&mut cancel, &mut shutdown) => {}
                }
            }
            if is_stopped(&cancel, &shutdown) {
                run.cancelled = true;
                break;
            }

            run.attempts += 1;
            debug!("{} slice {}/{}: {} USDT", intent.intent_id, index + 1, slices, slice_notional);
            match self
                .run_slice(intent, index, slice_notional, &mut run, &mut cancel, &mut shutdown)
                .await
            {
                SliceEnd::Complete => run.completed += 1,
                SliceEnd::Rejected(reason) => {
                    warn!("⛔ {} slice {} rejected: {}", intent.intent_id, index + 1, reason);
                    run.rejection = Some(reason);
                    break;
                }
                SliceEnd::Cancelled => {
                    info!("🛑 {} cancelled during slice {}", intent.intent_id, index + 1);
                    run.cancelled = true;
                    break;
                }
            }
        }

        self.finish(intent, run, slices).await
    }

    /// One slice: optional maker attempt, then a taker order for whatever is left.
    async fn run_slice(
        &self,
        intent: &OrderIntent,
        index: u32,
        notional: Decimal,
        run: &mut RouteRun,
        cancel: &mut watch::Receiver<bool>,
        shutdown: &mut ShutdownRx,
    ) -> SliceEnd {
        let quote = match self.exchange.fetch_quote(&intent.symbol, intent.market).await {
            Ok(q) => q,
            Err(e) => return SliceEnd::Rejected(e.to_string()),
        };
        let mut remaining = notional;

        let maker_price = quote.passive(intent.side);
        if intent.exec_policy.prefer_maker && maker_price > Decimal::ZERO {
            let qty = round_qty(notional / maker_price);
            if qty > Decimal::ZERO {
                let request = OrderRequest::maker(
                    format!("{}-s{}-m", intent.intent_id, index),
                    &intent.symbol,
                    intent.market,
                    intent.side,
                    qty,
                    maker_price,
                );
                let ack = match self.exchange.place_order(request).await {
                    Ok(ack) => ack,
                    Err(e) => return SliceEnd::Rejected(e.to_string()),
                };
                self.track_order(&intent.intent_id, &ack.order_id);
                run.order_ids.push(ack.order_id.clone());

                let (ack, stopped) = self
                    .wait_for_maker(ack, intent.exec_policy.maker_wait_ms, cancel, shutdown)
                    .await;
                let mid = quote.mid();
                run.fills.extend(
                    ack.executions
                        .iter()
                        .map(|e| to_fill(e, index, intent.side, mid)),
                );
                remaining = (notional - ack.filled_notional()).max(Decimal::ZERO);

                if stopped {
                    return SliceEnd::Cancelled;
                }
                if ack.status == OrderStatus::Filled {
                    return SliceEnd::Complete;
                }
                info!(
                    "⏱️  {} maker timeout after {}ms, taker fallback for {} USDT",
                    intent.intent_id, intent.exec_policy.maker_wait_ms, remaining
                );
            }
        }

        if remaining < DUST_NOTIONAL {
            return SliceEnd::Complete;
        }
        if is_stopped(cancel, shutdown) {
            return SliceEnd::Cancelled;
        }

        let mid = match self.exchange.fetch_quote(&intent.symbol, intent.market).await {
            Ok(q) => q.mid(),
            Err(_) => quote.mid(),
        };
        let request = OrderRequest::taker(
            format!("{}-s{}-t", intent.intent_id, index),
            &intent.symbol,
            intent.market,
            intent.side,
            remaining,
        );
        let ack = match self.take(intent, index, request, mid, run).await {
            Ok(ack) => ack,
            Err(e) => return SliceEnd::Rejected(e.to_string()),
        };
        let unfilled = (remaining - ack.filled_notional()).max(Decimal::ZERO);
        if ack.status == OrderStatus::Filled || unfilled < DUST_NOTIONAL {
            SliceEnd::Complete
        } else {
            SliceEnd::Rejected(format!(
                "taker order {} {} with {} USDT unfilled",
                ack.order_id,
                ack.status,
                unfilled.round_dp(2)
            ))
        }
    }

    /// Flatten `qty` of base asset with one market order
    async fn run_exit(&self, intent: &OrderIntent, qty: Decimal, run: &mut RouteRun) -> SliceEnd {
        let mid = match self.exchange.fetch_quote(&intent.symbol, intent.market).await {
            Ok(q) => q.mid(),
            Err(e) => {
                debug!("No quote for {} exit slippage: {}", intent.intent_id, e);
                Decimal::ZERO
            }
        };
        let request = OrderRequest::market_qty(
            format!("{}-x", intent.intent_id),
            &intent.symbol,
            intent.market,
            intent.side,
            round_qty(qty),
        );
        let ack = match self.take(intent, 0, request, mid, run).await {
            Ok(ack) => ack,
            Err(e) => return SliceEnd::Rejected(e.to_string()),
        };
        let unfilled = (qty - ack.filled_qty()).max(Decimal::ZERO);
        let dust = unfilled.is_zero() || (mid > Decimal::ZERO && unfilled * mid < DUST_NOTIONAL);
        if ack.status == OrderStatus::Filled || dust {
            SliceEnd::Complete
        } else {
            SliceEnd::Rejected(format!(
                "exit order {} {} with {} unfilled",
                ack.order_id, ack.status, unfilled
            ))
        }
    }

    /// Send a market order and record its fills. An order the venue left
    /// working is cancelled first, so the fills read are final.
    async fn take(
        &self,
        intent: &OrderIntent,
        index: u32,
        request: OrderRequest,
        mid: Decimal,
        run: &mut RouteRun,
    ) -> Result<OrderAck> {
        let mut ack = self.exchange.place_order(request).await?;
        self.track_order(&intent.intent_id, &ack.order_id);
        run.order_ids.push(ack.order_id.clone());

        if matches!(ack.status, OrderStatus::New | OrderStatus::PartiallyFilled) {
            if let Err(e) = self.exchange.cancel_order(&ack.order_id).await {
                warn!("Best-effort cancel of {} failed: {}", ack.order_id, e);
            }
            if let Ok(latest) = self.exchange.get_order(&ack.order_id).await {
                ack = latest;
            }
        }
        run.fills.extend(
            ack.executions
                .iter()
                .map(|e| to_fill(e, index, intent.side, mid)),
        );
        Ok(ack)
    }

    /// Poll a resting maker order until filled, timed out or stopped; an
    /// unfilled order is cancelled before returning. Returns the final venue
    /// view and whether a stop was requested.
    async fn wait_for_maker(
        &self,
        mut ack: OrderAck,
        wait_ms: u32,
        cancel: &mut watch::Receiver<bool>,
        shutdown: &mut ShutdownRx,
    ) -> (OrderAck, bool) {
        let deadline = Instant::now() + Duration::from_millis(u64::from(wait_ms));
        let poll = Duration::from_millis(self.config.maker_poll_ms.max(1));
        let mut stopped = false;

        while ack.status != OrderStatus::Filled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll.min(deadline - now)) => {}
                _ = stop_requested(cancel, shutdown) => {
                    stopped = true;
                    break;
                }
            }
            match self.exchange.get_order(&ack.order_id).await {
                Ok(latest) => ack = latest,
                Err(e) => debug!("Poll of {} failed: {}", ack.order_id, e),
            }
            if matches!(ack.status, OrderStatus::Canceled | OrderStatus::Rejected) {
                break;
            }
        }

        if ack.status != OrderStatus::Filled {
            if let Err(e) = self.exchange.cancel_order(&ack.order_id).await {
                warn!("Best-effort cancel of {} failed: {}", ack.order_id, e);
            }
            // pick up fills that raced the cancel
            if let Ok(latest) = self.exchange.get_order(&ack.order_id).await {
                ack = latest;
            }
        }
        (ack, stopped)
    }

    async fn finish(&self, intent: &OrderIntent, run: RouteRun, slices: u32) -> OrderResult {
        let (avg_price, executed_qty, executed_notional) = OrderResult::totals(&run.fills);

        let status = if run.fills.is_empty() {
            if run.cancelled && run.rejection.is_none() {
                OrderStatus::Canceled
            } else {
                OrderStatus::Rejected
            }
        } else if run.completed == slices {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        let message = match (&run.rejection, run.cancelled) {
            (Some(reason), _) => Some(reason.clone()),
            (None, true) => Some("cancelled".to_string()),
            (None, false) if run.fills.is_empty() => Some("no fills".to_string()),
            _ => None,
        };

        let protect = !run.fills.is_empty()
            && intent.market == Market::Spot
            && intent.kind.opens_exposure();

        let mut bracket_id = None;
        if protect {
            if let Some(oco) = &intent.exec_policy.oco {
                match self.attach_bracket(intent, oco, executed_qty).await {
                    Ok(bracket) => bracket_id = Some(bracket.bracket_id),
                    Err(e) => warn!("⚠️  OCO for {} not attached: {}", intent.intent_id, e),
                }
            }
        }

        let mut guard_stop_id = None;
        if protect && intent.exec_policy.guard_stop_enable {
            guard_stop_id = self
                .arm_guard_stop(intent, avg_price, executed_qty)
                .map(|gs| gs.guard_stop_id);
        }

        OrderResult {
            order_id: run.order_ids.last().cloned().unwrap_or_default(),
            client_order_id: intent.intent_id.clone(),
            status,
            avg_price,
            executed_qty,
            executed_notional,
            fills: run.fills,
            slice_attempts: run.attempts,
            guard_stop_armed: guard_stop_id.is_some(),
            guard_stop_id,
            bracket_id,
            message,
        }
    }

    fn track_order(&self, intent_id: &str, order_id: &str) {
        if let Some(route) = self.routes.write().get_mut(intent_id) {
            route.orders.push(order_id.to_string());
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Cancel
    // ─────────────────────────────────────────────────────────────

    /// Cancel by client order id (intent id) or venue order id.
    ///
    /// In order of precedence: an in-flight route is signalled to stop, an
    /// active OCO bracket has both legs cancelled, an armed guard stop is
    /// cancelled, anything else is passed to the venue.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let signalled = {
            let routes = self.routes.read();
            routes
                .iter()
                .find(|(key, route)| key.as_str() == id || route.orders.iter().any(|o| o == id))
                .map(|(key, route)| {
                    route.cancel.send_replace(true);
                    key.clone()
                })
        };
        if let Some(intent_id) = signalled {
            info!("🛑 Cancel requested for in-flight {}", intent_id);
            return Ok(true);
        }

        let bracket = self
            .brackets
            .get(id)
            .or_else(|| self.brackets.find_leg(id).map(|(b, _)| b))
            .or_else(|| self.brackets.by_intent(id))
            .filter(Bracket::is_active);
        if let Some(bracket) = bracket {
            return Ok(self.cancel_bracket(&bracket).await);
        }

        if self
            .guard_stops
            .get(id)
            .is_some_and(|gs| gs.status == GuardStopStatus::Armed)
        {
            self.cancel_guard_stop(id)?;
            return Ok(true);
        }

        self.exchange.cancel_order(id).await
    }

    /// Signal every in-flight route to stop
    pub fn cancel_all(&self) -> usize {
        let routes = self.routes.read();
        for route in routes.values() {
            route.cancel.send_replace(true);
        }
        routes.len()
    }

    // ─────────────────────────────────────────────────────────────
    // OCO brackets
    // ─────────────────────────────────────────────────────────────

    async fn attach_bracket(&self, intent: &OrderIntent, oco: &Oco, qty: Decimal) -> Result<Bracket> {
        let price = |v: f64| {
            Decimal::from_f64(v)
                .map(|d| d.round_dp(8))
                .ok_or_else(|| Error::BusinessRule(format!("OCO price {} not representable", v)))
        };
        let take_profit_px = price(oco.take_profit_px)?;
        let stop_loss_px = price(oco.stop_loss_px)?;
        let exit_side = intent.side.opposite();

        let tp = self
            .exchange
            .place_order(OrderRequest::take_profit(
                format!("{}-tp", intent.intent_id),
                &intent.symbol,
                intent.market,
                exit_side,
                qty,
                take_profit_px,
            ))
            .await?;

        let sl = match self
            .exchange
            .place_order(OrderRequest::stop_loss(
                format!("{}-sl", intent.intent_id),
                &intent.symbol,
                intent.market,
                exit_side,
                qty,
                stop_loss_px,
            ))
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                if let Err(ce) = self.exchange.cancel_order(&tp.order_id).await {
                    warn!("Failed to unwind TP leg {}: {}", tp.order_id, ce);
                }
                return Err(e);
            }
        };

        let bracket = Bracket {
            bracket_id: format!("oco_{}", Uuid::new_v4().simple()),
            intent_id: intent.intent_id.clone(),
            symbol: intent.symbol.clone(),
            market: intent.market,
            exit_side,
            qty,
            take_profit_px,
            stop_loss_px,
            tp_order_id: tp.order_id,
            sl_order_id: sl.order_id,
            status: BracketStatus::Active,
            created_at: Utc::now().timestamp_millis(),
            closed_at: None,
        };
        info!(
            "🔗 OCO {} for {}: TP {} / SL {} x {}",
            bracket.bracket_id, intent.intent_id, take_profit_px, stop_loss_px, qty
        );
        self.brackets.insert(bracket.clone());
        self.audit.record(AuditEvent::Bracket {
            bracket: bracket.clone(),
        });
        Ok(bracket)
    }

    async fn cancel_bracket(&self, bracket: &Bracket) -> bool {
        let Some(closed) = self
            .brackets
            .close(&bracket.bracket_id, BracketStatus::Cancelled)
        else {
            return false;
        };
        for order_id in [&closed.tp_order_id, &closed.sl_order_id] {
            if let Err(e) = self.exchange.cancel_order(order_id).await {
                warn!("Failed to cancel OCO leg {}: {}", order_id, e);
            }
        }
        info!("🔗 OCO {} cancelled", closed.bracket_id);
        self.audit.record(AuditEvent::Bracket { bracket: closed });
        true
    }

    /// A bracket leg filled: close the bracket and cancel the other leg.
    ///
    /// Returns the closed bracket, or `None` if the order is not an active leg.
    pub async fn on_leg_filled(&self, order_id: &str) -> Result<Option<Bracket>> {
        let Some((bracket, leg)) = self.brackets.find_leg(order_id) else {
            return Ok(None);
        };
        let status = match leg {
            Leg::Tp => BracketStatus::TakeProfitFilled,
            Leg::Sl => BracketStatus::StopLossFilled,
        };
        let Some(closed) = self.brackets.close(&bracket.bracket_id, status) else {
            return Ok(None);
        };

        let sibling = closed.sibling(leg);
        if let Err(e) = self.exchange.cancel_order(sibling).await {
            warn!("Failed to cancel OCO sibling {}: {}", sibling, e);
        }

        // position is closed; its guard stop has nothing left to protect
        for gs in self.guard_stops.by_intent(&closed.intent_id) {
            if gs.status == GuardStopStatus::Armed {
                self.cancel_guard_stop(&gs.guard_stop_id)?;
            }
        }

        info!("🎯 OCO {} closed by {:?} leg", closed.bracket_id, leg);
        self.audit.record(AuditEvent::Bracket {
            bracket: closed.clone(),
        });
        Ok(Some(closed))
    }

    /// Poll every active bracket's legs and enforce one-cancels-other.
    /// A leg that cannot be read is skipped until the next pass. Returns how
    /// many brackets were closed.
    pub async fn reconcile_brackets(&self) -> usize {
        let mut closed = 0;
        for bracket in self.brackets.active() {
            for order_id in [&bracket.tp_order_id, &bracket.sl_order_id] {
                let ack = match self.exchange.get_order(order_id).await {
                    Ok(ack) => ack,
                    Err(e) => {
                        warn!("⚠️  OCO {} leg {} unreadable: {}", bracket.bracket_id, order_id, e);
                        continue;
                    }
                };
                if ack.status == OrderStatus::Filled {
                    match self.on_leg_filled(order_id).await {
                        Ok(Some(_)) => closed += 1,
                        Ok(None) => {}
                        Err(e) => warn!("⚠️  OCO {} close failed: {}", bracket.bracket_id, e),
                    }
                    break;
                }
            }
        }
        closed
    }

    // ─────────────────────────────────────────────────────────────
    // Guard stops
    // ─────────────────────────────────────────────────────────────

    fn arm_guard_stop(&self, intent: &OrderIntent, entry_price: Decimal, qty: Decimal) -> Option<GuardStop> {
        let Some(sl_pct) = intent.exec_policy.sl_pct.and_then(Decimal::from_f64) else {
            warn!("⚠️  {} requests a guard stop without sl_pct", intent.intent_id);
            return None;
        };
        let stop = GuardStop {
            guard_stop_id: format!("gs_{}", Uuid::new_v4().simple()),
            intent_id: intent.intent_id.clone(),
            symbol: intent.symbol.clone(),
            market: intent.market,
            entry_side: intent.side,
            qty,
            entry_price,
            stop_price: GuardStop::stop_price_for(intent.side, entry_price, sl_pct).round_dp(8),
            status: GuardStopStatus::Armed,
            armed_at: Utc::now().timestamp_millis(),
            closed_at: None,
        };
        info!(
            "🛡️  Guard stop {} armed for {} at {}",
            stop.guard_stop_id, intent.intent_id, stop.stop_price
        );
        self.guard_stops.arm(stop.clone());
        self.audit.record(AuditEvent::GuardStop {
            guard_stop: stop.clone(),
        });
        Some(stop)
    }

    /// `ARMED → TRIGGERED`, yielding the EXIT intent to route. The entry's
    /// OCO bracket is cancelled first; the exit flattens the same quantity.
    pub async fn trigger_guard_stop(&self, guard_stop_id: &str) -> Result<OrderIntent> {
        let stop = self.guard_stops.trigger(guard_stop_id)?;
        warn!(
            "🚨 Guard stop {} triggered for {} at {}",
            stop.guard_stop_id, stop.symbol, stop.stop_price
        );
        if let Some(bracket) = self
            .brackets
            .by_intent(&stop.intent_id)
            .filter(Bracket::is_active)
        {
            self.cancel_bracket(&bracket).await;
        }
        let exit = stop.exit_intent();
        self.audit.record(AuditEvent::GuardStop { guard_stop: stop });
        Ok(exit)
    }

    /// `ARMED → CANCELLED`
    pub fn cancel_guard_stop(&self, guard_stop_id: &str) -> Result<GuardStop> {
        let stop = self.guard_stops.cancel(guard_stop_id)?;
        info!("Guard stop {} cancelled", stop.guard_stop_id);
        self.audit.record(AuditEvent::GuardStop {
            guard_stop: stop.clone(),
        });
        Ok(stop)
    }

    /// Trigger every armed stop on `symbol`/`market` crossed by `price`
    pub async fn evaluate_tick(&self, symbol: &Symbol, market: Market, price: Decimal) -> Vec<OrderIntent> {
        let crossed: Vec<String> = self
            .guard_stops
            .armed()
            .into_iter()
            .filter(|gs| &gs.symbol == symbol && gs.market == market && gs.is_crossed(price))
            .map(|gs| gs.guard_stop_id)
            .collect();

        let mut exits = Vec::with_capacity(crossed.len());
        for id in crossed {
            match self.trigger_guard_stop(&id).await {
                Ok(exit) => exits.push(exit),
                Err(e) => debug!("Guard stop {} not triggered: {}", id, e),
            }
        }
        exits
    }

    /// One monitor pass: reconcile brackets, check armed guard stops against
    /// the venue mid, route the resulting exits and prune old state. A market
    /// without a quote is skipped for this pass. Returns the number of exits
    /// routed.
    pub async fn monitor_tick(&self) -> usize {
        self.reconcile_brackets().await;

        let mut markets: Vec<(Symbol, Market)> = Vec::new();
        for gs in self.guard_stops.armed() {
            let key = (gs.symbol, gs.market);
            if !markets.contains(&key) {
                markets.push(key);
            }
        }

        let mut routed = 0;
        for (symbol, market) in markets {
            let quote = match self.exchange.fetch_quote(&symbol, market).await {
                Ok(q) => q,
                Err(e) => {
                    warn!("⚠️  No quote for {} {}, guard stops unchecked: {}", symbol, market, e);
                    continue;
                }
            };
            for exit in self.evaluate_tick(&symbol, market, quote.mid()).await {
                match self.route(exit).await {
                    Ok(result) => {
                        info!("Exit {} → {}", result.client_order_id, result.status);
                        routed += 1;
                    }
                    Err(e) => warn!("Exit routing failed: {}", e),
                }
            }
        }

        self.prune();
        routed
    }

    /// Forget routed results and closed brackets and guard stops older than
    /// `result_ttl_secs`. Returns how many entries were dropped.
    pub fn prune(&self) -> usize {
        let ttl = Duration::from_secs(self.config.result_ttl_secs);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(ttl_ms);

        let results = self.results.prune(ttl);
        let brackets = self.brackets.prune_closed(cutoff);
        let stops = self.guard_stops.prune_closed(cutoff);
        let dropped = results + brackets + stops;
        if dropped > 0 {
            debug!(
                "Pruned {} result(s), {} bracket(s), {} guard stop(s)",
                results, brackets, stops
            );
        }
        dropped
    }
}

/// Run [`ExecutionEngine::monitor_tick`] every `interval` until shutdown
pub fn spawn_guard_stop_monitor(
    engine: Arc<ExecutionEngine>,
    interval: Duration,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    spawn_supervised("guard-stop monitor", interval, shutdown, move || {
        let engine = engine.clone();
        async move {
            engine.monitor_tick().await;
            Ok(())
        }
    })
}

async fn stop_requested(cancel: &mut watch::Receiver<bool>, shutdown: &mut ShutdownRx) {
    tokio::select! {
        _ = wait_for_shutdown(cancel) => {}
        _ = wait_for_shutdown(shutdown) => {}
    }
}

fn is_stopped(cancel: &watch::Receiver<bool>, shutdown: &ShutdownRx) -> bool {
    *cancel.borrow() || *shutdown.borrow()
}

/// Equal slices truncated to 8 decimals; the last slice takes the remainder
pub fn split_notional(total: Decimal, slices: u32) -> Vec<Decimal> {
    let n = slices.max(1);
    let base = (total / Decimal::from(n)).round_dp_with_strategy(8, RoundingStrategy::ToZero);
    let mut parts = vec![base; (n - 1) as usize];
    parts.push(total - base * Decimal::from(n - 1));
    parts
}

/// Slippage is positive when the fill is worse than mid for `side`
fn to_fill(exec: &Execution, slice_index: u32, side: Side, mid: Decimal) -> Fill {
    let slippage_bps = if mid.is_zero() {
        0.0
    } else {
        let diff = match side {
            Side::Buy => exec.price - mid,
            Side::Sell => mid - exec.price,
        };
        (diff / mid * Decimal::from(10_000)).to_f64().unwrap_or(0.0)
    };
    Fill {
        fill_id: exec.exec_id.clone(),
        slice_index,
        liquidity: exec.liquidity,
        price: exec.price,
        qty: exec.qty,
        fee_usdt: exec.fee,
        mid_at_send: mid,
        slippage_bps,
        timestamp: exec.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullSink;
    use crate::core::{ErrorKind, ExecPolicy, IntentKind, Liquidity};
    use crate::exchange::{MakerFill, OrderType, PaperExchange, Quote};
    use crate::supervisor::shutdown_channel;
    use async_trait::async_trait;

    fn paper() -> Arc<PaperExchange> {
        let ex = Arc::new(PaperExchange::default());
        ex.set_quote(&Symbol::new("BTCUSDT"), Market::Spot, dec!(50000), dec!(50010));
        ex.set_quote(&Symbol::new("BTCUSDT"), Market::Fut, dec!(50000), dec!(50010));
        ex
    }

    fn engine_on(
        ex: Arc<dyn ExchangeAdapter>,
        config: ExecutionConfig,
    ) -> (Arc<ExecutionEngine>, watch::Sender<bool>) {
        let (tx, rx) = shutdown_channel();
        let engine = ExecutionEngine::new(ex, config, Arc::new(EntryTracker::new()), Arc::new(NullSink), rx);
        (Arc::new(engine), tx)
    }

    fn setup() -> (Arc<ExecutionEngine>, Arc<PaperExchange>, watch::Sender<bool>) {
        let ex = paper();
        let (engine, tx) = engine_on(ex.clone(), ExecutionConfig::default());
        (engine, ex, tx)
    }

    /// Venue whose market orders expire without trading
    struct ExpiringTaker(Arc<PaperExchange>);

    #[async_trait]
    impl ExchangeAdapter for ExpiringTaker {
        fn name(&self) -> &str {
            "expiring"
        }

        async fn fetch_quote(&self, symbol: &Symbol, market: Market) -> Result<Quote> {
            self.0.fetch_quote(symbol, market).await
        }

        async fn place_order(&self, order: OrderRequest) -> Result<OrderAck> {
            if order.order_type == OrderType::Market {
                return Ok(OrderAck {
                    order_id: format!("exp-{}", order.client_order_id),
                    client_order_id: order.client_order_id,
                    status: OrderStatus::Canceled,
                    executions: vec![],
                });
            }
            self.0.place_order(order).await
        }

        async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
            self.0.get_order(order_id).await
        }

        async fn cancel_order(&self, order_id: &str) -> Result<bool> {
            self.0.cancel_order(order_id).await
        }

        async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<()> {
            self.0.set_leverage(symbol, leverage).await
        }

        async fn transfer(&self, from: Market, to: Market, amount_usdt: Decimal) -> Result<String> {
            self.0.transfer(from, to, amount_usdt).await
        }
    }

    fn protected_policy() -> ExecPolicy {
        ExecPolicy {
            guard_stop_enable: true,
            sl_pct: Some(0.01),
            oco: Some(Oco {
                take_profit_px: 51_000.0,
                stop_loss_px: 49_500.0,
            }),
            ..ExecPolicy::immediate()
        }
    }

    fn spot_intent(id: &str, notional: f64, policy: ExecPolicy) -> OrderIntent {
        OrderIntent {
            intent_id: id.into(),
            symbol: Symbol::new("BTCUSDT"),
            market: Market::Spot,
            kind: IntentKind::Entry,
            side: Side::Buy,
            notional_usdt: notional,
            leverage: None,
            base_qty: None,
            exec_policy: policy,
        }
    }

    fn maker_policy(wait_ms: u32) -> ExecPolicy {
        ExecPolicy {
            prefer_maker: true,
            maker_wait_ms: wait_ms,
            ..ExecPolicy::immediate()
        }
    }

    #[test]
    fn test_split_sums_exactly() {
        let parts = split_notional(dec!(100), 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], dec!(33.33333333));
        assert_eq!(parts.iter().copied().sum::<Decimal>(), dec!(100));
        assert_eq!(split_notional(dec!(10), 0), vec![dec!(10)]);
    }

    #[test]
    fn test_slippage_sign() {
        let exec = Execution {
            exec_id: "e".into(),
            price: dec!(101),
            qty: dec!(1),
            fee: dec!(0),
            liquidity: Liquidity::Taker,
            timestamp: 0,
        };
        assert!((to_fill(&exec, 0, Side::Buy, dec!(100)).slippage_bps - 100.0).abs() < 1e-9);
        assert!((to_fill(&exec, 0, Side::Sell, dec!(100)).slippage_bps + 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_maker_fill_no_fallback() {
        let (engine, ex, _tx) = setup();
        let result = engine
            .route(spot_intent("m1", 100.0, maker_policy(2000)))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert!(result.fills.iter().all(|f| f.liquidity == Liquidity::Maker));
        assert_eq!(ex.placed_orders().len(), 1);
        assert!(result.executed_notional <= dec!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_maker_then_taker_remainder() {
        let (engine, ex, _tx) = setup();
        ex.set_maker_fill(MakerFill::Partial(dec!(0.5)));
        let result = engine
            .route(spot_intent("p1", 1000.0, maker_policy(500)))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.fills.len(), 2);
        assert_eq!(result.fills[0].liquidity, Liquidity::Maker);
        assert_eq!(result.fills[1].liquidity, Liquidity::Taker);
        assert!(result.executed_notional <= dec!(1000));
        assert_eq!(ex.cancelled_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_taker_leaves_slice_unfilled() {
        let ex = paper();
        ex.set_maker_fill(MakerFill::Partial(dec!(0.5)));
        let (engine, _tx) = engine_on(Arc::new(ExpiringTaker(ex.clone())), ExecutionConfig::default());

        let result = engine
            .route(spot_intent("x1", 1000.0, maker_policy(500)))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert_eq!(result.fills.len(), 1);
        assert!(result.executed_notional < dec!(600));
        let message = result.message.unwrap();
        assert!(message.contains("CANCELED") && message.contains("USDT unfilled"), "{}", message);
    }

    #[tokio::test]
    async fn test_expired_taker_alone_is_rejected() {
        let (engine, _tx) = engine_on(Arc::new(ExpiringTaker(paper())), ExecutionConfig::default());
        let result = engine
            .route(spot_intent("x2", 100.0, ExecPolicy::immediate()))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert!(result.fills.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_entry_refused_while_first_routes() {
        let (engine, ex, _tx) = setup();
        ex.set_maker_fill(MakerFill::Never);
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.route(spot_intent("e1", 100.0, maker_policy(1000))).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = engine
            .route(spot_intent("e2", 100.0, ExecPolicy::immediate()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GateRejection);
        assert!(err.to_string().contains("concurrent entries limit reached"));
        assert_eq!(ex.placed_orders().len(), 1);

        // exits are never counted against the limit
        let mut exit = spot_intent("e1-exit", 100.0, ExecPolicy::immediate());
        exit.kind = IntentKind::Exit;
        exit.side = Side::Sell;
        assert!(engine.route(exit).await.is_ok());

        first.await.unwrap().unwrap();
        // the refused intent did not burn its key
        let retried = engine
            .route(spot_intent("e2", 100.0, ExecPolicy::immediate()))
            .await
            .unwrap();
        assert_eq!(retried.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_fut_sets_leverage() {
        let (engine, ex, _tx) = setup();
        let mut intent = spot_intent("f1", 400.0, ExecPolicy::immediate());
        intent.market = Market::Fut;
        intent.leverage = Some(20);
        engine.route(intent).await.unwrap();
        assert_eq!(ex.leverage_for(&Symbol::new("BTCUSDT")), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_stops_remaining_slices() {
        let (engine, ex, _tx) = setup();
        ex.reject_placement(2, "insufficient balance");
        let policy = ExecPolicy {
            twap_slices: 4,
            ..ExecPolicy::immediate()
        };
        let result = engine.route(spot_intent("r1", 400.0, policy)).await.unwrap();
        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert_eq!(result.slice_attempts, 2);
        assert_eq!(result.message.as_deref(), Some("Exchange rejected: insufficient balance"));
        assert!(result.fills.iter().all(|f| f.slice_index == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_maker_wait() {
        let (engine, ex, _tx) = setup();
        ex.set_maker_fill(MakerFill::Never);
        let routing = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.route(spot_intent("c1", 100.0, maker_policy(10_000))).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(engine.cancel("c1").await.unwrap());

        let result = routing.await.unwrap().unwrap();
        assert_eq!(result.status, OrderStatus::Canceled);
        assert_eq!(ex.cancelled_orders().len(), 1);
        assert_eq!(ex.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_stop_armed_and_triggered() {
        let (engine, ex, _tx) = setup();
        let policy = ExecPolicy {
            guard_stop_enable: true,
            sl_pct: Some(0.01),
            ..ExecPolicy::immediate()
        };
        let result = engine.route(spot_intent("g1", 500.0, policy)).await.unwrap();
        assert!(result.guard_stop_armed);
        let id = result.guard_stop_id.clone().unwrap();

        let sym = Symbol::new("BTCUSDT");
        assert!(engine.evaluate_tick(&sym, Market::Spot, dec!(50000)).await.is_empty());

        ex.set_quote(&sym, Market::Spot, dec!(49000), dec!(49010));
        assert_eq!(engine.monitor_tick().await, 1);
        assert_eq!(engine.guard_stops().get(&id).unwrap().status, GuardStopStatus::Triggered);
        let exit = engine.result(&format!("exit_{}", id)).unwrap();
        assert_eq!(exit.status, OrderStatus::Filled);
        assert!(engine.trigger_guard_stop(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_gapped_guard_stop_exits_entry_qty_and_closes_bracket() {
        let (engine, ex, _tx) = setup();
        let entry = engine.route(spot_intent("gap1", 500.0, protected_policy())).await.unwrap();
        let bracket = engine.brackets().get(entry.bracket_id.as_deref().unwrap()).unwrap();
        let gs = entry.guard_stop_id.clone().unwrap();

        // price gaps through both the stop and the SL leg
        let sym = Symbol::new("BTCUSDT");
        ex.set_quote(&sym, Market::Spot, dec!(45000), dec!(45010));
        assert_eq!(engine.monitor_tick().await, 1);

        let exit = engine.result(&format!("exit_{}", gs)).unwrap();
        assert_eq!(exit.status, OrderStatus::Filled);
        assert_eq!(exit.executed_qty, entry.executed_qty);
        assert!(exit.fills.iter().all(|f| f.price == dec!(45000)));

        assert!(engine.brackets().active().is_empty());
        assert_eq!(
            engine.brackets().get(&bracket.bracket_id).unwrap().status,
            BracketStatus::Cancelled
        );
        let cancelled = ex.cancelled_orders();
        assert!(cancelled.contains(&bracket.tp_order_id) && cancelled.contains(&bracket.sl_order_id));

        let sold: Vec<_> = ex
            .placed_orders()
            .into_iter()
            .filter(|o| o.order_type == OrderType::Market && o.side == Side::Sell)
            .collect();
        assert_eq!(sold.len(), 1);
        assert_eq!(sold[0].quantity, Some(entry.executed_qty));
    }

    #[tokio::test]
    async fn test_monitor_survives_unreadable_bracket_and_missing_quote() {
        let (engine, ex, _tx) = setup();
        let sym = Symbol::new("BTCUSDT");
        engine.brackets().insert(Bracket {
            bracket_id: "oco_broken".into(),
            intent_id: "lost".into(),
            symbol: sym.clone(),
            market: Market::Spot,
            exit_side: Side::Sell,
            qty: dec!(0.01),
            take_profit_px: dec!(51000),
            stop_loss_px: dec!(49000),
            tp_order_id: "gone-tp".into(),
            sl_order_id: "gone-sl".into(),
            status: BracketStatus::Active,
            created_at: 0,
            closed_at: None,
        });
        engine.guard_stops().arm(GuardStop {
            guard_stop_id: "gs_unquoted".into(),
            intent_id: "eth-entry".into(),
            symbol: Symbol::new("ETHUSDT"),
            market: Market::Spot,
            entry_side: Side::Buy,
            qty: dec!(1),
            entry_price: dec!(3000),
            stop_price: dec!(2970),
            status: GuardStopStatus::Armed,
            armed_at: 0,
            closed_at: None,
        });

        let policy = ExecPolicy {
            guard_stop_enable: true,
            sl_pct: Some(0.01),
            ..ExecPolicy::immediate()
        };
        let entry = engine.route(spot_intent("m2", 500.0, policy)).await.unwrap();
        ex.set_quote(&sym, Market::Spot, dec!(49000), dec!(49010));

        assert_eq!(engine.monitor_tick().await, 1);
        let gs = entry.guard_stop_id.unwrap();
        assert!(engine.result(&format!("exit_{}", gs)).is_some());
        // both stay for the next pass
        assert_eq!(engine.brackets().active().len(), 1);
        assert_eq!(
            engine.guard_stops().get("gs_unquoted").unwrap().status,
            GuardStopStatus::Armed
        );
    }

    #[tokio::test]
    async fn test_prune_forgets_finished_state() {
        let config = ExecutionConfig {
            result_ttl_secs: 0,
            ..ExecutionConfig::default()
        };
        let (engine, _tx) = engine_on(paper(), config);
        let entry = engine.route(spot_intent("pr1", 500.0, protected_policy())).await.unwrap();
        assert!(engine.cancel("pr1").await.unwrap());
        engine
            .cancel_guard_stop(entry.guard_stop_id.as_deref().unwrap())
            .unwrap();
        assert!(engine.result("pr1").is_some());

        assert_eq!(engine.prune(), 3);
        assert!(engine.result("pr1").is_none());
        assert!(engine.brackets().is_empty());
        assert!(engine.guard_stops().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_live_protection() {
        let config = ExecutionConfig {
            result_ttl_secs: 0,
            ..ExecutionConfig::default()
        };
        let (engine, _tx) = engine_on(paper(), config);
        engine.route(spot_intent("pr2", 500.0, protected_policy())).await.unwrap();

        assert_eq!(engine.prune(), 1);
        assert_eq!(engine.brackets().active().len(), 1);
        assert_eq!(engine.guard_stops().armed().len(), 1);
    }

    #[tokio::test]
    async fn test_oco_leg_fill_cancels_sibling() {
        let (engine, ex, _tx) = setup();
        let policy = ExecPolicy {
            oco: Some(Oco {
                take_profit_px: 51_000.0,
                stop_loss_px: 49_500.0,
            }),
            ..ExecPolicy::immediate()
        };
        let result = engine.route(spot_intent("o1", 500.0, policy)).await.unwrap();
        let bracket = engine.brackets().get(result.bracket_id.as_deref().unwrap()).unwrap();
        assert_eq!(bracket.exit_side, Side::Sell);
        assert_eq!(bracket.qty, result.executed_qty);

        ex.fill_order(&bracket.tp_order_id).unwrap();
        assert_eq!(engine.reconcile_brackets().await, 1);
        assert_eq!(
            engine.brackets().get(&bracket.bracket_id).unwrap().status,
            BracketStatus::TakeProfitFilled
        );
        assert!(ex.cancelled_orders().contains(&bracket.sl_order_id));
        assert_eq!(engine.reconcile_brackets().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_by_intent_cancels_bracket() {
        let (engine, ex, _tx) = setup();
        let policy = ExecPolicy {
            oco: Some(Oco {
                take_profit_px: 51_000.0,
                stop_loss_px: 49_500.0,
            }),
            ..ExecPolicy::immediate()
        };
        engine.route(spot_intent("o2", 500.0, policy)).await.unwrap();
        assert!(engine.cancel("o2").await.unwrap());
        assert_eq!(ex.cancelled_orders().len(), 2);
        assert!(engine.brackets().active().is_empty());
    }
}
