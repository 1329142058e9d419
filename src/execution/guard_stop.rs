//! Local guard stops for SPOT entries
//!
//! A guard stop is tracked by the engine, not the venue. The price monitor
//! checks armed stops each tick; a crossed stop turns into an EXIT intent.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{
    Error, ExecPolicy, IntentKind, Market, OrderIntent, Result, Side, Symbol,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardStopStatus {
    Armed,
    Triggered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardStop {
    pub guard_stop_id: String,
    pub intent_id: String,
    pub symbol: Symbol,
    pub market: Market,
    /// Side of the protected entry
    pub entry_side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub status: GuardStopStatus,
    /// epoch ms
    pub armed_at: i64,
    pub closed_at: Option<i64>,
}

impl GuardStop {
    /// Stop sits `sl_pct` beyond the entry price, against the position
    pub fn stop_price_for(entry_side: Side, entry_price: Decimal, sl_pct: Decimal) -> Decimal {
        match entry_side {
            Side::Buy => entry_price * (Decimal::ONE - sl_pct),
            Side::Sell => entry_price * (Decimal::ONE + sl_pct),
        }
    }

    /// Long stops trigger at or below the stop, short stops at or above
    pub fn is_crossed(&self, price: Decimal) -> bool {
        match self.entry_side {
            Side::Buy => price <= self.stop_price,
            Side::Sell => price >= self.stop_price,
        }
    }

    pub fn exit_intent_id(&self) -> String {
        format!("exit_{}", self.guard_stop_id)
    }

    /// Taker-only EXIT for exactly the protected quantity. The notional is
    /// the estimate at the stop price; a gapped market moves the notional,
    /// never the quantity.
    pub fn exit_intent(&self) -> OrderIntent {
        let notional = (self.qty * self.stop_price).to_f64().unwrap_or(0.0);
        OrderIntent {
            intent_id: self.exit_intent_id(),
            symbol: self.symbol.clone(),
            market: self.market,
            kind: IntentKind::Exit,
            side: self.entry_side.opposite(),
            notional_usdt: notional,
            leverage: None,
            base_qty: Some(self.qty),
            exec_policy: ExecPolicy::immediate(),
        }
    }
}

/// Guard stops by id
#[derive(Debug, Default)]
pub struct GuardStopBook {
    stops: RwLock<HashMap<String, GuardStop>>,
}

impl GuardStopBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, stop: GuardStop) {
        self.stops.write().insert(stop.guard_stop_id.clone(), stop);
    }

    pub fn get(&self, id: &str) -> Option<GuardStop> {
        self.stops.read().get(id).cloned()
    }

    pub fn armed(&self) -> Vec<GuardStop> {
        self.stops
            .read()
            .values()
            .filter(|s| s.status == GuardStopStatus::Armed)
            .cloned()
            .collect()
    }

    pub fn by_intent(&self, intent_id: &str) -> Vec<GuardStop> {
        self.stops
            .read()
            .values()
            .filter(|s| s.intent_id == intent_id)
            .cloned()
            .collect()
    }

    /// Drop triggered and cancelled stops closed at or before `cutoff_ms`
    pub fn prune_closed(&self, cutoff_ms: i64) -> usize {
        let mut stops = self.stops.write();
        let before = stops.len();
        stops.retain(|_, s| s.status == GuardStopStatus::Armed || s.closed_at.is_none_or(|t| t > cutoff_ms));
        before - stops.len()
    }

    pub fn len(&self) -> usize {
        self.stops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.read().is_empty()
    }

    /// `ARMED → TRIGGERED`; any other state is an error
    pub fn trigger(&self, id: &str) -> Result<GuardStop> {
        self.transition(id, GuardStopStatus::Triggered)
    }

    /// `ARMED → CANCELLED`; any other state is an error
    pub fn cancel(&self, id: &str) -> Result<GuardStop> {
        self.transition(id, GuardStopStatus::Cancelled)
    }

    fn transition(&self, id: &str, to: GuardStopStatus) -> Result<GuardStop> {
        let mut stops = self.stops.write();
        let stop = stops
            .get_mut(id)
            .ok_or_else(|| Error::InvalidState(format!("unknown guard stop {}", id)))?;
        if stop.status != GuardStopStatus::Armed {
            return Err(Error::InvalidState(format!(
                "guard stop {} is {:?}, expected Armed",
                id, stop.status
            )));
        }
        stop.status = to;
        stop.closed_at = Some(Utc::now().timestamp_millis());
        Ok(stop.clone())
    }
}
