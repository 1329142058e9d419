//! OCO brackets: a take-profit and a stop-loss leg linked so that a fill of
//! one cancels the other.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{Market, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BracketStatus {
    Active,
    TakeProfitFilled,
    StopLossFilled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Leg {
    Tp,
    Sl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub bracket_id: String,
    pub intent_id: String,
    pub symbol: Symbol,
    pub market: Market,
    /// Side of the exit legs
    pub exit_side: Side,
    pub qty: Decimal,
    pub take_profit_px: Decimal,
    pub stop_loss_px: Decimal,
    pub tp_order_id: String,
    pub sl_order_id: String,
    pub status: BracketStatus,
    /// epoch ms
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

impl Bracket {
    pub fn is_active(&self) -> bool {
        self.status == BracketStatus::Active
    }

    pub fn leg_of(&self, order_id: &str) -> Option<Leg> {
        if self.tp_order_id == order_id {
            Some(Leg::Tp)
        } else if self.sl_order_id == order_id {
            Some(Leg::Sl)
        } else {
            None
        }
    }

    /// Order id of the leg opposite to `leg`
    pub fn sibling(&self, leg: Leg) -> &str {
        match leg {
            Leg::Tp => &self.sl_order_id,
            Leg::Sl => &self.tp_order_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct BracketBook {
    brackets: RwLock<HashMap<String, Bracket>>,
}

impl BracketBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bracket: Bracket) {
        self.brackets
            .write()
            .insert(bracket.bracket_id.clone(), bracket);
    }

    pub fn get(&self, bracket_id: &str) -> Option<Bracket> {
        self.brackets.read().get(bracket_id).cloned()
    }

    pub fn active(&self) -> Vec<Bracket> {
        self.brackets
            .read()
            .values()
            .filter(|b| b.is_active())
            .cloned()
            .collect()
    }

    /// Active bracket owning `order_id`, with the leg it is
    pub fn find_leg(&self, order_id: &str) -> Option<(Bracket, Leg)> {
        self.brackets
            .read()
            .values()
            .filter(|b| b.is_active())
            .find_map(|b| b.leg_of(order_id).map(|leg| (b.clone(), leg)))
    }

    pub fn by_intent(&self, intent_id: &str) -> Option<Bracket> {
        self.brackets
            .read()
            .values()
            .find(|b| b.intent_id == intent_id)
            .cloned()
    }

    /// Drop closed brackets whose close time is at or before `cutoff_ms`
    pub fn prune_closed(&self, cutoff_ms: i64) -> usize {
        let mut brackets = self.brackets.write();
        let before = brackets.len();
        brackets.retain(|_, b| b.is_active() || b.closed_at.is_none_or(|t| t > cutoff_ms));
        before - brackets.len()
    }

    pub fn len(&self) -> usize {
        self.brackets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.brackets.read().is_empty()
    }

    /// Close an active bracket. Returns `None` if it was already closed, so
    /// exactly one caller wins a race between the two legs.
    pub fn close(&self, bracket_id: &str, status: BracketStatus) -> Option<Bracket> {
        let mut brackets = self.brackets.write();
        let bracket = brackets.get_mut(bracket_id)?;
        if !bracket.is_active() {
            return None;
        }
        bracket.status = status;
        bracket.closed_at = Some(Utc::now().timestamp_millis());
        Some(bracket.clone())
    }
}
