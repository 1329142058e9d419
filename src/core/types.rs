//! Core types - Strong typing for the decision and execution data contracts

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tradeable symbol (e.g., "BTCUSDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `^[A-Z0-9]+$`, at least three characters
    pub fn is_well_formed(&self) -> bool {
        self.0.len() >= 3
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Market segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    /// USDT-margined perpetual futures
    Fut,
    Spot,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Market::Fut => write!(f, "FUT"),
            Market::Spot => write!(f, "SPOT"),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// What an intent does to the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentKind {
    Entry,
    Add,
    Exit,
    Tp,
    Sl,
}

impl IntentKind {
    /// Kinds that open or grow exposure and therefore count against the
    /// concurrent-entries limit.
    pub fn opens_exposure(self) -> bool {
        matches!(self, IntentKind::Entry | IntentKind::Add)
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntentKind::Entry => "ENTRY",
            IntentKind::Add => "ADD",
            IntentKind::Exit => "EXIT",
            IntentKind::Tp => "TP",
            IntentKind::Sl => "SL",
        };
        write!(f, "{}", s)
    }
}

/// Order status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::New)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::Filled => "FILLED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

// ─────────────────────────────────────────────────────────────
// Features
// ─────────────────────────────────────────────────────────────

/// A single feature value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

/// Named feature values
pub type FeatureSet = HashMap<String, FeatureValue>;

/// Features for one (symbol, market) at one instant.
///
/// Built once upstream; the pipeline only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub symbol: Symbol,
    pub market: Market,
    /// epoch ms
    pub timestamp: i64,
    values: FeatureSet,
}

impl FeatureSnapshot {
    pub fn new(symbol: Symbol, market: Market, values: FeatureSet) -> Self {
        Self {
            symbol,
            market,
            timestamp: Utc::now().timestamp_millis(),
            values,
        }
    }

    pub fn from_pairs<K, V, I>(symbol: Symbol, market: Market, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<FeatureValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(symbol, market, values)
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    /// Numeric value of a feature; `None` when missing or not numeric
    pub fn number(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(FeatureValue::as_f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &FeatureSet {
        &self.values
    }
}

// ─────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Open,
    Skip,
}

/// Output of the decision layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub size_mult: f64,
    pub tp_mult: f64,
    pub sl_mult: f64,
    pub reason: String,
}

impl Decision {
    pub fn is_open(&self) -> bool {
        self.action == DecisionAction::Open
    }
}

// ─────────────────────────────────────────────────────────────
// Order intent
// ─────────────────────────────────────────────────────────────

/// SPOT bracket prices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oco {
    pub take_profit_px: f64,
    pub stop_loss_px: f64,
}

/// How the router should work an intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPolicy {
    pub prefer_maker: bool,
    #[serde(default)]
    pub maker_wait_ms: u32,
    #[serde(default)]
    pub twap_slices: u32,
    #[serde(default)]
    pub guard_stop_enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oco: Option<Oco>,
}

impl ExecPolicy {
    /// Taker-only, single slice, no brackets
    pub fn immediate() -> Self {
        Self {
            prefer_maker: false,
            maker_wait_ms: 0,
            twap_slices: 1,
            guard_stop_enable: false,
            tp_pct: None,
            sl_pct: None,
            oco: None,
        }
    }

    /// `0` and `1` both mean a single slice
    pub fn effective_slices(&self) -> u32 {
        self.twap_slices.max(1)
    }
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

/// A fully specified instruction to the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Unique; doubles as the idempotency key and client order id
    pub intent_id: String,
    pub symbol: Symbol,
    pub market: Market,
    pub kind: IntentKind,
    pub side: Side,
    pub notional_usdt: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    /// Base quantity to execute instead of a quote amount; exits that
    /// flatten a known position carry it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_qty: Option<Decimal>,
    #[serde(default)]
    pub exec_policy: ExecPolicy,
}

// ─────────────────────────────────────────────────────────────
// Execution results
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liquidity {
    Maker,
    Taker,
}

/// One execution event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub slice_index: u32,
    pub liquidity: Liquidity,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee_usdt: Decimal,
    pub mid_at_send: Decimal,
    /// Positive = paid worse than mid
    pub slippage_bps: f64,
    /// epoch ms
    pub timestamp: i64,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }
}

/// Final report for a routed intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
    pub executed_notional: Decimal,
    pub fills: Vec<Fill>,
    pub slice_attempts: u32,
    pub guard_stop_armed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard_stop_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bracket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OrderResult {
    /// Aggregate totals from the fill sequence
    pub fn totals(fills: &[Fill]) -> (Decimal, Decimal, Decimal) {
        let qty: Decimal = fills.iter().map(|f| f.qty).sum();
        let notional: Decimal = fills.iter().map(Fill::notional).sum();
        let avg = if qty.is_zero() {
            Decimal::ZERO
        } else {
            notional / qty
        };
        (avg, qty, notional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_shape() {
        assert!(Symbol::new("btcusdt").is_well_formed());
        assert!(!Symbol::new("BTC/USDT").is_well_formed());
        assert!(!Symbol::new("BT").is_well_formed());
        let raw: Symbol = serde_json::from_str("\"btcusdt\"").unwrap();
        assert!(!raw.is_well_formed());
    }

    #[test]
    fn test_feature_values_from_json() {
        let values: FeatureSet = serde_json::from_str(
            r#"{"funding_next": 0.0001, "halted": false, "regime": "calm"}"#,
        )
        .unwrap();
        let snap = FeatureSnapshot::new(Symbol::new("BTCUSDT"), Market::Fut, values);
        assert_eq!(snap.number("funding_next"), Some(0.0001));
        assert_eq!(snap.get("halted"), Some(&FeatureValue::Bool(false)));
        assert_eq!(snap.number("regime"), None);
        assert_eq!(snap.number("missing"), None);
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&Market::Fut).unwrap(), "\"FUT\"");
        assert_eq!(
            serde_json::to_string(&OrderStatus::PartiallyFilled).unwrap(),
            "\"PARTIALLY_FILLED\""
        );
        assert!(serde_json::from_str::<IntentKind>("\"HEDGE\"").is_err());
    }
}
