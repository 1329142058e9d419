//! Exchange adapter - the engine's only view of the venue
//!
//! The adapter is the sole source of truth for fills. Every venue (and the
//! in-process paper exchange) implements the same interface.

pub mod paper;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::core::{Liquidity, Market, OrderStatus, Result, Side, Symbol};

pub use paper::{MakerFill, PaperExchange};

/// Exchange adapter trait
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Venue name (e.g., "paper", "binance")
    fn name(&self) -> &str;

    // ─────────────────────────────────────────────────────────────
    // Market Data
    // ─────────────────────────────────────────────────────────────

    /// Current top of book
    async fn fetch_quote(&self, symbol: &Symbol, market: Market) -> Result<Quote>;

    // ─────────────────────────────────────────────────────────────
    // Trading
    // ─────────────────────────────────────────────────────────────

    /// Place an order. A venue refusal is `Error::ExchangeRejection`.
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck>;

    /// Current state of an order, with its cumulative executions
    async fn get_order(&self, order_id: &str) -> Result<OrderAck>;

    /// Cancel a resting order. `false` when it was already terminal.
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────
    // Account
    // ─────────────────────────────────────────────────────────────

    /// Set leverage (futures only)
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<()>;

    /// Move USDT between the spot and futures wallets; returns the venue transfer id
    async fn transfer(&self, from: Market, to: Market, amount_usdt: Decimal) -> Result<String>;
}

/// Base quantities are truncated to 8 decimals
pub fn round_qty(qty: Decimal) -> Decimal {
    qty.round_dp_with_strategy(8, RoundingStrategy::ToZero)
}

/// Top of book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    /// epoch ms
    pub timestamp: i64,
}

impl Quote {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self {
            bid,
            ask,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Passive price for a maker order on `side`
    pub fn passive(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }

    /// Price a marketable order on `side` would pay
    pub fn aggressive(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    /// Triggers a market order when the stop price trades
    StopLoss,
    /// Resting limit that realises profit
    TakeProfit,
}

/// Order sent to the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: Symbol,
    pub market: Market,
    pub side: Side,
    pub order_type: OrderType,
    /// Base quantity
    pub quantity: Option<Decimal>,
    /// Quote amount to spend (market orders only)
    pub quote_notional: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub post_only: bool,
    pub reduce_only: bool,
}

impl OrderRequest {
    fn base(client_order_id: String, symbol: &Symbol, market: Market, side: Side, order_type: OrderType) -> Self {
        Self {
            client_order_id,
            symbol: symbol.clone(),
            market,
            side,
            order_type,
            quantity: None,
            quote_notional: None,
            price: None,
            stop_price: None,
            post_only: false,
            reduce_only: false,
        }
    }

    /// Post-only limit order
    pub fn maker(client_order_id: String, symbol: &Symbol, market: Market, side: Side, qty: Decimal, price: Decimal) -> Self {
        Self {
            quantity: Some(qty),
            price: Some(price),
            post_only: true,
            ..Self::base(client_order_id, symbol, market, side, OrderType::Limit)
        }
    }

    /// Market order for a quote amount
    pub fn taker(client_order_id: String, symbol: &Symbol, market: Market, side: Side, quote: Decimal) -> Self {
        Self {
            quote_notional: Some(quote),
            ..Self::base(client_order_id, symbol, market, side, OrderType::Market)
        }
    }

    /// Market order for a base quantity; reduce-only on futures
    pub fn market_qty(client_order_id: String, symbol: &Symbol, market: Market, side: Side, qty: Decimal) -> Self {
        Self {
            quantity: Some(qty),
            reduce_only: market == Market::Fut,
            ..Self::base(client_order_id, symbol, market, side, OrderType::Market)
        }
    }

    /// Resting take-profit limit
    pub fn take_profit(client_order_id: String, symbol: &Symbol, market: Market, side: Side, qty: Decimal, price: Decimal) -> Self {
        Self {
            quantity: Some(qty),
            price: Some(price),
            reduce_only: market == Market::Fut,
            ..Self::base(client_order_id, symbol, market, side, OrderType::TakeProfit)
        }
    }

    /// Stop-market order
    pub fn stop_loss(client_order_id: String, symbol: &Symbol, market: Market, side: Side, qty: Decimal, stop: Decimal) -> Self {
        Self {
            quantity: Some(qty),
            stop_price: Some(stop),
            reduce_only: market == Market::Fut,
            ..Self::base(client_order_id, symbol, market, side, OrderType::StopLoss)
        }
    }
}

/// One venue execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub exec_id: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee: Decimal,
    pub liquidity: Liquidity,
    /// epoch ms
    pub timestamp: i64,
}

/// Venue view of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    /// Cumulative, oldest first
    pub executions: Vec<Execution>,
}

impl OrderAck {
    pub fn filled_qty(&self) -> Decimal {
        self.executions.iter().map(|e| e.qty).sum()
    }

    pub fn filled_notional(&self) -> Decimal {
        self.executions.iter().map(|e| e.price * e.qty).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quote_prices() {
        let q = Quote::new(dec!(99.5), dec!(100.5));
        assert_eq!(q.mid(), dec!(100));
        assert_eq!(q.passive(Side::Buy), dec!(99.5));
        assert_eq!(q.aggressive(Side::Buy), dec!(100.5));
        assert_eq!(q.passive(Side::Sell), dec!(100.5));
    }

    #[test]
    fn test_order_builders() {
        let sym = Symbol::new("BTCUSDT");
        let m = OrderRequest::maker("c1".into(), &sym, Market::Spot, Side::Buy, dec!(0.1), dec!(100));
        assert!(m.post_only);
        assert_eq!(m.order_type, OrderType::Limit);

        let t = OrderRequest::taker("c1-t".into(), &sym, Market::Fut, Side::Sell, dec!(50));
        assert_eq!(t.quote_notional, Some(dec!(50)));
        assert_eq!(t.quantity, None);

        let x = OrderRequest::market_qty("gs-x".into(), &sym, Market::Fut, Side::Sell, dec!(0.25));
        assert_eq!(x.order_type, OrderType::Market);
        assert_eq!((x.quantity, x.quote_notional), (Some(dec!(0.25)), None));
        assert!(x.reduce_only);

        let sl = OrderRequest::stop_loss("b-sl".into(), &sym, Market::Fut, Side::Sell, dec!(1), dec!(90));
        assert!(sl.reduce_only);
    }
}
