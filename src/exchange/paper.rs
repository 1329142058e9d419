//! In-process paper exchange
//!
//! Fills against quotes set by the caller. Maker behaviour, fees and
//! rejections are configurable so execution paths can be driven
//! deterministically.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::core::{Error, Liquidity, Market, OrderStatus, Result, Side, Symbol};

use super::{Execution, ExchangeAdapter, OrderAck, OrderRequest, OrderType, Quote, round_qty};

/// What happens to a post-only order when it is placed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MakerFill {
    /// Fills completely on arrival
    Immediate,
    /// Rests until cancelled
    Never,
    /// Fills this fraction on arrival, rests the rest
    Partial(Decimal),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    ack: OrderAck,
    open: bool,
}

#[derive(Debug)]
pub struct PaperExchange {
    quotes: RwLock<HashMap<(Symbol, Market), Quote>>,
    orders: RwLock<HashMap<String, PaperOrder>>,
    placed: RwLock<Vec<OrderRequest>>,
    cancelled: RwLock<Vec<String>>,
    /// 1-based placement number → rejection reason
    rejections: RwLock<HashMap<usize, String>>,
    placements: AtomicUsize,
    maker_fill: RwLock<MakerFill>,
    maker_fee: Decimal,
    taker_fee: Decimal,
    leverage: RwLock<HashMap<Symbol, u32>>,
    transfers: RwLock<Vec<(Market, Market, Decimal)>>,
    fail_transfers: AtomicBool,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(dec!(0.0002), dec!(0.0005))
    }
}

impl PaperExchange {
    pub fn new(maker_fee: Decimal, taker_fee: Decimal) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            placed: RwLock::new(Vec::new()),
            cancelled: RwLock::new(Vec::new()),
            rejections: RwLock::new(HashMap::new()),
            placements: AtomicUsize::new(0),
            maker_fill: RwLock::new(MakerFill::Immediate),
            maker_fee,
            taker_fee,
            leverage: RwLock::new(HashMap::new()),
            transfers: RwLock::new(Vec::new()),
            fail_transfers: AtomicBool::new(false),
        }
    }

    pub fn set_quote(&self, symbol: &Symbol, market: Market, bid: Decimal, ask: Decimal) {
        self.quotes
            .write()
            .insert((symbol.clone(), market), Quote::new(bid, ask));
    }

    pub fn set_maker_fill(&self, behaviour: MakerFill) {
        *self.maker_fill.write() = behaviour;
    }

    /// Reject the `nth` placement (1-based, counted across all orders)
    pub fn reject_placement(&self, nth: usize, reason: impl Into<String>) {
        self.rejections.write().insert(nth, reason.into());
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Every accepted order request, in placement order
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed.read().clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.read().clone()
    }

    pub fn leverage_for(&self, symbol: &Symbol) -> Option<u32> {
        self.leverage.read().get(symbol).copied()
    }

    pub fn transfers(&self) -> Vec<(Market, Market, Decimal)> {
        self.transfers.read().clone()
    }

    /// Order id of an accepted order by client id
    pub fn order_id_for(&self, client_order_id: &str) -> Option<String> {
        self.orders
            .read()
            .values()
            .find(|o| o.ack.client_order_id == client_order_id)
            .map(|o| o.ack.order_id.clone())
    }

    /// Fill the open remainder of a resting order at its own price
    pub fn fill_order(&self, order_id: &str) -> Result<()> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| Error::Exchange(format!("unknown order {}", order_id)))?;
        if !order.open {
            return Err(Error::InvalidState(format!("order {} is not open", order_id)));
        }
        let qty = order.request.quantity.unwrap_or_default() - order.ack.filled_qty();
        let price = order
            .request
            .price
            .or(order.request.stop_price)
            .ok_or_else(|| Error::InvalidState(format!("order {} has no price", order_id)))?;
        let liquidity = match order.request.order_type {
            OrderType::StopLoss => Liquidity::Taker,
            _ => Liquidity::Maker,
        };
        let fee = self.fee(price * qty, liquidity);
        push_execution(&mut order.ack, price, qty, fee, liquidity);
        order.ack.status = OrderStatus::Filled;
        order.open = false;
        Ok(())
    }

    fn fee(&self, notional: Decimal, liquidity: Liquidity) -> Decimal {
        let rate = match liquidity {
            Liquidity::Maker => self.maker_fee,
            Liquidity::Taker => self.taker_fee,
        };
        (notional * rate).round_dp(8)
    }

    fn quote(&self, symbol: &Symbol, market: Market) -> Result<Quote> {
        self.quotes
            .read()
            .get(&(symbol.clone(), market))
            .copied()
            .ok_or_else(|| Error::Exchange(format!("no quote for {} {}", symbol, market)))
    }

    fn execute(&self, request: &OrderRequest, quote: Quote) -> Result<(OrderStatus, Vec<(Decimal, Decimal, Liquidity)>)> {
        match request.order_type {
            OrderType::Limit if request.post_only => {
                let price = request
                    .price
                    .ok_or_else(|| Error::ExchangeRejection("limit order without price".into()))?;
                let crosses = match request.side {
                    Side::Buy => price >= quote.ask,
                    Side::Sell => price <= quote.bid,
                };
                if crosses {
                    return Err(Error::ExchangeRejection("post-only order would cross".into()));
                }
                let qty = request.quantity.unwrap_or_default();
                Ok(match *self.maker_fill.read() {
                    MakerFill::Immediate => (OrderStatus::Filled, vec![(price, qty, Liquidity::Maker)]),
                    MakerFill::Never => (OrderStatus::New, vec![]),
                    MakerFill::Partial(fraction) => {
                        let part = round_qty(qty * fraction);
                        if part.is_zero() {
                            (OrderStatus::New, vec![])
                        } else {
                            (OrderStatus::PartiallyFilled, vec![(price, part, Liquidity::Maker)])
                        }
                    }
                })
            }
            OrderType::Market | OrderType::Limit => {
                let price = quote.aggressive(request.side);
                let qty = match (request.quote_notional, request.quantity) {
                    (Some(quote_amt), _) => round_qty(quote_amt / price),
                    (None, Some(q)) => q,
                    (None, None) => {
                        return Err(Error::ExchangeRejection("order without size".into()));
                    }
                };
                if qty.is_zero() {
                    return Err(Error::ExchangeRejection("order size below minimum".into()));
                }
                Ok((OrderStatus::Filled, vec![(price, qty, Liquidity::Taker)]))
            }
            OrderType::TakeProfit | OrderType::StopLoss => Ok((OrderStatus::New, vec![])),
        }
    }
}

fn push_execution(ack: &mut OrderAck, price: Decimal, qty: Decimal, fee: Decimal, liquidity: Liquidity) {
    let exec_id = format!("{}-{}", ack.order_id, ack.executions.len() + 1);
    ack.executions.push(Execution {
        exec_id,
        price,
        qty,
        fee,
        liquidity,
        timestamp: Utc::now().timestamp_millis(),
    });
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_quote(&self, symbol: &Symbol, market: Market) -> Result<Quote> {
        self.quote(symbol, market)
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck> {
        let nth = self.placements.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(reason) = self.rejections.write().remove(&nth) {
            debug!("paper: rejecting placement #{} ({})", nth, order.client_order_id);
            return Err(Error::ExchangeRejection(reason));
        }

        let quote = self.quote(&order.symbol, order.market)?;
        let (status, fills) = self.execute(&order, quote)?;

        let mut ack = OrderAck {
            order_id: Uuid::new_v4().to_string(),
            client_order_id: order.client_order_id.clone(),
            status,
            executions: Vec::with_capacity(fills.len()),
        };
        for (price, qty, liquidity) in fills {
            let fee = self.fee(price * qty, liquidity);
            push_execution(&mut ack, price, qty, fee, liquidity);
        }

        debug!(
            "paper: {} {:?} {} {} → {}",
            ack.order_id, order.order_type, order.side, order.symbol, ack.status
        );
        self.placed.write().push(order.clone());
        self.orders.write().insert(
            ack.order_id.clone(),
            PaperOrder {
                request: order,
                ack: ack.clone(),
                open: matches!(status, OrderStatus::New | OrderStatus::PartiallyFilled),
            },
        );
        Ok(ack)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck> {
        self.orders
            .read()
            .get(order_id)
            .map(|o| o.ack.clone())
            .ok_or_else(|| Error::Exchange(format!("unknown order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| Error::Exchange(format!("unknown order {}", order_id)))?;
        if !order.open {
            return Ok(false);
        }
        order.open = false;
        order.ack.status = OrderStatus::Canceled;
        self.cancelled.write().push(order_id.to_string());
        Ok(true)
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<()> {
        self.leverage.write().insert(symbol.clone(), leverage);
        Ok(())
    }

    async fn transfer(&self, from: Market, to: Market, amount_usdt: Decimal) -> Result<String> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(Error::Exchange("transfer endpoint unavailable".into()));
        }
        self.transfers.write().push((from, to, amount_usdt));
        Ok(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> (PaperExchange, Symbol) {
        let ex = PaperExchange::default();
        let sym = Symbol::new("BTCUSDT");
        ex.set_quote(&sym, Market::Spot, dec!(100), dec!(101));
        (ex, sym)
    }

    #[tokio::test]
    async fn test_taker_spends_at_most_quote() {
        let (ex, sym) = exchange();
        let ack = ex
            .place_order(OrderRequest::taker("c1".into(), &sym, Market::Spot, Side::Buy, dec!(50)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.executions[0].price, dec!(101));
        assert!(ack.filled_notional() <= dec!(50));
        assert_eq!(ack.executions[0].liquidity, Liquidity::Taker);
    }

    #[tokio::test]
    async fn test_resting_maker_can_be_cancelled_once() {
        let (ex, sym) = exchange();
        ex.set_maker_fill(MakerFill::Never);
        let ack = ex
            .place_order(OrderRequest::maker("c1".into(), &sym, Market::Spot, Side::Buy, dec!(1), dec!(100)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        assert!(ex.cancel_order(&ack.order_id).await.unwrap());
        assert!(!ex.cancel_order(&ack.order_id).await.unwrap());
        assert_eq!(ex.get_order(&ack.order_id).await.unwrap().status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn test_crossing_post_only_rejected() {
        let (ex, sym) = exchange();
        let err = ex
            .place_order(OrderRequest::maker("c1".into(), &sym, Market::Spot, Side::Buy, dec!(1), dec!(101)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExchangeRejection(_)));
    }

    #[tokio::test]
    async fn test_scripted_rejection_hits_nth_placement() {
        let (ex, sym) = exchange();
        ex.reject_placement(2, "insufficient balance");
        let req = || OrderRequest::taker("c".into(), &sym, Market::Spot, Side::Buy, dec!(10));
        assert!(ex.place_order(req()).await.is_ok());
        assert!(ex.place_order(req()).await.is_err());
        assert!(ex.place_order(req()).await.is_ok());
        assert_eq!(ex.placed_orders().len(), 2);
    }
}
