//! Feature calculators - turn bar history and book top into named features
//!
//! Every calculator implements [`Calculator`]; [`FeatureRegistry::standard`]
//! holds the fixed set (ATR, RV, correlation, depth).

mod calculators;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::core::{Error, FeatureProvider, FeatureSet, FeatureSnapshot, Market, Result, Symbol};

pub use calculators::{AtrCalculator, CorrelationCalculator, DepthCalculator, RvCalculator};

/// One OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// epoch ms
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Best level of the order book, sizes in base units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub bid_px: f64,
    pub bid_qty: f64,
    pub ask_px: f64,
    pub ask_qty: f64,
}

/// Input to the calculators, oldest bar first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSeries {
    pub bars: Vec<Bar>,
    /// Bars of the reference instrument (e.g. BTCUSDT), aligned with `bars`
    #[serde(default)]
    pub reference: Vec<Bar>,
    #[serde(default)]
    pub book: Option<BookTop>,
}

/// Log returns of consecutive closes; non-positive prices are skipped
pub(crate) fn log_returns(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .filter(|w| w[0].close > 0.0 && w[1].close > 0.0)
        .map(|w| (w[1].close / w[0].close).ln())
        .collect()
}

pub trait Calculator: Send + Sync {
    /// Short tag, e.g. "ATR"
    fn kind(&self) -> &'static str;

    fn calculate(&self, symbol: &Symbol, series: &MarketSeries) -> Result<FeatureSet>;
}

/// Fixed set of calculators run against one series
pub struct FeatureRegistry {
    calculators: Vec<Box<dyn Calculator>>,
}

impl FeatureRegistry {
    /// ATR(14), RV(20), correlation(20) and depth
    pub fn standard() -> Self {
        Self {
            calculators: vec![
                Box::new(AtrCalculator::new(14)),
                Box::new(RvCalculator::new(20)),
                Box::new(CorrelationCalculator::new(20)),
                Box::new(DepthCalculator),
            ],
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.calculators.iter().map(|c| c.kind()).collect()
    }

    /// Run every calculator and merge the outputs. A calculator that fails
    /// is skipped; the snapshot carries whatever the others produced.
    pub fn compute(&self, symbol: &Symbol, market: Market, series: &MarketSeries) -> FeatureSnapshot {
        let mut values = FeatureSet::new();
        for calc in &self.calculators {
            match calc.calculate(symbol, series) {
                Ok(set) => {
                    debug!("{} {}: {} feature(s)", calc.kind(), symbol, set.len());
                    values.extend(set);
                }
                Err(e) => warn!("Skipping {} for {}: {}", calc.kind(), symbol, e),
            }
        }
        let mut snapshot = FeatureSnapshot::new(symbol.clone(), market, values);
        if let Some(last) = series.bars.last() {
            snapshot.timestamp = last.timestamp;
        }
        snapshot
    }
}

/// Serves snapshots computed from the latest series per (symbol, market).
/// Holds one window per instrument; the requested window name is not used.
pub struct SeriesFeatureProvider {
    registry: FeatureRegistry,
    series: RwLock<HashMap<(Symbol, Market), MarketSeries>>,
}

impl SeriesFeatureProvider {
    pub fn new(registry: FeatureRegistry) -> Self {
        Self {
            registry,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, symbol: &Symbol, market: Market, series: MarketSeries) {
        self.series.write().insert((symbol.clone(), market), series);
    }
}

#[async_trait]
impl FeatureProvider for SeriesFeatureProvider {
    async fn snapshot(&self, symbol: &Symbol, market: Market, _window: &str) -> Result<FeatureSnapshot> {
        let series = self
            .series
            .read()
            .get(&(symbol.clone(), market))
            .cloned()
            .ok_or_else(|| Error::Structural(format!("no market series for {} {}", symbol, market)))?;
        Ok(self.registry.compute(symbol, market, &series))
    }
}

#[cfg(test)]
pub(crate) fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Bar {
            timestamp: i as i64 * 60_000,
            open: c,
            high: c * 1.01,
            low: c * 0.99,
            close: c,
            volume: 1.0,
        })
        .collect()
}
