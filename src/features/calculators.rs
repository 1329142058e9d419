use crate::core::{Error, FeatureSet, FeatureValue, Result, Symbol};

use super::{Calculator, MarketSeries, log_returns};

fn set<const N: usize>(pairs: [(&str, f64); N]) -> FeatureSet {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), FeatureValue::Number(v)))
        .collect()
}

fn insufficient(kind: &str, need: usize, have: usize) -> Error {
    Error::Structural(format!(
        "insufficient data for {} calculation: need {}, have {}",
        kind, need, have
    ))
}

/// Average true range with Wilder smoothing
#[derive(Debug, Clone, Copy)]
pub struct AtrCalculator {
    period: usize,
}

impl AtrCalculator {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
        }
    }
}

impl Calculator for AtrCalculator {
    fn kind(&self) -> &'static str {
        "ATR"
    }

    fn calculate(&self, _symbol: &Symbol, series: &MarketSeries) -> Result<FeatureSet> {
        let bars = &series.bars;
        if bars.len() < self.period + 1 {
            return Err(insufficient(self.kind(), self.period + 1, bars.len()));
        }

        let true_ranges: Vec<f64> = bars
            .windows(2)
            .map(|w| {
                let (prev, cur) = (&w[0], &w[1]);
                (cur.high - cur.low)
                    .max((cur.high - prev.close).abs())
                    .max((cur.low - prev.close).abs())
            })
            .collect();

        let n = self.period as f64;
        let seed = true_ranges[..self.period].iter().sum::<f64>() / n;
        let atr = true_ranges[self.period..]
            .iter()
            .fold(seed, |atr, tr| atr + (tr - atr) / n);

        let close = bars[bars.len() - 1].close;
        if close <= 0.0 {
            return Err(Error::Structural("last close must be positive".into()));
        }
        Ok(set([("atr", atr), ("atr_pct", atr / close * 100.0)]))
    }
}

/// Realised volatility of log returns, annualised with √252
#[derive(Debug, Clone, Copy)]
pub struct RvCalculator {
    period: usize,
}

impl RvCalculator {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(2),
        }
    }
}

impl Calculator for RvCalculator {
    fn kind(&self) -> &'static str {
        "RV"
    }

    fn calculate(&self, _symbol: &Symbol, series: &MarketSeries) -> Result<FeatureSet> {
        let returns = log_returns(&series.bars);
        if returns.len() < self.period {
            return Err(insufficient(self.kind(), self.period, returns.len()));
        }
        let window = &returns[returns.len() - self.period..];
        let n = self.period as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let rv = variance.sqrt() * 252f64.sqrt();
        Ok(set([("rv", rv), ("rv_pct", rv * 100.0)]))
    }
}

/// Pearson correlation of log returns against the reference series
#[derive(Debug, Clone, Copy)]
pub struct CorrelationCalculator {
    period: usize,
}

impl CorrelationCalculator {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(2),
        }
    }
}

impl Calculator for CorrelationCalculator {
    fn kind(&self) -> &'static str {
        "CORRELATION"
    }

    fn calculate(&self, _symbol: &Symbol, series: &MarketSeries) -> Result<FeatureSet> {
        let a = log_returns(&series.bars);
        let b = log_returns(&series.reference);
        let have = a.len().min(b.len());
        if have < self.period {
            return Err(insufficient(self.kind(), self.period, have));
        }
        let a = &a[a.len() - self.period..];
        let b = &b[b.len() - self.period..];

        let n = self.period as f64;
        let (ma, mb) = (a.iter().sum::<f64>() / n, b.iter().sum::<f64>() / n);
        let mut cov = 0.0;
        let mut va = 0.0;
        let mut vb = 0.0;
        for (x, y) in a.iter().zip(b) {
            cov += (x - ma) * (y - mb);
            va += (x - ma).powi(2);
            vb += (y - mb).powi(2);
        }
        if va == 0.0 || vb == 0.0 {
            return Err(Error::Structural("correlation undefined for a flat series".into()));
        }
        Ok(set([("correlation", cov / (va * vb).sqrt())]))
    }
}

/// Top-of-book liquidity
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthCalculator;

impl Calculator for DepthCalculator {
    fn kind(&self) -> &'static str {
        "DEPTH"
    }

    fn calculate(&self, _symbol: &Symbol, series: &MarketSeries) -> Result<FeatureSet> {
        let book = series
            .book
            .ok_or_else(|| Error::Structural("no order book top".into()))?;
        if book.bid_px <= 0.0 || book.ask_px < book.bid_px {
            return Err(Error::Structural(format!(
                "invalid book top {} / {}",
                book.bid_px, book.ask_px
            )));
        }
        let mid = (book.bid_px + book.ask_px) / 2.0;
        let depth = (book.bid_px * book.bid_qty).min(book.ask_px * book.ask_qty);
        let ratio = if book.ask_qty > 0.0 {
            book.bid_qty / book.ask_qty
        } else {
            0.0
        };
        Ok(set([
            ("depth_top1_usdt", depth),
            ("spread_bps", (book.ask_px - book.bid_px) / mid * 10_000.0),
            ("bid_ask_ratio", ratio),
        ]))
    }
}
