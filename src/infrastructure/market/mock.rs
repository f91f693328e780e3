use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage,
    MovingAverageConvergenceDivergence, RelativeStrengthIndex,
};
use ta::Next;

use crate::domain::errors::MarketError;
use crate::domain::ports::{Deadline, MarketProvider};
use crate::domain::types::{Asset, IndicatorBundle, MarketSnapshot};

/// In-memory [`MarketProvider`] that serves a fixed synthetic close-price series per symbol,
/// running it through the same indicator bundle (`ta` crate) a live feed would. Used for tests
/// and local development without a network dependency.
pub struct MockMarketProvider {
    series: HashMap<String, Vec<f64>>,
}

impl MockMarketProvider {
    pub fn new(symbols: &[&str]) -> Self {
        let series = symbols
            .iter()
            .map(|s| (s.to_string(), synthetic_series(s)))
            .collect();
        Self { series }
    }

}

fn synthetic_series(symbol: &str) -> Vec<f64> {
    let base = (symbol.bytes().map(|b| b as f64).sum::<f64>()).max(10.0);
    (0..60).map(|i| base + (i as f64 * 0.37).sin() * base * 0.01).collect()
}

fn build_indicators(closes: &[f64]) -> IndicatorBundle {
    let mut ema12 = ExponentialMovingAverage::new(12).expect("valid ema period");
    let mut ema26 = ExponentialMovingAverage::new(26).expect("valid ema period");
    let mut rsi14 = RelativeStrengthIndex::new(14).expect("valid rsi period");
    let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).expect("valid macd periods");
    let mut bb = BollingerBands::new(20, 2.0).expect("valid bollinger period");
    let mut atr = AverageTrueRange::new(14).expect("valid atr period");

    let mut last_ema12 = 0.0;
    let mut last_ema26 = 0.0;
    let mut last_rsi = 0.0;
    let mut last_macd = (0.0, 0.0, 0.0);
    let mut last_bb = (0.0, 0.0, 0.0);
    let mut last_atr = 0.0;

    for &close in closes {
        last_ema12 = ema12.next(close);
        last_ema26 = ema26.next(close);
        last_rsi = rsi14.next(close);
        let macd_out = macd.next(close);
        last_macd = (macd_out.macd, macd_out.signal, macd_out.histogram);
        let bb_out = bb.next(close);
        last_bb = (bb_out.lower, bb_out.average, bb_out.upper);
        last_atr = atr.next(close);
    }

    let mut ema = HashMap::new();
    ema.insert(12, Decimal::from_f64(last_ema12).unwrap_or_default());
    ema.insert(26, Decimal::from_f64(last_ema26).unwrap_or_default());

    let mut rsi = HashMap::new();
    rsi.insert(14, Decimal::from_f64(last_rsi).unwrap_or_default());

    IndicatorBundle {
        ema,
        macd: Some((
            Decimal::from_f64(last_macd.0).unwrap_or_default(),
            Decimal::from_f64(last_macd.1).unwrap_or_default(),
            Decimal::from_f64(last_macd.2).unwrap_or_default(),
        )),
        rsi,
        bollinger: Some((
            Decimal::from_f64(last_bb.0).unwrap_or_default(),
            Decimal::from_f64(last_bb.1).unwrap_or_default(),
            Decimal::from_f64(last_bb.2).unwrap_or_default(),
        )),
        atr: Some(Decimal::from_f64(last_atr).unwrap_or_default()),
    }
}

#[async_trait]
impl MarketProvider for MockMarketProvider {
    async fn snapshot(&self, symbol: &str, _deadline: Deadline) -> Result<MarketSnapshot, MarketError> {
        let closes = self
            .series
            .get(symbol)
            .ok_or_else(|| MarketError::SymbolUnknown(symbol.to_string()))?;

        let last_price = Decimal::from_f64(*closes.last().expect("non-empty series")).unwrap_or_default();
        let hour_ago = closes[closes.len().saturating_sub(4)];
        let four_hours_ago = closes[closes.len().saturating_sub(16)];
        let last = *closes.last().unwrap();

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            last_price,
            change_1h_pct: pct_change(hour_ago, last),
            change_4h_pct: pct_change(four_hours_ago, last),
            indicators: build_indicators(closes),
            open_interest_latest: None,
            open_interest_avg: None,
            funding_rate: None,
            intraday_closes: closes.iter().rev().take(24).rev().filter_map(|c| Decimal::from_f64(*c)).collect(),
            long_term_closes: closes.iter().filter_map(|c| Decimal::from_f64(*c)).collect(),
            fetched_at: Utc::now(),
        })
    }

    async fn list_assets(&self, _deadline: Deadline) -> Result<Vec<Asset>, MarketError> {
        Ok(self
            .series
            .keys()
            .enumerate()
            .map(|(i, symbol)| Asset { symbol: symbol.clone(), asset_index: i as u32 })
            .collect())
    }
}

fn pct_change(from: f64, to: f64) -> Decimal {
    if from == 0.0 {
        return Decimal::ZERO;
    }
    Decimal::from_f64((to - from) / from * 100.0).unwrap_or_default()
}
