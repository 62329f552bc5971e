// =============================================================================
// Shared types used across the minute-bar service
// =============================================================================

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// One trading day's worth of bars per calendar date. `BTreeMap` keeps the
/// dates in chronological order, which is also the on-disk line order.
pub type TradingDaySeries = BTreeMap<NaiveDate, Vec<Bar>>;

/// Round to the 4 decimal places the record files carry.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Bar
// =============================================================================

/// A single one-minute OHLCV sample with optional indicator annotations.
///
/// Field names of the indicator columns match the persisted record format
/// (`RSI_14`, `EMA_10`, `EMA_20`, `VWAP`); absent values serialise as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Market-local minute, serialised as `HH:MM`.
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(rename = "RSI_14", default)]
    pub rsi_14: Option<f64>,
    #[serde(rename = "EMA_10", default)]
    pub ema_10: Option<f64>,
    #[serde(rename = "EMA_20", default)]
    pub ema_20: Option<f64>,
    #[serde(rename = "VWAP", default)]
    pub vwap: Option<f64>,
}

impl Bar {
    /// Build an un-annotated bar.
    pub fn new(time: NaiveTime, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            rsi_14: None,
            ema_10: None,
            ema_20: None,
            vwap: None,
        }
    }

    /// `(high + low + close) / 3`, the price VWAP is weighted on.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// True when every price is finite and
    /// `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_consistent(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return false;
        }
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }
}

/// A bar tagged with its trading date, as served to the chart front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatedBar {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub bar: Bar,
}

/// A bar as returned by a market-data provider, before grouping by day.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    /// Market-local calendar date of the bar.
    pub date: NaiveDate,
    /// Market-local minute of the bar.
    pub time: NaiveTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl RawBar {
    /// Strip the date and round prices to record precision.
    pub fn into_bar(self) -> Bar {
        Bar::new(
            self.time,
            round4(self.open),
            round4(self.high),
            round4(self.low),
            round4(self.close),
            self.volume,
        )
    }
}

// =============================================================================
// TickerStore
// =============================================================================

/// Everything persisted for one ticker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickerStore {
    pub ticker: String,
    pub days: TradingDaySeries,
}

impl TickerStore {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            days: TradingDaySeries::new(),
        }
    }

    /// Most recent persisted trading date, if any.
    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.days.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn bar_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Serde helper: NaiveTime <-> "HH:MM"
// =============================================================================

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}
