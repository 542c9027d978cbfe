//! Domain types: instruments, bar periods, daily records, minute series.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange an instrument trades on, derived from its code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market {
    Shanghai,
    Shenzhen,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Shanghai => "SH",
            Market::Shenzhen => "SZ",
        }
    }
}

/// An instrument: a numeric exchange code plus an index/stock flag.
///
/// The market is never stored — it is a pure function of the code prefix,
/// so two call sites can never disagree about it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub code: String,
    pub is_index: bool,
}

impl Instrument {
    pub fn stock(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_index: false,
        }
    }

    pub fn index(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_index: true,
        }
    }

    /// Derive the market from the code prefix. Indices starting `399` trade
    /// in Shenzhen, all other indices in Shanghai; stocks starting `6` trade
    /// in Shanghai, everything else in Shenzhen.
    pub fn market(&self) -> Market {
        if self.is_index {
            if self.code.starts_with("399") {
                Market::Shenzhen
            } else {
                Market::Shanghai
            }
        } else if self.code.starts_with('6') {
            Market::Shanghai
        } else {
            Market::Shenzhen
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.code, self.market().as_str())
    }
}

/// Intraday bar period in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    M5,
    M15,
    M30,
    M60,
}

impl Period {
    pub fn minutes(&self) -> u32 {
        match self {
            Period::M5 => 5,
            Period::M15 => 15,
            Period::M30 => 30,
            Period::M60 => 60,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            5 => Some(Period::M5),
            15 => Some(Period::M15),
            30 => Some(Period::M30),
            60 => Some(Period::M60),
            _ => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes())
    }
}

/// One intraday OHLCV sample in the canonical schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub amount: f64,
    /// Percent change of `close` against the session base price.
    pub pct_chg: f64,
}

/// Minute bars for one (instrument, date, period, is_index) cache key,
/// strictly ordered by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteSeries {
    pub instrument: Instrument,
    pub date: NaiveDate,
    pub period: Period,
    pub bars: Vec<MinuteBar>,
}

impl MinuteSeries {
    /// Sort by timestamp and recompute `pct_chg` against the session base:
    /// the first bar's open, or its close when the open is zero or NaN.
    pub fn normalize(&mut self) {
        self.bars.sort_by_key(|b| b.timestamp);
        let base = match self.bars.first() {
            Some(first) if first.open.is_finite() && first.open != 0.0 => first.open,
            Some(first) => first.close,
            None => return,
        };
        if !base.is_finite() || base == 0.0 {
            return;
        }
        for bar in &mut self.bars {
            bar.pct_chg = (bar.close - base) / base * 100.0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }
}

/// One daily OHLCV sample in the canonical schema, as returned by a
/// provider adapter (no instrument identity attached yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub amount: f64,
    pub pct_chg: f64,
}

/// One row of the wide daily history table. Unique per (code, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub code: String,
    pub name: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub amount: f64,
    pub pct_chg: f64,
}

impl DailyRecord {
    pub fn from_bar(code: impl Into<String>, name: impl Into<String>, bar: DailyBar) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            date: bar.date,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            amount: bar.amount,
            pct_chg: bar.pct_chg,
        }
    }
}
