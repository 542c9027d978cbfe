//! Provider adapter trait and identifiers.
//!
//! One adapter per upstream quote source. Each adapter owns the mapping from
//! its wire format onto the canonical bar schema — callers never see provider
//! field names, and column layout is never guessed at call sites. The cache
//! layers sit above this trait; adapters know nothing about the cache.

pub mod eastmoney;
pub mod tushare;

use crate::domain::{DailyBar, Instrument, MinuteBar, Period};
use crate::error::DataError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use eastmoney::EastmoneyProvider;
pub use tushare::TushareProvider;

/// Identifier for a configured upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Licensed tabular API; requires a token credential.
    Tushare,
    /// Public quote endpoints; needs no credential and is therefore the
    /// guaranteed-available fallback.
    Eastmoney,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Tushare => "tushare",
            ProviderId::Eastmoney => "eastmoney",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tushare" => Ok(ProviderId::Tushare),
            "eastmoney" => Ok(ProviderId::Eastmoney),
            other => Err(DataError::Config(format!("unknown provider: {other:?}"))),
        }
    }
}

/// Adapter to one upstream quote-data source.
///
/// Implementations map their own field names onto the canonical schema
/// `{date|timestamp, open, high, low, close, volume, amount, pct_chg}`.
/// An empty or schema-violating payload is a `Provider` error so the caller
/// can fall back to the next source for the identical request.
pub trait QuoteProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Daily bars for one instrument over an inclusive date range.
    fn fetch_daily(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, DataError>;

    /// Minute bars for one instrument on one trading day.
    fn fetch_intraday(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Result<Vec<MinuteBar>, DataError>;

    /// Full `code → display name` listing for the market.
    fn fetch_instrument_list(&self) -> Result<BTreeMap<String, String>, DataError>;

    /// Constituent codes of a named index universe.
    fn fetch_index_constituents(&self, universe: &str) -> Result<Vec<String>, DataError>;

    /// Display name for a single instrument. Sources without a cheap
    /// per-instrument endpoint return `Ok(None)`.
    fn fetch_instrument_name(&self, _code: &str) -> Result<Option<String>, DataError> {
        Ok(None)
    }
}
