//! Eastmoney public quote adapter.
//!
//! Speaks the push2 `qt` endpoints. No credential is required, so this
//! adapter doubles as the guaranteed-available fallback appended to every
//! provider order. Kline rows arrive as comma-joined strings in a fixed
//! field order; the order is pinned here once and mapped onto the canonical
//! schema, never inferred downstream.

use super::{ProviderId, QuoteProvider};
use crate::domain::{DailyBar, Instrument, Market, MinuteBar, Period};
use crate::error::DataError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://push2his.eastmoney.com";
const DEFAULT_LIST_URL: &str = "https://push2.eastmoney.com";

/// Index universes with an Eastmoney board code. Only boards listed here can
/// be resolved to constituents through this adapter.
const UNIVERSE_BOARDS: &[(&str, &str)] = &[
    // CSI 300
    ("000300", "BK0500"),
];

#[derive(Debug, Deserialize)]
struct KlineResponse {
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    klines: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    diff: Option<Vec<ListRow>>,
}

/// `f12` is the instrument code, `f14` the display name.
#[derive(Debug, Deserialize)]
struct ListRow {
    f12: Option<String>,
    f14: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    data: Option<QuoteData>,
}

/// `f58` is the display name on the single-quote endpoint.
#[derive(Debug, Deserialize)]
struct QuoteData {
    f58: Option<String>,
}

pub struct EastmoneyProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    list_url: String,
}

impl EastmoneyProvider {
    pub fn new() -> Self {
        Self::with_base_urls(DEFAULT_BASE_URL, DEFAULT_LIST_URL)
    }

    /// Override endpoints, for a locally-hosted mirror or tests.
    pub fn with_base_urls(base_url: impl Into<String>, list_url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            list_url: list_url.into(),
        }
    }

    /// push2 security id: market prefix `1` for Shanghai, `0` for Shenzhen.
    fn secid(instrument: &Instrument) -> String {
        let prefix = match instrument.market() {
            Market::Shanghai => 1,
            Market::Shenzhen => 0,
        };
        format!("{prefix}.{}", instrument.code)
    }

    fn kline_url(&self, instrument: &Instrument, klt: u32, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/api/qt/stock/kline/get?secid={}&klt={klt}&fqt=1\
             &beg={}&end={}\
             &fields1=f1,f2,f3,f4,f5,f6&fields2=f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61",
            self.base_url,
            Self::secid(instrument),
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
        )
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, DataError> {
        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                DataError::NetworkUnreachable(e.to_string())
            } else {
                DataError::provider(ProviderId::Eastmoney, e)
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(DataError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !status.is_success() {
            return Err(DataError::provider(
                ProviderId::Eastmoney,
                format!("HTTP {status}"),
            ));
        }

        resp.json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("eastmoney payload: {e}")))
    }

    fn fetch_klines(
        &self,
        instrument: &Instrument,
        klt: u32,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<String>, DataError> {
        let url = self.kline_url(instrument, klt, start, end);
        debug!(%instrument, klt, "eastmoney kline request");
        let resp: KlineResponse = self.get_json(&url)?;
        resp.data
            .and_then(|d| d.klines)
            .filter(|rows| !rows.is_empty())
            .ok_or_else(|| {
                DataError::provider(
                    ProviderId::Eastmoney,
                    format!("empty kline payload for {instrument}"),
                )
            })
    }
}

impl Default for EastmoneyProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed kline row layout behind `fields2=f51..f61`:
/// `date,open,close,high,low,volume,amount,amplitude,pct_chg,change,turnover`.
/// Note close before high/low — this is the provider's order, not ours.
fn parse_kline_fields(row: &str) -> Result<(&str, f64, f64, f64, f64, u64, f64, f64), DataError> {
    let parts: Vec<&str> = row.split(',').collect();
    if parts.len() < 9 {
        return Err(DataError::ResponseFormatChanged(format!(
            "kline row has {} fields: {row:?}",
            parts.len()
        )));
    }
    let num = |i: usize| -> Result<f64, DataError> {
        parts[i]
            .parse::<f64>()
            .map_err(|_| DataError::ResponseFormatChanged(format!("kline field {i}: {row:?}")))
    };
    Ok((
        parts[0],
        num(1)?,          // open
        num(3)?,          // high
        num(4)?,          // low
        num(2)?,          // close
        num(5)? as u64,   // volume
        num(6)?,          // amount
        num(8)?,          // pct_chg
    ))
}

pub(crate) fn parse_daily_kline(row: &str) -> Result<DailyBar, DataError> {
    let (date, open, high, low, close, volume, amount, pct_chg) = parse_kline_fields(row)?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| DataError::ResponseFormatChanged(format!("kline date: {row:?}")))?;
    Ok(DailyBar {
        date,
        open,
        high,
        low,
        close,
        volume,
        amount,
        pct_chg,
    })
}

pub(crate) fn parse_minute_kline(row: &str) -> Result<MinuteBar, DataError> {
    let (ts, open, high, low, close, volume, amount, _) = parse_kline_fields(row)?;
    let timestamp = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M")
        .map_err(|_| DataError::ResponseFormatChanged(format!("kline timestamp: {row:?}")))?;
    Ok(MinuteBar {
        timestamp,
        open,
        high,
        low,
        close,
        volume,
        amount,
        // Recomputed against the session base by MinuteSeries::normalize.
        pct_chg: 0.0,
    })
}

impl QuoteProvider for EastmoneyProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Eastmoney
    }

    fn fetch_daily(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, DataError> {
        let rows = self.fetch_klines(instrument, 101, start, end)?;
        rows.iter().map(|r| parse_daily_kline(r)).collect()
    }

    fn fetch_intraday(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Result<Vec<MinuteBar>, DataError> {
        let rows = self.fetch_klines(instrument, period.minutes(), date, date)?;
        rows.iter().map(|r| parse_minute_kline(r)).collect()
    }

    fn fetch_instrument_list(&self) -> Result<BTreeMap<String, String>, DataError> {
        // All listed A-shares across both exchanges, code + name only.
        let url = format!(
            "{}/api/qt/clist/get?pn=1&pz=10000\
             &fs=m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23&fields=f12,f14",
            self.list_url
        );
        let resp: ListResponse = self.get_json(&url)?;
        let rows = resp.data.and_then(|d| d.diff).unwrap_or_default();

        let mut map = BTreeMap::new();
        for row in rows {
            if let (Some(code), Some(name)) = (row.f12, row.f14) {
                let name = name.trim();
                // A "name" that is itself a code means the column is junk.
                if !name.is_empty() && !(name.chars().all(|c| c.is_ascii_digit()) && name.len() >= 6)
                {
                    map.insert(code.trim().to_string(), name.to_string());
                }
            }
        }
        if map.is_empty() {
            return Err(DataError::provider(
                ProviderId::Eastmoney,
                "instrument list came back empty",
            ));
        }
        Ok(map)
    }

    fn fetch_index_constituents(&self, universe: &str) -> Result<Vec<String>, DataError> {
        let board = UNIVERSE_BOARDS
            .iter()
            .find(|(u, _)| *u == universe)
            .map(|(_, b)| *b)
            .ok_or_else(|| {
                DataError::provider(
                    ProviderId::Eastmoney,
                    format!("no board mapping for universe {universe}"),
                )
            })?;

        let url = format!(
            "{}/api/qt/clist/get?pn=1&pz=1000&fs=b:{board}&fields=f12,f14",
            self.list_url
        );
        let resp: ListResponse = self.get_json(&url)?;
        let rows = resp.data.and_then(|d| d.diff).unwrap_or_default();

        let codes: Vec<String> = rows
            .into_iter()
            .filter_map(|r| r.f12)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if codes.is_empty() {
            return Err(DataError::provider(
                ProviderId::Eastmoney,
                format!("no constituents for universe {universe}"),
            ));
        }
        Ok(codes)
    }

    fn fetch_instrument_name(&self, code: &str) -> Result<Option<String>, DataError> {
        let instrument = Instrument::stock(code);
        let url = format!(
            "{}/api/qt/stock/get?secid={}&fields=f58",
            self.list_url,
            Self::secid(&instrument)
        );
        let resp: QuoteResponse = self.get_json(&url)?;
        Ok(resp
            .data
            .and_then(|d| d.f58)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_kline_maps_fields_in_provider_order() {
        let row = "2024-03-01,10.00,10.50,10.60,9.90,123456,7890123.0,7.0,5.0,0.5,1.2";
        let bar = parse_daily_kline(row).unwrap();
        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(bar.open, 10.00);
        assert_eq!(bar.close, 10.50);
        assert_eq!(bar.high, 10.60);
        assert_eq!(bar.low, 9.90);
        assert_eq!(bar.volume, 123456);
        assert_eq!(bar.amount, 7890123.0);
        assert_eq!(bar.pct_chg, 5.0);
    }

    #[test]
    fn minute_kline_parses_timestamp() {
        let row = "2024-03-01 09:35,10.00,10.10,10.12,9.98,2000,20200.0,1.4,1.0,0.1,0.2";
        let bar = parse_minute_kline(row).unwrap();
        assert_eq!(
            bar.timestamp,
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(9, 35, 0)
                .unwrap()
        );
        assert_eq!(bar.close, 10.10);
    }

    #[test]
    fn truncated_kline_row_is_a_format_error() {
        let err = parse_daily_kline("2024-03-01,10.0,10.5").unwrap_err();
        assert!(matches!(err, DataError::ResponseFormatChanged(_)));
    }

    #[test]
    fn secid_uses_market_prefix() {
        assert_eq!(EastmoneyProvider::secid(&Instrument::stock("600000")), "1.600000");
        assert_eq!(EastmoneyProvider::secid(&Instrument::stock("000002")), "0.000002");
        assert_eq!(EastmoneyProvider::secid(&Instrument::index("000300")), "1.000300");
        assert_eq!(EastmoneyProvider::secid(&Instrument::index("399001")), "0.399001");
    }
}
