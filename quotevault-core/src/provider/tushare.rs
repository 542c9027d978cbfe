//! Tushare licensed-data adapter.
//!
//! Tushare's pro API is a single POST endpoint carrying `api_name`, the
//! token credential, and a parameter object; responses are tabular: a
//! `fields` array naming columns plus `items` rows. Columns are resolved
//! through an explicit name→index map built per response — positions are
//! never assumed. Units are normalized here too: volume arrives in lots
//! (100 shares) and amount in thousands of yuan.

use super::{ProviderId, QuoteProvider};
use crate::domain::{DailyBar, Instrument, MinuteBar, Period};
use crate::error::DataError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_URL: &str = "https://api.tushare.pro";

const LOT_SIZE: f64 = 100.0;
const AMOUNT_UNIT: f64 = 1_000.0;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    msg: Option<String>,
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    fields: Vec<String>,
    items: Vec<Vec<serde_json::Value>>,
}

/// Column name → index map for one tabular response.
struct FieldMap(HashMap<String, usize>);

impl FieldMap {
    fn new(fields: &[String]) -> Self {
        Self(
            fields
                .iter()
                .enumerate()
                .map(|(i, f)| (f.clone(), i))
                .collect(),
        )
    }

    fn str<'a>(&self, row: &'a [serde_json::Value], name: &str) -> Result<&'a str, DataError> {
        self.value(row, name)?.as_str().ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("field {name} is not a string"))
        })
    }

    fn f64(&self, row: &[serde_json::Value], name: &str) -> Result<f64, DataError> {
        let value = self.value(row, name)?;
        if value.is_null() {
            return Ok(f64::NAN);
        }
        value.as_f64().ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("field {name} is not numeric"))
        })
    }

    fn value<'a>(
        &self,
        row: &'a [serde_json::Value],
        name: &str,
    ) -> Result<&'a serde_json::Value, DataError> {
        let idx = *self.0.get(name).ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("missing field {name:?} in response"))
        })?;
        row.get(idx).ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("row shorter than field table at {name:?}"))
        })
    }
}

pub struct TushareProvider {
    client: reqwest::blocking::Client,
    api_url: String,
    token: String,
}

impl TushareProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_url(token, DEFAULT_API_URL)
    }

    pub fn with_api_url(token: impl Into<String>, api_url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("quotevault/0.1")
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    fn ts_code(instrument: &Instrument) -> String {
        format!("{}.{}", instrument.code, instrument.market().as_str())
    }

    fn call(
        &self,
        api_name: &str,
        params: serde_json::Value,
        fields: &str,
    ) -> Result<ApiData, DataError> {
        debug!(api_name, "tushare request");
        let body = json!({
            "api_name": api_name,
            "token": self.token,
            "params": params,
            "fields": fields,
        });

        let resp = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    DataError::NetworkUnreachable(e.to_string())
                } else {
                    DataError::provider(ProviderId::Tushare, e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DataError::provider(
                ProviderId::Tushare,
                format!("HTTP {status} from {api_name}"),
            ));
        }

        let api: ApiResponse = resp
            .json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("tushare payload: {e}")))?;
        if api.code != 0 {
            let msg = api.msg.unwrap_or_else(|| "unspecified error".into());
            // The points/frequency limit is the licensed tier's rate limit.
            if msg.contains("每分钟") || msg.to_ascii_lowercase().contains("limit") {
                return Err(DataError::RateLimited { retry_after_secs: 60 });
            }
            return Err(DataError::provider(
                ProviderId::Tushare,
                format!("{api_name}: {msg}"),
            ));
        }

        let data = api.data.ok_or_else(|| {
            DataError::provider(ProviderId::Tushare, format!("{api_name}: empty data"))
        })?;
        if data.items.is_empty() {
            return Err(DataError::provider(
                ProviderId::Tushare,
                format!("{api_name}: zero rows"),
            ));
        }
        Ok(data)
    }
}

fn daily_from_row(map: &FieldMap, row: &[serde_json::Value]) -> Result<DailyBar, DataError> {
    let date = NaiveDate::parse_from_str(map.str(row, "trade_date")?, "%Y%m%d")
        .map_err(|_| DataError::ResponseFormatChanged("trade_date not YYYYMMDD".into()))?;
    Ok(DailyBar {
        date,
        open: map.f64(row, "open")?,
        high: map.f64(row, "high")?,
        low: map.f64(row, "low")?,
        close: map.f64(row, "close")?,
        volume: (map.f64(row, "vol")? * LOT_SIZE).max(0.0) as u64,
        amount: map.f64(row, "amount")? * AMOUNT_UNIT,
        pct_chg: map.f64(row, "pct_chg")?,
    })
}

fn minute_from_row(map: &FieldMap, row: &[serde_json::Value]) -> Result<MinuteBar, DataError> {
    let timestamp = NaiveDateTime::parse_from_str(map.str(row, "trade_time")?, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| DataError::ResponseFormatChanged("trade_time not a datetime".into()))?;
    Ok(MinuteBar {
        timestamp,
        open: map.f64(row, "open")?,
        high: map.f64(row, "high")?,
        low: map.f64(row, "low")?,
        close: map.f64(row, "close")?,
        volume: (map.f64(row, "vol")?).max(0.0) as u64,
        amount: map.f64(row, "amount")?,
        // Recomputed against the session base by MinuteSeries::normalize.
        pct_chg: 0.0,
    })
}

impl QuoteProvider for TushareProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Tushare
    }

    fn fetch_daily(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, DataError> {
        let api_name = if instrument.is_index { "index_daily" } else { "daily" };
        let data = self.call(
            api_name,
            json!({
                "ts_code": Self::ts_code(instrument),
                "start_date": start.format("%Y%m%d").to_string(),
                "end_date": end.format("%Y%m%d").to_string(),
            }),
            "trade_date,open,high,low,close,vol,amount,pct_chg",
        )?;

        let map = FieldMap::new(&data.fields);
        let mut bars = data
            .items
            .iter()
            .map(|row| daily_from_row(&map, row))
            .collect::<Result<Vec<_>, _>>()?;
        // Tushare returns newest-first.
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    fn fetch_intraday(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Result<Vec<MinuteBar>, DataError> {
        let api_name = if instrument.is_index { "idx_mins" } else { "stk_mins" };
        let data = self.call(
            api_name,
            json!({
                "ts_code": Self::ts_code(instrument),
                "freq": format!("{}min", period.minutes()),
                "start_date": format!("{date} 09:00:00"),
                "end_date": format!("{date} 15:00:00"),
            }),
            "trade_time,open,high,low,close,vol,amount",
        )?;

        let map = FieldMap::new(&data.fields);
        let mut bars = data
            .items
            .iter()
            .map(|row| minute_from_row(&map, row))
            .collect::<Result<Vec<_>, _>>()?;
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }

    fn fetch_instrument_list(&self) -> Result<BTreeMap<String, String>, DataError> {
        let data = self.call(
            "stock_basic",
            json!({ "list_status": "L" }),
            "symbol,name",
        )?;

        let map = FieldMap::new(&data.fields);
        let mut names = BTreeMap::new();
        for row in &data.items {
            let code = map.str(row, "symbol")?.trim();
            let name = map.str(row, "name")?.trim();
            if !code.is_empty() && !name.is_empty() {
                names.insert(code.to_string(), name.to_string());
            }
        }
        if names.is_empty() {
            return Err(DataError::provider(
                ProviderId::Tushare,
                "instrument list came back empty",
            ));
        }
        Ok(names)
    }

    fn fetch_index_constituents(&self, universe: &str) -> Result<Vec<String>, DataError> {
        let index = Instrument::index(universe);
        // index_weight is published monthly; a trailing window catches the
        // most recent publication.
        let end = chrono::Local::now().date_naive();
        let start = end - chrono::Duration::days(45);
        let data = self.call(
            "index_weight",
            json!({
                "index_code": Self::ts_code(&index),
                "start_date": start.format("%Y%m%d").to_string(),
                "end_date": end.format("%Y%m%d").to_string(),
            }),
            "con_code,trade_date",
        )?;

        let map = FieldMap::new(&data.fields);
        let mut codes: Vec<String> = Vec::new();
        for row in &data.items {
            let con = map.str(row, "con_code")?;
            let code = con.split('.').next().unwrap_or(con).trim();
            if !code.is_empty() && !codes.iter().any(|c| c == code) {
                codes.push(code.to_string());
            }
        }
        if codes.is_empty() {
            return Err(DataError::provider(
                ProviderId::Tushare,
                format!("no constituents for universe {universe}"),
            ));
        }
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(fields: &[&str], items: serde_json::Value) -> ApiData {
        ApiData {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            items: serde_json::from_value(items).unwrap(),
        }
    }

    #[test]
    fn daily_row_resolves_columns_by_name_not_position() {
        // Deliberately scrambled field order.
        let data = data(
            &["pct_chg", "close", "trade_date", "vol", "open", "amount", "high", "low"],
            serde_json::json!([[1.5, 10.5, "20240301", 1234.0, 10.0, 5678.0, 10.6, 9.9]]),
        );
        let map = FieldMap::new(&data.fields);
        let bar = daily_from_row(&map, &data.items[0]).unwrap();

        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.close, 10.5);
        assert_eq!(bar.pct_chg, 1.5);
        // Lots → shares, thousand-yuan → yuan.
        assert_eq!(bar.volume, 123_400);
        assert_eq!(bar.amount, 5_678_000.0);
    }

    #[test]
    fn missing_column_is_a_format_error() {
        let data = data(
            &["trade_date", "close"],
            serde_json::json!([["20240301", 10.5]]),
        );
        let map = FieldMap::new(&data.fields);
        let err = daily_from_row(&map, &data.items[0]).unwrap_err();
        assert!(matches!(err, DataError::ResponseFormatChanged(_)));
    }

    #[test]
    fn null_numeric_maps_to_nan_not_error() {
        let data = data(
            &["trade_date", "open", "high", "low", "close", "vol", "amount", "pct_chg"],
            serde_json::json!([["20240301", 10.0, 10.6, 9.9, 10.5, 1000.0, null, 1.5]]),
        );
        let map = FieldMap::new(&data.fields);
        let bar = daily_from_row(&map, &data.items[0]).unwrap();
        assert!(bar.amount.is_nan());
    }
}
