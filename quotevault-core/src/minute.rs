//! Minute-bar cache — one immutable CSV entry per (period, kind, code, date).
//!
//! Keys look like `min/p5/stock/600000/20240301.csv`. A completed session's
//! bars never change upstream, so a cache hit is served without any
//! freshness check; correcting a bad entry is an explicit `evict` followed
//! by a refetch. Entries are only written after validation — an empty or
//! unparseable payload is a failed attempt, never a cached value.

use crate::config::{IntradaySettings, ProviderRegistry};
use crate::domain::{Instrument, MinuteBar, MinuteSeries, Period};
use crate::error::DataError;
use crate::orchestrator::{Backoff, Fetched};
use crate::store::KvStore;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const KEY_ROOT: &str = "min";

pub struct MinuteBarCache {
    store: Arc<dyn KvStore>,
    registry: Arc<ProviderRegistry>,
    settings: IntradaySettings,
}

impl MinuteBarCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: Arc<ProviderRegistry>,
        settings: IntradaySettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    /// Cache key for one series. The instrument kind is part of the key:
    /// an index and a stock sharing a code never collide.
    pub fn key(instrument: &Instrument, date: NaiveDate, period: Period) -> String {
        let kind = if instrument.is_index { "index" } else { "stock" };
        format!(
            "{KEY_ROOT}/p{period}/{kind}/{code}/{date}.csv",
            code = instrument.code,
            date = date.format("%Y%m%d")
        )
    }

    /// Cache-only lookup, no network.
    pub fn cached(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Option<MinuteSeries> {
        let key = Self::key(instrument, date, period);
        let bytes = self.store.get(&key)?;
        match parse_csv(&bytes) {
            Ok(bars) if !bars.is_empty() => Some(MinuteSeries {
                instrument: instrument.clone(),
                date,
                period,
                bars,
            }),
            Ok(_) => {
                warn!(key, "empty cached entry, evicting");
                let _ = self.store.remove(&key);
                None
            }
            Err(e) => {
                warn!(key, error = %e, "corrupt cached entry, evicting");
                let _ = self.store.remove(&key);
                None
            }
        }
    }

    /// Cache hit or fetch. The source marker tells batch callers whether
    /// the network was touched.
    pub fn fetch(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Result<Fetched<MinuteSeries>, DataError> {
        if let Some(series) = self.cached(instrument, date, period) {
            debug!(key = Self::key(instrument, date, period), "minute cache hit");
            return Ok(Fetched::cached(series));
        }
        self.fetch_network(instrument, date, period)
            .map(Fetched::network)
    }

    /// Like [`fetch`](Self::fetch) but flattening failure to `None`, for
    /// callers that render "no data" rather than an error.
    pub fn get(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Option<MinuteSeries> {
        self.fetch(instrument, date, period)
            .map(|f| f.value)
            .ok()
    }

    /// Drop one cached entry so the next fetch goes to the network.
    pub fn evict(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Result<(), DataError> {
        self.store.remove(&Self::key(instrument, date, period))
    }

    /// Keys currently cached, sorted. Used by cache status reporting.
    pub fn keys(&self) -> Vec<String> {
        self.store.list(KEY_ROOT)
    }

    /// Drop every cached minute entry.
    pub fn clear(&self) -> Result<(), DataError> {
        for key in self.keys() {
            self.store.remove(&key)?;
        }
        Ok(())
    }

    /// Provider fallback with a per-provider retry budget. Backoff state is
    /// owned by this call; concurrent tasks never share a delay ladder.
    fn fetch_network(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Period,
    ) -> Result<MinuteSeries, DataError> {
        self.registry.ensure_nonempty()?;
        let key = Self::key(instrument, date, period);

        for provider in self.registry.providers() {
            let mut backoff = Backoff::new(Duration::from_secs(self.settings.backoff_floor_secs));
            for attempt in 1..=self.settings.max_retries.max(1) {
                if !backoff.delay().is_zero() {
                    debug!(key, provider = %provider.id(), delay = ?backoff.delay(), "backing off");
                    std::thread::sleep(backoff.delay());
                }
                let outcome = provider
                    .fetch_intraday(instrument, date, period)
                    .and_then(|bars| validate_session(bars, date));
                match outcome {
                    Ok(bars) => {
                        let mut series = MinuteSeries {
                            instrument: instrument.clone(),
                            date,
                            period,
                            bars,
                        };
                        series.normalize();
                        if let Err(e) = self.store.put(&key, &to_csv(&series.bars)?) {
                            // Degraded but serviceable: the value is good
                            // even when the write is not.
                            warn!(key, error = %e, "minute cache write failed");
                        }
                        info!(key, provider = %provider.id(), bars = series.len(), "minute series fetched");
                        return Ok(series);
                    }
                    Err(e) => {
                        warn!(key, provider = %provider.id(), attempt, error = %e, "intraday fetch failed");
                        backoff.record_failure();
                    }
                }
            }
        }
        Err(DataError::Exhausted { key })
    }
}

/// A payload only becomes a cache entry if it has bars and every bar
/// belongs to the requested session.
fn validate_session(bars: Vec<MinuteBar>, date: NaiveDate) -> Result<Vec<MinuteBar>, DataError> {
    if bars.is_empty() {
        return Err(DataError::ValidationError("empty minute payload".into()));
    }
    if let Some(bar) = bars.iter().find(|b| b.timestamp.date() != date) {
        return Err(DataError::ValidationError(format!(
            "bar timestamp {} outside session {date}",
            bar.timestamp
        )));
    }
    Ok(bars)
}

fn to_csv(bars: &[MinuteBar]) -> Result<Vec<u8>, DataError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for bar in bars {
        writer
            .serialize(bar)
            .map_err(|e| DataError::CacheIo(format!("csv serialize: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| DataError::CacheIo(format!("csv flush: {e}")))
}

fn parse_csv(bytes: &[u8]) -> Result<Vec<MinuteBar>, DataError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut bars = Vec::new();
    for row in reader.deserialize() {
        bars.push(row.map_err(|e| DataError::CacheIo(format!("csv parse: {e}")))?);
    }
    Ok(bars)
}
