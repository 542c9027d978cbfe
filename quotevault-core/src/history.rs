//! Daily-bar history cache — one wide table per instrument universe.
//!
//! Layout: `{data_dir}/history/{universe}.parquet` plus a JSON metadata
//! sidecar (row count, date range, content hash). Updates are incremental:
//! the fetch window runs from the last cached date (re-requested, so an
//! upstream correction for it is picked up) through today, and the merge
//! guarantees one row per (code, date) with the newest fetch winning.
//! Staleness is preferred over unavailability — a total fetch failure
//! returns the last good table.

use crate::config::{HistorySettings, ProviderRegistry};
use crate::domain::{DailyRecord, Instrument};
use crate::error::DataError;
use crate::orchestrator::{DispatchMode, FetchOrchestrator, Fetched, WorkerContext};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata sidecar for a persisted universe table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMeta {
    pub universe: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub row_count: usize,
    pub data_hash: String,
    pub cached_at: chrono::NaiveDateTime,
}

/// The wide daily table for one universe, sorted by (date, code).
#[derive(Debug, Clone, Default)]
pub struct HistoryTable {
    pub records: Vec<DailyRecord>,
}

impl HistoryTable {
    pub fn new(mut records: Vec<DailyRecord>) -> Self {
        records.sort_by(|a, b| (a.date, a.code.as_str()).cmp(&(b.date, b.code.as_str())));
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Latest date present, i.e. the cache frontier.
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.iter().map(|r| r.date).max()
    }

    /// Distinct codes, in first-seen order.
    pub fn codes(&self) -> Vec<String> {
        let mut codes = Vec::new();
        for record in &self.records {
            if !codes.contains(&record.code) {
                codes.push(record.code.clone());
            }
        }
        codes
    }

    /// A date is a trading day iff the table has at least one row for it.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.records.iter().any(|r| r.date == date)
    }

    pub fn codes_for_date(&self, date: NaiveDate) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.date == date)
            .map(|r| r.code.clone())
            .collect()
    }

    /// Top `k` codes by traded amount on one date, descending. NaN amounts
    /// sort last.
    pub fn top_by_amount(&self, date: NaiveDate, k: usize) -> Vec<String> {
        let mut rows: Vec<&DailyRecord> =
            self.records.iter().filter(|r| r.date == date).collect();
        rows.sort_by(|a, b| {
            b.amount
                .partial_cmp(&a.amount)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.into_iter().take(k).map(|r| r.code.clone()).collect()
    }

    /// Overwrite display names from a resolver map, leaving rows whose code
    /// is absent from the map untouched.
    pub fn apply_names(&mut self, names: &BTreeMap<String, String>) {
        if names.is_empty() {
            return;
        }
        for record in &mut self.records {
            if let Some(name) = names.get(&record.code) {
                record.name = name.clone();
            }
        }
    }
}

/// Merge freshly fetched rows into the cached table.
///
/// Cached rows dated inside the fetch window are dropped first, then fresh
/// rows are appended and deduplicated by (code, date) keeping the later
/// occurrence — so an upstream re-send of an already-cached date always
/// replaces the old value.
pub fn merge_records(
    cached: Vec<DailyRecord>,
    fresh: Vec<DailyRecord>,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<DailyRecord> {
    let mut merged: Vec<DailyRecord> = cached
        .into_iter()
        .filter(|r| r.date < window_start || r.date > window_end)
        .collect();
    merged.extend(fresh);

    // Keep the last occurrence per key: later (fresher) rows win.
    let mut seen: BTreeMap<(String, NaiveDate), usize> = BTreeMap::new();
    let mut deduped: Vec<DailyRecord> = Vec::with_capacity(merged.len());
    for record in merged {
        let key = (record.code.clone(), record.date);
        match seen.get(&key) {
            Some(&idx) => deduped[idx] = record,
            None => {
                seen.insert(key, deduped.len());
                deduped.push(record);
            }
        }
    }
    deduped.sort_by(|a, b| (a.date, a.code.as_str()).cmp(&(b.date, b.code.as_str())));
    deduped
}

pub struct HistoryCache {
    dir: PathBuf,
    registry: Arc<ProviderRegistry>,
    settings: HistorySettings,
    context: Option<Arc<dyn WorkerContext>>,
}

impl HistoryCache {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        registry: Arc<ProviderRegistry>,
        settings: HistorySettings,
    ) -> Self {
        Self {
            dir: data_dir.into().join("history"),
            registry,
            settings,
            context: None,
        }
    }

    pub fn with_context(mut self, context: Arc<dyn WorkerContext>) -> Self {
        self.context = Some(context);
        self
    }

    fn table_path(&self, universe: &str) -> PathBuf {
        self.dir.join(format!("{universe}.parquet"))
    }

    fn meta_path(&self, universe: &str) -> PathBuf {
        self.dir.join(format!("{universe}.meta.json"))
    }

    pub fn meta(&self, universe: &str) -> Option<HistoryMeta> {
        let content = fs::read_to_string(self.meta_path(universe)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Load the persisted table. Read failures degrade to an empty table.
    pub fn load(&self, universe: &str) -> HistoryTable {
        let path = self.table_path(universe);
        if !path.exists() {
            return HistoryTable::default();
        }
        match read_parquet(&path) {
            Ok(records) => HistoryTable::new(records),
            Err(e) => {
                warn!(universe, error = %e, "history cache unreadable, treating as empty");
                HistoryTable::default()
            }
        }
    }

    /// Fetch-and-merge entry point. `names` fills the display-name column
    /// for newly fetched rows; pass an empty map to keep codes as names.
    pub fn get(
        &self,
        universe: &str,
        names: &BTreeMap<String, String>,
        today: NaiveDate,
    ) -> Result<HistoryTable, DataError> {
        self.registry.ensure_nonempty()?;

        let cached = self.load(universe);
        if let Some(last) = cached.last_date() {
            if last >= today {
                info!(universe, %last, "history cache is current, no network call");
                return Ok(cached);
            }
        }

        // The window starts at the frontier date itself, not the day after:
        // upstream corrections for the last cached date are re-requested and
        // replace the old row in the merge.
        let window_start = match cached.last_date() {
            Some(last) => last,
            None => lookback_start(today, self.settings.lookback_years),
        };
        if window_start > today {
            return Ok(cached);
        }

        let codes = match self.resolve_constituents(universe) {
            Ok(codes) => codes,
            Err(e) => {
                if cached.is_empty() {
                    return Err(e);
                }
                warn!(universe, error = %e, "constituents unresolved, reusing cached codes");
                cached.codes()
            }
        };

        info!(
            universe,
            instruments = codes.len(),
            %window_start,
            %today,
            "fetching daily window"
        );

        let mut orchestrator =
            FetchOrchestrator::new(DispatchMode::Concurrent {
                workers: self.settings.workers,
            });
        if let Some(context) = self.context.clone() {
            orchestrator = orchestrator.with_context(context);
        }

        let report = orchestrator.run(codes, |code| {
            self.fetch_one(code, names, window_start, today)
                .map(Fetched::network)
        });
        for (code, err) in &report.failures {
            warn!(code, error = %err, "daily fetch failed for instrument");
        }
        info!(
            universe,
            success = report.stats.success,
            failed = report.stats.failed,
            "daily window fetch complete"
        );

        let fresh: Vec<DailyRecord> = report
            .successes
            .into_iter()
            .flat_map(|(_, rows)| rows)
            .collect();

        if fresh.is_empty() {
            // Holiday window or total failure: stale beats unavailable.
            return Ok(cached);
        }

        let merged = HistoryTable::new(merge_records(
            cached.records,
            fresh,
            window_start,
            today,
        ));
        if let Err(e) = self.persist(universe, &merged) {
            warn!(universe, error = %e, "failed to persist history table");
        }
        Ok(merged)
    }

    /// Providers in registry order, then the codes already cached.
    fn resolve_constituents(&self, universe: &str) -> Result<Vec<String>, DataError> {
        for provider in self.registry.providers() {
            match provider.fetch_index_constituents(universe) {
                Ok(codes) if !codes.is_empty() => {
                    info!(universe, provider = %provider.id(), count = codes.len(), "constituents resolved");
                    return Ok(codes);
                }
                Ok(_) => {
                    warn!(universe, provider = %provider.id(), "empty constituent list");
                }
                Err(e) => {
                    warn!(universe, provider = %provider.id(), error = %e, "constituent fetch failed");
                }
            }
        }
        Err(DataError::UniverseUnresolved(universe.to_string()))
    }

    /// One instrument's window, through provider fallback.
    fn fetch_one(
        &self,
        code: &str,
        names: &BTreeMap<String, String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, DataError> {
        let instrument = Instrument::stock(code);
        let name = names.get(code).cloned().unwrap_or_else(|| code.to_string());
        for provider in self.registry.providers() {
            match provider.fetch_daily(&instrument, start, end) {
                Ok(bars) if !bars.is_empty() => {
                    return Ok(bars
                        .into_iter()
                        .map(|bar| DailyRecord::from_bar(code, name.clone(), bar))
                        .collect());
                }
                Ok(_) => {
                    warn!(code, provider = %provider.id(), "empty daily payload");
                }
                Err(e) => {
                    warn!(code, provider = %provider.id(), error = %e, "daily fetch attempt failed");
                }
            }
        }
        Err(DataError::Exhausted {
            key: format!("{code}:{start}..{end}"),
        })
    }

    /// Atomic persist: parquet to `.tmp` then rename, metadata sidecar last.
    fn persist(&self, universe: &str, table: &HistoryTable) -> Result<(), DataError> {
        if table.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)
            .map_err(|e| DataError::CacheIo(format!("create history dir: {e}")))?;

        let path = self.table_path(universe);
        let tmp = path.with_extension("parquet.tmp");
        let df = records_to_dataframe(&table.records)?;
        write_parquet(&df, &tmp)?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            DataError::CacheIo(format!("atomic rename failed: {e}"))
        })?;

        let meta = HistoryMeta {
            universe: universe.to_string(),
            start_date: table.records.first().map(|r| r.date).unwrap_or_default(),
            end_date: table.records.last().map(|r| r.date).unwrap_or_default(),
            row_count: table.len(),
            data_hash: blake3::hash(
                &serde_json::to_vec(&table.records)
                    .map_err(|e| DataError::CacheIo(format!("hash serialization: {e}")))?,
            )
            .to_hex()
            .to_string(),
            cached_at: chrono::Local::now().naive_local(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| DataError::CacheIo(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(universe), meta_json)
            .map_err(|e| DataError::CacheIo(format!("meta write: {e}")))
    }
}

fn lookback_start(today: NaiveDate, years: u32) -> NaiveDate {
    today - chrono::Duration::days(365 * i64::from(years))
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn records_to_dataframe(records: &[DailyRecord]) -> Result<DataFrame, DataError> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    let dates: Vec<i32> = records
        .iter()
        .map(|r| (r.date - epoch).num_days() as i32)
        .collect();
    let codes: Vec<&str> = records.iter().map(|r| r.code.as_str()).collect();
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    let opens: Vec<f64> = records.iter().map(|r| r.open).collect();
    let highs: Vec<f64> = records.iter().map(|r| r.high).collect();
    let lows: Vec<f64> = records.iter().map(|r| r.low).collect();
    let closes: Vec<f64> = records.iter().map(|r| r.close).collect();
    let volumes: Vec<u64> = records.iter().map(|r| r.volume).collect();
    let amounts: Vec<f64> = records.iter().map(|r| r.amount).collect();
    let pct_chgs: Vec<f64> = records.iter().map(|r| r.pct_chg).collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| DataError::CacheIo(format!("date cast: {e}")))?,
        Column::new("code".into(), codes),
        Column::new("name".into(), names),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("amount".into(), amounts),
        Column::new("pct_chg".into(), pct_chgs),
    ])
    .map_err(|e| DataError::CacheIo(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), DataError> {
    let file =
        fs::File::create(path).map_err(|e| DataError::CacheIo(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| DataError::CacheIo(format!("write parquet: {e}")))?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Vec<DailyRecord>, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::CacheIo(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::CacheIo(format!("read parquet: {e}")))?;

    let col = |name: &str| {
        df.column(name)
            .map_err(|e| DataError::CacheIo(format!("missing column {name}: {e}")))
    };
    let dates = col("date")?
        .date()
        .map_err(|e| DataError::CacheIo(format!("date column type: {e}")))?
        .clone();
    let codes = col("code")?
        .str()
        .map_err(|e| DataError::CacheIo(format!("code column type: {e}")))?
        .clone();
    let names = col("name")?
        .str()
        .map_err(|e| DataError::CacheIo(format!("name column type: {e}")))?
        .clone();
    let opens = col("open")?
        .f64()
        .map_err(|e| DataError::CacheIo(format!("open column type: {e}")))?
        .clone();
    let highs = col("high")?
        .f64()
        .map_err(|e| DataError::CacheIo(format!("high column type: {e}")))?
        .clone();
    let lows = col("low")?
        .f64()
        .map_err(|e| DataError::CacheIo(format!("low column type: {e}")))?
        .clone();
    let closes = col("close")?
        .f64()
        .map_err(|e| DataError::CacheIo(format!("close column type: {e}")))?
        .clone();
    let volumes = col("volume")?
        .u64()
        .map_err(|e| DataError::CacheIo(format!("volume column type: {e}")))?
        .clone();
    let amounts = col("amount")?
        .f64()
        .map_err(|e| DataError::CacheIo(format!("amount column type: {e}")))?
        .clone();
    let pct_chgs = col("pct_chg")?
        .f64()
        .map_err(|e| DataError::CacheIo(format!("pct_chg column type: {e}")))?
        .clone();

    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    let mut records = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let days = dates
            .get(i)
            .ok_or_else(|| DataError::CacheIo(format!("null date at row {i}")))?;
        records.push(DailyRecord {
            code: codes.get(i).unwrap_or_default().to_string(),
            name: names.get(i).unwrap_or_default().to_string(),
            date: epoch + chrono::Duration::days(i64::from(days)),
            open: opens.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            volume: volumes.get(i).unwrap_or(0),
            amount: amounts.get(i).unwrap_or(f64::NAN),
            pct_chg: pct_chgs.get(i).unwrap_or(f64::NAN),
        });
    }
    Ok(records)
}
