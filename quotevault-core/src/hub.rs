//! The single entry point callers use.
//!
//! Wires configuration into the provider registry, the on-disk store, the
//! two cache layers, the name resolver and the prefetch scheduler, and
//! exposes the operations a front end needs. Construction is cheap; no
//! network traffic happens until an operation asks for data.

use crate::config::{ProviderRegistry, VaultConfig};
use crate::domain::{Instrument, MinuteSeries, Period};
use crate::error::DataError;
use crate::history::{HistoryCache, HistoryTable};
use crate::minute::MinuteBarCache;
use crate::names::NameResolver;
use crate::orchestrator::{Fetched, WorkerContext};
use crate::prefetch::{PrefetchBatch, PrefetchScheduler, PrefetchState};
use crate::store::{FsStore, KvStore};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Trading dates covered by one prefetch run, counted back from the
/// latest date in the history table.
const PREFETCH_DATES: usize = 3;

pub struct DataHub {
    config: VaultConfig,
    store: Arc<dyn KvStore>,
    history: HistoryCache,
    minute: Arc<MinuteBarCache>,
    names: NameResolver,
    prefetch: Arc<PrefetchScheduler>,
}

impl DataHub {
    pub fn new(config: VaultConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        Self::with_registry(config, registry, None)
    }

    /// Build with an injected registry (scripted providers in tests, or a
    /// host-managed one) and an optional worker-thread context hook.
    pub fn with_registry(
        config: VaultConfig,
        registry: Arc<ProviderRegistry>,
        context: Option<Arc<dyn WorkerContext>>,
    ) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(FsStore::new(&config.data_dir));

        let mut history = HistoryCache::new(
            &config.data_dir,
            Arc::clone(&registry),
            config.history.clone(),
        );
        if let Some(context) = context {
            history = history.with_context(context);
        }

        let minute = Arc::new(MinuteBarCache::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.intraday.clone(),
        ));
        let names = NameResolver::new(Arc::clone(&store), Arc::clone(&registry));
        let prefetch = Arc::new(PrefetchScheduler::new(
            Arc::clone(&store),
            Arc::clone(&minute),
            config.prefetch.clone(),
            Self::period_of(&config),
        ));

        Self {
            config,
            store,
            history,
            minute,
            names,
            prefetch,
        }
    }

    fn period_of(config: &VaultConfig) -> Period {
        Period::from_minutes(config.intraday.default_period_minutes).unwrap_or(Period::M5)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn default_period(&self) -> Period {
        Self::period_of(&self.config)
    }

    /// The daily history table for a universe, brought up to date and with
    /// display names applied.
    pub fn history(&self, universe: &str) -> Result<HistoryTable, DataError> {
        let names = self.names.ensure_fresh();
        let today = chrono::Local::now().date_naive();
        let mut table = self.history.get(universe, &names, today)?;
        table.apply_names(&names);
        Ok(table)
    }

    /// The cached table only, for status reporting. Never fetches.
    pub fn history_cached(&self, universe: &str) -> HistoryTable {
        self.history.load(universe)
    }

    /// Minute bars for one instrument and session, cache-first.
    pub fn minute_bars(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Option<Period>,
    ) -> Result<Fetched<MinuteSeries>, DataError> {
        self.minute
            .fetch(instrument, date, period.unwrap_or_else(|| self.default_period()))
    }

    /// Drop one minute-cache entry so the next request refetches.
    pub fn evict_minute(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        period: Option<Period>,
    ) -> Result<(), DataError> {
        self.minute
            .evict(instrument, date, period.unwrap_or_else(|| self.default_period()))
    }

    pub fn minute_cache_keys(&self) -> Vec<String> {
        self.minute.keys()
    }

    pub fn clear_minute_cache(&self) -> Result<(), DataError> {
        self.minute.clear()
    }

    /// Export the whole data tree (history tables, minute entries, name map,
    /// prefetch state) into a destination directory. Returns the number of
    /// files exported.
    pub fn backup_to(&self, dest: &std::path::Path) -> Result<usize, DataError> {
        let backup = FsStore::new(dest);
        let count = crate::store::copy_tree(self.store.as_ref(), &backup)?;
        info!(dest = %dest.display(), files = count, "data backup written");
        Ok(count)
    }

    /// Import a previously exported data tree into the live store,
    /// overwriting entries that exist in both. Returns the number of files
    /// restored. Keys are validated on write, so a tampered backup cannot
    /// escape the data directory.
    pub fn restore_from(&self, src: &std::path::Path) -> Result<usize, DataError> {
        let backup = FsStore::new(src);
        let count = crate::store::copy_tree(&backup, self.store.as_ref())?;
        info!(src = %src.display(), files = count, "data backup restored");
        Ok(count)
    }

    pub fn refresh_names(&self, force: bool) -> BTreeMap<String, String> {
        self.names.refresh(force)
    }

    /// Resolve names for specific codes, fetching only stale entries.
    pub fn refresh_names_for(&self, codes: &[String], force: bool) -> BTreeMap<String, String> {
        self.names.refresh_for(codes, force)
    }

    pub fn names(&self) -> BTreeMap<String, String> {
        self.names.map()
    }

    pub fn prefetch_state(&self) -> Option<PrefetchState> {
        self.prefetch.state()
    }

    pub fn prefetch_running(&self) -> bool {
        self.prefetch.is_running()
    }

    /// Start a prefetch run for a universe on a detached thread. Returns
    /// `false` when one is already in flight or the plan is empty.
    pub fn start_prefetch(&self, universe: &str) -> Result<bool, DataError> {
        let table = self.history(universe)?;
        let today = chrono::Local::now().date_naive();
        let plan = self.build_plan(&table);
        if plan.is_empty() {
            info!(universe, "nothing to prefetch");
            return Ok(false);
        }
        Ok(self.prefetch.start_detached(today, plan))
    }

    /// Fire the prefetch auto-trigger if its conditions hold: enabled, past
    /// the configured time on a trading day, not already run today.
    pub fn maybe_autostart_prefetch(&self, universe: &str) -> Result<bool, DataError> {
        let now = chrono::Local::now();
        let today = now.date_naive();

        // Gate on the cached table first so a closed gate costs no network.
        let cached = self.history.load(universe);
        let is_trading_day = cached.is_trading_day(today) || cached.last_date() < Some(today);
        if !self.prefetch.should_autostart(today, now.time(), is_trading_day) {
            return Ok(false);
        }

        let table = self.history(universe)?;
        if !table.is_trading_day(today) {
            return Ok(false);
        }
        let plan = self.build_plan(&table);
        if plan.is_empty() {
            return Ok(false);
        }
        Ok(self.prefetch.start_detached(today, plan))
    }

    /// Per-date batches: the configured index codes plus the top stocks by
    /// traded amount, over the most recent trading dates.
    fn build_plan(&self, table: &HistoryTable) -> Vec<PrefetchBatch> {
        let mut dates: Vec<NaiveDate> = table.records.iter().map(|r| r.date).collect();
        dates.sort_unstable();
        dates.dedup();
        dates.reverse();
        dates.truncate(PREFETCH_DATES);

        dates
            .into_iter()
            .map(|date| {
                let mut instruments: Vec<Instrument> = self
                    .config
                    .prefetch
                    .index_codes
                    .iter()
                    .map(|code| Instrument::index(code.clone()))
                    .collect();
                instruments.extend(
                    table
                        .top_by_amount(date, self.config.prefetch.top_k)
                        .into_iter()
                        .map(Instrument::stock),
                );
                PrefetchBatch { date, instruments }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DailyRecord;

    fn record(code: &str, day: u32, amount: f64) -> DailyRecord {
        DailyRecord {
            code: code.to_string(),
            name: code.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: 10.0,
            high: 10.5,
            low: 9.5,
            close: 10.2,
            volume: 1_000,
            amount,
            pct_chg: 0.0,
        }
    }

    fn hub(dir: &std::path::Path, top_k: usize) -> DataHub {
        let mut config = VaultConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        config.prefetch.top_k = top_k;
        config.prefetch.index_codes = vec!["000300".into()];
        DataHub::with_registry(
            config,
            Arc::new(ProviderRegistry::with_providers(vec![])),
            None,
        )
    }

    #[test]
    fn plan_covers_recent_dates_with_indexes_and_top_stocks() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path(), 2);

        let table = HistoryTable::new(vec![
            record("600000", 1, 300.0),
            record("000002", 1, 200.0),
            record("300750", 1, 100.0),
            record("600000", 4, 100.0),
            record("000002", 4, 400.0),
            record("600000", 5, 50.0),
        ]);

        let plan = hub.build_plan(&table);
        assert_eq!(plan.len(), 3);

        // Newest date first.
        assert_eq!(plan[0].date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(
            plan[0].instruments,
            vec![Instrument::index("000300"), Instrument::stock("600000")]
        );

        // Top-k ordering follows traded amount per date.
        assert_eq!(
            plan[1].instruments,
            vec![
                Instrument::index("000300"),
                Instrument::stock("000002"),
                Instrument::stock("600000"),
            ]
        );
    }

    #[test]
    fn plan_is_empty_for_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path(), 5);
        assert!(hub.build_plan(&HistoryTable::default()).is_empty());
    }

    #[test]
    fn backup_and_restore_roundtrip_the_data_tree() {
        let data_dir = tempfile::tempdir().unwrap();
        let backup_dir = tempfile::tempdir().unwrap();
        let hub = hub(data_dir.path(), 5);

        let live = FsStore::new(data_dir.path());
        live.put("names/map.json", b"{\"600000\":\"x\"}").unwrap();
        live.put("min/p5/stock/600000/20240301.csv", b"bars").unwrap();

        assert_eq!(hub.backup_to(backup_dir.path()).unwrap(), 2);

        // Wipe the live tree, then restore it from the backup.
        live.remove("names/map.json").unwrap();
        live.remove("min/p5/stock/600000/20240301.csv").unwrap();
        assert!(hub.minute_cache_keys().is_empty());

        assert_eq!(hub.restore_from(backup_dir.path()).unwrap(), 2);
        assert_eq!(live.get("names/map.json").unwrap(), b"{\"600000\":\"x\"}");
        assert_eq!(hub.minute_cache_keys().len(), 1);
    }

    #[test]
    fn default_period_falls_back_to_five_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path(), 5);
        assert_eq!(hub.default_period(), Period::M5);
    }
}
