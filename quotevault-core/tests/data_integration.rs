//! End-to-end tests over scripted providers: incremental history merge,
//! provider fallback, minute-cache idempotency, name-map freshness, and a
//! full prefetch run with a persistently failing instrument.

use chrono::NaiveDate;
use quotevault_core::config::{HistorySettings, ProviderRegistry, VaultConfig};
use quotevault_core::domain::{DailyBar, Instrument, MinuteBar, Period};
use quotevault_core::error::DataError;
use quotevault_core::history::HistoryCache;
use quotevault_core::hub::DataHub;
use quotevault_core::orchestrator::FetchSource;
use quotevault_core::provider::{ProviderId, QuoteProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fully scripted provider: per-code daily bars, a constituent list, an
/// instrument-name list, and an optional set of codes whose intraday
/// fetches always fail. Every network call is counted.
#[derive(Default)]
struct MockProvider {
    id_is_primary: bool,
    daily: Mutex<HashMap<String, Vec<DailyBar>>>,
    constituents: Vec<String>,
    names: BTreeMap<String, String>,
    intraday_failing: HashSet<String>,
    fail_all: bool,
    daily_calls: AtomicUsize,
    intraday_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MockProvider {
    fn set_daily(&self, code: &str, bars: Vec<DailyBar>) {
        self.daily.lock().unwrap().insert(code.to_string(), bars);
    }

    fn daily_calls(&self) -> usize {
        self.daily_calls.load(Ordering::SeqCst)
    }

    fn intraday_calls(&self) -> usize {
        self.intraday_calls.load(Ordering::SeqCst)
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl QuoteProvider for MockProvider {
    fn id(&self) -> ProviderId {
        if self.id_is_primary {
            ProviderId::Tushare
        } else {
            ProviderId::Eastmoney
        }
    }

    fn fetch_daily(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, DataError> {
        self.daily_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            return Err(DataError::provider(self.id(), "scripted outage"));
        }
        let daily = self.daily.lock().unwrap();
        Ok(daily
            .get(&instrument.code)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn fetch_intraday(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        _period: Period,
    ) -> Result<Vec<MinuteBar>, DataError> {
        self.intraday_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all || self.intraday_failing.contains(&instrument.code) {
            return Err(DataError::provider(self.id(), "scripted failure"));
        }
        Ok(vec![
            minute_bar(date, (9, 35), 10.0),
            minute_bar(date, (9, 40), 10.2),
        ])
    }

    fn fetch_instrument_list(&self) -> Result<BTreeMap<String, String>, DataError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all || self.names.is_empty() {
            return Err(DataError::provider(self.id(), "scripted outage"));
        }
        Ok(self.names.clone())
    }

    fn fetch_index_constituents(&self, _universe: &str) -> Result<Vec<String>, DataError> {
        if self.fail_all || self.constituents.is_empty() {
            return Err(DataError::provider(self.id(), "scripted outage"));
        }
        Ok(self.constituents.clone())
    }
}

fn daily_bar(date: NaiveDate, close: f64, amount: f64) -> DailyBar {
    DailyBar {
        date,
        open: close - 0.2,
        high: close + 0.3,
        low: close - 0.4,
        close,
        volume: 10_000,
        amount,
        pct_chg: 0.0,
    }
}

fn minute_bar(date: NaiveDate, hm: (u32, u32), close: f64) -> MinuteBar {
    MinuteBar {
        timestamp: date.and_hms_opt(hm.0, hm.1, 0).unwrap(),
        open: close - 0.1,
        high: close + 0.1,
        low: close - 0.2,
        close,
        volume: 100,
        amount: close * 100.0,
        pct_chg: 0.0,
    }
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn registry_of(providers: Vec<Arc<dyn QuoteProvider>>) -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::with_providers(providers))
}

fn fast_config(dir: &std::path::Path) -> VaultConfig {
    let mut config = VaultConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    };
    config.intraday.backoff_floor_secs = 0;
    config.intraday.max_retries = 1;
    config.intraday.delay_secs = 0.0;
    config.prefetch.delay_secs = 0.0;
    config
}

#[test]
fn history_update_is_incremental_and_corrections_win() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider {
        constituents: vec!["600000".to_string()],
        ..Default::default()
    });
    provider.set_daily(
        "600000",
        vec![
            daily_bar(ymd(2024, 2, 28), 10.0, 1_000.0),
            daily_bar(ymd(2024, 2, 29), 10.2, 1_100.0),
        ],
    );

    let cache = HistoryCache::new(
        dir.path(),
        registry_of(vec![provider.clone()]),
        HistorySettings::default(),
    );
    let names = BTreeMap::new();

    let table = cache.get("000300", &names, ymd(2024, 2, 29)).unwrap();
    assert_eq!(table.len(), 2);
    let first_round_calls = provider.daily_calls();

    // Upstream corrects 02-29 and publishes 03-01.
    provider.set_daily(
        "600000",
        vec![
            daily_bar(ymd(2024, 2, 28), 10.0, 1_000.0),
            daily_bar(ymd(2024, 2, 29), 11.5, 1_200.0),
            daily_bar(ymd(2024, 3, 1), 11.8, 1_300.0),
        ],
    );

    let table = cache.get("000300", &names, ymd(2024, 3, 1)).unwrap();
    assert_eq!(table.len(), 3, "one row per (code, date)");
    let corrected = table
        .records
        .iter()
        .find(|r| r.date == ymd(2024, 2, 29))
        .unwrap();
    assert_eq!(corrected.close, 11.5, "the re-sent row must replace the old one");
    assert!(provider.daily_calls() > first_round_calls);

    // Cache frontier reached: a third call makes no network requests.
    let calls = provider.daily_calls();
    let table = cache.get("000300", &names, ymd(2024, 3, 1)).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(provider.daily_calls(), calls);
}

#[test]
fn daily_fallback_uses_the_second_provider_when_the_first_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let down = Arc::new(MockProvider {
        id_is_primary: true,
        fail_all: true,
        ..Default::default()
    });
    let up = Arc::new(MockProvider {
        constituents: vec!["600000".to_string()],
        ..Default::default()
    });
    up.set_daily("600000", vec![daily_bar(ymd(2024, 3, 1), 10.0, 1_000.0)]);

    let cache = HistoryCache::new(
        dir.path(),
        registry_of(vec![down.clone(), up.clone()]),
        HistorySettings::default(),
    );

    let table = cache.get("000300", &BTreeMap::new(), ymd(2024, 3, 1)).unwrap();
    assert_eq!(table.len(), 1);
    assert!(down.daily_calls() >= 1, "primary must be tried first");
    assert_eq!(up.daily_calls(), 1);
}

#[test]
fn total_daily_failure_returns_the_stale_table() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider {
        constituents: vec!["600000".to_string()],
        ..Default::default()
    });
    provider.set_daily("600000", vec![daily_bar(ymd(2024, 2, 29), 10.0, 1_000.0)]);

    let cache = HistoryCache::new(
        dir.path(),
        registry_of(vec![provider.clone()]),
        HistorySettings::default(),
    );
    let warm = cache.get("000300", &BTreeMap::new(), ymd(2024, 2, 29)).unwrap();
    assert_eq!(warm.len(), 1);

    // Provider goes dark; asking for a later day serves the stale table.
    provider.set_daily("600000", vec![]);
    let stale = cache.get("000300", &BTreeMap::new(), ymd(2024, 3, 1)).unwrap();
    assert_eq!(stale.records, warm.records);
}

#[test]
fn minute_fetch_is_idempotent_through_the_hub() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::default());
    let hub = DataHub::with_registry(
        fast_config(dir.path()),
        registry_of(vec![provider.clone()]),
        None,
    );

    let instrument = Instrument::stock("600000");
    let date = ymd(2024, 3, 1);

    let first = hub.minute_bars(&instrument, date, None).unwrap();
    assert_eq!(first.source, FetchSource::Network);
    assert_eq!(provider.intraday_calls(), 1);

    let second = hub.minute_bars(&instrument, date, None).unwrap();
    assert_eq!(second.source, FetchSource::Cache);
    assert_eq!(second.value, first.value);
    assert_eq!(provider.intraday_calls(), 1, "hit must not touch the network");

    // Eviction forces exactly one refetch.
    hub.evict_minute(&instrument, date, None).unwrap();
    let third = hub.minute_bars(&instrument, date, None).unwrap();
    assert_eq!(third.source, FetchSource::Network);
    assert_eq!(provider.intraday_calls(), 2);
}

#[test]
fn fresh_name_map_is_served_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider {
        names: [("600000".to_string(), "浦发银行".to_string())].into(),
        ..Default::default()
    });
    let hub = DataHub::with_registry(
        fast_config(dir.path()),
        registry_of(vec![provider.clone()]),
        None,
    );

    let map = hub.refresh_names(false);
    assert_eq!(map.get("600000").map(String::as_str), Some("浦发银行"));
    assert_eq!(provider.list_calls(), 1);

    let map = hub.refresh_names(false);
    assert_eq!(map.len(), 1);
    assert_eq!(provider.list_calls(), 1, "a fresh map must not refetch");
}

#[test]
fn prefetch_run_over_three_dates_reports_partial_on_one_bad_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let today = chrono::Local::now().date_naive();
    let dates = [
        today - chrono::Duration::days(2),
        today - chrono::Duration::days(1),
        today,
    ];

    // 27 stocks plus 3 indexes per date = 30 instruments; one stock's
    // intraday endpoint is permanently broken.
    let codes: Vec<String> = (0..27).map(|i| format!("600{i:03}")).collect();
    let provider = Arc::new(MockProvider {
        constituents: codes.clone(),
        names: codes
            .iter()
            .map(|c| (c.clone(), format!("股票{c}")))
            .collect(),
        intraday_failing: ["600013".to_string()].into(),
        ..Default::default()
    });
    for (rank, code) in codes.iter().enumerate() {
        provider.set_daily(
            code,
            dates
                .iter()
                .map(|&d| daily_bar(d, 10.0, 1_000.0 * (rank + 1) as f64))
                .collect(),
        );
    }

    let mut config = fast_config(dir.path());
    config.prefetch.top_k = 27;
    config.prefetch.index_codes =
        vec!["000300".into(), "000001".into(), "399001".into()];

    let hub = DataHub::with_registry(config, registry_of(vec![provider]), None);
    assert!(hub.start_prefetch("000300").unwrap());

    let mut waited = 0u32;
    while hub.prefetch_running() {
        std::thread::sleep(std::time::Duration::from_millis(10));
        waited += 1;
        assert!(waited < 3_000, "prefetch run did not finish");
    }

    let state = hub.prefetch_state().unwrap();
    assert_eq!(state.date, today);
    assert_eq!(state.success + state.failed, 90, "3 dates x 30 instruments");
    assert_eq!(state.failed, 3, "the broken instrument fails once per date");
    assert_eq!(state.success, 87);
    assert_eq!(
        state.status,
        quotevault_core::prefetch::PrefetchStatus::Partial
    );

    // The warmed cache holds everything except the broken instrument.
    assert_eq!(hub.minute_cache_keys().len(), 87);
}
