//! Configuration file and provider registry.
//!
//! Configuration comes from `quotevault.toml` (every field defaulted, a
//! missing file is fine) with environment overrides for the knobs operators
//! actually flip: `QUOTEVAULT_DATA_DIR`, `QUOTEVAULT_PROVIDERS`,
//! `TUSHARE_TOKEN`.

use crate::error::DataError;
use crate::provider::{EastmoneyProvider, ProviderId, QuoteProvider, TushareProvider};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root of the on-disk cache tree.
    pub data_dir: PathBuf,

    /// Provider ids in fallback order. Unknown names are warned about and
    /// ignored; the public fallback is appended if omitted.
    pub provider_order: Vec<String>,

    /// Credential for the licensed provider. Absent means the provider is
    /// skipped, not an error.
    pub tushare_token: Option<String>,

    pub history: HistorySettings,
    pub intraday: IntradaySettings,
    pub prefetch: PrefetchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Lookback when no cache exists yet.
    pub lookback_years: u32,
    /// Worker pool size for per-instrument daily fetches. Kept small to
    /// stay under upstream anti-abuse thresholds.
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntradaySettings {
    /// Worker pool size; 1 means serial dispatch with `delay_secs` between
    /// network calls.
    pub workers: usize,
    pub delay_secs: f64,
    /// Per-provider attempt budget for one minute-bar task.
    pub max_retries: u32,
    /// Exponential backoff floor, in seconds.
    pub backoff_floor_secs: u64,
    pub default_period_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchSettings {
    pub enabled: bool,
    /// Time of day (HH:MM) after which the auto-trigger may start.
    pub trigger_time: String,
    /// Inter-task delay inside a prefetch batch.
    pub delay_secs: f64,
    /// Instruments warmed per date: this many top-by-amount stocks.
    pub top_k: usize,
    /// Always-warmed index codes.
    pub index_codes: Vec<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            provider_order: vec!["tushare".into(), "eastmoney".into()],
            tushare_token: None,
            history: HistorySettings::default(),
            intraday: IntradaySettings::default(),
            prefetch: PrefetchSettings::default(),
        }
    }
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            lookback_years: 2,
            workers: 10,
        }
    }
}

impl Default for IntradaySettings {
    fn default() -> Self {
        Self {
            workers: 1,
            delay_secs: 0.5,
            max_retries: 3,
            backoff_floor_secs: 60,
            default_period_minutes: 5,
        }
    }
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_time: "15:15".into(),
            delay_secs: 10.0,
            top_k: 25,
            index_codes: vec!["000300".into(), "000001".into(), "399001".into()],
        }
    }
}

impl VaultConfig {
    /// Load from a TOML file, then apply environment overrides. A missing
    /// file yields the defaults; a malformed file is a configuration error.
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let mut cfg = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| DataError::Config(format!("read {}: {e}", path.display())))?;
            toml::from_str(&content)
                .map_err(|e| DataError::Config(format!("parse {}: {e}", path.display())))?
        } else {
            Self::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("QUOTEVAULT_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(order) = std::env::var("QUOTEVAULT_PROVIDERS") {
            let parsed: Vec<String> = order
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.provider_order = parsed;
            }
        }
        if let Ok(token) = std::env::var("TUSHARE_TOKEN") {
            if !token.trim().is_empty() {
                self.tushare_token = Some(token.trim().to_string());
            }
        }
    }

    /// Configured secret for a provider, if any.
    pub fn credential(&self, id: ProviderId) -> Option<&str> {
        match id {
            ProviderId::Tushare => self.tushare_token.as_deref(),
            ProviderId::Eastmoney => None,
        }
    }

    /// Effective provider order: parse configured names (warning on unknown
    /// ones), drop duplicates, and always append the public fallback.
    pub fn effective_order(&self) -> Vec<ProviderId> {
        let mut order: Vec<ProviderId> = Vec::new();
        for name in &self.provider_order {
            match name.parse::<ProviderId>() {
                Ok(id) => {
                    if !order.contains(&id) {
                        order.push(id);
                    }
                }
                Err(_) => warn!(provider = %name, "ignoring unknown provider in order"),
            }
        }
        if !order.contains(&ProviderId::Eastmoney) {
            order.push(ProviderId::Eastmoney);
        }
        order
    }

    pub fn trigger_time(&self) -> NaiveTime {
        parse_hhmm(&self.prefetch.trigger_time)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(15, 15, 0).unwrap())
    }
}

pub(crate) fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (h, m) = value.split_once(':')?;
    NaiveTime::from_hms_opt(h.trim().parse().ok()?, m.trim().parse().ok()?, 0)
}

/// Ordered set of usable provider adapters.
///
/// Pure lookup: holds the adapters built from configuration, in fallback
/// order, with credential-less licensed providers already skipped.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn QuoteProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(cfg: &VaultConfig) -> Self {
        let mut providers: Vec<Arc<dyn QuoteProvider>> = Vec::new();
        for id in cfg.effective_order() {
            match id {
                ProviderId::Tushare => match cfg.credential(id) {
                    Some(token) => {
                        providers.push(Arc::new(TushareProvider::new(token)));
                    }
                    None => info!(provider = %id, "no credential configured, skipping"),
                },
                ProviderId::Eastmoney => {
                    providers.push(Arc::new(EastmoneyProvider::new()));
                }
            }
        }
        Self { providers }
    }

    /// Build from pre-constructed adapters, preserving order. Used by tests
    /// to inject scripted providers.
    pub fn with_providers(providers: Vec<Arc<dyn QuoteProvider>>) -> Self {
        Self { providers }
    }

    pub fn order(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub fn providers(&self) -> &[Arc<dyn QuoteProvider>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn ensure_nonempty(&self) -> Result<(), DataError> {
        if self.is_empty() {
            Err(DataError::NoProviders)
        } else {
            Ok(())
        }
    }
}
