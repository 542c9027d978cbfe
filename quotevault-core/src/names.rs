//! Instrument display-name resolution with a long-lived on-disk map.
//!
//! Names change rarely, so the map is refreshed at most every 180 days and
//! a failed refresh is not retried for 30 minutes. The map itself is never
//! discarded: a refresh merges on top of what is cached, and on total
//! failure the stale map is served as-is. A schema version is stored
//! alongside; bumping [`SCHEMA_VERSION`] invalidates freshness (not the
//! map) so the next lookup refetches.

use crate::config::ProviderRegistry;
use crate::error::DataError;
use crate::store::KvStore;
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const MAP_KEY: &str = "names/map.json";
const STATE_KEY: &str = "names/state.json";

/// Bump when the persisted layout or the upstream field mapping changes.
pub const SCHEMA_VERSION: u32 = 2;

/// Full-map refresh interval.
const TTL_DAYS: i64 = 180;
/// Minimum gap between failed refresh attempts.
const RETRY_INTERVAL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NameState {
    pub schema_version: u32,
    /// When a refresh was last *attempted*, successful or not.
    pub last_attempt: Option<NaiveDateTime>,
    /// When a refresh last *succeeded*.
    pub last_refresh: Option<NaiveDateTime>,
    /// Provider that served the last successful refresh.
    pub last_source: Option<String>,
    /// Per-code resolution timestamps for targeted lookups.
    pub per_code: BTreeMap<String, NaiveDateTime>,
}

impl NameState {
    fn is_fresh(&self, now: NaiveDateTime) -> bool {
        self.schema_version == SCHEMA_VERSION
            && self
                .last_refresh
                .is_some_and(|t| now - t < TimeDelta::days(TTL_DAYS))
    }

    fn attempted_recently(&self, now: NaiveDateTime) -> bool {
        self.last_attempt
            .is_some_and(|t| now - t < TimeDelta::minutes(RETRY_INTERVAL_MINUTES))
    }

    fn code_is_fresh(&self, code: &str, now: NaiveDateTime) -> bool {
        self.schema_version == SCHEMA_VERSION
            && self
                .per_code
                .get(code)
                .is_some_and(|t| now - *t < TimeDelta::days(TTL_DAYS))
    }
}

pub struct NameResolver {
    store: Arc<dyn KvStore>,
    registry: Arc<ProviderRegistry>,
}

impl NameResolver {
    pub fn new(store: Arc<dyn KvStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self { store, registry }
    }

    /// The cached map as-is, no freshness check and no network.
    pub fn map(&self) -> BTreeMap<String, String> {
        self.store
            .get(MAP_KEY)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn state(&self) -> NameState {
        self.store
            .get(STATE_KEY)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    /// The map, refreshed first if stale. A fresh map is returned without
    /// any network traffic.
    pub fn ensure_fresh(&self) -> BTreeMap<String, String> {
        self.refresh_at(false, chrono::Local::now().naive_local())
    }

    /// Refresh the map. `force` bypasses both the TTL and the failed-attempt
    /// gate. Always returns a usable map; failure means the stale one.
    pub fn refresh(&self, force: bool) -> BTreeMap<String, String> {
        self.refresh_at(force, chrono::Local::now().naive_local())
    }

    fn refresh_at(&self, force: bool, now: NaiveDateTime) -> BTreeMap<String, String> {
        let mut state = self.state();
        if !force {
            if state.is_fresh(now) {
                return self.map();
            }
            if state.attempted_recently(now) {
                // A refresh just failed; serve stale rather than hammer.
                return self.map();
            }
        }

        state.last_attempt = Some(now);
        self.persist_state(&state);

        match self.fetch_full_map() {
            Some((source, fetched)) => {
                let mut map = self.map();
                for (code, name) in &fetched {
                    map.insert(code.clone(), name.clone());
                    state.per_code.insert(code.clone(), now);
                }
                state.schema_version = SCHEMA_VERSION;
                state.last_refresh = Some(now);
                state.last_source = Some(source.clone());
                self.persist_map(&map);
                self.persist_state(&state);
                info!(source, names = fetched.len(), "name map refreshed");
                map
            }
            None => {
                warn!("name refresh failed on every provider, serving stale map");
                self.map()
            }
        }
    }

    /// Resolve specific codes. The TTL-gated bulk refresh runs first — one
    /// instrument-list call covers most codes on a cold store — and the
    /// per-code lookups only fill what the bulk map left missing or stale.
    /// Returns the full map.
    pub fn refresh_for(&self, codes: &[String], force: bool) -> BTreeMap<String, String> {
        let now = chrono::Local::now().naive_local();
        let mut map = self.refresh_at(force, now);
        let mut state = self.state();
        let mut changed = false;

        for code in codes {
            // A code the bulk refresh just stamped is fresh even under
            // `force`; re-fetching it one by one would be a duplicate.
            if map.contains_key(code) && state.code_is_fresh(code, now) {
                continue;
            }
            if let Some(name) = self.fetch_one_name(code) {
                map.insert(code.clone(), name);
                state.per_code.insert(code.clone(), now);
                changed = true;
            }
        }

        if changed {
            if state.schema_version != SCHEMA_VERSION {
                state.schema_version = SCHEMA_VERSION;
            }
            self.persist_map(&map);
            self.persist_state(&state);
        }
        map
    }

    /// Providers in fallback order; first non-empty instrument list wins.
    fn fetch_full_map(&self) -> Option<(String, BTreeMap<String, String>)> {
        for provider in self.registry.providers() {
            match provider.fetch_instrument_list() {
                Ok(list) if !list.is_empty() => {
                    return Some((provider.id().to_string(), list));
                }
                Ok(_) => {
                    warn!(provider = %provider.id(), "empty instrument list");
                }
                Err(e) => {
                    warn!(provider = %provider.id(), error = %e, "instrument list fetch failed");
                }
            }
        }
        None
    }

    fn fetch_one_name(&self, code: &str) -> Option<String> {
        for provider in self.registry.providers() {
            match provider.fetch_instrument_name(code) {
                Ok(Some(name)) if !name.trim().is_empty() => return Some(name),
                Ok(_) => {}
                Err(e) => {
                    warn!(code, provider = %provider.id(), error = %e, "name lookup failed");
                }
            }
        }
        None
    }

    fn persist_map(&self, map: &BTreeMap<String, String>) {
        match serde_json::to_vec_pretty(map) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(MAP_KEY, &bytes) {
                    warn!(error = %e, "failed to persist name map");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize name map"),
        }
    }

    fn persist_state(&self, state: &NameState) {
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(STATE_KEY, &bytes) {
                    warn!(error = %e, "failed to persist name state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize name state"),
        }
    }
}
