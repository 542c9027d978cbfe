//! QuoteVault Core — market data acquisition, caching and prefetch.
//!
//! This crate contains the data engine:
//! - Canonical domain types (instruments, periods, daily and minute bars)
//! - Provider adapters with explicit field mapping and ordered fallback
//! - On-disk caches: a wide parquet daily table with incremental merge,
//!   and immutable per-session minute CSV entries
//! - Fetch orchestration over serial or bounded concurrent dispatch
//! - Name resolution with a long-TTL persisted map
//! - A resumable background prefetch scheduler
//! - The [`DataHub`](hub::DataHub) facade wiring it all together

pub mod config;
pub mod domain;
pub mod error;
pub mod history;
pub mod hub;
pub mod minute;
pub mod names;
pub mod orchestrator;
pub mod prefetch;
pub mod provider;
pub mod store;

pub use config::{ProviderRegistry, VaultConfig};
pub use domain::{DailyBar, DailyRecord, Instrument, Market, MinuteBar, MinuteSeries, Period};
pub use error::DataError;
pub use hub::DataHub;
