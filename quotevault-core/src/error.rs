//! Structured error types for data acquisition and caching.
//!
//! The taxonomy mirrors the propagation policy: provider failures are local
//! and trigger fallback, cache I/O failures degrade to cache misses, and only
//! systemic conditions (no providers, unresolvable universe) surface as
//! operation-level errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    /// One provider's call failed or returned unusable data. Non-fatal:
    /// the caller falls back to the next provider in registry order.
    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    /// Disk read/write failure in a cache layer. Logged by the cache and
    /// treated as a miss, never a hard failure of the surrounding operation.
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// Every configured provider and retry attempt failed for one key.
    /// Recorded as a per-task failure; never aborts a batch.
    #[error("all providers exhausted for {key}")]
    Exhausted { key: String },

    /// Zero providers are usable at all — systemic, bubbles up.
    #[error("no data providers configured")]
    NoProviders,

    /// The universe's constituent list could not be resolved from any
    /// source and no cached codes exist to fall back on — systemic.
    #[error("cannot resolve constituents for universe '{0}'")]
    UniverseUnresolved(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DataError {
    /// Wrap any adapter-level failure into the non-fatal `Provider` variant
    /// before it crosses the adapter boundary.
    pub fn provider(provider: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        DataError::Provider {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}
