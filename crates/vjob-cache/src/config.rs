//! Cache configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::key::CacheCategory;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for keys without a category override
    pub default_ttl: Duration,
    /// Entry ceiling; reaching it evicts the oldest 10% before an insert
    pub max_entries: usize,
    /// How often the sweeper drops expired entries
    pub sweep_interval: Duration,
    /// Per-category TTL overrides
    pub category_ttls: HashMap<CacheCategory, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut category_ttls = HashMap::new();
        category_ttls.insert(CacheCategory::Transcript, Duration::from_secs(24 * 3600));
        category_ttls.insert(CacheCategory::AiResult, Duration::from_secs(7 * 24 * 3600));
        category_ttls.insert(CacheCategory::Metadata, Duration::from_secs(3600));
        category_ttls.insert(CacheCategory::OwnerResult, Duration::from_secs(3600));
        category_ttls.insert(CacheCategory::Quota, Duration::from_secs(30));

        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
            category_ttls,
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.default_ttl = env_secs("CACHE_DEFAULT_TTL_SECS").unwrap_or(config.default_ttl);
        config.max_entries = std::env::var("CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.max_entries);
        config.sweep_interval =
            env_secs("CACHE_SWEEP_INTERVAL_SECS").unwrap_or(config.sweep_interval);

        let overrides = [
            (CacheCategory::Transcript, "CACHE_TRANSCRIPT_TTL_SECS"),
            (CacheCategory::AiResult, "CACHE_AI_RESULT_TTL_SECS"),
            (CacheCategory::Metadata, "CACHE_METADATA_TTL_SECS"),
            (CacheCategory::OwnerResult, "CACHE_OWNER_RESULT_TTL_SECS"),
            (CacheCategory::Quota, "CACHE_QUOTA_TTL_SECS"),
        ];
        for (category, var) in overrides {
            if let Some(ttl) = env_secs(var) {
                config.category_ttls.insert(category, ttl);
            }
        }

        config
    }

    /// Set the entry ceiling.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// TTL a key gets when `set` is called without one.
    pub fn ttl_for_key(&self, key: &str) -> Duration {
        CacheCategory::of_key(key)
            .and_then(|category| self.category_ttls.get(&category).copied())
            .unwrap_or(self.default_ttl)
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}
