//! Multi-category in-memory cache.
//!
//! This crate provides:
//! - A TTL map with capacity-triggered eviction and a background sweeper
//! - Category-prefixed and content-addressable cache keys
//! - Hit/miss/eviction counters

pub mod config;
pub mod key;
pub mod store;

pub use config::CacheConfig;
pub use key::CacheCategory;
pub use store::{CacheStats, EntryMeta, SweeperHandle, TtlCache};
