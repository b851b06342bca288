//! Authorization-result caching.
//!
//! [`CacheBucket`] is the building block: a keyed cache with LRU or TTL
//! eviction that populates misses exactly once per key even under
//! concurrent access. The gate nests three of them (site, credential,
//! resource); see `application::hierarchy`.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! credential_capacity = 1024
//! credential_ttl_seconds = 600
//! resource_capacity = 100
//! resource_ttl_seconds = 60
//! ```

mod bucket;
mod config;
pub(crate) mod lock;

pub use bucket::{CacheBucket, CacheEntry, EvictionPolicy};
pub(crate) use bucket::{
    METRIC_CACHE_EVICT, METRIC_CACHE_EXPIRED, METRIC_CACHE_HIT, METRIC_CACHE_MISS,
};
pub use config::CacheConfig;
