//! Cache sizing for the credential and resource tiers.
//!
//! The site tier has no configured size: it always holds one slot per
//! configured site.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CREDENTIAL_CAPACITY: usize = 1024;
const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 600;
const DEFAULT_RESOURCE_CAPACITY: usize = 100;
const DEFAULT_RESOURCE_TTL_SECS: u64 = 60;

/// Cache configuration from the `[cache]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum credential buckets per site.
    pub credential_capacity: usize,
    /// Lifetime of a credential bucket, in seconds.
    pub credential_ttl_seconds: u64,
    /// Maximum cached resource decisions per credential.
    pub resource_capacity: usize,
    /// Lifetime of a cached resource decision, in seconds.
    pub resource_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            credential_capacity: DEFAULT_CREDENTIAL_CAPACITY,
            credential_ttl_seconds: DEFAULT_CREDENTIAL_TTL_SECS,
            resource_capacity: DEFAULT_RESOURCE_CAPACITY,
            resource_ttl_seconds: DEFAULT_RESOURCE_TTL_SECS,
        }
    }
}

impl CacheConfig {
    /// Returns the credential capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn credential_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.credential_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the resource capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn resource_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.resource_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_seconds)
    }

    pub fn resource_ttl(&self) -> Duration {
        Duration::from_secs(self.resource_ttl_seconds)
    }
}
