//! Provider availability cache.
//!
//! Probing a local server or the on-device runtime is expensive, so the
//! result is kept for [`AVAILABILITY_TTL`]. A cached answer younger than
//! the TTL is always reused; an expired one is always re-probed.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::future::Future;
use std::time::Duration;

use crate::providers::ProviderId;

pub const AVAILABILITY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Availability {
    pub available: bool,
    pub checked_at: DateTime<Utc>,
}

pub struct AvailabilityCache {
    cache: Cache<ProviderId, Availability>,
}

impl AvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(ProviderId::ALL.len() as u64)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    /// Return the cached availability of `provider`, running `probe` when
    /// there is no fresh entry.
    pub async fn check<F, Fut>(&self, provider: ProviderId, probe: F) -> Availability
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        if let Some(cached) = self.cache.get(&provider).await {
            tracing::debug!(provider = %provider, available = cached.available, "Availability (cached)");
            return cached;
        }

        let result = Availability {
            available: probe().await,
            checked_at: Utc::now(),
        };
        tracing::info!(provider = %provider, available = result.available, "Availability probed");
        self.cache.insert(provider, result).await;
        result
    }

    /// Forget the cached result for `provider`.
    pub async fn invalidate(&self, provider: ProviderId) {
        self.cache.invalidate(&provider).await;
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new(AVAILABILITY_TTL)
    }
}
