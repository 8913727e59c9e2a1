//! Cached view of the remote daily download allowance.
//!
//! The remote service is the source of truth; the cache only exists so the
//! download stage can gate dispatch without a network round trip per item.
//! Races on the cache over-throttle, never over-consume.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::sources::QuotaSource;

/// Default cache TTL in minutes.
pub const DEFAULT_CACHE_TTL_MINUTES: u64 = 5;

/// Cached remote daily download allowance.
#[derive(Debug, Clone)]
pub struct DownloadQuota {
    /// Downloads left today, local view.
    pub remaining: i64,
    /// Daily cap reported by the remote service.
    pub daily_limit: i64,
    /// When the cache was last refreshed from the remote service.
    pub last_checked: Instant,
    /// When the remote allowance resets, if the service said.
    pub next_reset: Option<String>,
}

impl DownloadQuota {
    /// `true` when at least one download is left.
    #[must_use]
    pub fn has_quota_available(&self) -> bool {
        self.remaining > 0
    }

    /// `true` once the cache is older than the TTL.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.last_checked.elapsed() > ttl
    }
}

/// Manages the cached allowance for one remote account.
pub struct QuotaManager {
    source: Arc<dyn QuotaSource>,
    cache_ttl: Duration,
    cached: Mutex<Option<DownloadQuota>>,
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl QuotaManager {
    /// Creates a quota manager over the given remote source.
    #[must_use]
    pub fn new(source: Arc<dyn QuotaSource>, cache_ttl_minutes: u64) -> Self {
        Self {
            source,
            cache_ttl: Duration::from_secs(cache_ttl_minutes * 60),
            cached: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<DownloadQuota>> {
        match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the current allowance, refreshing from the remote service
    /// when the cache is missing, expired, or `force_refresh` is set.
    ///
    /// # Errors
    ///
    /// Returns a network error (`quota_check_failed`) when the remote
    /// service cannot be reached.
    #[instrument(skip(self))]
    pub async fn get_current_quota(&self, force_refresh: bool) -> Result<DownloadQuota, EngineError> {
        if !force_refresh
            && let Some(cached) = self.guard().clone()
            && !cached.is_expired(self.cache_ttl)
        {
            debug!(
                remaining = cached.remaining,
                daily_limit = cached.daily_limit,
                "using cached quota"
            );
            return Ok(cached);
        }

        let snapshot = self
            .source
            .get_quota()
            .await
            .map_err(|e| EngineError::network(format!("quota_check_failed: {e}")))?;

        let quota = DownloadQuota {
            remaining: snapshot.remaining,
            daily_limit: snapshot.daily_limit,
            last_checked: Instant::now(),
            next_reset: snapshot.next_reset,
        };
        info!(
            remaining = quota.remaining,
            daily_limit = quota.daily_limit,
            "quota refreshed"
        );
        *self.guard() = Some(quota.clone());
        Ok(quota)
    }

    /// Synchronous availability check against the cache.
    ///
    /// Returns `false` when the cache is empty; callers are expected to
    /// refresh via [`Self::get_current_quota`] and ask again. An expired
    /// cache still answers from the stale value rather than blocking.
    #[must_use]
    pub fn has_quota_available(&self) -> bool {
        match self.guard().as_ref() {
            Some(quota) => {
                if quota.is_expired(self.cache_ttl) {
                    debug!("quota cache expired, answering from stale value");
                }
                quota.has_quota_available()
            }
            None => {
                warn!("quota cache empty, refresh required");
                false
            }
        }
    }

    /// `true` when the cache is empty or past its TTL.
    #[must_use]
    pub fn cache_is_stale(&self) -> bool {
        match self.guard().as_ref() {
            Some(quota) => quota.is_expired(self.cache_ttl),
            None => true,
        }
    }

    /// Locally decrements the allowance by `count`.
    ///
    /// Returns `false` when the cache is empty or holds fewer than `count`
    /// remaining downloads; the caller must treat that as quota exhaustion.
    pub fn consume_quota(&self, count: i64) -> bool {
        let mut guard = self.guard();
        let Some(quota) = guard.as_mut() else {
            warn!("quota cache empty, cannot consume");
            return false;
        };
        if quota.remaining >= count {
            quota.remaining -= count;
            info!(
                consumed = count,
                remaining = quota.remaining,
                daily_limit = quota.daily_limit,
                "quota consumed"
            );
            true
        } else {
            warn!(
                requested = count,
                remaining = quota.remaining,
                "quota insufficient"
            );
            false
        }
    }

    /// Clears the cache; the next query refreshes from the remote service.
    pub fn reset_cache(&self) {
        debug!("quota cache reset");
        *self.guard() = None;
    }

    /// Snapshot of the cached allowance for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> Option<DownloadQuota> {
        self.guard().clone()
    }
}
