use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};

/// At most `max_calls` per `window_ms`, refilled evenly across the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_calls: usize,
    pub window_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_calls: 20,
            window_ms: 1_000,
        }
    }
}

impl RateLimit {
    /// GCRA quota: one cell per `window / max_calls`, bursting to `max_calls`.
    pub fn quota(&self) -> Quota {
        let burst = u32::try_from(self.max_calls)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_millis(self.window_ms)
            .checked_div(burst.get())
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_micros(1));
        Quota::with_period(period)
            .map(|quota| quota.allow_burst(burst))
            .unwrap_or_else(|| Quota::per_second(burst))
    }
}

/// Call limiter shared by `&self`; safe to use from several threads.
pub struct CallRateLimiter {
    limit: RateLimit,
    limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for CallRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRateLimiter")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl CallRateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            limiter: RateLimiter::direct(limit.quota()),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take one cell if the quota allows it.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
