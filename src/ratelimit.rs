//! Per-tenant, per-source webhook rate limiting. Limiter state is
//! process-local, not shared across replicas.
//!
//! Each `(tenant, source)` pair gets its own token bucket, configured from
//! that tenant's `NamespacePolicy.spec.webhookAuth.rateLimit`. Buckets are
//! created lazily on first use and never shared across tenants, so one
//! tenant's webhook traffic can never exhaust another's budget.

use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};

use crate::crd::RateLimitConfig;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Holds one token bucket per `(tenant, source)` pair observed so far.
/// Buckets are never evicted; cardinality is bounded by the number of
/// tenant/source pairs actually in use, which is small relative to
/// request volume.
#[derive(Default)]
pub struct RateLimiters {
    buckets: DashMap<(String, String), Arc<Bucket>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and consumes one token from the `(tenant, source)` bucket,
    /// creating it from `config` on first use. Returns `true` if the
    /// request is admitted, `false` if it must be rejected with 429
    /// (`ErrorKind::RateLimited`).
    pub fn check(&self, tenant: &str, source: &str, config: &RateLimitConfig) -> bool {
        let key = (tenant.to_string(), source.to_string());
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(build_bucket(config)))
            .clone();
        bucket.check().is_ok()
    }

    /// Drops the bucket for a `(tenant, source)` pair, e.g. after the
    /// tenant's policy changes its rate limit (the next `check` rebuilds it
    /// from the new config).
    pub fn reset(&self, tenant: &str, source: &str) {
        self.buckets.remove(&(tenant.to_string(), source.to_string()));
    }
}

fn build_bucket(config: &RateLimitConfig) -> Bucket {
    let per_minute = NonZeroU32::new(config.requests_per_minute.max(1)).expect("nonzero after max(1)");
    let burst = NonZeroU32::new(config.burst_size.max(1)).expect("nonzero after max(1)");
    let quota = Quota::per_minute(per_minute).allow_burst(burst);
    RateLimiter::direct(quota)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests_per_minute: u32, burst_size: u32) -> RateLimitConfig {
        RateLimitConfig { requests_per_minute, burst_size }
    }

    #[test]
    fn test_burst_is_admitted_then_exhausted() {
        let limiters = RateLimiters::new();
        let cfg = config(60, 2);
        assert!(limiters.check("team-alpha", "github", &cfg));
        assert!(limiters.check("team-alpha", "github", &cfg));
        assert!(!limiters.check("team-alpha", "github", &cfg));
    }

    #[test]
    fn test_tenants_have_independent_buckets() {
        let limiters = RateLimiters::new();
        let cfg = config(60, 1);
        assert!(limiters.check("team-alpha", "github", &cfg));
        assert!(!limiters.check("team-alpha", "github", &cfg));
        assert!(limiters.check("team-beta", "github", &cfg), "a different tenant must not be throttled by team-alpha's usage");
    }

    #[test]
    fn test_sources_within_a_tenant_have_independent_buckets() {
        let limiters = RateLimiters::new();
        let cfg = config(60, 1);
        assert!(limiters.check("team-alpha", "github", &cfg));
        assert!(!limiters.check("team-alpha", "github", &cfg));
        assert!(limiters.check("team-alpha", "slack", &cfg));
    }

    #[test]
    fn test_reset_rebuilds_bucket() {
        let limiters = RateLimiters::new();
        let cfg = config(60, 1);
        assert!(limiters.check("team-alpha", "github", &cfg));
        assert!(!limiters.check("team-alpha", "github", &cfg));
        limiters.reset("team-alpha", "github");
        assert!(limiters.check("team-alpha", "github", &cfg));
    }
}
