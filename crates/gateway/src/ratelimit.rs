//! Distributed rate limiting.
//!
//! Fixed-window counters keyed by (api, plan, consumer). The store behind
//! [`RateLimitStore`] is pluggable: the in-memory implementation here covers
//! a single gateway instance; multi-instance deployments plug a shared store
//! in behind the same trait. The only locking discipline the contract
//! requires is atomicity of the increment-and-compare at the store, with an
//! atomic window rollover (no lost resets, no double-counting across the
//! boundary).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use portcullis_common::{ApiId, GatewayResult, PlanId, TimeWindow};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Composite counter key: one bucket per (api, plan, consumer) tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub api: ApiId,
    pub plan: PlanId,
    /// Consumer identity from the security chain; None for keyless traffic
    pub consumer: Option<String>,
}

impl RateLimitKey {
    /// Canonical store key
    pub fn canonical(&self) -> String {
        match &self.consumer {
            Some(consumer) => format!("{}:{}:{}", self.api, self.plan, consumer),
            None => format!("{}:{}", self.api, self.plan),
        }
    }
}

/// Counter state for the current window
#[derive(Debug, Clone, Copy)]
pub struct WindowSlot {
    /// Post-increment count within the window
    pub count: u64,
    /// Unix timestamp (seconds) when the window resets
    pub reset_at: u64,
}

/// Pluggable counter store.
///
/// `incr_and_get` must be atomic with respect to concurrent callers: the
/// increment, the limit comparison input it returns and the window rollover
/// all happen under one unit of synchronization at the store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn incr_and_get(
        &self,
        key: &str,
        window: TimeWindow,
        now_secs: u64,
    ) -> GatewayResult<WindowSlot>;
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window (0 when at or over the limit)
    pub remaining: u64,
    /// Unix timestamp (seconds) when the window resets
    pub reset_at: u64,
}

/// Rate limiter service consulted by the `rate-limit` policy
pub struct RateLimiter {
    store: Box<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Box<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Charge one request against the key's quota.
    ///
    /// The rejected attempt still counts: the increment is not reverted when
    /// the post-increment value exceeds the limit (conservative enforcement).
    pub async fn try_consume(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: TimeWindow,
    ) -> GatewayResult<RateLimitDecision> {
        self.try_consume_at(key, limit, window, unix_now_secs()).await
    }

    /// Same as [`try_consume`](Self::try_consume) with an explicit clock,
    /// used by tests to drive window rollover deterministically.
    pub async fn try_consume_at(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: TimeWindow,
        now_secs: u64,
    ) -> GatewayResult<RateLimitDecision> {
        let canonical = key.canonical();
        let slot = self.store.incr_and_get(&canonical, window, now_secs).await?;

        let decision = RateLimitDecision {
            allowed: slot.count <= limit,
            remaining: limit.saturating_sub(slot.count),
            reset_at: slot.reset_at,
        };

        trace!(
            key = %canonical,
            count = slot.count,
            limit,
            allowed = decision.allowed,
            "Rate limit check"
        );

        Ok(decision)
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Single-instance counter store.
///
/// One mutex per key: the increment-and-compare and the window rollover for
/// a key are serialized; unrelated keys never contend.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    counters: DashMap<String, Mutex<CounterSlot>>,
}

#[derive(Debug, Clone, Copy)]
struct CounterSlot {
    window_start: u64,
    count: u64,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn incr_and_get(
        &self,
        key: &str,
        window: TimeWindow,
        now_secs: u64,
    ) -> GatewayResult<WindowSlot> {
        let window_start = window.window_start(now_secs);
        let entry = self.counters.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(CounterSlot {
                window_start,
                count: 0,
            })
        });

        let mut slot = entry.lock();
        if slot.window_start != window_start {
            // Crossed the window boundary: reset under the same lock as the
            // increment so no count is lost or carried over.
            slot.window_start = window_start;
            slot.count = 0;
        }
        slot.count += 1;

        Ok(WindowSlot {
            count: slot.count,
            reset_at: slot.window_start + window.seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Box::new(InMemoryRateLimitStore::new()))
    }

    fn key(consumer: Option<&str>) -> RateLimitKey {
        RateLimitKey {
            api: "orders".into(),
            plan: "free".into(),
            consumer: consumer.map(|c| c.to_string()),
        }
    }

    #[tokio::test]
    async fn test_remaining_counts_down_then_rejects() {
        let limiter = limiter();
        let key = key(Some("acme"));
        let window = TimeWindow::new(60);
        let now = 1_000_020; // mid-window

        for expected_remaining in [4u64, 3, 2, 1, 0] {
            let decision = limiter.try_consume_at(&key, 5, window, now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        // 6th call rejected; remaining stays at 0
        let decision = limiter.try_consume_at(&key, 5, window, now).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_window_rollover_resets_counter() {
        let limiter = limiter();
        let key = key(Some("acme"));
        let window = TimeWindow::new(60);

        for _ in 0..6 {
            limiter.try_consume_at(&key, 5, window, 1_000_020).await.unwrap();
        }

        // Next window starts at 1_000_080
        let decision = limiter
            .try_consume_at(&key, 5, window, 1_000_081)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_at, 1_000_140);
    }

    #[tokio::test]
    async fn test_rejected_attempts_still_count() {
        let limiter = limiter();
        let key = key(Some("acme"));
        let window = TimeWindow::new(60);

        for _ in 0..10 {
            limiter.try_consume_at(&key, 3, window, 500).await.unwrap();
        }

        // The bucket kept counting while rejected; still rejected
        let decision = limiter.try_consume_at(&key, 3, window, 510).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        let window = TimeWindow::new(60);

        let acme = key(Some("acme"));
        let globex = key(Some("globex"));

        limiter.try_consume_at(&acme, 1, window, 100).await.unwrap();
        let rejected = limiter.try_consume_at(&acme, 1, window, 100).await.unwrap();
        assert!(!rejected.allowed);

        let other = limiter.try_consume_at(&globex, 1, window, 100).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_exceed_limit_plus_race_margin() {
        use std::sync::Arc;

        let limiter = Arc::new(limiter());
        let window = TimeWindow::new(60);
        let mut handles = Vec::new();

        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let key = RateLimitKey {
                    api: "orders".into(),
                    plan: "free".into(),
                    consumer: Some("acme".to_string()),
                };
                limiter
                    .try_consume_at(&key, 10, window, 100)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(key(Some("acme")).canonical(), "orders:free:acme");
        assert_eq!(key(None).canonical(), "orders:free");
    }
}
