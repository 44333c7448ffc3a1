//! Per-key sliding-window rate limiting
//!
//! Each key owns a bounded deque of admission instants behind its own lock;
//! the outer map lock is held only long enough to fetch or create the window,
//! so admissions on different keys never contend. Admission is linearizable
//! per key and O(limit) worst case.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use aegis_core::context::DecisionContext;

/// Result of an admission attempt
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the event was admitted
    pub allowed: bool,

    /// Admissions left in the current window
    pub remaining: u32,

    /// When the window frees up
    pub reset_at: Instant,

    /// How long a denied caller should wait
    pub retry_after: Option<Duration>,
}

struct Window {
    timestamps: VecDeque<Instant>,
}

/// Shared sliding-window limiter
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, Arc<Mutex<Window>>>>,
}

impl SlidingWindowLimiter {
    /// Create an empty limiter
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to admit one event for `key`
    pub fn admit(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        self.admit_at(key, limit, window, Instant::now())
    }

    pub(crate) fn admit_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        let slot = {
            let mut map = self.windows.lock();
            map.entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Window {
                        timestamps: VecDeque::with_capacity(limit as usize),
                    }))
                })
                .clone()
        };

        let mut win = slot.lock();

        // Drop everything outside the window
        while let Some(&oldest) = win.timestamps.front() {
            if now.duration_since(oldest) >= window {
                win.timestamps.pop_front();
            } else {
                break;
            }
        }

        let count = win.timestamps.len() as u32;
        if count < limit {
            win.timestamps.push_back(now);
            RateDecision {
                allowed: true,
                remaining: limit - count - 1,
                reset_at: now + window,
                retry_after: None,
            }
        } else {
            // Window is full: it frees when the oldest admission ages out.
            // A zero limit never frees; report the full window.
            let reset_at = match win.timestamps.front() {
                Some(&oldest) => oldest + window,
                None => now + window,
            };
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after: Some(reset_at.saturating_duration_since(now)),
            }
        }
    }

    /// Evict keys whose windows hold no live timestamps
    pub fn sweep(&self, window: Duration) {
        self.sweep_at(window, Instant::now());
    }

    fn sweep_at(&self, window: Duration, now: Instant) {
        let mut map = self.windows.lock();
        let before = map.len();
        map.retain(|_, slot| {
            let win = slot.lock();
            win.timestamps
                .back()
                .is_some_and(|&t| now.duration_since(t) < window)
        });
        if map.len() != before {
            debug!(evicted = before - map.len(), "rate limiter sweep");
        }
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Spawn a background sweeper on the given interval
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        max_window: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep(max_window);
            }
        })
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the per-request rate-limit key
///
/// Default template is `{agent}:{action}:{resource_root}`; the client IP is
/// appended when configured.
#[derive(Debug, Clone)]
pub struct RateLimitKey {
    include_client_ip: bool,
}

impl RateLimitKey {
    pub fn new(include_client_ip: bool) -> Self {
        Self { include_client_ip }
    }

    /// Render the key for a context
    pub fn render(&self, ctx: &DecisionContext) -> String {
        let root = resource_root(&ctx.resource);
        let mut key = format!("{}:{}:{}", ctx.agent, ctx.action, root);
        if self.include_client_ip {
            if let Some(ref ip) = ctx.environment.client_ip {
                key.push(':');
                key.push_str(ip);
            }
        }
        key
    }
}

impl Default for RateLimitKey {
    fn default() -> Self {
        Self::new(false)
    }
}

/// The tool/scheme portion of a namespaced resource identifier
fn resource_root(resource: &str) -> &str {
    resource.split(':').next().unwrap_or(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_millis(1_000);

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();

        for i in 0..10 {
            let d = limiter.admit_at("k", 10, WINDOW, t0 + Duration::from_millis(i * 10));
            assert!(d.allowed, "admission {} should pass", i);
            assert_eq!(d.remaining, 9 - i as u32);
        }

        let d = limiter.admit_at("k", 10, WINDOW, t0 + Duration::from_millis(100));
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        let retry = d.retry_after.unwrap();
        assert!(retry > Duration::ZERO && retry <= WINDOW);
    }

    #[test]
    fn test_zero_limit_always_denies() {
        let limiter = SlidingWindowLimiter::new();
        let d = limiter.admit_at("k", 0, WINDOW, Instant::now());
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Some(WINDOW));
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit_at("k", 1, WINDOW, t0).allowed);
        assert!(!limiter.admit_at("k", 1, WINDOW, t0 + Duration::from_millis(500)).allowed);
        // First admission aged out
        assert!(limiter.admit_at("k", 1, WINDOW, t0 + Duration::from_millis(1_001)).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit_at("a", 1, WINDOW, t0).allowed);
        assert!(limiter.admit_at("b", 1, WINDOW, t0).allowed);
        assert!(!limiter.admit_at("a", 1, WINDOW, t0).allowed);
    }

    #[test]
    fn test_denied_attempts_do_not_consume() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit_at("k", 1, WINDOW, t0).allowed);
        for i in 1..50 {
            assert!(!limiter.admit_at("k", 1, WINDOW, t0 + Duration::from_millis(i)).allowed);
        }
        // The original admission still ages out on schedule
        assert!(limiter.admit_at("k", 1, WINDOW, t0 + Duration::from_millis(1_000)).allowed);
    }

    #[test]
    fn test_retry_after_points_at_oldest_expiry() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();

        limiter.admit_at("k", 2, WINDOW, t0);
        limiter.admit_at("k", 2, WINDOW, t0 + Duration::from_millis(400));

        let d = limiter.admit_at("k", 2, WINDOW, t0 + Duration::from_millis(600));
        assert!(!d.allowed);
        assert_eq!(d.retry_after.unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn test_sweep_evicts_idle_keys() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Instant::now();

        limiter.admit_at("old", 10, WINDOW, t0);
        limiter.admit_at("fresh", 10, WINDOW, t0 + Duration::from_millis(900));
        assert_eq!(limiter.key_count(), 2);

        limiter.sweep_at(WINDOW, t0 + Duration::from_millis(1_500));
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_key_rendering() {
        use aegis_core::context::{ContextCollector, ContextConfig};
        use aegis_core::request::InboundRequest;
        use chrono::{TimeZone, Utc};

        let req = InboundRequest::tool_call("r1", "filesystem__read_file")
            .with_arguments(serde_json::json!({"path": "/tmp/a.txt"}))
            .with_client_ip("203.0.113.9");
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let ctx = ContextCollector::new(&ContextConfig::default())
            .unwrap()
            .collect(&req, now)
            .unwrap();

        assert_eq!(
            RateLimitKey::default().render(&ctx),
            "r1:tools/call:filesystem__read_file"
        );
        assert_eq!(
            RateLimitKey::new(true).render(&ctx),
            "r1:tools/call:filesystem__read_file:203.0.113.9"
        );
    }

    proptest! {
        /// In any rolling window of length W, at most `limit` admissions succeed
        #[test]
        fn prop_never_exceeds_limit_in_window(
            offsets in proptest::collection::vec(0u64..5_000, 1..200),
            limit in 1u32..20,
        ) {
            let mut offsets = offsets;
            offsets.sort_unstable();

            let limiter = SlidingWindowLimiter::new();
            let t0 = Instant::now();
            let window = Duration::from_millis(1_000);
            let mut admitted: Vec<u64> = Vec::new();

            for off in offsets {
                let d = limiter.admit_at("k", limit, window, t0 + Duration::from_millis(off));
                if d.allowed {
                    admitted.push(off);
                    let in_window = admitted
                        .iter()
                        .filter(|&&t| off - t < 1_000)
                        .count();
                    prop_assert!(in_window <= limit as usize);
                }
            }
        }
    }
}
