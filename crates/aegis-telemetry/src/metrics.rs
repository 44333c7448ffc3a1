//! Metrics collection and reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector for enforcement-path monitoring
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    total_requests: AtomicU64,
    permits: AtomicU64,
    denials: AtomicU64,
    constraint_violations: AtomicU64,
    obligation_failures: AtomicU64,
    total_latency_us: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_requests: AtomicU64::new(0),
                permits: AtomicU64::new(0),
                denials: AtomicU64::new(0),
                constraint_violations: AtomicU64::new(0),
                obligation_failures: AtomicU64::new(0),
                total_latency_us: AtomicU64::new(0),
            }),
        }
    }

    /// Record a request
    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a permitted request
    pub fn record_permit(&self) {
        self.inner.permits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a denied request
    pub fn record_denial(&self) {
        self.inner.denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a constraint violation at egress
    pub fn record_constraint_violation(&self) {
        self.inner
            .constraint_violations
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed obligation
    pub fn record_obligation_failure(&self) {
        self.inner
            .obligation_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record end-to-end latency
    pub fn record_latency(&self, latency_us: u64) {
        self.inner
            .total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            permits: self.inner.permits.load(Ordering::Relaxed),
            denials: self.inner.denials.load(Ordering::Relaxed),
            constraint_violations: self.inner.constraint_violations.load(Ordering::Relaxed),
            obligation_failures: self.inner.obligation_failures.load(Ordering::Relaxed),
            total_latency_us: self.inner.total_latency_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub permits: u64,
    pub denials: u64,
    pub constraint_violations: u64,
    pub obligation_failures: u64,
    pub total_latency_us: u64,
}

impl MetricsSnapshot {
    /// Average end-to-end latency per request
    pub fn avg_latency_us(&self) -> u64 {
        if self.total_requests == 0 {
            0
        } else {
            self.total_latency_us / self.total_requests
        }
    }

    /// Fraction of requests denied
    pub fn denial_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.denials as f64 / self.total_requests as f64
        }
    }
}
