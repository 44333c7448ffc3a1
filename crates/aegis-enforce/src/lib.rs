//! Aegis Enforcement
//!
//! Everything that happens to a request after the decision: the
//! [`ConstraintManager`] shapes or rejects the upstream response under the
//! decision's constraint directives, the [`ObligationManager`] runs
//! fire-and-forget post-decision work, and the [`SlidingWindowLimiter`]
//! provides per-key admission control to both.

pub mod constraint;
pub mod obligation;
pub mod processors;
pub mod rate_limiter;

pub use constraint::{
    ensure_rate_limit, ConstraintManager, ConstraintProcessor, EnforcementConfig, GeoPrefix,
};
pub use obligation::{
    NotifyExecutor, ObligationExecutor, ObligationManager, ObligationRecord, ObligationReport,
    RetentionExecutor,
};
pub use processors::{
    AnonymizeProcessor, GeoRestrictProcessor, RateLimitProcessor, TimeWindowProcessor,
};
pub use rate_limiter::{RateDecision, RateLimitKey, SlidingWindowLimiter};
