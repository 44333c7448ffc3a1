//! Aegis Policy
//!
//! The hybrid decision engine: deterministic ODRL-style rule evaluation,
//! an external AI judge with timeout and fallback, and a TTL decision cache,
//! orchestrated by [`HybridEngine`].
//!
//! Policies are immutable once loaded; mutations swap in a new compiled
//! [`PolicySet`] and bump a monotonic version that is folded into every
//! cache fingerprint, so stale entries can never be served.

pub mod cache;
pub mod engine;
pub mod evaluator;
pub mod judge;
pub mod rule;

pub use cache::{CacheConfig, DecisionCache};
pub use engine::{EngineConfig, EngineStats, HybridEngine};
pub use evaluator::{evaluate, PolicySet, RuleOutcome};
pub use judge::{HttpJudge, Judge, JudgeConfig};
pub use rule::{
    ActionRef, ConstraintOperator, Duty, LeftOperand, Policy, PolicyStatus, Rule, RuleConstraint,
    RuleKind, TargetRef,
};
