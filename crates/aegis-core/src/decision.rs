//! Decision types produced by the policy engines

use serde::{Deserialize, Serialize};

/// Final verdict for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Permit,
    Deny,
    /// Neither engine could decide. Coerced to DENY at the enforcer boundary.
    Indeterminate,
}

impl Verdict {
    /// Fail-closed check: only PERMIT allows the upstream call
    pub fn allows(&self) -> bool {
        matches!(self, Self::Permit)
    }
}

/// Which engine produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineKind {
    Rules,
    Ai,
    Hybrid,
    Cache,
}

/// Metadata attached to every decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionMetadata {
    /// Engine that produced the verdict
    pub engine: EngineKind,

    /// Wall-clock evaluation time
    pub evaluation_time_ms: u64,

    /// Whether the decision was served from cache
    pub cached: bool,
}

/// A rendered policy decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// PERMIT / DENY / INDETERMINATE
    pub verdict: Verdict,

    /// Human-readable reason
    pub reason: String,

    /// Confidence in [0, 1]; 1.0 for deterministic rule fires
    pub confidence: f64,

    /// Constraint directives to apply to the response
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,

    /// Obligation directives to execute after the call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<String>,

    /// Provenance metadata
    pub metadata: DecisionMetadata,
}

impl Decision {
    /// Create a PERMIT decision
    pub fn permit(reason: impl Into<String>, confidence: f64, engine: EngineKind) -> Self {
        Self::new(Verdict::Permit, reason, confidence, engine)
    }

    /// Create a DENY decision
    pub fn deny(reason: impl Into<String>, confidence: f64, engine: EngineKind) -> Self {
        Self::new(Verdict::Deny, reason, confidence, engine)
    }

    /// Create an INDETERMINATE decision
    pub fn indeterminate(reason: impl Into<String>, engine: EngineKind) -> Self {
        Self::new(Verdict::Indeterminate, reason, 0.0, engine)
    }

    fn new(verdict: Verdict, reason: impl Into<String>, confidence: f64, engine: EngineKind) -> Self {
        Self {
            verdict,
            reason: reason.into(),
            confidence,
            constraints: Vec::new(),
            obligations: Vec::new(),
            metadata: DecisionMetadata {
                engine,
                evaluation_time_ms: 0,
                cached: false,
            },
        }
    }

    /// Attach constraint directives
    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Attach obligation directives
    pub fn with_obligations(mut self, obligations: Vec<String>) -> Self {
        self.obligations = obligations;
        self
    }
}
