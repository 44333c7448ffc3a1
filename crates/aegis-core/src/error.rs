//! Error types for Aegis

use serde::{Deserialize, Serialize};

/// Result type alias using Aegis' Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Aegis operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request could not be normalized into a decision context
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// The requesting agent appears in its own delegation chain
    #[error("delegation cycle: agent '{0}' appears in its own chain")]
    DelegationCycle(String),

    /// Delegation chain is deeper than the configured maximum
    #[error("delegation depth {depth} exceeds maximum {max}")]
    DelegationDepthExceeded { depth: usize, max: usize },

    /// The decision engine denied the request
    #[error("policy denied: {0}")]
    PolicyDeny(String),

    /// A constraint processor rejected the response
    #[error("constraint violated: {0}")]
    ConstraintViolated(String),

    /// A constraint processor exceeded its deadline
    #[error("constraint timed out: {0}")]
    ConstraintTimeout(String),

    /// Sliding-window admission failed
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    /// Decision engine failures (rules, cache, orchestration)
    #[error("engine error: {0}")]
    Engine(String),

    /// AI judge call exceeded its deadline
    #[error("ai judge timed out")]
    AiTimeout,

    /// AI judge endpoint could not be reached
    #[error("ai judge unreachable: {0}")]
    AiUnreachable(String),

    /// Upstream tool server failure
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An obligation executor failed after retries
    #[error("obligation failed: {0}")]
    ObligationFailed(String),

    /// Audit sink failure (side path, never surfaced to callers)
    #[error("audit error: {0}")]
    Audit(String),

    /// Policy loading / parsing errors
    #[error("policy error: {0}")]
    Policy(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new invalid-context error
    pub fn invalid_context(msg: impl Into<String>) -> Self {
        Self::InvalidContext(msg.into())
    }

    /// Create a new engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a new policy error
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Stable machine-readable code for the wire
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidContext(_) => ErrorCode::InvalidContext,
            Self::DelegationCycle(_) => ErrorCode::DelegationCycle,
            Self::DelegationDepthExceeded { .. } => ErrorCode::DelegationDepthExceeded,
            Self::PolicyDeny(_) => ErrorCode::PolicyDeny,
            Self::ConstraintViolated(_) => ErrorCode::ConstraintViolated,
            Self::ConstraintTimeout(_) => ErrorCode::ConstraintTimeout,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::Engine(_) | Self::AiTimeout | Self::AiUnreachable(_) => ErrorCode::EngineError,
            Self::Upstream(_) => ErrorCode::UpstreamError,
            Self::ObligationFailed(_) => ErrorCode::ObligationFailed,
            Self::Audit(_) => ErrorCode::AuditFailed,
            Self::Policy(_) | Self::Config(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorCode::EngineError
            }
        }
    }
}

/// Machine-readable error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PolicyDeny,
    InvalidContext,
    ConstraintViolated,
    ConstraintTimeout,
    RateLimitExceeded,
    DelegationCycle,
    DelegationDepthExceeded,
    EngineError,
    UpstreamError,
    ObligationFailed,
    AuditFailed,
}

/// Structured error returned to the caller instead of an upstream response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Additional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Original request id, echoed for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// Build a response from an error, echoing the request id
    pub fn from_error(err: &Error, request_id: Option<String>) -> Self {
        let details = match err {
            Error::RateLimitExceeded { retry_after_ms } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after_ms }))
            }
            Error::DelegationDepthExceeded { depth, max } => {
                Some(serde_json::json!({ "depth": depth, "max": max }))
            }
            _ => None,
        };

        Self {
            code: err.code(),
            message: err.to_string(),
            details,
            request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map() {
        assert_eq!(
            Error::PolicyDeny("write prohibited".into()).code(),
            ErrorCode::PolicyDeny
        );
        assert_eq!(
            Error::RateLimitExceeded { retry_after_ms: 250 }.code(),
            ErrorCode::RateLimitExceeded
        );
        assert_eq!(Error::AiTimeout.code(), ErrorCode::EngineError);
    }

    #[test]
    fn test_error_response_serialization() {
        let err = Error::RateLimitExceeded { retry_after_ms: 900 };
        let resp = ErrorResponse::from_error(&err, Some("req-1".into()));

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(json["details"]["retry_after_ms"], 900);
        assert_eq!(json["request_id"], "req-1");
    }

    #[test]
    fn test_delegation_errors() {
        let err = Error::DelegationDepthExceeded { depth: 5, max: 3 };
        assert_eq!(err.code(), ErrorCode::DelegationDepthExceeded);
        assert!(err.to_string().contains("5"));
    }
}
