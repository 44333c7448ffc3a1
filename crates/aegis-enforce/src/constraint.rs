//! Constraint dispatch
//!
//! Constraint directives shape or reject the upstream response before it is
//! released. Each parsed directive is handed to the first registered
//! processor whose `can_process` matches, under a per-processor deadline.
//! Directives nothing can process are soft failures: logged, never executed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aegis_core::context::DecisionContext;
use aegis_core::directive::Directive;
use aegis_core::error::{Error, Result};

/// Enforcement configuration shared by constraint and obligation managers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Per-processor deadline
    #[serde(default = "default_timeout_ms")]
    pub constraint_timeout_ms: u64,

    /// Per-executor deadline
    #[serde(default = "default_timeout_ms")]
    pub obligation_timeout_ms: u64,

    /// Extra attempts for a failed obligation
    #[serde(default = "default_obligation_retries")]
    pub obligation_retries: u32,

    /// Rate limit applied to permitted requests that carry no explicit one
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit: String,

    /// Append the client IP to rate-limit keys
    #[serde(default)]
    pub rate_key_include_client_ip: bool,

    /// JSON keys masked by the anonymizer
    #[serde(default = "default_pii_keys")]
    pub pii_keys: Vec<String>,

    /// IP prefix → ISO country code table for the geo restrictor
    #[serde(default)]
    pub geo_prefixes: Vec<GeoPrefix>,
}

/// One IP prefix → country mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoPrefix {
    pub prefix: String,
    pub country: String,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            constraint_timeout_ms: default_timeout_ms(),
            obligation_timeout_ms: default_timeout_ms(),
            obligation_retries: default_obligation_retries(),
            default_rate_limit: default_rate_limit(),
            rate_key_include_client_ip: false,
            pii_keys: default_pii_keys(),
            geo_prefixes: Vec::new(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_obligation_retries() -> u32 {
    1
}

fn default_rate_limit() -> String {
    "100/min".to_string()
}

fn default_pii_keys() -> Vec<String> {
    ["email", "phone", "ssn", "credit_card", "address", "full_name"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Trait for all constraint processors
#[async_trait]
pub trait ConstraintProcessor: Send + Sync {
    /// Processor name for logs and timeout reports
    fn name(&self) -> &str;

    /// Whether this processor handles the directive
    fn can_process(&self, directive: &Directive) -> bool;

    /// Apply the directive, returning the (possibly transformed) payload
    async fn apply(
        &self,
        directive: &Directive,
        payload: serde_json::Value,
        ctx: &DecisionContext,
    ) -> Result<serde_json::Value>;
}

/// Dispatches constraint directives to registered processors in order
pub struct ConstraintManager {
    processors: Vec<Arc<dyn ConstraintProcessor>>,
    timeout: Duration,
}

impl ConstraintManager {
    /// Create a manager with no processors registered
    pub fn new(timeout: Duration) -> Self {
        Self {
            processors: Vec::new(),
            timeout,
        }
    }

    /// Register a processor; dispatch prefers earlier registrations
    pub fn register(mut self, processor: Arc<dyn ConstraintProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Apply every directive in order to the payload
    ///
    /// Any processor error aborts the whole request; the caller must not
    /// release the payload. Unmatched directives proceed with a warning.
    pub async fn apply(
        &self,
        directives: &[String],
        mut payload: serde_json::Value,
        ctx: &DecisionContext,
    ) -> Result<serde_json::Value> {
        for raw in directives {
            let directive = Directive::parse(raw);

            let Some(processor) = self
                .processors
                .iter()
                .find(|p| p.can_process(&directive))
            else {
                warn!(directive = %raw, "no processor for directive, skipping");
                continue;
            };

            debug!(directive = %raw, processor = processor.name(), "applying constraint");

            payload = match tokio::time::timeout(
                self.timeout,
                processor.apply(&directive, payload, ctx),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::ConstraintTimeout(format!(
                        "processor '{}' exceeded {}ms on '{}'",
                        processor.name(),
                        self.timeout.as_millis(),
                        raw
                    )));
                }
            };
        }

        Ok(payload)
    }
}

/// Prepend the default rate limit when no explicit one is present
pub fn ensure_rate_limit(directives: &[String], default_limit: &str) -> Vec<String> {
    let has_limit = directives
        .iter()
        .any(|d| matches!(Directive::parse(d), Directive::RateLimit { .. }));
    if has_limit {
        directives.to_vec()
    } else {
        let mut out = Vec::with_capacity(directives.len() + 1);
        out.push(default_limit.to_string());
        out.extend_from_slice(directives);
        out
    }
}
