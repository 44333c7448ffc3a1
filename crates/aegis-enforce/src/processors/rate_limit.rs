//! Sliding-window admission as a constraint processor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aegis_core::context::DecisionContext;
use aegis_core::directive::Directive;
use aegis_core::error::{Error, Result};

use crate::constraint::ConstraintProcessor;
use crate::rate_limiter::{RateLimitKey, SlidingWindowLimiter};

/// Applies `N per window` directives through the shared limiter
pub struct RateLimitProcessor {
    limiter: Arc<SlidingWindowLimiter>,
    key: RateLimitKey,
}

impl RateLimitProcessor {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, key: RateLimitKey) -> Self {
        Self { limiter, key }
    }
}

#[async_trait]
impl ConstraintProcessor for RateLimitProcessor {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn can_process(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::RateLimit { .. })
    }

    async fn apply(
        &self,
        directive: &Directive,
        mut payload: serde_json::Value,
        ctx: &DecisionContext,
    ) -> Result<serde_json::Value> {
        let Directive::RateLimit { limit, window_ms } = directive else {
            return Ok(payload);
        };

        let key = self.key.render(ctx);
        let decision = self
            .limiter
            .admit(&key, *limit, Duration::from_millis(*window_ms));

        if !decision.allowed {
            let retry_after_ms = decision
                .retry_after
                .map(|d| d.as_millis() as u64)
                .unwrap_or(*window_ms);
            return Err(Error::RateLimitExceeded { retry_after_ms });
        }

        // Surface window state the way a gateway surfaces rate-limit headers
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "_rate_limit".to_string(),
                serde_json::json!({
                    "limit": limit,
                    "remaining": decision.remaining,
                }),
            );
        }
        Ok(payload)
    }
}
