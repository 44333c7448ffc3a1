//! Daily time-window gating

use async_trait::async_trait;

use aegis_core::context::DecisionContext;
use aegis_core::directive::Directive;
use aegis_core::error::{Error, Result};

use crate::constraint::ConstraintProcessor;

/// Asserts the request time falls inside a directive's daily window
pub struct TimeWindowProcessor;

#[async_trait]
impl ConstraintProcessor for TimeWindowProcessor {
    fn name(&self) -> &str {
        "time-window"
    }

    fn can_process(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::TimeWindow { .. })
    }

    async fn apply(
        &self,
        directive: &Directive,
        payload: serde_json::Value,
        ctx: &DecisionContext,
    ) -> Result<serde_json::Value> {
        let Directive::TimeWindow { start_min, end_min } = directive else {
            return Ok(payload);
        };

        let minutes = ctx.minutes_of_day();
        let inside = if start_min <= end_min {
            minutes >= *start_min && minutes < *end_min
        } else {
            minutes >= *start_min || minutes < *end_min
        };

        if !inside {
            return Err(Error::ConstraintViolated(format!(
                "request at minute {} outside window {:02}:{:02}-{:02}:{:02}",
                minutes,
                start_min / 60,
                start_min % 60,
                end_min / 60,
                end_min % 60
            )));
        }

        Ok(payload)
    }
}
