//! Geographic gating on the client IP

use async_trait::async_trait;

use aegis_core::context::DecisionContext;
use aegis_core::directive::Directive;
use aegis_core::error::{Error, Result};

use crate::constraint::GeoPrefix;
use crate::constraint::ConstraintProcessor;

/// Asserts the client IP resolves to an allowed country
///
/// Resolution is a longest-prefix match over a configured table; requests
/// with no client IP or no resolvable country fail closed.
pub struct GeoRestrictProcessor {
    prefixes: Vec<GeoPrefix>,
}

impl GeoRestrictProcessor {
    pub fn new(mut prefixes: Vec<GeoPrefix>) -> Self {
        // Longest prefix first so the most specific mapping wins
        prefixes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { prefixes }
    }

    fn country_of(&self, ip: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|p| ip.starts_with(&p.prefix))
            .map(|p| p.country.as_str())
    }
}

#[async_trait]
impl ConstraintProcessor for GeoRestrictProcessor {
    fn name(&self) -> &str {
        "geo-restrict"
    }

    fn can_process(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::GeoRestrict { .. })
    }

    async fn apply(
        &self,
        directive: &Directive,
        payload: serde_json::Value,
        ctx: &DecisionContext,
    ) -> Result<serde_json::Value> {
        let Directive::GeoRestrict { countries } = directive else {
            return Ok(payload);
        };

        let Some(ref ip) = ctx.environment.client_ip else {
            return Err(Error::ConstraintViolated(
                "geo restriction requires a client ip".into(),
            ));
        };

        let Some(country) = self.country_of(ip) else {
            return Err(Error::ConstraintViolated(format!(
                "country of {} could not be resolved",
                ip
            )));
        };

        if !countries.iter().any(|c| c == country) {
            return Err(Error::ConstraintViolated(format!(
                "country {} not in allowed set {:?}",
                country, countries
            )));
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::context::{ContextCollector, ContextConfig};
    use aegis_core::request::InboundRequest;
    use chrono::{TimeZone, Utc};

    fn processor() -> GeoRestrictProcessor {
        GeoRestrictProcessor::new(vec![
            GeoPrefix {
                prefix: "203.0.113.".into(),
                country: "JP".into(),
            },
            GeoPrefix {
                prefix: "198.51.100.".into(),
                country: "US".into(),
            },
        ])
    }

    fn ctx(ip: Option<&str>) -> DecisionContext {
        let mut req = InboundRequest::tool_call("t1", "tool");
        req.client_ip = ip.map(|s| s.to_string());
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        ContextCollector::new(&ContextConfig::default())
            .unwrap()
            .collect(&req, now)
            .unwrap()
    }

    fn restrict(countries: &[&str]) -> Directive {
        Directive::GeoRestrict {
            countries: countries.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_allowed_country_passes() {
        let out = processor()
            .apply(&restrict(&["JP"]), serde_json::json!({}), &ctx(Some("203.0.113.7")))
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_disallowed_country_rejected() {
        let err = processor()
            .apply(&restrict(&["JP"]), serde_json::json!({}), &ctx(Some("198.51.100.7")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolated(_)));
    }

    #[tokio::test]
    async fn test_missing_ip_fails_closed() {
        let err = processor()
            .apply(&restrict(&["JP"]), serde_json::json!({}), &ctx(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolated(_)));
    }

    #[tokio::test]
    async fn test_unresolvable_ip_fails_closed() {
        let err = processor()
            .apply(&restrict(&["JP"]), serde_json::json!({}), &ctx(Some("192.0.2.1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolated(_)));
    }
}
