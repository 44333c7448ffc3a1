//! PII masking for response payloads

use async_trait::async_trait;
use regex::Regex;

use aegis_core::context::DecisionContext;
use aegis_core::directive::Directive;
use aegis_core::error::Result;

use crate::constraint::ConstraintProcessor;

const MASK: &str = "[REDACTED]";

/// Recursively masks configured PII key paths and scrubs common PII shapes
/// (emails, phone numbers) out of free-text values
pub struct AnonymizeProcessor {
    keys: Vec<String>,
    email_regex: Regex,
    phone_regex: Regex,
}

impl AnonymizeProcessor {
    /// Create a processor masking the given JSON keys
    pub fn new(keys: &[String]) -> Result<Self> {
        Ok(Self {
            keys: keys.iter().map(|k| k.to_lowercase()).collect(),
            email_regex: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b")
                .map_err(|e| aegis_core::Error::config(format!("email regex: {}", e)))?,
            phone_regex: Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b")
                .map_err(|e| aegis_core::Error::config(format!("phone regex: {}", e)))?,
        })
    }

    fn mask_value(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if self.keys.contains(&key.to_lowercase()) {
                        *v = serde_json::Value::String(MASK.to_string());
                    } else {
                        self.mask_value(v);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items.iter_mut() {
                    self.mask_value(item);
                }
            }
            serde_json::Value::String(s) => {
                let scrubbed = self.email_regex.replace_all(s, MASK);
                let scrubbed = self.phone_regex.replace_all(&scrubbed, MASK);
                if scrubbed != *s {
                    *s = scrubbed.into_owned();
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ConstraintProcessor for AnonymizeProcessor {
    fn name(&self) -> &str {
        "anonymize"
    }

    fn can_process(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::Anonymize)
    }

    async fn apply(
        &self,
        _directive: &Directive,
        mut payload: serde_json::Value,
        _ctx: &DecisionContext,
    ) -> Result<serde_json::Value> {
        self.mask_value(&mut payload);
        Ok(payload)
    }
}
