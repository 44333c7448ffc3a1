//! AI judgment of requests no rule decides
//!
//! The judge serializes the decision context together with a human-readable
//! policy description into a chat prompt, calls an external model endpoint
//! under a bounded deadline, and parses the structured verdict out of the
//! completion. It is stateless between calls; the hybrid engine owns all
//! orchestration around it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aegis_core::context::DecisionContext;
use aegis_core::decision::{Decision, EngineKind, Verdict};
use aegis_core::error::Result;

/// Seam between the hybrid engine and the external model
#[async_trait]
pub trait Judge: Send + Sync {
    /// Judge a context against a policy description
    ///
    /// Implementations return INDETERMINATE decisions for their own failure
    /// modes (unreachable endpoint, unparsable output, low confidence)
    /// rather than errors; the engine treats those uniformly.
    async fn judge(&self, ctx: &DecisionContext, policy_text: &str) -> Result<Decision>;
}

/// Judge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Chat-completions style endpoint
    pub endpoint: String,

    /// Model identifier sent with each request
    #[serde(default = "default_model")]
    pub model: String,

    /// Bearer token, if the endpoint requires one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Call deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Verdicts below this confidence degrade to INDETERMINATE
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: default_model(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_confidence_threshold() -> f64 {
    0.7
}

/// HTTP judge calling a chat-completions endpoint
pub struct HttpJudge {
    client: reqwest::Client,
    config: JudgeConfig,
}

impl HttpJudge {
    /// Create a judge from configuration
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| aegis_core::Error::config(format!("judge client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn call_once(&self, ctx: &DecisionContext, policy_text: &str) -> reqwest::Result<String> {
        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system_prompt(policy_text),
                },
                ChatMessage {
                    role: "user".into(),
                    content: user_prompt(ctx),
                },
            ],
            temperature: 0.0,
        };

        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if let Some(ref key) = self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp: ChatResponse = req.send().await?.error_for_status()?.json().await?;
        Ok(resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn judge(&self, ctx: &DecisionContext, policy_text: &str) -> Result<Decision> {
        let content = match self.call_once(ctx, policy_text).await {
            Ok(content) => content,
            Err(e) if e.is_timeout() || e.is_connect() => {
                // Exactly one retry on transient network failure
                debug!(agent = %ctx.agent, "judge call failed transiently, retrying: {}", e);
                match self.call_once(ctx, policy_text).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(agent = %ctx.agent, "judge unreachable after retry: {}", e);
                        return Ok(Decision::indeterminate("ai-unreachable", EngineKind::Ai));
                    }
                }
            }
            Err(e) => {
                warn!(agent = %ctx.agent, "judge call failed: {}", e);
                return Ok(Decision::indeterminate("ai-unreachable", EngineKind::Ai));
            }
        };

        Ok(parse_verdict(&content, self.config.confidence_threshold))
    }
}

fn system_prompt(policy_text: &str) -> String {
    format!(
        "You are a policy decision point for tool invocations by AI agents.\n\
         Decide whether the request below should be permitted under these policies:\n\n\
         {}\n\
         Respond with a single JSON object: {{\"decision\": \"PERMIT\"|\"DENY\", \
         \"reason\": string, \"confidence\": number in [0,1], \
         \"constraints\": [string], \"obligations\": [string]}}.",
        policy_text
    )
}

fn user_prompt(ctx: &DecisionContext) -> String {
    serde_json::to_string_pretty(ctx).unwrap_or_else(|_| format!("{:?}", ctx))
}

/// Parse a model completion into a decision, degrading on any failure
///
/// Low confidence and unparsable output both yield INDETERMINATE; the caller
/// decides whether to fail closed or fall back to rules.
pub fn parse_verdict(content: &str, threshold: f64) -> Decision {
    let Some(raw) = extract_json(content) else {
        warn!("judge returned no parsable JSON");
        return Decision::indeterminate("ai-unreachable", EngineKind::Ai);
    };

    let parsed: JudgeVerdict = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("judge verdict did not parse: {}", e);
            return Decision::indeterminate("ai-unreachable", EngineKind::Ai);
        }
    };

    let verdict = match parsed.decision.to_uppercase().as_str() {
        "PERMIT" => Verdict::Permit,
        "DENY" => Verdict::Deny,
        _ => Verdict::Indeterminate,
    };

    if verdict == Verdict::Indeterminate || parsed.confidence < threshold {
        let mut d = Decision::indeterminate("ai-low-confidence", EngineKind::Ai);
        d.confidence = parsed.confidence;
        return d;
    }

    let mut decision = Decision {
        verdict,
        reason: parsed.reason,
        confidence: parsed.confidence,
        constraints: parsed.constraints,
        obligations: parsed.obligations,
        metadata: aegis_core::decision::DecisionMetadata {
            engine: EngineKind::Ai,
            evaluation_time_ms: 0,
            cached: false,
        },
    };
    decision.confidence = decision.confidence.clamp(0.0, 1.0);
    decision
}

/// Pull the first JSON object out of a completion that may wrap it in prose
/// or a code fence
fn extract_json(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(content[start..=end].to_string())
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    content: String,
}

/// The structured verdict the model is asked to emit
#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    decision: String,

    #[serde(default)]
    reason: String,

    #[serde(default)]
    confidence: f64,

    #[serde(default)]
    constraints: Vec<String>,

    #[serde(default)]
    obligations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_permit() {
        let content = r#"{"decision": "PERMIT", "reason": "read of temp file", "confidence": 0.9, "constraints": ["anonymize-pii"], "obligations": ["log"]}"#;
        let d = parse_verdict(content, 0.7);
        assert_eq!(d.verdict, Verdict::Permit);
        assert_eq!(d.confidence, 0.9);
        assert_eq!(d.constraints, vec!["anonymize-pii".to_string()]);
        assert_eq!(d.obligations, vec!["log".to_string()]);
    }

    #[test]
    fn test_parse_deny() {
        let content = r#"{"decision": "deny", "reason": "sensitive path", "confidence": 0.95}"#;
        let d = parse_verdict(content, 0.7);
        assert_eq!(d.verdict, Verdict::Deny);
    }

    #[test]
    fn test_low_confidence_degrades() {
        let content = r#"{"decision": "PERMIT", "reason": "maybe", "confidence": 0.4}"#;
        let d = parse_verdict(content, 0.7);
        assert_eq!(d.verdict, Verdict::Indeterminate);
        assert_eq!(d.reason, "ai-low-confidence");
        assert_eq!(d.confidence, 0.4);
    }

    #[test]
    fn test_unparsable_degrades() {
        let d = parse_verdict("I cannot help with that.", 0.7);
        assert_eq!(d.verdict, Verdict::Indeterminate);
        assert_eq!(d.reason, "ai-unreachable");
    }

    #[test]
    fn test_json_in_code_fence() {
        let content = "Here is my decision:\n```json\n{\"decision\": \"PERMIT\", \"confidence\": 0.8}\n```";
        let d = parse_verdict(content, 0.7);
        assert_eq!(d.verdict, Verdict::Permit);
    }

    #[test]
    fn test_unknown_decision_word() {
        let content = r#"{"decision": "ESCALATE", "confidence": 0.99}"#;
        let d = parse_verdict(content, 0.7);
        assert_eq!(d.verdict, Verdict::Indeterminate);
    }
}
