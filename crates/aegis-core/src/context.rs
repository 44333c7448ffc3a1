//! Decision context collection
//!
//! Normalizes each inbound request into the [`DecisionContext`] the decision
//! engines evaluate. Collection is a pure function of the request and the
//! supplied instant: no I/O, no clocks of its own.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::{InboundRequest, McpMethod};

/// Known environment attributes attached to a context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    /// Client IP as seen by the transport adapter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,

    /// Session the request belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Hour of day (0-23) derived from the request time
    pub hour_of_day: u32,

    /// Whether the request time falls inside the configured business window
    pub is_business_hours: bool,
}

/// One decision context per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    /// Caller identity
    pub agent: String,

    /// Caller classification, `unknown` when the adapter cannot tell
    pub agent_type: String,

    /// Verb namespace, e.g. `tools/call`
    pub action: String,

    /// Namespaced resource identifier, normalized
    pub resource: String,

    /// Derived sensitivity class of the resource
    pub resource_classification: String,

    /// Request instant
    pub time: DateTime<Utc>,

    /// Caller trust score in [0, 1], if assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,

    /// Agents this request was delegated through, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegation_chain: Vec<String>,

    /// Emergency override flag
    #[serde(default)]
    pub emergency: bool,

    /// Known environment attributes
    pub environment: Environment,

    /// Request id carried through for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl DecisionContext {
    /// Delegation depth (chain length)
    pub fn delegation_depth(&self) -> usize {
        self.delegation_chain.len()
    }

    /// Minutes since midnight of the request instant
    pub fn minutes_of_day(&self) -> u32 {
        self.time.hour() * 60 + self.time.minute()
    }
}

/// Inclusive-start, exclusive-end daily window in minutes since midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub start_min: u32,
    pub end_min: u32,
}

impl BusinessHours {
    /// Parse an `HH:MM-HH:MM` window
    pub fn parse(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::config(format!("invalid business hours '{}'", s)))?;
        Ok(Self {
            start_min: parse_hhmm(start)?,
            end_min: parse_hhmm(end)?,
        })
    }

    /// Whether the given minutes-since-midnight falls inside the window
    pub fn contains(&self, minutes: u32) -> bool {
        if self.start_min <= self.end_min {
            minutes >= self.start_min && minutes < self.end_min
        } else {
            // Window wraps midnight
            minutes >= self.start_min || minutes < self.end_min
        }
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        // 09:00-18:00
        Self {
            start_min: 9 * 60,
            end_min: 18 * 60,
        }
    }
}

/// Parse `HH:MM` into minutes since midnight
pub fn parse_hhmm(s: &str) -> Result<u32> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| Error::config(format!("invalid time '{}'", s)))?;
    let h: u32 = h
        .parse()
        .map_err(|_| Error::config(format!("invalid hour in '{}'", s)))?;
    let m: u32 = m
        .parse()
        .map_err(|_| Error::config(format!("invalid minute in '{}'", s)))?;
    if h > 23 || m > 59 {
        return Err(Error::config(format!("time out of range '{}'", s)));
    }
    Ok(h * 60 + m)
}

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Business hours window, `HH:MM-HH:MM`
    #[serde(default = "default_business_hours")]
    pub business_hours: String,

    /// Maximum delegation chain depth
    #[serde(default = "default_max_depth")]
    pub delegation_max_depth: usize,

    /// Substrings marking a resource as sensitive
    #[serde(default = "default_sensitive_keywords")]
    pub sensitive_keywords: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            business_hours: default_business_hours(),
            delegation_max_depth: default_max_depth(),
            sensitive_keywords: default_sensitive_keywords(),
        }
    }
}

fn default_business_hours() -> String {
    "09:00-18:00".to_string()
}

fn default_max_depth() -> usize {
    3
}

fn default_sensitive_keywords() -> Vec<String> {
    [".env", ".key", "password", "credential", "secret"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Normalizes inbound requests into decision contexts
#[derive(Debug, Clone)]
pub struct ContextCollector {
    hours: BusinessHours,
    max_depth: usize,
    sensitive_keywords: Vec<String>,
}

impl ContextCollector {
    /// Create a collector from configuration
    pub fn new(config: &ContextConfig) -> Result<Self> {
        Ok(Self {
            hours: BusinessHours::parse(&config.business_hours)?,
            max_depth: config.delegation_max_depth,
            sensitive_keywords: config
                .sensitive_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        })
    }

    /// Normalize a request into a context at the given instant
    pub fn collect(&self, req: &InboundRequest, now: DateTime<Utc>) -> Result<DecisionContext> {
        if req.agent_id.trim().is_empty() {
            return Err(Error::invalid_context("missing agent id"));
        }

        let resource = self.derive_resource(req)?;
        if resource.is_empty() {
            return Err(Error::invalid_context("missing resource"));
        }

        // Cycle before depth: a self-referencing chain is the stronger signal
        if req.delegation_chain.iter().any(|a| a == &req.agent_id) {
            return Err(Error::DelegationCycle(req.agent_id.clone()));
        }
        if req.delegation_chain.len() > self.max_depth {
            return Err(Error::DelegationDepthExceeded {
                depth: req.delegation_chain.len(),
                max: self.max_depth,
            });
        }

        let minutes = now.hour() * 60 + now.minute();

        Ok(DecisionContext {
            agent: req.agent_id.clone(),
            agent_type: req
                .agent_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            action: req.method.as_str().to_string(),
            resource: resource.clone(),
            resource_classification: self.classify_resource(&resource),
            time: now,
            trust_score: req.trust_score,
            delegation_chain: req.delegation_chain.clone(),
            emergency: req.emergency,
            environment: Environment {
                client_ip: req.client_ip.clone(),
                session_id: req.session_id.clone(),
                hour_of_day: now.hour(),
                is_business_hours: self.hours.contains(minutes),
            },
            request_id: req.request_id.clone(),
        })
    }

    /// Derive the namespaced resource identifier for a request
    fn derive_resource(&self, req: &InboundRequest) -> Result<String> {
        let raw = match req.method {
            McpMethod::ToolsCall => {
                let name = req
                    .name
                    .as_deref()
                    .ok_or_else(|| Error::invalid_context("tools/call without tool name"))?;
                match target_path(req.arguments.as_ref()) {
                    Some(path) => format!("{}:{}", name, path),
                    None => name.to_string(),
                }
            }
            McpMethod::ResourcesRead => req
                .uri
                .clone()
                .ok_or_else(|| Error::invalid_context("resources/read without uri"))?,
            McpMethod::ToolsList => "tools".to_string(),
            McpMethod::ResourcesList => "resources".to_string(),
        };
        Ok(normalize_resource(&raw))
    }

    /// Derive the sensitivity class of a resource
    fn classify_resource(&self, resource: &str) -> String {
        let lower = resource.to_lowercase();
        if self.sensitive_keywords.iter().any(|k| lower.contains(k)) {
            "sensitive".to_string()
        } else {
            "general".to_string()
        }
    }
}

/// Extract the path-like target argument of a tool call
fn target_path(arguments: Option<&serde_json::Value>) -> Option<String> {
    let args = arguments?;
    for key in ["path", "uri", "url", "file"] {
        if let Some(v) = args.get(key).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
    }
    None
}

/// Normalize a resource string: lowercase the scheme, collapse separator runs
pub fn normalize_resource(raw: &str) -> String {
    let trimmed = raw.trim();
    let (scheme, rest) = match trimmed.split_once(':') {
        Some((s, r)) => (s.to_lowercase(), r),
        None => return collapse_slashes(trimmed),
    };

    // `scheme://` keeps its double slash; everything after collapses
    if let Some(stripped) = rest.strip_prefix("//") {
        format!("{}://{}", scheme, collapse_slashes(stripped))
    } else {
        format!("{}:{}", scheme, collapse_slashes(rest))
    }
}

fn collapse_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_slash = false;
    for c in s.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}
