//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use aegis_core::context::ContextConfig;
use aegis_enforce::EnforcementConfig;
use aegis_policy::{EngineConfig, JudgeConfig};
use aegis_telemetry::{AnomalyConfig, AuditConfig};

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AegisConfig {
    /// Policy file or directory of YAML policies
    #[serde(default = "default_policy_path")]
    pub policy_path: String,

    /// Upstream tool server URL; absent means echo mode (dry runs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,

    /// Context collection (business hours, delegation depth)
    #[serde(default)]
    pub context: ContextConfig,

    /// Hybrid engine (rules / AI / cache)
    #[serde(default)]
    pub engine: EngineConfig,

    /// AI judge endpoint; absent disables the AI path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeConfig>,

    /// Constraint and obligation enforcement
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// Audit sink
    #[serde(default)]
    pub audit: AuditConfig,

    /// Anomaly detection
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Rate-limiter sweep interval
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for AegisConfig {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            backend_url: None,
            context: ContextConfig::default(),
            engine: EngineConfig::default(),
            judge: None,
            enforcement: EnforcementConfig::default(),
            audit: AuditConfig::default(),
            anomaly: AnomalyConfig::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_policy_path() -> String {
    "./policies".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl AegisConfig {
    /// Load configuration from a file, falling back to defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }
}
