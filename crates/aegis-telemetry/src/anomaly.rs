//! Realtime anomaly detection over the audit stream
//!
//! The detector runs on the background audit path, never on the serving
//! path. It keeps a bounded ring of recent entries plus lifetime per-agent
//! counts, matches each incoming entry against its pattern set, and
//! dispatches alerts to registered listeners synchronously. CRITICAL
//! patterns additionally record an agent soft-block in the mitigation log;
//! enforcing that block is the embedder's concern.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use aegis_core::context::BusinessHours;
use aegis_core::decision::Verdict;
use aegis_core::error::Result;

use crate::audit::AuditEntry;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An emitted anomaly alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    /// Unique alert id
    pub alert_id: String,

    /// When the pattern matched
    pub detected_at: DateTime<Utc>,

    /// Pattern that matched
    pub pattern_id: String,

    /// Severity of the pattern
    pub severity: AlertSeverity,

    /// Agent whose entry triggered the pattern
    pub agent: String,

    /// Resource of the triggering entry
    pub resource: String,

    /// Operator guidance
    pub suggested_actions: Vec<String>,

    /// Whether a soft-block was recorded automatically
    pub auto_mitigated: bool,
}

/// A recorded agent soft-block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mitigation {
    pub agent: String,
    pub pattern_id: String,
    pub detected_at: DateTime<Utc>,
}

/// Receives alerts synchronously; failures are logged and never block
/// further detection
pub trait AlertListener: Send + Sync {
    fn on_alert(&self, alert: &AnomalyAlert) -> Result<()>;
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Ring retention
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Business window for the off-hours pattern, `HH:MM-HH:MM`
    #[serde(default = "default_business_hours")]
    pub business_hours: String,

    /// Substrings marking a resource as sensitive
    #[serde(default = "default_sensitive_keywords")]
    pub sensitive_keywords: Vec<String>,

    /// Rapid access: more than this many entries per agent per window
    #[serde(default = "default_rapid_threshold")]
    pub rapid_access_threshold: usize,

    #[serde(default = "default_rapid_window_secs")]
    pub rapid_access_window_secs: u64,

    /// Repeated denials: at least this many consecutive DENYs per window
    #[serde(default = "default_denial_threshold")]
    pub denial_threshold: usize,

    #[serde(default = "default_denial_window_secs")]
    pub denial_window_secs: u64,

    /// New-agent surge: at least this many entries per window while the
    /// agent's lifetime count stays at or below the history bound
    #[serde(default = "default_surge_threshold")]
    pub surge_threshold: usize,

    #[serde(default = "default_surge_window_secs")]
    pub surge_window_secs: u64,

    #[serde(default = "default_surge_history_max")]
    pub surge_history_max: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            business_hours: default_business_hours(),
            sensitive_keywords: default_sensitive_keywords(),
            rapid_access_threshold: default_rapid_threshold(),
            rapid_access_window_secs: default_rapid_window_secs(),
            denial_threshold: default_denial_threshold(),
            denial_window_secs: default_denial_window_secs(),
            surge_threshold: default_surge_threshold(),
            surge_window_secs: default_surge_window_secs(),
            surge_history_max: default_surge_history_max(),
        }
    }
}

fn default_retention_hours() -> u64 {
    24
}

fn default_business_hours() -> String {
    "09:00-18:00".to_string()
}

fn default_sensitive_keywords() -> Vec<String> {
    [".env", ".key", "password", "credential"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_rapid_threshold() -> usize {
    10
}

fn default_rapid_window_secs() -> u64 {
    60
}

fn default_denial_threshold() -> usize {
    5
}

fn default_denial_window_secs() -> u64 {
    300
}

fn default_surge_threshold() -> usize {
    3
}

fn default_surge_window_secs() -> u64 {
    3_600
}

fn default_surge_history_max() -> u64 {
    5
}

struct DetectorState {
    ring: VecDeque<AuditEntry>,
    agent_totals: HashMap<String, u64>,
}

/// Sliding-window pattern matcher over recent audit entries
pub struct AnomalyDetector {
    state: Mutex<DetectorState>,
    listeners: RwLock<Vec<Arc<dyn AlertListener>>>,
    mitigations: Mutex<Vec<Mitigation>>,
    hours: BusinessHours,
    sensitive: AhoCorasick,
    config: AnomalyConfig,
}

impl AnomalyDetector {
    /// Create a detector from configuration
    pub fn new(config: AnomalyConfig) -> Result<Self> {
        let hours = BusinessHours::parse(&config.business_hours)?;
        let sensitive = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&config.sensitive_keywords)
            .map_err(|e| aegis_core::Error::config(format!("sensitive keywords: {}", e)))?;

        Ok(Self {
            state: Mutex::new(DetectorState {
                ring: VecDeque::new(),
                agent_totals: HashMap::new(),
            }),
            listeners: RwLock::new(Vec::new()),
            mitigations: Mutex::new(Vec::new()),
            hours,
            sensitive,
            config,
        })
    }

    /// Register an alert listener
    pub fn add_listener(&self, listener: Arc<dyn AlertListener>) {
        self.listeners.write().push(listener);
    }

    /// Ingest one audit entry and return any alerts it triggered
    pub fn detect(&self, entry: &AuditEntry) -> Vec<AnomalyAlert> {
        let mut alerts = Vec::new();

        {
            let mut state = self.state.lock();
            state.ring.push_back(entry.clone());
            *state.agent_totals.entry(entry.agent.clone()).or_insert(0) += 1;

            if let Some(alert) = self.check_rapid_access(entry, &state) {
                alerts.push(alert);
            }
            if let Some(alert) = self.check_repeated_denials(entry, &state) {
                alerts.push(alert);
            }
            if let Some(alert) = self.check_off_hours(entry) {
                alerts.push(alert);
            }
            if let Some(alert) = self.check_sensitive_resource(entry) {
                alerts.push(alert);
            }
            if let Some(alert) = self.check_new_agent_surge(entry, &state) {
                alerts.push(alert);
            }
        }

        for alert in &alerts {
            if alert.auto_mitigated {
                self.mitigations.lock().push(Mitigation {
                    agent: alert.agent.clone(),
                    pattern_id: alert.pattern_id.clone(),
                    detected_at: alert.detected_at,
                });
                warn!(agent = %alert.agent, pattern = %alert.pattern_id, "agent soft-blocked");
            }
            self.dispatch(alert);
        }

        alerts
    }

    fn dispatch(&self, alert: &AnomalyAlert) {
        for listener in self.listeners.read().iter() {
            if let Err(e) = listener.on_alert(alert) {
                error!(pattern = %alert.pattern_id, "alert listener failed: {}", e);
            }
        }
    }

    fn check_rapid_access(&self, entry: &AuditEntry, state: &DetectorState) -> Option<AnomalyAlert> {
        let window = chrono::Duration::seconds(self.config.rapid_access_window_secs as i64);
        let cutoff = entry.timestamp - window;
        let count = state
            .ring
            .iter()
            .filter(|e| e.agent == entry.agent && e.timestamp > cutoff)
            .count();

        if count > self.config.rapid_access_threshold {
            return Some(self.alert(
                "rapid-access",
                AlertSeverity::High,
                entry,
                vec![format!(
                    "{} requests from '{}' in {}s",
                    count, entry.agent, self.config.rapid_access_window_secs
                )],
            ));
        }
        None
    }

    fn check_repeated_denials(
        &self,
        entry: &AuditEntry,
        state: &DetectorState,
    ) -> Option<AnomalyAlert> {
        if entry.verdict != Verdict::Deny {
            return None;
        }

        let window = chrono::Duration::seconds(self.config.denial_window_secs as i64);
        let cutoff = entry.timestamp - window;

        // Consecutive denials ending at this entry
        let consecutive = state
            .ring
            .iter()
            .rev()
            .filter(|e| e.agent == entry.agent && e.timestamp > cutoff)
            .take_while(|e| e.verdict == Verdict::Deny)
            .count();

        if consecutive >= self.config.denial_threshold {
            return Some(self.alert(
                "repeated-denials",
                AlertSeverity::High,
                entry,
                vec![format!(
                    "{} consecutive denials for '{}'",
                    consecutive, entry.agent
                )],
            ));
        }
        None
    }

    fn check_off_hours(&self, entry: &AuditEntry) -> Option<AnomalyAlert> {
        let minutes = entry.timestamp.hour() * 60 + entry.timestamp.minute();
        if self.hours.contains(minutes) {
            return None;
        }
        Some(self.alert(
            "off-hours-access",
            AlertSeverity::Medium,
            entry,
            vec!["verify the agent is expected to run outside business hours".into()],
        ))
    }

    fn check_sensitive_resource(&self, entry: &AuditEntry) -> Option<AnomalyAlert> {
        if !self.sensitive.is_match(&entry.resource) {
            return None;
        }
        Some(self.alert(
            "sensitive-resource",
            AlertSeverity::Critical,
            entry,
            vec![
                format!("review access to '{}'", entry.resource),
                format!("soft-block agent '{}'", entry.agent),
            ],
        ))
    }

    fn check_new_agent_surge(
        &self,
        entry: &AuditEntry,
        state: &DetectorState,
    ) -> Option<AnomalyAlert> {
        let total = state.agent_totals.get(&entry.agent).copied().unwrap_or(0);
        if total > self.config.surge_history_max {
            return None;
        }

        let window = chrono::Duration::seconds(self.config.surge_window_secs as i64);
        let cutoff = entry.timestamp - window;
        let recent = state
            .ring
            .iter()
            .filter(|e| e.agent == entry.agent && e.timestamp > cutoff)
            .count();

        if recent >= self.config.surge_threshold {
            return Some(self.alert(
                "new-agent-surge",
                AlertSeverity::Medium,
                entry,
                vec![format!(
                    "new agent '{}' made {} requests within the hour",
                    entry.agent, recent
                )],
            ));
        }
        None
    }

    fn alert(
        &self,
        pattern_id: &str,
        severity: AlertSeverity,
        entry: &AuditEntry,
        suggested_actions: Vec<String>,
    ) -> AnomalyAlert {
        AnomalyAlert {
            alert_id: format!("alr_{}", uuid::Uuid::new_v4()),
            detected_at: entry.timestamp,
            pattern_id: pattern_id.to_string(),
            severity,
            agent: entry.agent.clone(),
            resource: entry.resource.clone(),
            suggested_actions,
            auto_mitigated: severity == AlertSeverity::Critical,
        }
    }

    /// Drop ring entries older than the retention window
    pub fn sweep(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.retention_hours as i64);
        let mut state = self.state.lock();
        let before = state.ring.len();
        while let Some(front) = state.ring.front() {
            if front.timestamp < cutoff {
                state.ring.pop_front();
            } else {
                break;
            }
        }
        if state.ring.len() != before {
            debug!(evicted = before - state.ring.len(), "anomaly ring swept");
        }
    }

    /// Spawn the hourly sweeper
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// Recorded soft-blocks
    pub fn mitigations(&self) -> Vec<Mitigation> {
        self.mitigations.lock().clone()
    }

    /// Entries currently in the ring
    pub fn ring_len(&self) -> usize {
        self.state.lock().ring.len()
    }
}
