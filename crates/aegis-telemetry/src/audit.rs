//! Append-only audit trail
//!
//! Every terminal decision produces exactly one entry. Entries are enqueued
//! on the serving path and written by a single background thread, which
//! preserves enqueue order and keeps file I/O off the critical path. A
//! bounded in-memory buffer of recent entries serves queries without
//! touching disk.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use aegis_core::context::DecisionContext;
use aegis_core::decision::{Decision, Verdict};

/// How the enforced request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
    Error,
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id
    pub id: String,

    /// When the decision was finalized
    pub timestamp: DateTime<Utc>,

    /// Caller identity
    pub agent: String,

    /// Verb namespace
    pub action: String,

    /// Normalized resource identifier
    pub resource: String,

    /// Rule or engine label that decided
    pub policy_applied: String,

    /// Final verdict as returned to the caller
    pub verdict: Verdict,

    /// Request outcome
    pub outcome: AuditOutcome,

    /// End-to-end processing time
    pub processing_time_ms: u64,

    /// Decision confidence
    pub confidence: f64,

    /// Serialized decision context
    pub context_json: serde_json::Value,

    /// Serialized decision including constraints and obligations
    pub decision_json: serde_json::Value,
}

impl AuditEntry {
    /// Build an entry from a finalized decision
    pub fn from_decision(
        ctx: &DecisionContext,
        decision: &Decision,
        outcome: AuditOutcome,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            id: format!("aud_{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            agent: ctx.agent.clone(),
            action: ctx.action.clone(),
            resource: ctx.resource.clone(),
            policy_applied: decision.reason.clone(),
            verdict: decision.verdict,
            outcome,
            processing_time_ms,
            confidence: decision.confidence,
            context_json: serde_json::to_value(ctx).unwrap_or_default(),
            decision_json: serde_json::to_value(decision).unwrap_or_default(),
        }
    }
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory the JSONL log lives in
    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,

    /// Flush to disk after this many entries
    #[serde(default = "default_flush_interval")]
    pub flush_interval: usize,

    /// In-memory recent buffer size
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            audit_dir: default_audit_dir(),
            flush_interval: default_flush_interval(),
            recent_capacity: default_recent_capacity(),
        }
    }
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("./audit")
}

fn default_flush_interval() -> usize {
    10
}

fn default_recent_capacity() -> usize {
    1_000
}

enum AuditCommand {
    Record(Box<AuditEntry>),
    Flush,
    Shutdown,
}

/// Append-only audit sink with a background writer
pub struct AuditSink {
    sender: mpsc::UnboundedSender<AuditCommand>,
    recent: Arc<RwLock<VecDeque<AuditEntry>>>,
    recent_capacity: usize,
}

impl AuditSink {
    /// Create the sink and start its writer thread
    pub fn new(config: AuditConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.audit_dir)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let path = config.audit_dir.join("audit.jsonl");
        let flush_interval = config.flush_interval.max(1);

        std::thread::spawn(move || {
            if let Err(e) = run_writer(path, flush_interval, receiver) {
                error!("audit writer thread failed: {}", e);
            }
        });

        info!(dir = ?config.audit_dir, "audit sink started");

        Ok(Self {
            sender,
            recent: Arc::new(RwLock::new(VecDeque::with_capacity(config.recent_capacity))),
            recent_capacity: config.recent_capacity.max(1),
        })
    }

    /// Record an entry; ordering follows the call order
    pub fn record(&self, entry: AuditEntry) {
        {
            let mut recent = self.recent.write();
            if recent.len() >= self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        if self.sender.send(AuditCommand::Record(Box::new(entry))).is_err() {
            warn!("audit writer is gone, entry kept in memory only");
        }
    }

    /// Ask the writer to flush to disk
    pub fn flush(&self) {
        let _ = self.sender.send(AuditCommand::Flush);
    }

    /// Snapshot of recent entries, oldest first
    pub fn recent(&self) -> Vec<AuditEntry> {
        self.recent.read().iter().cloned().collect()
    }

    /// Recent entries for one agent, oldest first
    pub fn recent_for_agent(&self, agent: &str) -> Vec<AuditEntry> {
        self.recent
            .read()
            .iter()
            .filter(|e| e.agent == agent)
            .cloned()
            .collect()
    }
}

impl Drop for AuditSink {
    fn drop(&mut self) {
        let _ = self.sender.send(AuditCommand::Shutdown);
    }
}

/// Background writer loop, one line of JSON per entry
fn run_writer(
    path: PathBuf,
    flush_interval: usize,
    mut receiver: mpsc::UnboundedReceiver<AuditCommand>,
) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut writer = BufWriter::new(file);
    let mut since_flush = 0usize;

    while let Some(cmd) = receiver.blocking_recv() {
        match cmd {
            AuditCommand::Record(entry) => {
                match serde_json::to_string(entry.as_ref()) {
                    Ok(json) => {
                        writer.write_all(json.as_bytes())?;
                        writer.write_all(b"\n")?;
                        since_flush += 1;
                        if since_flush >= flush_interval {
                            writer.flush()?;
                            since_flush = 0;
                        }
                    }
                    Err(e) => error!("failed to serialize audit entry: {}", e),
                }
            }
            AuditCommand::Flush => {
                writer.flush()?;
                since_flush = 0;
            }
            AuditCommand::Shutdown => {
                debug!("audit writer shutting down");
                writer.flush()?;
                break;
            }
        }
    }

    Ok(())
}
