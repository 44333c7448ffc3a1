//! Post-decision obligations
//!
//! Obligations run after the upstream call completes and are never part of
//! the serving contract: a failed obligation is recorded and retried within
//! its budget, but it cannot revoke a PERMIT already granted or delay the
//! caller's response.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use aegis_core::context::DecisionContext;
use aegis_core::decision::Decision;
use aegis_core::directive::{Directive, DirectiveFamily};
use aegis_core::error::Result;

const HISTORY_CAPACITY: usize = 1_000;

/// Trait for all obligation executors
#[async_trait]
pub trait ObligationExecutor: Send + Sync {
    /// Executor name for logs and counters
    fn name(&self) -> &str;

    /// Whether this executor handles the directive
    fn can_execute(&self, directive: &Directive) -> bool;

    /// Execute the directive
    async fn execute(
        &self,
        directive: &Directive,
        ctx: &DecisionContext,
        decision: &Decision,
    ) -> Result<()>;
}

/// One completed (or abandoned) obligation execution
#[derive(Debug, Clone)]
pub struct ObligationRecord {
    pub directive: String,
    pub executor: String,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Aggregate result of one `execute` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObligationReport {
    pub executed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Per-executor success/failure counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorCounters {
    pub success: u64,
    pub failure: u64,
}

/// Dispatches obligation directives to registered executors
pub struct ObligationManager {
    executors: Vec<Arc<dyn ObligationExecutor>>,
    timeout: Duration,
    retries: u32,
    history: Mutex<VecDeque<ObligationRecord>>,
    counters: Mutex<HashMap<String, ExecutorCounters>>,
}

impl ObligationManager {
    /// Create a manager with no executors registered
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            executors: Vec::new(),
            timeout,
            retries,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Register an executor; dispatch prefers earlier registrations
    pub fn register(mut self, executor: Arc<dyn ObligationExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Execute every obligation directive, fire-and-forget semantics
    pub async fn execute(
        &self,
        directives: &[String],
        ctx: &DecisionContext,
        decision: &Decision,
    ) -> ObligationReport {
        let mut report = ObligationReport::default();

        for raw in directives {
            let directive = Directive::parse(raw);
            if directive.family() != DirectiveFamily::Obligation {
                warn!(directive = %raw, "not an obligation directive, skipping");
                report.skipped += 1;
                continue;
            }

            let Some(executor) = self.executors.iter().find(|e| e.can_execute(&directive))
            else {
                warn!(directive = %raw, "no executor for obligation, skipping");
                report.skipped += 1;
                continue;
            };

            let record = self.run_one(raw, &directive, executor, ctx, decision).await;
            if record.success {
                report.executed += 1;
            } else {
                report.failed += 1;
            }
            self.record(record);
        }

        report
    }

    async fn run_one(
        &self,
        raw: &str,
        directive: &Directive,
        executor: &Arc<dyn ObligationExecutor>,
        ctx: &DecisionContext,
        decision: &Decision,
    ) -> ObligationRecord {
        let max_attempts = 1 + self.retries;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let outcome =
                tokio::time::timeout(self.timeout, executor.execute(directive, ctx, decision))
                    .await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(directive = %raw, executor = executor.name(), attempt, "obligation executed");
                    return ObligationRecord {
                        directive: raw.to_string(),
                        executor: executor.name().to_string(),
                        success: true,
                        attempts: attempt,
                        error: None,
                        executed_at: Utc::now(),
                    };
                }
                Ok(Err(e)) => {
                    warn!(directive = %raw, executor = executor.name(), attempt, "obligation failed: {}", e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        directive = %raw,
                        executor = executor.name(),
                        attempt,
                        "obligation timed out after {}ms",
                        self.timeout.as_millis()
                    );
                    last_error = Some(format!("timeout after {}ms", self.timeout.as_millis()));
                }
            }
        }

        ObligationRecord {
            directive: raw.to_string(),
            executor: executor.name().to_string(),
            success: false,
            attempts: max_attempts,
            error: last_error,
            executed_at: Utc::now(),
        }
    }

    fn record(&self, record: ObligationRecord) {
        {
            let mut counters = self.counters.lock();
            let entry = counters.entry(record.executor.clone()).or_default();
            if record.success {
                entry.success += 1;
            } else {
                entry.failure += 1;
            }
        }

        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Snapshot of recent execution records, oldest first
    pub fn history(&self) -> Vec<ObligationRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Per-executor counters
    pub fn counters(&self) -> HashMap<String, ExecutorCounters> {
        self.counters.lock().clone()
    }
}

/// A delivered out-of-band notification
#[derive(Debug, Clone)]
pub struct Notification {
    pub target: String,
    pub agent: String,
    pub resource: String,
    pub reason: String,
    pub sent_at: DateTime<Utc>,
}

/// Notifies an out-of-band target about a decision
///
/// Delivery here is the notification log plus a structured warning; wiring
/// an actual pager/webhook is the embedder's concern.
#[derive(Default)]
pub struct NotifyExecutor {
    sent: Mutex<Vec<Notification>>,
}

impl NotifyExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ObligationExecutor for NotifyExecutor {
    fn name(&self) -> &str {
        "notifier"
    }

    fn can_execute(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::Notify { .. })
    }

    async fn execute(
        &self,
        directive: &Directive,
        ctx: &DecisionContext,
        decision: &Decision,
    ) -> Result<()> {
        let Directive::Notify { target } = directive else {
            return Ok(());
        };

        warn!(
            target = %target,
            agent = %ctx.agent,
            resource = %ctx.resource,
            verdict = ?decision.verdict,
            "policy notification"
        );

        self.sent.lock().push(Notification {
            target: target.clone(),
            agent: ctx.agent.clone(),
            resource: ctx.resource.clone(),
            reason: decision.reason.clone(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}

/// A scheduled retention deletion, enforced externally
#[derive(Debug, Clone)]
pub struct RetentionRecord {
    pub agent: String,
    pub resource: String,
    pub delete_after_days: u32,
    pub scheduled_at: DateTime<Utc>,
}

/// Records `delete-after:Nd` retention timers
#[derive(Default)]
pub struct RetentionExecutor {
    scheduled: Mutex<Vec<RetentionRecord>>,
}

impl RetentionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retention timers recorded so far
    pub fn scheduled(&self) -> Vec<RetentionRecord> {
        self.scheduled.lock().clone()
    }
}

#[async_trait]
impl ObligationExecutor for RetentionExecutor {
    fn name(&self) -> &str {
        "retention"
    }

    fn can_execute(&self, directive: &Directive) -> bool {
        matches!(directive, Directive::DeleteAfter { .. })
    }

    async fn execute(
        &self,
        directive: &Directive,
        ctx: &DecisionContext,
        _decision: &Decision,
    ) -> Result<()> {
        let Directive::DeleteAfter { days } = directive else {
            return Ok(());
        };

        debug!(agent = %ctx.agent, resource = %ctx.resource, days, "retention scheduled");
        self.scheduled.lock().push(RetentionRecord {
            agent: ctx.agent.clone(),
            resource: ctx.resource.clone(),
            delete_after_days: *days,
            scheduled_at: Utc::now(),
        });
        Ok(())
    }
}
