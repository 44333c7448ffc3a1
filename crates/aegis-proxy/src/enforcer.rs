//! Policy enforcement entry point
//!
//! One `enforce` call serves a request end-to-end: contextualize, decide,
//! admit, call upstream, shape the response, then hand audit, anomaly
//! detection, and obligations to the background worker. The caller never
//! waits for background work, and every failure on the serving path fails
//! closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use aegis_core::context::{ContextCollector, DecisionContext};
use aegis_core::decision::{Decision, Verdict};
use aegis_core::directive::Directive;
use aegis_core::error::{Error, ErrorResponse, Result};
use aegis_core::request::InboundRequest;
use aegis_enforce::{
    ensure_rate_limit, AnonymizeProcessor, ConstraintManager, GeoRestrictProcessor,
    NotifyExecutor, ObligationManager, RateLimitKey, RateLimitProcessor, RetentionExecutor,
    SlidingWindowLimiter, TimeWindowProcessor,
};
use aegis_policy::{HttpJudge, HybridEngine, Judge};
use aegis_telemetry::{
    AnomalyDetector, AuditEntry, AuditOutcome, AuditSink, MetricsCollector,
};

use crate::config::AegisConfig;
use crate::upstream::Upstream;

/// Lifecycle of a single request; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RequestState {
    Received,
    Contextualized,
    Decided,
    Called,
    Shaped,
    Completed,
    Denied,
    Errored,
}

impl RequestState {
    fn advance(&mut self, next: RequestState) {
        debug_assert!(*self < next, "state machine must not backtrack");
        *self = next;
    }
}

/// Work handed off the serving path after a decision is finalized
struct BackgroundWork {
    entry: AuditEntry,
    obligations: Vec<String>,
    ctx: Option<DecisionContext>,
    decision: Option<Decision>,
}

/// The public entry point of the proxy core
pub struct PolicyEnforcer {
    collector: ContextCollector,
    engine: Arc<HybridEngine>,
    constraints: Arc<ConstraintManager>,
    upstream: Arc<dyn Upstream>,
    audit: Arc<AuditSink>,
    detector: Arc<AnomalyDetector>,
    metrics: MetricsCollector,
    default_rate_limit: String,
    background: mpsc::UnboundedSender<BackgroundWork>,
}

impl PolicyEnforcer {
    /// Wire the enforcement pipeline with an explicit judge and upstream
    pub fn new(
        config: &AegisConfig,
        judge: Option<Arc<dyn Judge>>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        let collector = ContextCollector::new(&config.context)?;
        let engine = Arc::new(HybridEngine::new(config.engine.clone(), judge));

        let limiter = Arc::new(SlidingWindowLimiter::new());
        limiter.clone().spawn_sweeper(
            Duration::from_secs(config.sweep_interval_secs),
            Duration::from_secs(3_600),
        );

        let key = RateLimitKey::new(config.enforcement.rate_key_include_client_ip);
        let constraints = Arc::new(
            ConstraintManager::new(Duration::from_millis(config.enforcement.constraint_timeout_ms))
                .register(Arc::new(RateLimitProcessor::new(limiter, key)))
                .register(Arc::new(AnonymizeProcessor::new(&config.enforcement.pii_keys)?))
                .register(Arc::new(GeoRestrictProcessor::new(
                    config.enforcement.geo_prefixes.clone(),
                )))
                .register(Arc::new(TimeWindowProcessor)),
        );

        let obligations = Arc::new(
            ObligationManager::new(
                Duration::from_millis(config.enforcement.obligation_timeout_ms),
                config.enforcement.obligation_retries,
            )
            .register(Arc::new(NotifyExecutor::new()))
            .register(Arc::new(RetentionExecutor::new())),
        );

        let audit = Arc::new(AuditSink::new(config.audit.clone())?);
        let detector = Arc::new(AnomalyDetector::new(config.anomaly.clone())?);
        detector.clone().spawn_sweeper(Duration::from_secs(3_600));

        let metrics = MetricsCollector::new();
        let background = spawn_background_worker(
            audit.clone(),
            detector.clone(),
            obligations,
            metrics.clone(),
        );

        Ok(Self {
            collector,
            engine,
            constraints,
            upstream,
            audit,
            detector,
            metrics,
            default_rate_limit: config.enforcement.default_rate_limit.clone(),
            background,
        })
    }

    /// Wire the pipeline from configuration, constructing the HTTP judge
    /// when one is configured
    pub fn from_config(config: &AegisConfig, upstream: Arc<dyn Upstream>) -> Result<Self> {
        let judge: Option<Arc<dyn Judge>> = match &config.judge {
            Some(judge_config) => Some(Arc::new(HttpJudge::new(judge_config.clone())?)),
            None => None,
        };
        Self::new(config, judge, upstream)
    }

    /// Serve one request end-to-end
    pub async fn enforce(
        &self,
        req: &InboundRequest,
    ) -> std::result::Result<serde_json::Value, ErrorResponse> {
        let started = Instant::now();
        let mut state = RequestState::Received;
        self.metrics.record_request();
        metrics::counter!("aegis_requests_total").increment(1);

        // 1. Contextualize
        let ctx = match self.collector.collect(req, Utc::now()) {
            Ok(ctx) => ctx,
            Err(e) => {
                state.advance(RequestState::Errored);
                warn!(agent = %req.agent_id, state = ?state, "context rejected: {}", e);
                self.metrics.record_denial();
                self.enqueue(BackgroundWork {
                    entry: context_failure_entry(req, &e),
                    obligations: Vec::new(),
                    ctx: None,
                    decision: None,
                });
                return Err(ErrorResponse::from_error(&e, req.request_id.clone()));
            }
        };
        state.advance(RequestState::Contextualized);

        // 2. Decide; INDETERMINATE coerces to DENY at this boundary
        let mut decision = self.engine.decide(&ctx).await;
        state.advance(RequestState::Decided);
        if decision.verdict == Verdict::Indeterminate {
            debug!(agent = %ctx.agent, reason = %decision.reason, "indeterminate coerced to deny");
            decision.verdict = Verdict::Deny;
        }

        if decision.verdict != Verdict::Permit {
            state.advance(RequestState::Denied);
            self.metrics.record_denial();
            metrics::counter!("aegis_decisions_total", "verdict" => "deny").increment(1);
            self.finalize(&ctx, &decision, AuditOutcome::Failure, started, Vec::new());

            let err = Error::PolicyDeny(decision.reason.clone());
            return Err(ErrorResponse::from_error(&err, req.request_id.clone()));
        }
        metrics::counter!("aegis_decisions_total", "verdict" => "permit").increment(1);

        // 3. Admission: rate limits gate the upstream call itself. The
        // processor annotates window state onto the (empty) admission
        // payload; that annotation is carried onto the response below.
        let directives = ensure_rate_limit(&decision.constraints, &self.default_rate_limit);
        let (admission, shaping): (Vec<String>, Vec<String>) = directives
            .into_iter()
            .partition(|d| matches!(Directive::parse(d), Directive::RateLimit { .. }));

        let admission_meta = match self
            .constraints
            .apply(&admission, serde_json::json!({}), &ctx)
            .await
        {
            Ok(meta) => meta,
            Err(e) => {
                state.advance(RequestState::Denied);
                self.metrics.record_constraint_violation();
                self.finalize(&ctx, &decision, self.outcome_for(&e), started, Vec::new());
                return Err(ErrorResponse::from_error(&e, req.request_id.clone()));
            }
        };

        // 4. Upstream call
        let response = match self.upstream.call(req).await {
            Ok(response) => response,
            Err(e) => {
                state.advance(RequestState::Errored);
                error!(agent = %ctx.agent, resource = %ctx.resource, "upstream failed: {}", e);
                self.finalize(&ctx, &decision, AuditOutcome::Error, started, Vec::new());
                return Err(ErrorResponse::from_error(&e, req.request_id.clone()));
            }
        };
        state.advance(RequestState::Called);

        // 5. Shape the response; a violation here is a deny at egress
        let mut shaped = match self.constraints.apply(&shaping, response, &ctx).await {
            Ok(shaped) => shaped,
            Err(e) => {
                state.advance(RequestState::Errored);
                self.metrics.record_constraint_violation();
                metrics::counter!("aegis_constraint_violations_total").increment(1);
                warn!(agent = %ctx.agent, "response dropped at egress: {}", e);
                self.finalize(&ctx, &decision, self.outcome_for(&e), started, Vec::new());
                return Err(ErrorResponse::from_error(&e, req.request_id.clone()));
            }
        };

        // Surface the admission window state rate-limit-header style
        if let (Some(obj), Some(meta)) = (shaped.as_object_mut(), admission_meta.as_object()) {
            for (key, value) in meta {
                obj.insert(key.clone(), value.clone());
            }
        }
        state.advance(RequestState::Shaped);

        // 6. Background: audit, anomaly detection, obligations
        self.metrics.record_permit();
        let obligations = pending_obligations(&decision.obligations);
        self.finalize(&ctx, &decision, AuditOutcome::Success, started, obligations);
        state.advance(RequestState::Completed);
        debug!(agent = %ctx.agent, resource = %ctx.resource, state = ?state, "request completed");

        Ok(shaped)
    }

    fn finalize(
        &self,
        ctx: &DecisionContext,
        decision: &Decision,
        outcome: AuditOutcome,
        started: Instant,
        obligations: Vec<String>,
    ) {
        let elapsed = started.elapsed();
        self.metrics.record_latency(elapsed.as_micros() as u64);
        metrics::histogram!("aegis_decision_latency_us").record(elapsed.as_micros() as f64);

        let entry =
            AuditEntry::from_decision(ctx, decision, outcome, elapsed.as_millis() as u64);
        self.enqueue(BackgroundWork {
            entry,
            obligations,
            ctx: Some(ctx.clone()),
            decision: Some(decision.clone()),
        });
    }

    fn enqueue(&self, work: BackgroundWork) {
        if self.background.send(work).is_err() {
            error!("background worker is gone, audit entry lost");
        }
    }

    /// Timeouts surface as ERROR, plain violations as FAILURE
    fn outcome_for(&self, err: &Error) -> AuditOutcome {
        match err {
            Error::ConstraintTimeout(_) => AuditOutcome::Error,
            _ => AuditOutcome::Failure,
        }
    }

    /// Ask the audit sink to flush to disk
    pub fn flush(&self) {
        self.audit.flush();
    }

    /// The decision engine, for policy CRUD
    pub fn engine(&self) -> &Arc<HybridEngine> {
        &self.engine
    }

    /// The audit sink
    pub fn audit(&self) -> &Arc<AuditSink> {
        &self.audit
    }

    /// The anomaly detector
    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    /// Enforcement metrics
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Drop `log` duties: the canonical audit record written for every terminal
/// decision already satisfies them, and writing a second entry would break
/// the one-entry-per-decision contract
fn pending_obligations(obligations: &[String]) -> Vec<String> {
    obligations
        .iter()
        .filter(|raw| !matches!(Directive::parse(raw), Directive::Log))
        .cloned()
        .collect()
}

/// Single worker draining the background queue in finalize order
fn spawn_background_worker(
    audit: Arc<AuditSink>,
    detector: Arc<AnomalyDetector>,
    obligations: Arc<ObligationManager>,
    metrics: MetricsCollector,
) -> mpsc::UnboundedSender<BackgroundWork> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundWork>();

    tokio::spawn(async move {
        while let Some(mut work) = rx.recv().await {
            let alerts = detector.detect(&work.entry);
            for alert in &alerts {
                info!(
                    pattern = %alert.pattern_id,
                    severity = ?alert.severity,
                    agent = %alert.agent,
                    auto_mitigated = alert.auto_mitigated,
                    "anomaly detected"
                );
            }

            // A critical anomaly marks the record before it is appended
            if alerts
                .iter()
                .any(|a| a.severity == aegis_telemetry::AlertSeverity::Critical)
            {
                work.entry.outcome = AuditOutcome::Error;
            }
            audit.record(work.entry);

            if work.obligations.is_empty() {
                continue;
            }
            let (Some(ctx), Some(decision)) = (work.ctx, work.decision) else {
                continue;
            };

            // Obligations get their own task so a slow executor cannot
            // stall audit ordering
            let manager = obligations.clone();
            let metrics = metrics.clone();
            let directives = work.obligations;
            tokio::spawn(async move {
                let report = manager.execute(&directives, &ctx, &decision).await;
                for _ in 0..report.failed {
                    metrics.record_obligation_failure();
                }
            });
        }
        debug!("background worker stopped");
    });

    tx
}

/// Audit record for requests rejected before a context existed
fn context_failure_entry(req: &InboundRequest, err: &Error) -> AuditEntry {
    AuditEntry {
        id: format!("aud_{}", uuid::Uuid::new_v4()),
        timestamp: Utc::now(),
        agent: req.agent_id.clone(),
        action: req.method.as_str().to_string(),
        resource: req
            .name
            .clone()
            .or_else(|| req.uri.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        policy_applied: err.to_string(),
        verdict: Verdict::Deny,
        outcome: AuditOutcome::Failure,
        processing_time_ms: 0,
        confidence: 1.0,
        context_json: serde_json::to_value(req).unwrap_or_default(),
        decision_json: serde_json::Value::Null,
    }
}
