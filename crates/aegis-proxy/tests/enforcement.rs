//! End-to-end enforcement tests
//!
//! Drives the full pipeline with a counting mock upstream and a scripted
//! judge: decision, admission, shaping, audit, and anomaly detection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aegis_core::decision::{Decision, DecisionMetadata, EngineKind, Verdict};
use aegis_core::error::{ErrorCode, Result};
use aegis_core::{DecisionContext, InboundRequest};
use aegis_policy::{Judge, Policy};
use aegis_proxy::config::AegisConfig;
use aegis_proxy::enforcer::PolicyEnforcer;
use aegis_proxy::upstream::Upstream;
use aegis_telemetry::{AuditOutcome, AlertSeverity};

/// Upstream that counts calls and returns a canned payload
struct CountingUpstream {
    calls: AtomicUsize,
    payload: serde_json::Value,
}

impl CountingUpstream {
    fn new(payload: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            payload,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for CountingUpstream {
    async fn call(&self, _req: &InboundRequest) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.clone())
    }
}

/// Judge returning one fixed decision
struct ScriptedJudge(Decision);

#[async_trait]
impl Judge for ScriptedJudge {
    async fn judge(&self, _ctx: &DecisionContext, _policy: &str) -> Result<Decision> {
        Ok(self.0.clone())
    }
}

fn sandbox_policy() -> Policy {
    Policy::from_yaml(
        r#"
id: sandbox
name: Sandbox filesystem policy
priority: 10
permission:
  - action: { value: "tools/call" }
    target: { uid: "filesystem__read_file:/tmp/*" }
    duty:
      - action: { value: "log" }
prohibition:
  - action: { value: "tools/call" }
    target: { uid: "filesystem__write_file:*" }
"#,
    )
    .unwrap()
}

fn test_config(audit_dir: &std::path::Path) -> AegisConfig {
    let mut config = AegisConfig::default();
    config.engine.use_ai = false;
    config.audit.audit_dir = audit_dir.to_path_buf();
    config.audit.flush_interval = 1;
    config
}

fn read_req(agent: &str, path: &str) -> InboundRequest {
    InboundRequest::tool_call(agent, "filesystem__read_file")
        .with_arguments(serde_json::json!({ "path": path }))
}

fn write_req(agent: &str, path: &str) -> InboundRequest {
    InboundRequest::tool_call(agent, "filesystem__write_file")
        .with_arguments(serde_json::json!({ "path": path }))
}

/// Poll until the predicate holds or two seconds elapse
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_allowed_read_in_tmp() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({"content": "hello"}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    let result = enforcer.enforce(&read_req("t1", "/tmp/a.txt")).await.unwrap();
    assert_eq!(result["content"], "hello");
    assert_eq!(upstream.calls(), 1);

    // The default rate limit's window state rides along with the response
    assert_eq!(result["_rate_limit"]["limit"], 100);
    assert_eq!(result["_rate_limit"]["remaining"], 99);

    let audit = enforcer.audit().clone();
    wait_until(|| !audit.recent().is_empty()).await;
    let entries = audit.recent();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].verdict, Verdict::Permit);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
}

#[tokio::test]
async fn test_write_denied_without_upstream_call() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    let err = enforcer
        .enforce(&write_req("t1", "/tmp/a.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PolicyDeny);

    // P1: a non-PERMIT verdict must never reach upstream
    assert_eq!(upstream.calls(), 0);

    let audit = enforcer.audit().clone();
    wait_until(|| !audit.recent().is_empty()).await;
    let entries = audit.recent();
    assert_eq!(entries[0].verdict, Verdict::Deny);
    assert_eq!(entries[0].outcome, AuditOutcome::Failure);
}

#[tokio::test]
async fn test_escape_denied() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    let err = enforcer
        .enforce(&read_req("t1", "/etc/passwd"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PolicyDeny);
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_trip() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({"ok": true}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();

    enforcer.engine().add_policy(
        Policy::from_yaml(
            r#"
id: limited
name: Rate limited reads
permission:
  - action: { value: "tools/call" }
    target: { uid: "filesystem__read_file:/tmp/*" }
    duty:
      - action: { value: "10 per sec" }
"#,
        )
        .unwrap(),
    );

    for i in 0..10 {
        let result = enforcer.enforce(&read_req("r1", "/tmp/a.txt")).await;
        let payload = result.unwrap_or_else(|e| panic!("call {} should pass: {:?}", i, e));
        assert_eq!(payload["_rate_limit"]["limit"], 10);
        assert_eq!(payload["_rate_limit"]["remaining"], 9 - i as u64);
    }

    let err = enforcer
        .enforce(&read_req("r1", "/tmp/a.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimitExceeded);
    let retry = err.details.unwrap()["retry_after_ms"].as_u64().unwrap();
    assert!(retry > 0);

    // P3: admission happens before the upstream call
    assert_eq!(upstream.calls(), 10);
}

#[tokio::test]
async fn test_hybrid_fallback_to_ai() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({"ok": true}));

    let judge = ScriptedJudge(Decision {
        verdict: Verdict::Permit,
        reason: "benign read".into(),
        confidence: 0.85,
        constraints: vec![],
        obligations: vec![],
        metadata: DecisionMetadata {
            engine: EngineKind::Ai,
            evaluation_time_ms: 0,
            cached: false,
        },
    });

    let mut config = test_config(dir.path());
    config.engine.use_ai = true;
    let enforcer =
        PolicyEnforcer::new(&config, Some(Arc::new(judge)), upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    // Outside every rule pattern: only the AI can permit this
    let result = enforcer
        .enforce(&read_req("t1", "/home/user/notes.txt"))
        .await;
    assert!(result.is_ok());
    assert_eq!(upstream.calls(), 1);

    let audit = enforcer.audit().clone();
    wait_until(|| !audit.recent().is_empty()).await;
    let entry = &audit.recent()[0];
    assert_eq!(entry.verdict, Verdict::Permit);
    assert_eq!(entry.decision_json["metadata"]["engine"], "AI");
    assert_eq!(entry.confidence, 0.85);
}

#[tokio::test]
async fn test_critical_anomaly_marks_audit_error() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({"content": "SECRET=1"}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    let result = enforcer.enforce(&read_req("snoop", "/tmp/.env")).await;
    assert!(result.is_ok(), "the sandbox policy permits /tmp reads");

    let detector = enforcer.detector().clone();
    wait_until(|| !detector.mitigations().is_empty()).await;

    let mitigations = detector.mitigations();
    assert_eq!(mitigations[0].agent, "snoop");
    assert_eq!(mitigations[0].pattern_id, "sensitive-resource");

    let audit = enforcer.audit().clone();
    wait_until(|| !audit.recent().is_empty()).await;
    let entry = &audit.recent()[0];
    assert_eq!(entry.outcome, AuditOutcome::Error);
}

#[tokio::test]
async fn test_delegation_limits() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    // P6: depth above the maximum
    let deep = read_req("t1", "/tmp/a.txt").with_delegation_chain(vec![
        "a".into(),
        "b".into(),
        "c".into(),
        "d".into(),
    ]);
    let err = enforcer.enforce(&deep).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DelegationDepthExceeded);

    // P6: the agent appearing in its own chain
    let cyclic =
        read_req("t1", "/tmp/a.txt").with_delegation_chain(vec!["x".into(), "t1".into()]);
    let err = enforcer.enforce(&cyclic).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DelegationCycle);

    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn test_policy_mutation_invalidates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    assert!(enforcer.enforce(&read_req("t1", "/tmp/a.txt")).await.is_ok());
    // Second identical request is served from cache
    assert!(enforcer.enforce(&read_req("t1", "/tmp/a.txt")).await.is_ok());
    assert!(enforcer.engine().stats().cache_hits >= 1);

    // P4: removing the policy must force fresh evaluation
    assert!(enforcer.engine().remove_policy("sandbox"));
    let err = enforcer
        .enforce(&read_req("t1", "/tmp/a.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PolicyDeny);
}

#[tokio::test]
async fn test_one_audit_entry_per_decision() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    let _ = enforcer.enforce(&read_req("t1", "/tmp/a.txt")).await;
    let _ = enforcer.enforce(&write_req("t1", "/tmp/a.txt")).await;
    let _ = enforcer.enforce(&read_req("t1", "/etc/shadow")).await;

    let audit = enforcer.audit().clone();
    wait_until(|| audit.recent().len() == 3).await;

    // P7: exactly one entry per terminal decision, verdicts matching
    let verdicts: Vec<Verdict> = audit.recent().iter().map(|e| e.verdict).collect();
    assert_eq!(verdicts, vec![Verdict::Permit, Verdict::Deny, Verdict::Deny]);
}

#[tokio::test]
async fn test_anonymize_constraint_shapes_response() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({
        "content": "reach me at alice@example.com",
        "email": "alice@example.com"
    }));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();

    enforcer.engine().add_policy(
        Policy::from_yaml(
            r#"
id: masked
name: Masked reads
permission:
  - action: { value: "tools/call" }
    target: { uid: "filesystem__read_file:/tmp/*" }
    duty:
      - action: { value: "anonymize-pii" }
"#,
        )
        .unwrap(),
    );

    let result = enforcer.enforce(&read_req("t1", "/tmp/a.txt")).await.unwrap();
    assert_eq!(result["email"], "[REDACTED]");
    assert!(!result["content"].as_str().unwrap().contains("alice@example.com"));
}

#[tokio::test]
async fn test_geo_violation_drops_response() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({"secret": "payload"}));

    let mut config = test_config(dir.path());
    config.enforcement.geo_prefixes = vec![aegis_enforce::GeoPrefix {
        prefix: "198.51.100.".into(),
        country: "US".into(),
    }];
    let enforcer = PolicyEnforcer::new(&config, None, upstream.clone()).unwrap();

    enforcer.engine().add_policy(
        Policy::from_yaml(
            r#"
id: geo
name: Geo gated reads
permission:
  - action: { value: "tools/call" }
    target: { uid: "filesystem__read_file:/tmp/*" }
    duty:
      - action: { value: "geo-restrict:JP" }
"#,
        )
        .unwrap(),
    );

    let req = read_req("t1", "/tmp/a.txt").with_client_ip("198.51.100.20");
    let err = enforcer.enforce(&req).await.unwrap_err();

    // P2: the upstream was called, but the violating response is dropped
    assert_eq!(err.code, ErrorCode::ConstraintViolated);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_indeterminate_coerced_to_deny() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));

    let judge = ScriptedJudge(Decision::indeterminate("ai-low-confidence", EngineKind::Ai));
    let mut config = test_config(dir.path());
    config.engine.use_ai = true;
    let enforcer =
        PolicyEnforcer::new(&config, Some(Arc::new(judge)), upstream.clone()).unwrap();

    let err = enforcer
        .enforce(&read_req("t1", "/somewhere/else.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PolicyDeny);
    assert_eq!(upstream.calls(), 0);

    let audit = enforcer.audit().clone();
    wait_until(|| !audit.recent().is_empty()).await;
    assert_eq!(audit.recent()[0].verdict, Verdict::Deny);
}

#[tokio::test]
async fn test_repeated_denials_raise_alert() {
    use aegis_telemetry::{AlertListener, AnomalyAlert};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector(Mutex<Vec<AnomalyAlert>>);

    impl AlertListener for Collector {
        fn on_alert(&self, alert: &AnomalyAlert) -> Result<()> {
            self.0.lock().push(alert.clone());
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let upstream = CountingUpstream::new(serde_json::json!({}));
    let enforcer = PolicyEnforcer::new(&test_config(dir.path()), None, upstream.clone()).unwrap();
    enforcer.engine().add_policy(sandbox_policy());

    let collector = Arc::new(Collector::default());
    enforcer.detector().add_listener(collector.clone());

    for _ in 0..6 {
        let _ = enforcer.enforce(&write_req("bruteforce", "/tmp/a.txt")).await;
    }

    let audit = enforcer.audit().clone();
    wait_until(|| audit.recent().len() == 6).await;

    let alerts = collector.0.lock().clone();
    let denial_alert = alerts
        .iter()
        .find(|a| a.pattern_id == "repeated-denials")
        .expect("denial streak must raise an alert");
    assert_eq!(denial_alert.severity, AlertSeverity::High);
    assert!(!denial_alert.auto_mitigated);
    assert!(enforcer.detector().mitigations().is_empty());
}
