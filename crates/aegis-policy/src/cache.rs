//! Decision cache
//!
//! TTL cache keyed by a structural fingerprint of the decision context.
//! The active policy-set version is folded into the fingerprint, so policy
//! mutations invalidate every prior entry without touching the map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use aegis_core::context::DecisionContext;
use aegis_core::decision::Decision;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Entry count bound; overflow evicts the TTL-soonest entry
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_max_entries() -> usize {
    10_000
}

/// Compute the structural fingerprint of a context under a policy version
///
/// Every field a rule constraint can gate on participates, so two contexts
/// only share a fingerprint when the evaluator would treat them
/// identically. Time of day is folded in at minute granularity, the same
/// resolution `HH:MM` rule literals compare at.
pub fn fingerprint(ctx: &DecisionContext, policy_version: u64) -> String {
    let mut hasher = Sha256::new();
    for part in [
        ctx.agent.as_str(),
        ctx.action.as_str(),
        ctx.resource.as_str(),
        ctx.agent_type.as_str(),
        ctx.resource_classification.as_str(),
        ctx.environment.client_ip.as_deref().unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    for agent in &ctx.delegation_chain {
        hasher.update(agent.as_bytes());
        hasher.update([1]);
    }
    match ctx.trust_score {
        Some(score) => {
            hasher.update([1]);
            hasher.update(score.to_bits().to_be_bytes());
        }
        None => hasher.update([0]),
    }
    hasher.update([ctx.emergency as u8, ctx.environment.is_business_hours as u8]);
    hasher.update(ctx.minutes_of_day().to_be_bytes());
    hasher.update(policy_version.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    decision: Decision,
    expires_at: Instant,
}

/// Concurrent TTL cache for decisions
///
/// Reads take a shared lock; writes are exclusive. Entries are never
/// mutated in place.
pub struct DecisionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl DecisionCache {
    /// Create a cache from configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_millis(config.ttl_ms),
            max_entries: config.max_entries.max(1),
        }
    }

    /// Look up a fingerprint; expired entries miss
    pub fn get(&self, fp: &str) -> Option<Decision> {
        self.get_at(fp, Instant::now())
    }

    fn get_at(&self, fp: &str, now: Instant) -> Option<Decision> {
        let entries = self.entries.read();
        let entry = entries.get(fp)?;
        if entry.expires_at <= now {
            return None;
        }
        Some(entry.decision.clone())
    }

    /// Insert a decision, evicting the TTL-soonest entry on overflow
    pub fn put(&self, fp: impl Into<String>, decision: Decision) {
        self.put_at(fp, decision, Instant::now());
    }

    fn put_at(&self, fp: impl Into<String>, decision: Decision, now: Instant) {
        let mut entries = self.entries.write();

        if entries.len() >= self.max_entries {
            entries.retain(|_, e| e.expires_at > now);
        }
        if entries.len() >= self.max_entries {
            if let Some(soonest) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&soonest);
            }
        }

        entries.insert(
            fp.into(),
            CacheEntry {
                decision,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop every entry; called when the policy set version changes
    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    /// Number of entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::decision::EngineKind;

    fn cache(ttl_ms: u64, max: usize) -> DecisionCache {
        DecisionCache::new(&CacheConfig {
            ttl_ms,
            max_entries: max,
        })
    }

    fn permit() -> Decision {
        Decision::permit("test", 1.0, EngineKind::Rules)
    }

    #[test]
    fn test_put_get() {
        let c = cache(1000, 10);
        c.put("fp1", permit());
        assert!(c.get("fp1").is_some());
        assert!(c.get("fp2").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache(1000, 10);
        let t0 = Instant::now();
        c.put_at("fp1", permit(), t0);

        assert!(c.get_at("fp1", t0 + Duration::from_millis(500)).is_some());
        assert!(c.get_at("fp1", t0 + Duration::from_millis(1001)).is_none());
    }

    #[test]
    fn test_invalidate_all() {
        let c = cache(60_000, 10);
        c.put("fp1", permit());
        c.put("fp2", permit());
        c.invalidate_all();
        assert!(c.is_empty());
    }

    #[test]
    fn test_overflow_evicts_soonest() {
        let c = cache(1000, 2);
        let t0 = Instant::now();
        c.put_at("oldest", permit(), t0);
        c.put_at("newer", permit(), t0 + Duration::from_millis(100));
        c.put_at("newest", permit(), t0 + Duration::from_millis(200));

        assert_eq!(c.len(), 2);
        let probe = t0 + Duration::from_millis(300);
        assert!(c.get_at("oldest", probe).is_none());
        assert!(c.get_at("newer", probe).is_some());
        assert!(c.get_at("newest", probe).is_some());
    }

    #[test]
    fn test_fingerprint_varies_with_version() {
        use aegis_core::context::{ContextCollector, ContextConfig};
        use aegis_core::request::InboundRequest;
        use chrono::{TimeZone, Utc};

        let req = InboundRequest::tool_call("t1", "tool");
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let ctx = ContextCollector::new(&ContextConfig::default())
            .unwrap()
            .collect(&req, now)
            .unwrap();

        let a = fingerprint(&ctx, 1);
        let b = fingerprint(&ctx, 2);
        assert_ne!(a, b);
        assert_eq!(a, fingerprint(&ctx, 1));
    }

    #[test]
    fn test_fingerprint_varies_with_resource() {
        use aegis_core::context::{ContextCollector, ContextConfig};
        use aegis_core::request::InboundRequest;
        use chrono::{TimeZone, Utc};

        let collector = ContextCollector::new(&ContextConfig::default()).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();

        let a = collector
            .collect(
                &InboundRequest::tool_call("t1", "tool")
                    .with_arguments(serde_json::json!({"path": "/tmp/a"})),
                now,
            )
            .unwrap();
        let b = collector
            .collect(
                &InboundRequest::tool_call("t1", "tool")
                    .with_arguments(serde_json::json!({"path": "/tmp/b"})),
                now,
            )
            .unwrap();

        assert_ne!(fingerprint(&a, 1), fingerprint(&b, 1));
    }

    fn base_ctx() -> DecisionContext {
        use aegis_core::context::{ContextCollector, ContextConfig};
        use aegis_core::request::InboundRequest;
        use chrono::{TimeZone, Utc};

        let req = InboundRequest::tool_call("t1", "tool");
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        ContextCollector::new(&ContextConfig::default())
            .unwrap()
            .collect(&req, now)
            .unwrap()
    }

    #[test]
    fn test_fingerprint_varies_with_trust_score() {
        let mut high = base_ctx();
        high.trust_score = Some(0.95);
        let mut low = base_ctx();
        low.trust_score = Some(0.2);
        let none = base_ctx();

        assert_ne!(fingerprint(&high, 1), fingerprint(&low, 1));
        assert_ne!(fingerprint(&high, 1), fingerprint(&none, 1));
    }

    #[test]
    fn test_fingerprint_varies_with_emergency() {
        let calm = base_ctx();
        let mut urgent = base_ctx();
        urgent.emergency = true;

        assert_ne!(fingerprint(&calm, 1), fingerprint(&urgent, 1));
    }

    #[test]
    fn test_fingerprint_varies_with_delegation_chain() {
        let direct = base_ctx();
        let mut delegated = base_ctx();
        delegated.delegation_chain = vec!["parent".into()];

        assert_ne!(fingerprint(&direct, 1), fingerprint(&delegated, 1));
    }

    #[test]
    fn test_fingerprint_varies_with_agent_type() {
        let unknown = base_ctx();
        let mut typed = base_ctx();
        typed.agent_type = "assistant".into();

        assert_ne!(fingerprint(&unknown, 1), fingerprint(&typed, 1));
    }

    #[test]
    fn test_fingerprint_varies_within_business_hours() {
        use chrono::{TimeZone, Utc};

        // Same business-hours bucket, different minute: rules comparing
        // time_of_day against an exact HH:MM literal must not collide
        let mut early = base_ctx();
        early.time = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let mut late = base_ctx();
        late.time = Utc.with_ymd_and_hms(2025, 6, 2, 10, 1, 0).unwrap();
        assert_eq!(
            early.environment.is_business_hours,
            late.environment.is_business_hours
        );

        assert_ne!(fingerprint(&early, 1), fingerprint(&late, 1));
    }
}
