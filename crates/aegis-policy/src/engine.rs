//! Hybrid decision engine
//!
//! Orchestrates cache lookup, deterministic rule evaluation, and the AI
//! judge into a single `decide` call. Rule prohibitions are authoritative:
//! the AI is only consulted when no rule decides, and can never overturn a
//! deterministic DENY. Every failure mode on this path fails closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aegis_core::context::DecisionContext;
use aegis_core::decision::{Decision, EngineKind, Verdict};
use aegis_core::directive::split_families;
use aegis_core::error::Result;

use crate::cache::{fingerprint, CacheConfig, DecisionCache};
use crate::evaluator::{evaluate, PolicySet, RuleOutcome};
use crate::judge::Judge;
use crate::rule::Policy;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Evaluate deterministic rules
    #[serde(default = "default_true")]
    pub use_rules: bool,

    /// Consult the AI judge when rules do not decide
    #[serde(default = "default_true")]
    pub use_ai: bool,

    /// Serve repeated identical decisions from cache
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// AI verdicts below this confidence are not combined
    #[serde(default = "default_ai_threshold")]
    pub ai_threshold: f64,

    /// Cache tuning
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_rules: true,
            use_ai: true,
            cache_enabled: true,
            ai_threshold: default_ai_threshold(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ai_threshold() -> f64 {
    0.7
}

/// Atomic decision counters
#[derive(Debug, Default)]
struct Counters {
    rules_hits: AtomicU64,
    ai_hits: AtomicU64,
    cache_hits: AtomicU64,
    total_decisions: AtomicU64,
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub rules_hits: u64,
    pub ai_hits: u64,
    pub cache_hits: u64,
    pub total_decisions: u64,
}

/// The hybrid policy decision point
pub struct HybridEngine {
    /// Raw policies as loaded, including inactive ones
    raw_policies: RwLock<Vec<Policy>>,

    /// Compiled active set, swapped copy-on-write
    compiled: RwLock<Arc<PolicySet>>,

    version: AtomicU64,
    cache: DecisionCache,
    judge: Option<Arc<dyn Judge>>,
    config: EngineConfig,
    counters: Counters,
}

impl HybridEngine {
    /// Create an engine with no policies loaded
    pub fn new(config: EngineConfig, judge: Option<Arc<dyn Judge>>) -> Self {
        let cache = DecisionCache::new(&config.cache);
        Self {
            raw_policies: RwLock::new(Vec::new()),
            compiled: RwLock::new(Arc::new(PolicySet::empty())),
            version: AtomicU64::new(0),
            cache,
            judge,
            config,
            counters: Counters::default(),
        }
    }

    /// Decide a context, fail-closed
    pub async fn decide(&self, ctx: &DecisionContext) -> Decision {
        let start = Instant::now();
        let mut decision = self.decide_inner(ctx).await;
        decision.metadata.evaluation_time_ms = start.elapsed().as_millis() as u64;
        self.counters.total_decisions.fetch_add(1, Ordering::Relaxed);
        decision
    }

    async fn decide_inner(&self, ctx: &DecisionContext) -> Decision {
        if !self.config.use_rules && !self.config.use_ai {
            return Decision::deny("no policy engines enabled", 1.0, EngineKind::Rules);
        }

        // Snapshot the active set; mutations swap a new Arc in
        let set = self.compiled.read().clone();
        let fp = fingerprint(ctx, set.version());

        if self.config.cache_enabled {
            if let Some(mut hit) = self.cache.get(&fp) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                hit.metadata.engine = EngineKind::Cache;
                hit.metadata.cached = true;
                debug!(agent = %ctx.agent, resource = %ctx.resource, "decision served from cache");
                return hit;
            }
        }

        let rule_outcome = if self.config.use_rules {
            evaluate(ctx, &set)
        } else {
            None
        };

        if let Some(ref outcome) = rule_outcome {
            let decisive = outcome.verdict == Verdict::Deny
                || outcome.confidence >= self.config.ai_threshold
                || !self.config.use_ai
                || self.judge.is_none();
            if decisive {
                self.counters.rules_hits.fetch_add(1, Ordering::Relaxed);
                let decision = decision_from_rules(outcome);
                self.maybe_cache(&fp, &decision);
                return decision;
            }
        }

        if self.config.use_ai {
            if let Some(ref judge) = self.judge {
                let ai = match judge.judge(ctx, &set.describe()).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(agent = %ctx.agent, "judge error: {}", e);
                        Decision::indeterminate(format!("engine-error: {}", e), EngineKind::Ai)
                    }
                };

                if ai.verdict != Verdict::Indeterminate {
                    self.counters.ai_hits.fetch_add(1, Ordering::Relaxed);
                    let decision = combine_ai(ai, rule_outcome.as_ref());
                    self.maybe_cache(&fp, &decision);
                    return decision;
                }

                // AI could not decide: a sub-threshold rule outcome still stands
                if let Some(ref outcome) = rule_outcome {
                    self.counters.rules_hits.fetch_add(1, Ordering::Relaxed);
                    let decision = decision_from_rules(outcome);
                    self.maybe_cache(&fp, &decision);
                    return decision;
                }
                return ai;
            }
        }

        // Rules alone were enabled and nothing matched
        Decision::deny("no matching rule (fail closed)", 1.0, EngineKind::Rules)
    }

    /// Cache PERMIT and DENY; never cache INDETERMINATE (transient by nature)
    fn maybe_cache(&self, fp: &str, decision: &Decision) {
        if self.config.cache_enabled && decision.verdict != Verdict::Indeterminate {
            self.cache.put(fp, decision.clone());
        }
    }

    /// Add a policy, bumping the set version and invalidating the cache
    pub fn add_policy(&self, policy: Policy) {
        let mut raw = self.raw_policies.write();
        raw.retain(|p| p.id != policy.id);
        raw.push(policy);
        let snapshot = raw.clone();
        drop(raw);
        self.rebuild(snapshot);
    }

    /// Remove a policy by id; returns whether anything was removed
    pub fn remove_policy(&self, id: &str) -> bool {
        let mut raw = self.raw_policies.write();
        let before = raw.len();
        raw.retain(|p| p.id != id);
        let removed = raw.len() != before;
        let snapshot = raw.clone();
        drop(raw);
        if removed {
            self.rebuild(snapshot);
        }
        removed
    }

    /// All loaded policies, including inactive ones
    pub fn list_policies(&self) -> Vec<Policy> {
        self.raw_policies.read().clone()
    }

    /// Load every `.yaml`/`.yml` policy in a directory
    pub fn load_policy_dir(&self, dir: impl AsRef<std::path::Path>) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            match Policy::from_file(&path) {
                Ok(policy) => {
                    self.add_policy(policy);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = ?path, "failed to load policy: {}", e);
                }
            }
        }
        Ok(loaded)
    }

    fn rebuild(&self, policies: Vec<Policy>) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let set = Arc::new(PolicySet::compile(policies, version));
        *self.compiled.write() = set;
        self.cache.invalidate_all();
        debug!(version, "policy set rebuilt");
    }

    /// Current policy-set version
    pub fn policy_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Counter snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            rules_hits: self.counters.rules_hits.load(Ordering::Relaxed),
            ai_hits: self.counters.ai_hits.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            total_decisions: self.counters.total_decisions.load(Ordering::Relaxed),
        }
    }
}

/// Render a rule outcome into a decision
fn decision_from_rules(outcome: &RuleOutcome) -> Decision {
    let (constraints, obligations) = split_families(&outcome.directives);
    let reason = match outcome.verdict {
        Verdict::Deny => format!("prohibited by {}", outcome.matched_rules.join(", ")),
        _ => format!("permitted by {}", outcome.matched_rules.join(", ")),
    };
    let mut decision = match outcome.verdict {
        Verdict::Deny => Decision::deny(reason, outcome.confidence, EngineKind::Rules),
        _ => Decision::permit(reason, outcome.confidence, EngineKind::Rules),
    };
    decision.constraints = constraints;
    decision.obligations = obligations;
    decision
}

/// Combine an AI verdict with directives from partially matched rules
fn combine_ai(mut ai: Decision, rules: Option<&RuleOutcome>) -> Decision {
    let partial = rules.map(|r| r.partial_directives.as_slice()).unwrap_or(&[]);
    if partial.is_empty() {
        ai.metadata.engine = EngineKind::Ai;
        return ai;
    }

    let (mut constraints, mut obligations) = split_families(partial);
    constraints.retain(|d| !ai.constraints.contains(d));
    obligations.retain(|d| !ai.obligations.contains(d));
    ai.constraints.extend(constraints);
    ai.obligations.extend(obligations);
    ai.metadata.engine = EngineKind::Hybrid;
    ai
}
