//! Deterministic rule evaluation
//!
//! The evaluator is a pure function over an immutable [`PolicySet`]: glob
//! matchers are compiled once when the set is built, and evaluation takes no
//! locks, so it is safe to call from any number of workers concurrently.

use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use aegis_core::context::{parse_hhmm, DecisionContext};
use aegis_core::decision::Verdict;

use crate::rule::{ConstraintOperator, LeftOperand, Policy, Rule, RuleConstraint, RuleKind};

/// An immutable, compiled collection of policies
///
/// The version is monotonic across mutations and is folded into every cache
/// fingerprint, which is what invalidates stale cache entries.
pub struct PolicySet {
    policies: Vec<Policy>,
    version: u64,
    matchers: HashMap<String, Regex>,
}

impl PolicySet {
    /// Compile a set of policies, keeping only active ones, priority descending
    pub fn compile(mut policies: Vec<Policy>, version: u64) -> Self {
        policies.retain(|p| p.is_active());
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut matchers = HashMap::new();
        for policy in &policies {
            for (_, rule) in policy.rules() {
                compile_matcher(&mut matchers, &rule.action.value);
                if let Some(ref target) = rule.target {
                    compile_matcher(&mut matchers, &target.uid);
                }
            }
        }

        Self {
            policies,
            version,
            matchers,
        }
    }

    /// An empty set at version 0
    pub fn empty() -> Self {
        Self::compile(Vec::new(), 0)
    }

    /// Monotonic version of this set
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Active policies, priority descending
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Match a rule pattern against a normalized context string
    fn matches(&self, pattern: &str, value: &str) -> bool {
        if !is_glob(pattern) {
            return pattern == value;
        }
        match self.matchers.get(pattern) {
            Some(re) => re.is_match(value),
            // Pattern failed to compile at build time; fall back to exact
            None => pattern == value,
        }
    }

    /// Human-readable description fed to the AI judge as policy text
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for policy in &self.policies {
            out.push_str(&format!(
                "Policy '{}' (priority {}):\n",
                policy.name, policy.priority
            ));
            for rule in &policy.prohibition {
                out.push_str(&format!("  PROHIBIT {}\n", describe_rule(rule)));
            }
            for rule in &policy.permission {
                out.push_str(&format!("  PERMIT {}\n", describe_rule(rule)));
            }
        }
        if out.is_empty() {
            out.push_str("No active policies.\n");
        }
        out
    }
}

fn describe_rule(rule: &Rule) -> String {
    let mut s = rule.action.value.clone();
    if let Some(ref target) = rule.target {
        s.push_str(&format!(" on {}", target.uid));
    }
    for c in &rule.constraint {
        s.push_str(&format!(
            " when {:?} {:?} {}",
            c.left_operand, c.operator, c.right_operand
        ));
    }
    s
}

fn compile_matcher(matchers: &mut HashMap<String, Regex>, pattern: &str) {
    if !is_glob(pattern) || matchers.contains_key(pattern) {
        return;
    }
    match Regex::new(&glob_to_regex(pattern)) {
        Ok(re) => {
            matchers.insert(pattern.to_string(), re);
        }
        Err(e) => warn!(pattern = %pattern, "failed to compile rule pattern: {}", e),
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Translate a glob pattern (`*`, `?`) into an anchored regex
fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

/// Outcome of a deterministic evaluation; `None` from [`evaluate`] is NO_MATCH
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    /// PERMIT for a fired permission, DENY for a fired prohibition
    pub verdict: Verdict,

    /// Always 1.0 for deterministic fires
    pub confidence: f64,

    /// Labels of the rules that fired
    pub matched_rules: Vec<String>,

    /// Duty directives merged from the fired rules
    pub directives: Vec<String>,

    /// Duty directives from rules whose action/target matched but whose
    /// constraints did not hold; the hybrid engine may merge these into an
    /// AI decision
    pub partial_directives: Vec<String>,
}

/// Evaluate a context against a policy set
///
/// Active policies are visited in priority order. A rule fires when its
/// action (and target, if present) matches and every constraint triple holds.
/// Any fired prohibition denies the request regardless of permission
/// priority; otherwise the highest-priority fired permission wins.
pub fn evaluate(ctx: &DecisionContext, set: &PolicySet) -> Option<RuleOutcome> {
    let mut fired_permission: Option<(String, &Rule)> = None;
    let mut partial_directives = Vec::new();

    for policy in set.policies() {
        for (kind, rule) in policy.rules() {
            if !set.matches(&rule.action.value, &ctx.action) {
                continue;
            }
            if let Some(ref target) = rule.target {
                if !set.matches(&target.uid, &ctx.resource) {
                    continue;
                }
            }

            let label = rule_label(policy, kind, rule);

            if !constraints_hold(&rule.constraint, ctx) {
                partial_directives.extend(rule.duty_directives());
                continue;
            }

            match kind {
                RuleKind::Prohibition => {
                    // Prohibitions override permissions outright
                    return Some(RuleOutcome {
                        verdict: Verdict::Deny,
                        confidence: 1.0,
                        matched_rules: vec![label],
                        directives: rule.duty_directives(),
                        partial_directives,
                    });
                }
                RuleKind::Permission => {
                    if fired_permission.is_none() {
                        fired_permission = Some((label, rule));
                    }
                }
            }
        }
    }

    fired_permission.map(|(label, rule)| RuleOutcome {
        verdict: Verdict::Permit,
        confidence: 1.0,
        matched_rules: vec![label],
        directives: rule.duty_directives(),
        partial_directives,
    })
}

fn rule_label(policy: &Policy, kind: RuleKind, rule: &Rule) -> String {
    let kind = match kind {
        RuleKind::Permission => "permission",
        RuleKind::Prohibition => "prohibition",
    };
    match rule.target {
        Some(ref t) => format!("{}/{}:{}@{}", policy.id, kind, rule.action.value, t.uid),
        None => format!("{}/{}:{}", policy.id, kind, rule.action.value),
    }
}

/// A rule fires only when every constraint triple evaluates true
fn constraints_hold(constraints: &[RuleConstraint], ctx: &DecisionContext) -> bool {
    constraints.iter().all(|c| constraint_holds(c, ctx))
}

fn constraint_holds(c: &RuleConstraint, ctx: &DecisionContext) -> bool {
    let Some(field) = field_value(c.left_operand, ctx) else {
        // Missing context field never satisfies a constraint
        return false;
    };
    apply_operator(&field, c.operator, &c.right_operand)
}

/// A context field projected for comparison
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Bool(bool),
    Num(f64),
    Str(String),
}

fn field_value(operand: LeftOperand, ctx: &DecisionContext) -> Option<FieldValue> {
    match operand {
        LeftOperand::TimeOfDay => Some(FieldValue::Num(ctx.minutes_of_day() as f64)),
        LeftOperand::IsBusinessHours => {
            Some(FieldValue::Bool(ctx.environment.is_business_hours))
        }
        LeftOperand::AgentType => Some(FieldValue::Str(ctx.agent_type.clone())),
        LeftOperand::TrustScore => ctx.trust_score.map(FieldValue::Num),
        LeftOperand::ResourceClassification => {
            Some(FieldValue::Str(ctx.resource_classification.clone()))
        }
        LeftOperand::DelegationDepth => Some(FieldValue::Num(ctx.delegation_depth() as f64)),
        LeftOperand::EmergencyFlag => Some(FieldValue::Bool(ctx.emergency)),
    }
}

/// Project a JSON literal into the same domain as a field value
///
/// Numeric fields accept plain numbers; `HH:MM` strings are converted to
/// minutes since midnight for `time_of_day` comparisons.
fn literal_value(field: &FieldValue, literal: &serde_json::Value) -> Option<FieldValue> {
    match field {
        FieldValue::Bool(_) => literal.as_bool().map(FieldValue::Bool),
        FieldValue::Num(_) => match literal {
            serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Num),
            serde_json::Value::String(s) if s.contains(':') => {
                parse_hhmm(s).ok().map(|m| FieldValue::Num(m as f64))
            }
            _ => None,
        },
        FieldValue::Str(_) => literal.as_str().map(|s| FieldValue::Str(s.to_string())),
    }
}

fn apply_operator(
    field: &FieldValue,
    op: ConstraintOperator,
    right: &serde_json::Value,
) -> bool {
    match op {
        ConstraintOperator::In | ConstraintOperator::NotIn => {
            let Some(items) = right.as_array() else {
                return false;
            };
            let contained = items
                .iter()
                .filter_map(|v| literal_value(field, v))
                .any(|v| v == *field);
            match op {
                ConstraintOperator::In => contained,
                _ => !contained,
            }
        }
        _ => {
            let Some(lit) = literal_value(field, right) else {
                return false;
            };
            match op {
                ConstraintOperator::Eq => *field == lit,
                ConstraintOperator::Neq => *field != lit,
                ConstraintOperator::Lt | ConstraintOperator::Lteq | ConstraintOperator::Gt
                | ConstraintOperator::Gteq => {
                    let (FieldValue::Num(a), FieldValue::Num(b)) = (field, &lit) else {
                        return false;
                    };
                    match op {
                        ConstraintOperator::Lt => a < b,
                        ConstraintOperator::Lteq => a <= b,
                        ConstraintOperator::Gt => a > b,
                        _ => a >= b,
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}
