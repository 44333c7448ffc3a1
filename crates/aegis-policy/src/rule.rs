//! Policy and rule definitions
//!
//! Policies are ODRL-style documents: `permission` and `prohibition` rule
//! arrays, each rule carrying an action pattern, an optional target pattern,
//! constraint triples that gate the match, and duties that become directive
//! strings on a fired decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A complete policy containing permission and prohibition rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Version of the policy document
    #[serde(default)]
    pub version: String,

    /// Lifecycle status; only `active` policies evaluate
    #[serde(default)]
    pub status: PolicyStatus,

    /// Evaluation priority, higher first
    #[serde(default)]
    pub priority: i32,

    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Last modification timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,

    /// Rules granting access
    #[serde(default)]
    pub permission: Vec<Rule>,

    /// Rules denying access; these override permissions on the same target
    #[serde(default)]
    pub prohibition: Vec<Rule>,
}

impl Policy {
    /// Load a policy from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load a policy from a file
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Iterate all rules with their kind, prohibitions first
    pub fn rules(&self) -> impl Iterator<Item = (RuleKind, &Rule)> {
        self.prohibition
            .iter()
            .map(|r| (RuleKind::Prohibition, r))
            .chain(self.permission.iter().map(|r| (RuleKind::Permission, r)))
    }

    /// Whether this policy participates in evaluation
    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }
}

/// Policy lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    #[default]
    Active,
    Inactive,
    Draft,
    Deprecated,
}

/// Which side of the permission/prohibition union a rule is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Permission,
    Prohibition,
}

/// A single rule within a policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Action pattern, glob or exact (e.g. `tools/call`)
    pub action: ActionRef,

    /// Optional target pattern, glob or exact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRef>,

    /// Constraint triples; the rule fires only when all evaluate true
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint: Vec<RuleConstraint>,

    /// Obligation templates attached to a fired rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duty: Vec<Duty>,
}

impl Rule {
    /// Duty action values as directive strings
    pub fn duty_directives(&self) -> Vec<String> {
        self.duty.iter().map(|d| d.action.value.clone()).collect()
    }
}

/// Action reference, `{ value: "tools/call" }` on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRef {
    pub value: String,
}

/// Target reference, `{ uid: "filesystem__read_file:/tmp/*" }` on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRef {
    pub uid: String,
}

/// An operand/operator/literal triple over known context fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConstraint {
    #[serde(rename = "leftOperand")]
    pub left_operand: LeftOperand,

    pub operator: ConstraintOperator,

    #[serde(rename = "rightOperand")]
    pub right_operand: serde_json::Value,
}

/// The fixed set of context fields rules may constrain on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeftOperand {
    TimeOfDay,
    IsBusinessHours,
    AgentType,
    TrustScore,
    ResourceClassification,
    DelegationDepth,
    EmergencyFlag,
}

/// The fixed operator set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperator {
    Eq,
    Neq,
    Lt,
    Lteq,
    Gt,
    Gteq,
    In,
    NotIn,
}

/// An obligation template; the action value is a directive string
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Duty {
    pub action: ActionRef,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint: Vec<RuleConstraint>,
}
