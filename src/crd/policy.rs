//! LuaPolicy Custom Resource Definition.
//!
//! A LuaPolicy holds a user-authored Lua script together with match criteria
//! describing which cluster objects it applies to. Depending on its type the
//! policy is served as a validating or mutating admission webhook, or run
//! continuously against live objects as a controller policy.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default admission timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 10;
/// Default number of violations kept per policy.
pub const DEFAULT_AUDIT_LOG_SIZE: i32 = 20;
/// Upper bound for the violations ring.
pub const MAX_AUDIT_LOG_SIZE: i32 = 40;

/// LuaPolicy is a cluster-scoped policy evaluated by the policy engine.
///
/// Example:
/// ```yaml
/// apiVersion: policy.luapolicy.dev/v1beta1
/// kind: LuaPolicy
/// metadata:
///   name: deny-default-namespace.example.com
/// spec:
///   type: Validating
///   operations: ["CREATE"]
///   resources: ["pods"]
///   script: |
///     if request.namespace == "default" then
///       deny("creation in the default namespace is forbidden")
///     end
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.luapolicy.dev",
    version = "v1beta1",
    kind = "LuaPolicy",
    plural = "luapolicies",
    status = "LuaPolicyStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LuaPolicySpec {
    /// Lua source of the policy. May be empty if a bundle is managed
    /// out-of-band, in which case the bundle object must already exist.
    #[serde(default)]
    pub script: String,

    /// Additional Lua modules available to the script via require().
    /// Maps module name to module source.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,

    /// How the policy is enforced (default: Validating).
    #[serde(default)]
    pub r#type: PolicyType,

    /// Admission operations the policy applies to.
    pub operations: Vec<Operation>,

    /// Resource plurals the policy applies to (e.g. "pods").
    pub resources: Vec<String>,

    /// API groups to match. Empty means all groups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_groups: Vec<String>,

    /// API versions to match. Empty means all versions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_versions: Vec<String>,

    /// Scope of matched objects (Cluster, Namespaced or *).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ResourceScope>,

    /// Only objects in namespaces matching this selector are evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Only objects matching this selector are evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,

    /// What the apiserver does when the webhook cannot be reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// How rules are matched against modified apis (Exact or Equivalent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<MatchPolicy>,

    /// Reinvocation behavior for mutating policies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reinvocation_policy: Option<ReinvocationPolicy>,

    /// What happens when the policy denies a request (default: Deny).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_policy: Option<ViolationPolicy>,

    /// Whether denials are recorded in the violations object (default: Log).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_policy: Option<AuditPolicy>,

    /// Number of violations kept (1..40, default 20).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log_size: Option<i32>,

    /// Hard deadline for a single script evaluation (1..30s, default 10).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

impl LuaPolicySpec {
    /// Evaluation timeout with the default applied.
    pub fn timeout(&self) -> std::time::Duration {
        let secs = self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        std::time::Duration::from_secs(secs.clamp(1, 30) as u64)
    }

    /// Violations ring size with default and upper bound applied.
    pub fn audit_log_size(&self) -> usize {
        match self.audit_log_size {
            Some(size) if size > 0 && size <= MAX_AUDIT_LOG_SIZE => size as usize,
            _ => DEFAULT_AUDIT_LOG_SIZE as usize,
        }
    }

    /// Whether the given admission operation is covered by this policy.
    pub fn matches_operation(&self, op: &Operation) -> bool {
        self.operations
            .iter()
            .any(|o| *o == Operation::All || o == op)
    }
}

/// How a policy is enforced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyType {
    /// Served as a validating admission webhook.
    #[default]
    Validating,
    /// Served as a mutating admission webhook.
    Mutating,
    /// Evaluated continuously against live objects.
    Controller,
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyType::Validating => write!(f, "Validating"),
            PolicyType::Mutating => write!(f, "Mutating"),
            PolicyType::Controller => write!(f, "Controller"),
        }
    }
}

/// Admission operation, mirroring the admissionregistration.k8s.io values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Operation {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "CONNECT")]
    Connect,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::All => write!(f, "*"),
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Connect => write!(f, "CONNECT"),
        }
    }
}

/// Scope of matched resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ResourceScope {
    #[serde(rename = "Cluster")]
    Cluster,
    #[serde(rename = "Namespaced")]
    Namespaced,
    #[serde(rename = "*")]
    All,
}

impl ResourceScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceScope::Cluster => "Cluster",
            ResourceScope::Namespaced => "Namespaced",
            ResourceScope::All => "*",
        }
    }
}

/// Failure policy of the installed webhook configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum FailurePolicy {
    Ignore,
    Fail,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Ignore => "Ignore",
            FailurePolicy::Fail => "Fail",
        }
    }
}

/// Match policy of the installed webhook configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum MatchPolicy {
    Exact,
    Equivalent,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Exact => "Exact",
            MatchPolicy::Equivalent => "Equivalent",
        }
    }
}

/// Reinvocation policy for mutating webhooks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ReinvocationPolicy {
    Never,
    IfNeeded,
}

impl ReinvocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReinvocationPolicy::Never => "Never",
            ReinvocationPolicy::IfNeeded => "IfNeeded",
        }
    }
}

/// What a deny verdict turns into at the admission boundary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
    /// The request is denied (default).
    #[default]
    Deny,
    /// The deny is converted into an allow with a warning attached.
    Warn,
    /// Any non-allow outcome and any mutation is replaced with a plain allow.
    Dry,
}

impl ViolationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationPolicy::Deny => "deny",
            ViolationPolicy::Warn => "warn",
            ViolationPolicy::Dry => "dry",
        }
    }
}

/// Whether denials are recorded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuditPolicy {
    /// Record denials in the violations object (default).
    #[default]
    Log,
    /// Do not record denials.
    Skip,
}

/// Status of a LuaPolicy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LuaPolicyStatus {
    /// Synced or Failed, derived from the conditions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PolicyPhase>,

    /// Machine-readable reason when the policy failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message when the policy failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Content hash of (script, dependencies) the bundle was built from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle_hash: String,

    /// The generation most recently reconciled without error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the derived artifacts.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Lifecycle phase of a LuaPolicy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyPhase {
    Synced,
    Failed,
}

impl std::fmt::Display for PolicyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyPhase::Synced => write!(f, "Synced"),
            PolicyPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition type: the policy bundle compiled successfully.
pub const CONDITION_BUNDLE_COMPILED: &str = "BundleCompiled";
/// Condition type: the webhook configuration is in sync.
pub const CONDITION_WEBHOOK_READY: &str = "WebhookReady";
/// Condition type: the background controller for this policy is running.
pub const CONDITION_CONTROLLER_READY: &str = "ControllerPolicyReady";
/// Condition type: summary over all other conditions.
pub const CONDITION_READY: &str = "Ready";

/// Severity of a false condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

/// Condition describes the state of one derived artifact of a policy.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Severity when the condition is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
}

impl Condition {
    /// Create a condition marked "True".
    pub fn r#true(condition_type: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: "True".to_string(),
            severity: None,
            reason: String::new(),
            message: String::new(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }

    /// Create a condition marked "False" with a reason and message.
    pub fn r#false(
        condition_type: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: &str,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: "False".to_string(),
            severity: Some(severity),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }

    /// Whether this condition is true.
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_and_clamps() {
        let mut spec = LuaPolicySpec::default();
        assert_eq!(spec.timeout().as_secs(), 10);

        spec.timeout_seconds = Some(25);
        assert_eq!(spec.timeout().as_secs(), 25);

        spec.timeout_seconds = Some(500);
        assert_eq!(spec.timeout().as_secs(), 30);
    }

    #[test]
    fn audit_log_size_defaults_and_bounds() {
        let mut spec = LuaPolicySpec::default();
        assert_eq!(spec.audit_log_size(), 20);

        spec.audit_log_size = Some(5);
        assert_eq!(spec.audit_log_size(), 5);

        // out of range falls back to the default
        spec.audit_log_size = Some(0);
        assert_eq!(spec.audit_log_size(), 20);
        spec.audit_log_size = Some(100);
        assert_eq!(spec.audit_log_size(), 20);
    }

    #[test]
    fn operation_wildcard_matches_everything() {
        let spec = LuaPolicySpec {
            operations: vec![Operation::All],
            ..Default::default()
        };
        assert!(spec.matches_operation(&Operation::Create));
        assert!(spec.matches_operation(&Operation::Delete));

        let spec = LuaPolicySpec {
            operations: vec![Operation::Create],
            ..Default::default()
        };
        assert!(spec.matches_operation(&Operation::Create));
        assert!(!spec.matches_operation(&Operation::Delete));
    }

    #[test]
    fn operation_serializes_to_uppercase() {
        assert_eq!(
            serde_json::to_string(&Operation::Create).unwrap(),
            "\"CREATE\""
        );
        assert_eq!(serde_json::to_string(&Operation::All).unwrap(), "\"*\"");
    }

    #[test]
    fn violation_policy_parses_lowercase() {
        let p: ViolationPolicy = serde_json::from_str("\"dry\"").unwrap();
        assert_eq!(p, ViolationPolicy::Dry);
    }
}
