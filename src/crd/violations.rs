//! LuaPolicyViolations Custom Resource Definition.
//!
//! A bounded ring of recent denials per policy, written by the violation
//! sink and owned by the policy so it is cleaned up alongside it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// LuaPolicyViolations records the most recent denials of its owning policy.
/// The spec is intentionally empty; all data lives in the status subresource.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.luapolicy.dev",
    version = "v1beta1",
    kind = "LuaPolicyViolations",
    plural = "luapolicyviolations",
    status = "LuaPolicyViolationsStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LuaPolicyViolationsSpec {}

/// Status of a LuaPolicyViolations object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LuaPolicyViolationsStatus {
    /// Most recent violations, oldest first, trimmed to the policy's
    /// audit log size.
    #[serde(default)]
    pub violations: Vec<PolicyViolation>,
}

/// One recorded denial.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    /// Enforcement action at the time of the violation (deny, warn, dry
    /// or controller).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    /// The request that triggered the violation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<RequestInfo>,

    /// The requesting user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,

    /// Denial message, truncated to 256 characters.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Denial reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// HTTP status code attached to the denial.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: i32,

    /// When the violation was recorded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

/// Object coordinates of the denied request.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
}

/// Identity of the requesting user.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}
