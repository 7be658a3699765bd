//! Violation sink: a bounded ring of recent denials per policy.
//!
//! Each non-allowed, non-skipped response appends a violation record to the
//! policy's LuaPolicyViolations object, created on first use with an owner
//! reference. Conflicting writes retry down a budget; at zero the record is
//! dropped with a log line.

use kube::api::{Api, DynamicObject, ObjectMeta, PostParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::{Client, Resource, ResourceExt};
use tracing::{error, warn};

use crate::crd::{
    AuditPolicy, LuaPolicy, LuaPolicyViolations, LuaPolicyViolationsSpec,
    LuaPolicyViolationsStatus, PolicyType, PolicyViolation, RequestInfo, UserInfo, ViolationPolicy,
};

/// Violation messages are capped at this many characters.
const MAX_MESSAGE_LEN: usize = 256;

/// Record a denial in the policy's violations ring. `budget` bounds conflict
/// retries; the admission path passes 5, background workers pass 1.
pub async fn log_request(
    client: Client,
    request: &AdmissionRequest<DynamicObject>,
    response: &AdmissionResponse,
    policy: &LuaPolicy,
    mut budget: u32,
) {
    if response.allowed || policy.spec.audit_policy == Some(AuditPolicy::Skip) {
        return;
    }

    let name = policy.name_any();
    let api: Api<LuaPolicyViolations> = Api::all(client);
    let violation = build_violation(request, response, policy);
    let log_size = policy.spec.audit_log_size();

    while budget > 0 {
        budget -= 1;

        let mut violations = match api.get_opt(&name).await {
            Ok(Some(violations)) => violations,
            Ok(None) => {
                let fresh = LuaPolicyViolations {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        owner_references: policy.controller_owner_ref(&()).map(|r| vec![r]),
                        ..Default::default()
                    },
                    spec: LuaPolicyViolationsSpec::default(),
                    status: None,
                };
                match api.create(&PostParams::default(), &fresh).await {
                    Ok(_) => continue,
                    // another replica won the race; retry the read
                    Err(kube::Error::Api(err)) if err.code == 409 => continue,
                    Err(err) => {
                        error!(policy = %name, error = %err, "cannot create violations object");
                        return;
                    }
                }
            }
            Err(err) => {
                error!(policy = %name, error = %err, "cannot read violations object");
                return;
            }
        };

        let mut status = violations.status.take().unwrap_or_default();
        status.violations.push(violation.clone());
        trim_ring(&mut status, log_size);
        violations.status = Some(status);

        let payload = match serde_json::to_vec(&violations) {
            Ok(payload) => payload,
            Err(err) => {
                error!(policy = %name, error = %err, "cannot serialize violations object");
                return;
            }
        };
        match api
            .replace_status(&name, &PostParams::default(), payload)
            .await
        {
            Ok(_) => return,
            Err(kube::Error::Api(err)) if err.code == 409 => continue,
            Err(kube::Error::Api(err)) if err.code == 404 => return,
            Err(err) => {
                error!(policy = %name, error = %err, "cannot record violation");
                return;
            }
        }
    }

    warn!(
        policy = %name,
        "violations status update still conflicting after several retries, giving up"
    );
}

/// Keep the last `size` entries in temporal order.
fn trim_ring(status: &mut LuaPolicyViolationsStatus, size: usize) {
    let len = status.violations.len();
    if len > size {
        status.violations.drain(0..len - size);
    }
}

fn build_violation(
    request: &AdmissionRequest<DynamicObject>,
    response: &AdmissionResponse,
    policy: &LuaPolicy,
) -> PolicyViolation {
    let action = if policy.spec.r#type == PolicyType::Controller {
        "controller".to_string()
    } else {
        policy
            .spec
            .violation_policy
            .unwrap_or(ViolationPolicy::Deny)
            .as_str()
            .to_string()
    };

    let mut message = response.result.message.clone();
    if message.len() > MAX_MESSAGE_LEN {
        message = format!("{}...", truncate_chars(&message, MAX_MESSAGE_LEN - 3));
    }

    PolicyViolation {
        action,
        request_info: Some(RequestInfo {
            api_version: if request.kind.group.is_empty() {
                request.kind.version.clone()
            } else {
                format!("{}/{}", request.kind.group, request.kind.version)
            },
            kind: request.kind.kind.clone(),
            namespace: request.namespace.clone().unwrap_or_default(),
            name: request.name.clone(),
            operation: operation_name(&request.operation).to_string(),
        }),
        user_info: Some(UserInfo {
            username: request.user_info.username.clone().unwrap_or_default(),
            uid: request.user_info.uid.clone().unwrap_or_default(),
        }),
        message,
        reason: response.result.reason.clone(),
        code: i32::from(response.result.code),
        timestamp: jiff::Timestamp::now().to_string(),
    }
}

fn operation_name(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(n: usize) -> PolicyViolation {
        PolicyViolation {
            message: format!("violation {n}"),
            ..Default::default()
        }
    }

    #[test]
    fn ring_keeps_the_last_entries_in_order() {
        let mut status = LuaPolicyViolationsStatus::default();
        for i in 0..7 {
            status.violations.push(violation(i));
            trim_ring(&mut status, 3);
        }
        assert_eq!(status.violations.len(), 3);
        let messages: Vec<_> = status
            .violations
            .iter()
            .map(|v| v.message.as_str())
            .collect();
        assert_eq!(messages, vec!["violation 4", "violation 5", "violation 6"]);
    }

    #[test]
    fn ring_under_capacity_is_untouched() {
        let mut status = LuaPolicyViolationsStatus::default();
        status.violations.push(violation(0));
        status.violations.push(violation(1));
        trim_ring(&mut status, 20);
        assert_eq!(status.violations.len(), 2);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(300);
        let t = truncate_chars(&s, 253);
        assert_eq!(t.chars().count(), 253);
    }
}
