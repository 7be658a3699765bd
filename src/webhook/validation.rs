//! Admission validation for LuaPolicy objects served at `/crds`.
//!
//! Rejections happen before any side effect: a policy that fails validation
//! never reaches the reconciler.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Resource;
use kube::api::DynamicObject;
use kube::core::Status;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};

use crate::crd::{
    LuaPolicy, MAX_AUDIT_LOG_SIZE, Operation as PolicyOperation, PolicyType,
};

/// Validate a LuaPolicy admission request. Objects in other API groups pass
/// through allowed.
pub fn handle(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    if req.kind.group.as_str() != LuaPolicy::group(&()).as_ref()
        || req.kind.kind.as_str() != LuaPolicy::kind(&()).as_ref()
    {
        return AdmissionResponse::from(req);
    }

    let (policy, old_policy) = match decode(req) {
        Ok(decoded) => decoded,
        Err(message) => return denied(req, "BadRequest", &message, 400),
    };

    let errors = match req.operation {
        Operation::Create => validate_policy(&policy, None),
        Operation::Update => validate_policy(&policy, old_policy.as_ref()),
        _ => return denied(req, "BadRequest", "operation not supported", 400),
    };

    if errors.is_empty() {
        AdmissionResponse::from(req)
    } else {
        denied(req, "Forbidden", &errors.join("; "), 403)
    }
}

fn decode(
    req: &AdmissionRequest<DynamicObject>,
) -> Result<(LuaPolicy, Option<LuaPolicy>), String> {
    let object = req
        .object
        .as_ref()
        .ok_or_else(|| "missing object in request".to_string())?;
    let policy: LuaPolicy = serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|err| format!("invalid LuaPolicy: {err}"))?;

    let old_policy = match req.old_object.as_ref() {
        Some(old) => Some(
            serde_json::to_value(old)
                .and_then(serde_json::from_value)
                .map_err(|err| format!("invalid previous LuaPolicy: {err}"))?,
        ),
        None => None,
    };

    Ok((policy, old_policy))
}

fn denied(
    req: &AdmissionRequest<DynamicObject>,
    reason: &str,
    message: &str,
    code: u16,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(req);
    response.allowed = false;
    response.result = Status::failure(message, reason).with_code(code);
    response
}

/// Validate a policy spec, optionally against its previous version.
pub fn validate_policy(policy: &LuaPolicy, old: Option<&LuaPolicy>) -> Vec<String> {
    let mut errors = Vec::new();
    let spec = &policy.spec;

    let name = policy.metadata.name.as_deref().unwrap_or_default();
    if let Err(err) = validate_qualified_name(name) {
        errors.push(format!("metadata.name: {err}"));
    }

    if spec.operations.is_empty() {
        errors.push("spec.operations: at least one operation is required".to_string());
    }
    if spec.operations.len() > 1 && spec.operations.contains(&PolicyOperation::All) {
        errors.push(
            "spec.operations: if '*' is present, must not specify other operations".to_string(),
        );
    }
    if spec.r#type == PolicyType::Controller {
        for op in &spec.operations {
            if matches!(op, PolicyOperation::Update | PolicyOperation::Connect) {
                errors.push(format!(
                    "spec.operations: {op} is not supported for controller policies"
                ));
            }
        }
    }

    errors.extend(validate_resources(&spec.resources));

    if spec.api_groups.len() > 1 && spec.api_groups.iter().any(|g| g == "*") {
        errors.push(
            "spec.apiGroups: if '*' is present, must not specify other API groups".to_string(),
        );
    }
    if spec.api_versions.len() > 1 && spec.api_versions.iter().any(|v| v == "*") {
        errors.push(
            "spec.apiVersions: if '*' is present, must not specify other API versions".to_string(),
        );
    }
    if spec.api_versions.iter().any(String::is_empty) {
        errors.push("spec.apiVersions: version must not be empty".to_string());
    }

    if let Some(timeout) = spec.timeout_seconds {
        if !(1..=30).contains(&timeout) {
            errors.push(format!(
                "spec.timeoutSeconds: the timeout value must be between 1 and 30 seconds, got {timeout}"
            ));
        }
    }
    if let Some(size) = spec.audit_log_size {
        if !(1..=MAX_AUDIT_LOG_SIZE).contains(&size) {
            errors.push(format!(
                "spec.auditLogSize: the audit log size needs to be between 1 and 40, got {size}"
            ));
        }
    }

    if let Some(selector) = &spec.namespace_selector {
        errors.extend(validate_label_selector(selector, "spec.namespaceSelector"));
    }
    if let Some(selector) = &spec.object_selector {
        errors.extend(validate_label_selector(selector, "spec.objectSelector"));
    }

    if let Some(old) = old {
        if old.spec.r#type != spec.r#type {
            errors.push("spec.type: type is immutable".to_string());
        }
    }

    errors
}

/// Policy names must be domain-qualified: a DNS-1123 subdomain containing at
/// least one dot.
fn validate_qualified_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is required".to_string());
    }
    if name.len() > 253 {
        return Err("name must be no more than 253 characters".to_string());
    }
    if !name.contains('.') {
        return Err("name must be fully qualified (e.g. mypolicy.company.tld)".to_string());
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err("name must not contain empty dot-separated segments".to_string());
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(
                "name must consist of lowercase alphanumeric characters, '-' and '.'".to_string(),
            );
        }
        if segment.starts_with('-') || segment.ends_with('-') {
            return Err("name segments must not start or end with '-'".to_string());
        }
    }
    Ok(())
}

fn validate_resources(resources: &[String]) -> Vec<String> {
    let mut errors = Vec::new();
    if resources.is_empty() {
        errors.push("spec.resources: at least one resource is required".to_string());
        return errors;
    }

    let mut wildcard_subresources: Vec<&str> = Vec::new(); // x/*
    let mut wildcard_resources: Vec<&str> = Vec::new(); // */x
    let mut has_double_wildcard = false;
    let mut has_single_wildcard = false;
    let mut has_plain_resource = false;

    for entry in resources {
        if entry.is_empty() {
            errors.push("spec.resources: resource must not be empty".to_string());
            continue;
        }
        if entry == "*/*" {
            has_double_wildcard = true;
        }
        if entry == "*" {
            has_single_wildcard = true;
        }
        match entry.split_once('/') {
            None => {
                if entry != "*" {
                    has_plain_resource = true;
                }
            }
            Some((resource, subresource)) => {
                if wildcard_subresources.contains(&resource) {
                    errors.push(format!(
                        "spec.resources: if '{resource}/*' is present, must not specify {entry}"
                    ));
                }
                if wildcard_resources.contains(&subresource) {
                    errors.push(format!(
                        "spec.resources: if '*/{subresource}' is present, must not specify {entry}"
                    ));
                }
                if subresource == "*" {
                    wildcard_subresources.push(resource);
                }
                if resource == "*" {
                    wildcard_resources.push(subresource);
                }
            }
        }
    }

    if resources.len() > 1 && has_double_wildcard {
        errors.push("spec.resources: if '*/*' is present, must not specify other resources".to_string());
    }
    if has_single_wildcard && has_plain_resource {
        errors.push(
            "spec.resources: if '*' is present, must not specify other resources without subresources"
                .to_string(),
        );
    }
    errors
}

fn validate_label_selector(selector: &LabelSelector, path: &str) -> Vec<String> {
    match kube::core::Selector::try_from(selector.clone()) {
        Ok(_) => Vec::new(),
        Err(err) => vec![format!("{path}: {err}")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LuaPolicySpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use kube::api::ObjectMeta;

    fn policy(name: &str, spec: LuaPolicySpec) -> LuaPolicy {
        LuaPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn valid_spec() -> LuaPolicySpec {
        LuaPolicySpec {
            script: "allow()".to_string(),
            operations: vec![PolicyOperation::Create],
            resources: vec!["pods".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_valid_policy() {
        let p = policy("a.test", valid_spec());
        assert!(validate_policy(&p, None).is_empty());
    }

    #[test]
    fn rejects_unqualified_names() {
        let p = policy("mypolicy", valid_spec());
        let errors = validate_policy(&p, None);
        assert!(errors.iter().any(|e| e.contains("fully qualified")));

        let p = policy("My.Policy", valid_spec());
        assert!(!validate_policy(&p, None).is_empty());
    }

    #[test]
    fn rejects_wildcard_mixed_with_other_operations() {
        let mut spec = valid_spec();
        spec.operations = vec![PolicyOperation::All, PolicyOperation::Create];
        let errors = validate_policy(&policy("a.test", spec), None);
        assert!(errors.iter().any(|e| e.contains("operations")));
    }

    #[test]
    fn rejects_wildcard_mixed_with_other_resources() {
        let mut spec = valid_spec();
        spec.resources = vec!["*".to_string(), "pods".to_string()];
        let errors = validate_policy(&policy("a.test", spec), None);
        assert!(errors.iter().any(|e| e.contains("resources")));
    }

    #[test]
    fn allows_wildcard_with_subresources() {
        let mut spec = valid_spec();
        spec.resources = vec!["*".to_string(), "pods/status".to_string()];
        assert!(validate_policy(&policy("a.test", spec), None).is_empty());
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        for timeout in [0, 31, -5] {
            let mut spec = valid_spec();
            spec.timeout_seconds = Some(timeout);
            let errors = validate_policy(&policy("a.test", spec), None);
            assert!(
                errors.iter().any(|e| e.contains("timeoutSeconds")),
                "timeout {timeout} should be rejected"
            );
        }

        let mut spec = valid_spec();
        spec.timeout_seconds = Some(30);
        assert!(validate_policy(&policy("a.test", spec), None).is_empty());
    }

    #[test]
    fn rejects_out_of_range_audit_log_size() {
        for size in [0, 41] {
            let mut spec = valid_spec();
            spec.audit_log_size = Some(size);
            let errors = validate_policy(&policy("a.test", spec), None);
            assert!(errors.iter().any(|e| e.contains("auditLogSize")));
        }
    }

    #[test]
    fn rejects_update_and_connect_for_controller_policies() {
        let mut spec = valid_spec();
        spec.r#type = PolicyType::Controller;
        spec.operations = vec![PolicyOperation::Update];
        let errors = validate_policy(&policy("a.test", spec), None);
        assert!(errors.iter().any(|e| e.contains("controller")));

        let mut spec = valid_spec();
        spec.r#type = PolicyType::Controller;
        spec.operations = vec![PolicyOperation::Create, PolicyOperation::Delete];
        assert!(validate_policy(&policy("a.test", spec), None).is_empty());
    }

    #[test]
    fn rejects_type_changes_on_update() {
        let old = policy("a.test", valid_spec());
        let mut spec = valid_spec();
        spec.r#type = PolicyType::Mutating;
        let errors = validate_policy(&policy("a.test", spec), Some(&old));
        assert!(errors.iter().any(|e| e.contains("immutable")));
    }

    #[test]
    fn rejects_invalid_label_selector() {
        let mut spec = valid_spec();
        spec.object_selector = Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "team".to_string(),
                operator: "In".to_string(),
                values: None,
            }]),
            ..Default::default()
        });
        let errors = validate_policy(&policy("a.test", spec), None);
        assert!(
            errors.iter().any(|e| e.contains("objectSelector")),
            "In without values must be rejected: {errors:?}"
        );
    }

    #[test]
    fn rejects_conflicting_subresource_wildcards() {
        let mut spec = valid_spec();
        spec.resources = vec!["pods/*".to_string(), "pods/status".to_string()];
        let errors = validate_policy(&policy("a.test", spec), None);
        assert!(!errors.is_empty());
    }
}
