//! Materialization of webhook configurations from policies.
//!
//! Each validating or mutating policy owns exactly one webhook configuration
//! of its category. Owned configurations carry labels for lookup and an owner
//! reference for cascading deletion; the CA bundle read at startup is
//! re-applied on every sync.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::info;

use crate::config::Settings;
use crate::crd::{LuaPolicy, Operation, ResourceScope};

/// Label identifying configurations managed by this engine.
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label carrying the owning policy's name.
pub const POLICY_LABEL: &str = "policy.luapolicy.dev/policy";
/// Service port webhook client configs point at.
const WEBHOOK_SERVICE_PORT: i32 = 443;

fn managed_by() -> String {
    "luapolicy".to_string()
}

fn owned_selector(policy_name: &str) -> String {
    format!("{MANAGED_BY_LABEL}={},{POLICY_LABEL}={policy_name}", managed_by())
}

fn config_labels(policy_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), managed_by());
    labels.insert(POLICY_LABEL.to_string(), policy_name.to_string());
    labels
}

/// Rule derived from the policy's match criteria, with the documented
/// defaults applied: empty apiGroups/apiVersions become `["*"]`, missing
/// scope becomes `*` (all scopes).
fn webhook_rule(policy: &LuaPolicy) -> RuleWithOperations {
    let spec = &policy.spec;
    let defaulted = |values: &[String]| {
        if values.is_empty() {
            vec!["*".to_string()]
        } else {
            values.to_vec()
        }
    };

    RuleWithOperations {
        operations: Some(spec.operations.iter().map(Operation::to_string).collect()),
        api_groups: Some(defaulted(&spec.api_groups)),
        api_versions: Some(defaulted(&spec.api_versions)),
        resources: Some(spec.resources.clone()),
        scope: Some(
            spec.scope
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| ResourceScope::All.as_str().to_string()),
        ),
    }
}

/// Default selector: namespaces labeled `control-plane` are excluded.
fn default_namespace_selector() -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: "control-plane".to_string(),
            operator: "DoesNotExist".to_string(),
            values: None,
        }]),
        match_labels: None,
    }
}

fn client_config(path: &str, settings: &Settings, ca_bundle: &[u8]) -> WebhookClientConfig {
    let ca_bundle = (!ca_bundle.is_empty()).then(|| ByteString(ca_bundle.to_vec()));
    match &settings.webhook_url {
        Some(url) => WebhookClientConfig {
            url: Some(format!("{}{path}", url.trim_end_matches('/'))),
            service: None,
            ca_bundle,
        },
        None => WebhookClientConfig {
            url: None,
            service: Some(ServiceReference {
                name: settings.service_name.clone(),
                namespace: settings.namespace.clone(),
                path: Some(path.to_string()),
                port: Some(WEBHOOK_SERVICE_PORT),
            }),
            ca_bundle,
        },
    }
}

fn desired_validating_webhook(
    policy: &LuaPolicy,
    settings: &Settings,
    ca_bundle: &[u8],
) -> ValidatingWebhook {
    let name = policy.name_any();
    let spec = &policy.spec;
    ValidatingWebhook {
        name: name.clone(),
        client_config: client_config(&format!("/policy/{name}"), settings, ca_bundle),
        rules: Some(vec![webhook_rule(policy)]),
        failure_policy: Some(
            spec.failure_policy
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "Fail".to_string()),
        ),
        match_policy: Some(
            spec.match_policy
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "Equivalent".to_string()),
        ),
        namespace_selector: Some(
            spec.namespace_selector
                .clone()
                .unwrap_or_else(default_namespace_selector),
        ),
        object_selector: Some(spec.object_selector.clone().unwrap_or_default()),
        side_effects: "None".to_string(),
        timeout_seconds: Some(spec.timeout_seconds.unwrap_or(10)),
        admission_review_versions: vec!["v1".to_string()],
        match_conditions: None,
    }
}

fn desired_mutating_webhook(
    policy: &LuaPolicy,
    settings: &Settings,
    ca_bundle: &[u8],
) -> MutatingWebhook {
    let validating = desired_validating_webhook(policy, settings, ca_bundle);
    MutatingWebhook {
        name: validating.name,
        client_config: validating.client_config,
        rules: validating.rules,
        failure_policy: validating.failure_policy,
        match_policy: validating.match_policy,
        namespace_selector: validating.namespace_selector,
        object_selector: validating.object_selector,
        side_effects: validating.side_effects,
        timeout_seconds: validating.timeout_seconds,
        admission_review_versions: validating.admission_review_versions,
        reinvocation_policy: Some(
            policy
                .spec
                .reinvocation_policy
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "Never".to_string()),
        ),
        match_conditions: None,
    }
}

fn owned_metadata(policy: &LuaPolicy) -> ObjectMeta {
    let name = policy.name_any();
    ObjectMeta {
        generate_name: Some(format!("{name}-")),
        labels: Some(config_labels(&name)),
        owner_references: policy.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Ensure exactly one validating webhook configuration exists for the policy
/// and matches the desired shape. Extras are deleted; an existing
/// configuration is only written when it actually differs.
pub async fn sync_validating(
    client: &Client,
    policy: &LuaPolicy,
    settings: &Settings,
    ca_bundle: &[u8],
) -> Result<(), kube::Error> {
    let name = policy.name_any();
    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let owned = api
        .list(&ListParams::default().labels(&owned_selector(&name)))
        .await?;

    let mut items = owned.items.into_iter();
    let existing = items.next();
    for extra in items {
        info!(config = %extra.name_any(), "deleting extra validating webhook configuration");
        delete_ignoring_missing(&api, &extra.name_any()).await?;
    }

    let webhook = desired_validating_webhook(policy, settings, ca_bundle);
    match existing {
        None => {
            info!(policy = %name, "creating validating webhook configuration");
            let config = ValidatingWebhookConfiguration {
                metadata: owned_metadata(policy),
                webhooks: Some(vec![webhook]),
            };
            api.create(&PostParams::default(), &config).await?;
        }
        Some(existing) => {
            let mut desired = existing.clone();
            desired.webhooks = Some(vec![webhook]);
            desired
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(config_labels(&name));
            if serde_json::to_value(&existing).ok() != serde_json::to_value(&desired).ok() {
                info!(policy = %name, config = %existing.name_any(),
                    "updating validating webhook configuration");
                api.replace(&existing.name_any(), &PostParams::default(), &desired)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Mutating counterpart of [`sync_validating`].
pub async fn sync_mutating(
    client: &Client,
    policy: &LuaPolicy,
    settings: &Settings,
    ca_bundle: &[u8],
) -> Result<(), kube::Error> {
    let name = policy.name_any();
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let owned = api
        .list(&ListParams::default().labels(&owned_selector(&name)))
        .await?;

    let mut items = owned.items.into_iter();
    let existing = items.next();
    for extra in items {
        info!(config = %extra.name_any(), "deleting extra mutating webhook configuration");
        delete_ignoring_missing(&api, &extra.name_any()).await?;
    }

    let webhook = desired_mutating_webhook(policy, settings, ca_bundle);
    match existing {
        None => {
            info!(policy = %name, "creating mutating webhook configuration");
            let config = MutatingWebhookConfiguration {
                metadata: owned_metadata(policy),
                webhooks: Some(vec![webhook]),
            };
            api.create(&PostParams::default(), &config).await?;
        }
        Some(existing) => {
            let mut desired = existing.clone();
            desired.webhooks = Some(vec![webhook]);
            desired
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(config_labels(&name));
            if serde_json::to_value(&existing).ok() != serde_json::to_value(&desired).ok() {
                info!(policy = %name, config = %existing.name_any(),
                    "updating mutating webhook configuration");
                api.replace(&existing.name_any(), &PostParams::default(), &desired)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Delete every validating webhook configuration owned by the policy.
pub async fn delete_owned_validating(
    client: &Client,
    policy_name: &str,
) -> Result<(), kube::Error> {
    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let owned = api
        .list(&ListParams::default().labels(&owned_selector(policy_name)))
        .await?;
    for config in owned {
        info!(config = %config.name_any(), "deleting validating webhook configuration");
        delete_ignoring_missing(&api, &config.name_any()).await?;
    }
    Ok(())
}

/// Delete every mutating webhook configuration owned by the policy.
pub async fn delete_owned_mutating(
    client: &Client,
    policy_name: &str,
) -> Result<(), kube::Error> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let owned = api
        .list(&ListParams::default().labels(&owned_selector(policy_name)))
        .await?;
    for config in owned {
        info!(config = %config.name_any(), "deleting mutating webhook configuration");
        delete_ignoring_missing(&api, &config.name_any()).await?;
    }
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

/// Install the engine's own validating webhook configuration for the `/crds`
/// endpoint so LuaPolicy objects are schema-validated at admission.
pub async fn ensure_crd_webhook_configuration(
    client: &Client,
    settings: &Settings,
    ca_bundle: &[u8],
) -> Result<(), kube::Error> {
    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let name = settings.service_name.clone();

    let group = LuaPolicy::group(&()).to_string();
    let webhook = ValidatingWebhook {
        name: format!("{}.{}", LuaPolicy::plural(&()), group),
        client_config: client_config("/crds", settings, ca_bundle),
        rules: Some(vec![RuleWithOperations {
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            api_groups: Some(vec![group]),
            api_versions: Some(vec![LuaPolicy::version(&()).to_string()]),
            resources: Some(vec![LuaPolicy::plural(&()).to_string()]),
            scope: Some("Cluster".to_string()),
        }]),
        failure_policy: Some("Fail".to_string()),
        match_policy: Some("Equivalent".to_string()),
        namespace_selector: None,
        object_selector: None,
        side_effects: "None".to_string(),
        timeout_seconds: Some(10),
        admission_review_versions: vec!["v1".to_string()],
        match_conditions: None,
    };

    let desired = ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                managed_by(),
            )])),
            ..Default::default()
        },
        webhooks: Some(vec![webhook]),
    };

    match api.get_opt(&name).await? {
        None => {
            info!(config = %name, "installing policy validation webhook configuration");
            api.create(&PostParams::default(), &desired).await?;
        }
        Some(existing) => {
            let mut updated = existing.clone();
            updated.webhooks = desired.webhooks.clone();
            updated
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(MANAGED_BY_LABEL.to_string(), managed_by());
            if serde_json::to_value(&existing).ok() != serde_json::to_value(&updated).ok() {
                info!(config = %name, "updating policy validation webhook configuration");
                api.replace(&name, &PostParams::default(), &updated).await?;
            }
        }
    }
    Ok(())
}
