//! Policy reconciliation: turns a LuaPolicy into its derived artifacts (a
//! compiled bundle, a webhook configuration or a background controller
//! record) and keeps them in sync via content hashing and conditions.

pub mod webhook_config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::background::PolicyManager;
use crate::bundle::Bundler;
use crate::config::Settings;
use crate::crd::{
    CONDITION_BUNDLE_COMPILED, CONDITION_CONTROLLER_READY, CONDITION_READY,
    CONDITION_WEBHOOK_READY, ConditionSeverity, LuaPolicy, LuaPolicyBundle, LuaPolicyBundleSpec,
    LuaPolicyStatus, PolicyType,
};
use crate::util::{conditions, hash};

/// Field manager name for patches issued by the reconciler.
pub const FIELD_MANAGER: &str = "luapolicy";

/// Finalizer ensuring background records are deregistered before a policy
/// object disappears.
pub const FINALIZER: &str = "policy.luapolicy.dev/finalizer";

/// Compile failure messages are truncated to this many bytes in conditions.
const MAX_CONDITION_MESSAGE: usize = 10_000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Conflicts, rate limiting and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(err)) => {
                err.code == 409 || err.code == 429 || err.code >= 500
            }
            Error::Kube(kube::Error::Service(_)) => true,
            Error::Kube(_) => false,
            Error::Serialization(_) => false,
        }
    }

    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(300)
        }
    }
}

/// Shared context for the reconciler.
pub struct Context {
    pub client: Client,
    pub manager: Arc<PolicyManager>,
    pub bundler: Arc<dyn Bundler>,
    pub settings: Settings,
    pub ca_bundle: Vec<u8>,
    reporter: Reporter,
    /// Complete hash (bundle + match criteria) per registered controller
    /// policy; an unchanged hash skips the background-manager update.
    controller_hashes: parking_lot::Mutex<HashMap<String, String>>,
}

impl Context {
    pub fn new(
        client: Client,
        manager: Arc<PolicyManager>,
        bundler: Arc<dyn Bundler>,
        settings: Settings,
        ca_bundle: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            manager,
            bundler,
            settings,
            ca_bundle,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            controller_hashes: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    async fn publish_warning_event(
        &self,
        policy: &LuaPolicy,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = policy.object_ref(&());
        if let Err(err) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %reason, error = %err, "failed to publish event");
        }
    }

    fn controller_hash_changed(&self, name: &str, complete_hash: &str) -> bool {
        let mut hashes = self.controller_hashes.lock();
        if hashes.get(name).map(String::as_str) == Some(complete_hash) {
            return false;
        }
        hashes.insert(name.to_string(), complete_hash.to_string());
        true
    }

    fn drop_controller_hash(&self, name: &str) {
        self.controller_hashes.lock().remove(name);
    }
}

/// Reconcile one LuaPolicy.
pub async fn reconcile(policy: Arc<LuaPolicy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = policy.name_any();
    debug!(policy = %name, "reconcile started");

    let api: Api<LuaPolicy> = Api::all(ctx.client.clone());

    if policy.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&policy, &ctx, &api).await;
    }

    if !policy.finalizers().iter().any(|f| f == FINALIZER) {
        add_finalizer(&api, &policy).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let bundle_hash = hash::hash_bundle_source(&policy.spec.script, &policy.spec.dependencies)?;

    let bundles: Api<LuaPolicyBundle> = Api::all(ctx.client.clone());
    let bundle = bundles.get_opt(&name).await?;

    let mut status = policy.status.clone().unwrap_or_default();
    let result = reconcile_inner(&policy, &ctx, &mut status, &bundle_hash, bundle.as_ref()).await;

    // Ready summarizes the other conditions; phase/reason/message derive from
    // the condition set for human display.
    conditions::set_summary(
        &mut status,
        &[
            CONDITION_CONTROLLER_READY,
            CONDITION_WEBHOOK_READY,
            CONDITION_BUNDLE_COMPILED,
        ],
    );
    conditions::reconcile_phase(&mut status, result.is_err());
    status.bundle_hash = bundle_hash;
    if result.is_ok() {
        status.observed_generation = policy.metadata.generation;
    }

    if let Err(err) = patch_status(&api, &name, &status).await {
        warn!(policy = %name, error = %err, "failed to patch policy status");
        return result.and(Err(err));
    }

    result
}

async fn reconcile_inner(
    policy: &LuaPolicy,
    ctx: &Arc<Context>,
    status: &mut LuaPolicyStatus,
    bundle_hash: &str,
    bundle: Option<&LuaPolicyBundle>,
) -> Result<Action, Error> {
    let name = policy.name_any();

    compile_bundle(policy, ctx, status, bundle_hash, bundle).await?;

    // Without a compiled bundle no derived artifact may keep serving.
    if conditions::is_false(status, CONDITION_BUNDLE_COMPILED) {
        webhook_config::delete_owned_validating(&ctx.client, &name).await?;
        webhook_config::delete_owned_mutating(&ctx.client, &name).await?;
        ctx.manager.delete(&name).await;
        ctx.drop_controller_hash(&name);
        return Ok(Action::await_change());
    }

    if policy.spec.r#type == PolicyType::Controller {
        // a controller policy never has webhook configurations
        webhook_config::delete_owned_validating(&ctx.client, &name).await?;
        webhook_config::delete_owned_mutating(&ctx.client, &name).await?;

        let Some(bundle) = bundle else {
            // freshly created this reconcile; the object appears momentarily
            return Ok(Action::requeue(Duration::from_secs(1)));
        };
        sync_controller_policy(policy, ctx, status, bundle, bundle_hash).await?;
        return Ok(Action::await_change());
    }

    sync_webhook(policy, ctx, status).await?;
    Ok(Action::await_change())
}

/// Bundle step: build or rebuild when the source hash moved, mark the
/// condition, and persist the bundle object before the condition flips true.
async fn compile_bundle(
    policy: &LuaPolicy,
    ctx: &Arc<Context>,
    status: &mut LuaPolicyStatus,
    bundle_hash: &str,
    bundle: Option<&LuaPolicyBundle>,
) -> Result<(), Error> {
    let name = policy.name_any();

    if bundle_hash.is_empty() {
        // No source: an externally managed bundle must already exist.
        match bundle {
            None => conditions::mark_false(
                status,
                CONDITION_BUNDLE_COMPILED,
                "BundleMissing",
                ConditionSeverity::Error,
                "couldn't find a policy bundle, and the policy provides no script",
            ),
            Some(_) => conditions::mark_true(status, CONDITION_BUNDLE_COMPILED),
        }
        return Ok(());
    }

    let needs_build = bundle.is_none()
        || !conditions::has(status, CONDITION_BUNDLE_COMPILED)
        || bundle_hash != status.bundle_hash;
    if !needs_build {
        return Ok(());
    }

    info!(policy = %name, "bundling policy script");
    let payload = match ctx.bundler.bundle(
        &policy.spec.script,
        &policy.spec.dependencies,
        ctx.settings.bundle_timeout,
    ) {
        Ok(payload) => payload,
        Err(err) => {
            let mut message = err.to_string();
            if message.len() > MAX_CONDITION_MESSAGE {
                message.truncate(
                    (0..=MAX_CONDITION_MESSAGE)
                        .rev()
                        .find(|i| message.is_char_boundary(*i))
                        .unwrap_or(0),
                );
                message.push_str("...");
            }
            error!(policy = %name, "error bundling policy: {message}");
            ctx.publish_warning_event(policy, "CompileFailed", "Bundling", Some(message.clone()))
                .await;
            conditions::mark_false(
                status,
                CONDITION_BUNDLE_COMPILED,
                "CompileFailed",
                ConditionSeverity::Error,
                &message,
            );
            return Ok(());
        }
    };

    let bundles: Api<LuaPolicyBundle> = Api::all(ctx.client.clone());
    let write = match bundle {
        None => {
            let fresh = LuaPolicyBundle {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    owner_references: policy.controller_owner_ref(&()).map(|r| vec![r]),
                    ..Default::default()
                },
                spec: LuaPolicyBundleSpec { bundle: payload },
            };
            bundles.create(&PostParams::default(), &fresh).await
        }
        Some(existing) => {
            let mut updated = existing.clone();
            updated.spec.bundle = payload;
            bundles
                .replace(&name, &PostParams::default(), &updated)
                .await
        }
    };

    match write {
        Ok(_) => {
            conditions::mark_true(status, CONDITION_BUNDLE_COMPILED);
            Ok(())
        }
        Err(err) => {
            // The bundle state is unknown; drop the condition so the next
            // reconcile rebuilds unconditionally.
            conditions::delete(status, CONDITION_BUNDLE_COMPILED);
            Err(err.into())
        }
    }
}

async fn sync_controller_policy(
    policy: &LuaPolicy,
    ctx: &Arc<Context>,
    status: &mut LuaPolicyStatus,
    bundle: &LuaPolicyBundle,
    bundle_hash: &str,
) -> Result<(), Error> {
    let name = policy.name_any();

    // With no script source, hash the stored bundle payload instead.
    let effective_hash = if bundle_hash.is_empty() {
        hash::hash_bytes(&bundle.spec.bundle)
    } else {
        bundle_hash.to_string()
    };
    let complete = serde_json::to_string(&serde_json::json!({
        "bundleHash": effective_hash,
        "resources": policy.spec.resources,
        "apiGroups": policy.spec.api_groups,
        "apiVersions": policy.spec.api_versions,
    }))?;
    let complete_hash = hash::hash_string(&complete);

    if ctx.controller_hash_changed(&name, &complete_hash) {
        info!(policy = %name, "updating controller policy");
        if let Err(err) = ctx.manager.update(policy, true).await {
            info!(policy = %name, error = %err, "error starting controller policy");
            ctx.manager.delete(&name).await;
            ctx.drop_controller_hash(&name);
            conditions::mark_false(
                status,
                CONDITION_CONTROLLER_READY,
                "InitControllerPolicy",
                ConditionSeverity::Error,
                &format!("error starting controller policy: {err}"),
            );
            return Ok(());
        }
    } else if conditions::is_false(status, CONDITION_CONTROLLER_READY) {
        return Ok(());
    }

    conditions::mark_true(status, CONDITION_CONTROLLER_READY);
    Ok(())
}

/// Webhook step: remove the wrong category's configurations first, then
/// drive the right category to exactly one up-to-date configuration.
async fn sync_webhook(
    policy: &LuaPolicy,
    ctx: &Arc<Context>,
    status: &mut LuaPolicyStatus,
) -> Result<(), Error> {
    let name = policy.name_any();

    let result = match policy.spec.r#type {
        PolicyType::Mutating => {
            webhook_config::delete_owned_validating(&ctx.client, &name).await?;
            webhook_config::sync_mutating(&ctx.client, policy, &ctx.settings, &ctx.ca_bundle).await
        }
        _ => {
            webhook_config::delete_owned_mutating(&ctx.client, &name).await?;
            webhook_config::sync_validating(&ctx.client, policy, &ctx.settings, &ctx.ca_bundle)
                .await
        }
    };

    match result {
        Ok(()) => {
            conditions::mark_true(status, CONDITION_WEBHOOK_READY);
            Ok(())
        }
        Err(err) => {
            conditions::mark_false(
                status,
                CONDITION_WEBHOOK_READY,
                "SyncFailed",
                ConditionSeverity::Error,
                &err.to_string(),
            );
            ctx.publish_warning_event(
                policy,
                "SyncFailed",
                "SyncWebhook",
                Some(err.to_string()),
            )
            .await;
            Err(err.into())
        }
    }
}

async fn handle_deletion(
    policy: &LuaPolicy,
    ctx: &Arc<Context>,
    api: &Api<LuaPolicy>,
) -> Result<Action, Error> {
    let name = policy.name_any();
    info!(policy = %name, "policy deleted, deregistering");

    ctx.manager.delete(&name).await;
    ctx.drop_controller_hash(&name);
    // Owned bundles, violations and webhook configurations cascade via their
    // owner references.

    remove_finalizer(api, policy).await?;
    Ok(Action::await_change())
}

async fn add_finalizer(api: &Api<LuaPolicy>, policy: &LuaPolicy) -> Result<(), Error> {
    let name = policy.name_any();
    let mut finalizers = policy.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<LuaPolicy>, policy: &LuaPolicy) -> Result<(), Error> {
    let name = policy.name_any();
    let finalizers: Vec<String> = policy
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    match api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn patch_status(
    api: &Api<LuaPolicy>,
    name: &str,
    status: &LuaPolicyStatus,
) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Error policy for the controller.
pub fn error_policy(policy: Arc<LuaPolicy>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = policy.name_any();
    if error.is_not_found() {
        debug!(policy = %name, "object no longer exists");
        return Action::await_change();
    }
    if error.is_retryable() {
        warn!(policy = %name, error = %error, "retryable reconcile error");
    } else {
        error!(policy = %name, error = %error, "reconcile error");
    }
    Action::requeue(error.requeue_after())
}

/// Run the policy reconciler until the stream ends. Triggers on the policy
/// itself, its owned webhook configurations and its bundle.
pub async fn run_reconciler(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let policies: Api<LuaPolicy> = Api::all(client.clone());
    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let bundles: Api<LuaPolicyBundle> = Api::all(client);

    let config = watcher::Config::default();
    Controller::new(policies, config.clone())
        .owns(validating, config.clone())
        .owns(mutating, config.clone())
        .watches(bundles, config, |bundle| {
            Some(ObjectRef::new(&bundle.name_any()))
        })
        .with_config(kube::runtime::controller::Config::default().concurrency(10))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(policy = %obj.name, "reconciled"),
                Err(err) => debug!(error = %err, "reconcile stream error"),
            }
        })
        .await;

    error!("policy reconciler stream ended unexpectedly");
}
