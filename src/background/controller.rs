//! Per-policy background worker.
//!
//! Drains a rate-limited workqueue of `version|group|kind|namespace|name`
//! keys, classifies each key as a create or delete by looking at the cache,
//! synthesizes an admission request and pushes it through the shared policy
//! handler. A `requeue()` verdict re-enqueues the key with backoff; script
//! errors are logged and forgotten so a deterministic failure cannot loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DynamicObject};
use kube::core::admission::AdmissionRequest;
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, GvkKey, ObjectCache};
use crate::crd::{LuaPolicy, Operation};
use crate::webhook::{PolicyHandler, audit};

use super::queue::RateLimitedQueue;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed queue key {0}")]
    MalformedKey(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct PolicyWorker {
    policy_name: String,
    client: Client,
    cache: Arc<ObjectCache>,
    handler: Arc<PolicyHandler>,
    pub(super) queue: RateLimitedQueue,
    gvks: Vec<GvkKey>,
    /// Spec snapshot used for event pre-filtering; processing re-fetches the
    /// live policy per key.
    snapshot: parking_lot::RwLock<Arc<LuaPolicy>>,
}

impl PolicyWorker {
    pub fn new(
        client: Client,
        cache: Arc<ObjectCache>,
        handler: Arc<PolicyHandler>,
        policy: &LuaPolicy,
        gvks: Vec<GvkKey>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy_name: policy.name_any(),
            client,
            cache,
            handler,
            queue: RateLimitedQueue::new(),
            gvks,
            snapshot: parking_lot::RwLock::new(Arc::new(policy.clone())),
        })
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn gvks(&self) -> &[GvkKey] {
        &self.gvks
    }

    /// Refresh the pre-filtering snapshot after a policy update that did not
    /// change the watched kinds.
    pub fn update_snapshot(&self, policy: &LuaPolicy) {
        *self.snapshot.write() = Arc::new(policy.clone());
    }

    /// Stop the worker; the queue drains and the run loop exits.
    pub fn shutdown(&self) {
        self.queue.shut_down();
    }

    /// Pre-filter an object against the policy's selectors and enqueue its
    /// key.
    pub async fn enqueue(&self, gvk: &GvkKey, obj: &DynamicObject) {
        let policy = Arc::clone(&self.snapshot.read());

        if let (Some(ns), Some(selector)) =
            (obj.namespace(), policy.spec.namespace_selector.as_ref())
        {
            let namespaces = GvkKey::new("", "v1", "Namespace");
            match self.cache.get(&namespaces, None, &ns).await {
                Ok(Some(ns_obj)) => {
                    if !selector_matches(selector, ns_obj.labels(), &self.policy_name) {
                        return;
                    }
                }
                // The namespace is gone or unreadable; nothing to evaluate.
                _ => return,
            }
        }

        if let Some(selector) = policy.spec.object_selector.as_ref() {
            if !selector_matches(selector, obj.labels(), &self.policy_name) {
                return;
            }
        }

        self.queue.add(&object_key(gvk, obj));
    }

    /// List every object of every subscribed kind and enqueue it.
    pub async fn requeue_all(&self) -> Result<(), CacheError> {
        for gvk in &self.gvks {
            let objects = self.cache.list(gvk, None, None).await?;
            for obj in objects {
                self.enqueue(gvk, &obj).await;
            }
        }
        Ok(())
    }

    /// Drain the queue until shutdown.
    pub async fn run(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            match self.process(&key).await {
                Ok(true) => self.queue.add_rate_limited(&key),
                Ok(false) => self.queue.forget(&key),
                Err(err) => {
                    // Errors are never rate-limit-requeued: a deterministic
                    // failure would loop forever.
                    warn!(policy = %self.policy_name, key = %key, error = %err,
                        "error in background policy");
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }
        debug!(policy = %self.policy_name, "background worker stopped");
    }

    /// Process one key. Returns true when the key should be rescheduled.
    async fn process(&self, key: &str) -> Result<bool, ProcessError> {
        let parts: Vec<&str> = key.split('|').collect();
        let [version, group, kind, namespace, name] = parts.as_slice() else {
            return Err(ProcessError::MalformedKey(key.to_string()));
        };
        let gvk = GvkKey::new(group, version, kind);
        let namespace = (!namespace.is_empty()).then_some(*namespace);

        // live policy config, not the snapshot
        let policies: Api<LuaPolicy> = Api::all(self.client.clone());
        let policy = policies.get(&self.policy_name).await?;

        let object = self.cache.get(&gvk, namespace, name).await?;
        let (operation, object) = match object {
            None => (Operation::Delete, None),
            Some(obj) if obj.metadata.deletion_timestamp.is_some() => {
                (Operation::Delete, Some(obj))
            }
            Some(obj) => (Operation::Create, Some(obj)),
        };

        if !policy.spec.matches_operation(&operation) {
            return Ok(false);
        }

        let request = synthesize_request(&gvk, namespace, name, operation, object.as_ref())?;
        let outcome = self.handler.handle(&request, &policy).await;
        for warning in &outcome.warnings {
            warn!("[{}]: {}", self.policy_name, warning);
        }

        if !outcome.response.allowed {
            audit::log_request(
                self.client.clone(),
                &request,
                &outcome.response,
                &policy,
                1,
            )
            .await;
        }

        if let Some(raw) = &outcome.raw {
            if raw.reschedule {
                if let Some(message) = raw.message.as_deref() {
                    info!(
                        "[{}]: Reschedule {} because of: {}",
                        self.policy_name, name, message
                    );
                }
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Queue key: `version|group|kind|namespace|name`. The same key enqueued
/// while one is in flight collapses, serializing per-object processing.
pub fn object_key(gvk: &GvkKey, obj: &DynamicObject) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        gvk.version,
        gvk.group,
        gvk.kind,
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Synthesize the admission request a background evaluation sees. There is
/// never an `oldObject`; deletes carry the object as last observed, if any.
fn synthesize_request(
    gvk: &GvkKey,
    namespace: Option<&str>,
    name: &str,
    operation: Operation,
    object: Option<&DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, serde_json::Error> {
    let mut request = json!({
        "uid": "",
        "kind": { "group": gvk.group, "version": gvk.version, "kind": gvk.kind },
        "resource": { "group": "", "version": "", "resource": "" },
        "name": name,
        "operation": operation.to_string(),
        "userInfo": {},
    });
    if let Some(ns) = namespace {
        request["namespace"] = json!(ns);
    }
    if let Some(object) = object {
        request["object"] = serde_json::to_value(object)?;
    }
    serde_json::from_value(request)
}

fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
    policy: &str,
) -> bool {
    match kube::core::Selector::try_from(selector.clone()) {
        Ok(selector) => selector.matches(labels),
        Err(err) => {
            warn!(policy = %policy, error = %err, "invalid selector on policy");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn object(ns: Option<&str>, name: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(str::to_string),
                ..Default::default()
            },
            data: json!({}),
        }
    }

    #[test]
    fn keys_carry_all_coordinates() {
        let gvk = GvkKey::new("apps", "v1", "Deployment");
        assert_eq!(
            object_key(&gvk, &object(Some("prod"), "web")),
            "v1|apps|Deployment|prod|web"
        );
        assert_eq!(
            object_key(&GvkKey::new("", "v1", "Namespace"), &object(None, "prod")),
            "v1||Namespace||prod"
        );
    }

    #[test]
    fn synthesized_request_carries_object_and_operation() {
        let gvk = GvkKey::new("", "v1", "ConfigMap");
        let obj = object(Some("default"), "cm");
        let request =
            synthesize_request(&gvk, Some("default"), "cm", Operation::Create, Some(&obj))
                .unwrap();

        assert_eq!(request.name, "cm");
        assert_eq!(request.namespace.as_deref(), Some("default"));
        assert_eq!(request.kind.kind, "ConfigMap");
        assert!(request.object.is_some());
        assert!(request.old_object.is_none());
        assert!(matches!(
            request.operation,
            kube::core::admission::Operation::Create
        ));
    }

    #[test]
    fn synthesized_delete_may_have_no_object() {
        let gvk = GvkKey::new("", "v1", "ConfigMap");
        let request =
            synthesize_request(&gvk, Some("default"), "cm", Operation::Delete, None).unwrap();
        assert!(request.object.is_none());
        assert!(matches!(
            request.operation,
            kube::core::admission::Operation::Delete
        ));
    }

    #[test]
    fn selector_matching_uses_label_grammar() {
        let selector = LabelSelector {
            match_labels: Some([("team".to_string(), "core".to_string())].into()),
            ..Default::default()
        };
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "core".to_string());
        assert!(selector_matches(&selector, &labels, "p"));

        labels.insert("team".to_string(), "other".to_string());
        assert!(!selector_matches(&selector, &labels, "p"));
    }
}
