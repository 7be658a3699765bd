//! Background controller manager: owns one worker per controller-type policy
//! and the informer subscriptions feeding them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kube::{Client, ResourceExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheError, EventSubscriber, GvkKey, ObjectCache};
use crate::crd::LuaPolicy;
use crate::webhook::PolicyHandler;

use super::controller::PolicyWorker;
use super::handler::FanoutHandler;

/// How often unused informers and empty handlers are collected.
const GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot register a policy that has no resources specified")]
    NoResources,

    #[error("wildcard resources are not allowed for background policies")]
    WildcardResource,

    #[error("no kinds found for resources {0:?}")]
    NoKinds(Vec<String>),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

struct PolicyRecord {
    worker: Arc<PolicyWorker>,
}

#[derive(Default)]
struct ManagerState {
    policies: HashMap<String, PolicyRecord>,
    informers: HashMap<GvkKey, Arc<FanoutHandler>>,
}

pub struct PolicyManager {
    client: Client,
    cache: Arc<ObjectCache>,
    handler: Arc<PolicyHandler>,
    state: tokio::sync::Mutex<ManagerState>,
}

impl PolicyManager {
    pub fn new(
        client: Client,
        cache: Arc<ObjectCache>,
        handler: Arc<PolicyHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            cache,
            handler,
            state: tokio::sync::Mutex::new(ManagerState::default()),
        })
    }

    /// Register or refresh a controller policy. When the watched kind set is
    /// unchanged the existing worker is kept (and optionally re-seeded);
    /// otherwise the record is torn down and rebuilt.
    pub async fn update(&self, policy: &LuaPolicy, requeue: bool) -> Result<(), ManagerError> {
        let name = policy.name_any();
        let gvks = self.resolve_gvks(policy).await?;

        let mut state = self.state.lock().await;

        if let Some(record) = state.policies.get(&name) {
            if gvk_sets_equal(record.worker.gvks(), &gvks) {
                record.worker.update_snapshot(policy);
                if requeue {
                    record.worker.requeue_all().await?;
                }
                return Ok(());
            }
            Self::remove_locked(&mut state, &name);
        }

        self.add_locked(&mut state, policy, gvks).await
    }

    async fn add_locked(
        &self,
        state: &mut ManagerState,
        policy: &LuaPolicy,
        gvks: Vec<GvkKey>,
    ) -> Result<(), ManagerError> {
        let name = policy.name_any();

        for gvk in &gvks {
            if !state.informers.contains_key(gvk) {
                let entry = self.cache.entry_for(gvk).await?;
                let fanout = FanoutHandler::new(gvk.clone());
                entry.add_subscriber(subscriber(&fanout));
                state.informers.insert(gvk.clone(), fanout);
            }
        }

        let worker = PolicyWorker::new(
            self.client.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.handler),
            policy,
            gvks.clone(),
        );

        for gvk in &gvks {
            if let Some(fanout) = state.informers.get(gvk) {
                fanout.add_worker(Arc::clone(&worker));
            }
        }

        tokio::spawn(Arc::clone(&worker).run());

        if let Err(err) = worker.requeue_all().await {
            warn!(policy = %name, error = %err, "error re-queueing objects for policy");
        }

        info!(policy = %name, "started background policy controller");
        state.policies.insert(name, PolicyRecord { worker });
        Ok(())
    }

    /// Deregister a policy: detach it from every handler list, stop its
    /// worker and collect informers that lost their last subscriber.
    pub async fn delete(&self, name: &str) {
        {
            let mut state = self.state.lock().await;
            if !state.policies.contains_key(name) {
                return;
            }
            info!(policy = %name, "stopping background policy controller");
            Self::remove_locked(&mut state, name);
        }
        self.collect_garbage().await;
    }

    fn remove_locked(state: &mut ManagerState, name: &str) {
        let Some(record) = state.policies.remove(name) else {
            return;
        };
        for fanout in state.informers.values() {
            fanout.remove_worker(name);
        }
        record.worker.shutdown();
    }

    /// Run periodic informer garbage collection until cancelled, then tear
    /// down every policy record.
    pub async fn start(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(GC_INTERVAL) => self.collect_garbage().await,
            }
        }
        self.cleanup().await;
    }

    /// Drop handlers that lost all their policies and let the cache stop
    /// informers that are idle and outside the keep-set.
    async fn collect_garbage(&self) {
        let keep: HashSet<GvkKey> = {
            let mut state = self.state.lock().await;
            let empty: Vec<GvkKey> = state
                .informers
                .iter()
                .filter(|(_, fanout)| fanout.worker_count() == 0)
                .map(|(gvk, _)| gvk.clone())
                .collect();
            for gvk in empty {
                if let Some(fanout) = state.informers.remove(&gvk) {
                    if let Some(entry) = self.cache.peek(&gvk) {
                        entry.remove_subscriber(&subscriber(&fanout));
                    }
                }
            }
            state.informers.keys().cloned().collect()
        };
        self.cache.garbage_collect(&keep);
    }

    async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        for (name, record) in state.policies.drain() {
            info!(policy = %name, "stopping background policy controller");
            record.worker.shutdown();
        }
        for (gvk, fanout) in state.informers.drain() {
            if let Some(entry) = self.cache.peek(&gvk) {
                entry.remove_subscriber(&subscriber(&fanout));
            }
        }
        self.cache.garbage_collect(&HashSet::new());
    }

    /// Resolve a policy's resource list into concrete kinds. Wildcards are
    /// forbidden here: a background policy must name what it watches.
    async fn resolve_gvks(&self, policy: &LuaPolicy) -> Result<Vec<GvkKey>, ManagerError> {
        if policy.spec.resources.is_empty() {
            return Err(ManagerError::NoResources);
        }
        if policy.spec.resources.iter().any(|r| r == "*") {
            return Err(ManagerError::WildcardResource);
        }

        let kinds = self
            .cache
            .kinds_for_resources(
                &policy.spec.resources,
                &policy.spec.api_groups,
                &policy.spec.api_versions,
            )
            .await?;
        if kinds.is_empty() {
            return Err(ManagerError::NoKinds(policy.spec.resources.clone()));
        }
        Ok(kinds.into_iter().map(|(gvk, _)| gvk).collect())
    }

    /// Kinds currently referenced by at least one policy (test observability).
    pub async fn subscribed_kinds(&self) -> HashSet<GvkKey> {
        let state = self.state.lock().await;
        state
            .informers
            .iter()
            .filter(|(_, fanout)| fanout.worker_count() > 0)
            .map(|(gvk, _)| gvk.clone())
            .collect()
    }
}

fn subscriber(fanout: &Arc<FanoutHandler>) -> Arc<dyn EventSubscriber> {
    Arc::clone(fanout) as Arc<dyn EventSubscriber>
}

/// Order-insensitive comparison of watched kind sets.
fn gvk_sets_equal(a: &[GvkKey], b: &[GvkKey]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let set: HashSet<&GvkKey> = a.iter().collect();
    b.iter().all(|gvk| set.contains(gvk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_set_equality_ignores_order() {
        let a = vec![
            GvkKey::new("", "v1", "Pod"),
            GvkKey::new("apps", "v1", "Deployment"),
        ];
        let b = vec![
            GvkKey::new("apps", "v1", "Deployment"),
            GvkKey::new("", "v1", "Pod"),
        ];
        assert!(gvk_sets_equal(&a, &b));
    }

    #[test]
    fn gvk_set_equality_detects_differences() {
        let a = vec![GvkKey::new("", "v1", "Pod")];
        let b = vec![GvkKey::new("", "v1", "ConfigMap")];
        assert!(!gvk_sets_equal(&a, &b));
        assert!(!gvk_sets_equal(&a, &[]));
    }
}
