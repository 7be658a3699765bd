//! Shared informer fan-out: one handler per kind, subscribed once to the
//! cache's informer, dispatching every event to all interested policy
//! workers.

use std::sync::Arc;

use kube::api::DynamicObject;

use crate::cache::{EventSubscriber, GvkKey};

use super::controller::PolicyWorker;

pub struct FanoutHandler {
    gvk: GvkKey,
    workers: parking_lot::RwLock<Vec<Arc<PolicyWorker>>>,
}

impl FanoutHandler {
    pub fn new(gvk: GvkKey) -> Arc<Self> {
        Arc::new(Self {
            gvk,
            workers: parking_lot::RwLock::new(Vec::new()),
        })
    }

    pub fn add_worker(&self, worker: Arc<PolicyWorker>) {
        self.workers.write().push(worker);
    }

    pub fn remove_worker(&self, policy_name: &str) {
        self.workers
            .write()
            .retain(|worker| worker.policy_name() != policy_name);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }
}

impl EventSubscriber for FanoutHandler {
    fn handle(&self, obj: &DynamicObject) {
        let workers: Vec<Arc<PolicyWorker>> = self.workers.read().clone();
        if workers.is_empty() {
            return;
        }

        // Selector pre-filtering may need a namespace lookup; do it off the
        // informer's dispatch path.
        let obj = obj.clone();
        let gvk = self.gvk.clone();
        tokio::spawn(async move {
            for worker in workers {
                worker.enqueue(&gvk, &obj).await;
            }
        });
    }
}
