//! A single lazily-started informer: a reflector-backed watch on one
//! group/version/kind with subscriber fan-out and secondary field indexes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::discovery::ApiResource;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::GvkKey;

/// Receives every add/update/delete (and resync re-delivery) for one kind.
pub trait EventSubscriber: Send + Sync {
    /// Called with the object as seen by the watch. Deletions deliver the
    /// last observed state; classification happens at processing time by
    /// checking the cache.
    fn handle(&self, obj: &DynamicObject);
}

/// Extracts index values from an object for a secondary field index.
pub type IndexExtractor = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

type ObjKey = (Option<String>, String);

struct FieldIndex {
    extractor: IndexExtractor,
    by_value: HashMap<String, HashSet<ObjKey>>,
    by_object: HashMap<ObjKey, Vec<String>>,
}

impl FieldIndex {
    fn new(extractor: IndexExtractor) -> Self {
        Self {
            extractor,
            by_value: HashMap::new(),
            by_object: HashMap::new(),
        }
    }

    /// Values are stored twice, namespaced and namespace-free, so both
    /// scoped and cluster-wide queries are single lookups.
    fn keys_for(ns: Option<&str>, raw: &str) -> Vec<String> {
        match ns {
            Some(ns) => vec![format!("{ns}/{raw}"), raw.to_string()],
            None => vec![raw.to_string()],
        }
    }

    fn upsert(&mut self, obj: &DynamicObject) {
        let obj_key = (obj.namespace(), obj.name_any());
        self.remove_keys(&obj_key);

        let mut keys = Vec::new();
        for raw in (self.extractor)(obj) {
            keys.extend(Self::keys_for(obj.namespace().as_deref(), &raw));
        }
        for key in &keys {
            self.by_value
                .entry(key.clone())
                .or_default()
                .insert(obj_key.clone());
        }
        self.by_object.insert(obj_key, keys);
    }

    fn remove(&mut self, obj: &DynamicObject) {
        let obj_key = (obj.namespace(), obj.name_any());
        self.remove_keys(&obj_key);
        self.by_object.remove(&obj_key);
    }

    fn remove_keys(&mut self, obj_key: &ObjKey) {
        if let Some(keys) = self.by_object.get(obj_key) {
            for key in keys {
                if let Some(set) = self.by_value.get_mut(key) {
                    set.remove(obj_key);
                    if set.is_empty() {
                        self.by_value.remove(key);
                    }
                }
            }
        }
    }

    fn clear(&mut self) {
        self.by_value.clear();
        self.by_object.clear();
    }

    fn lookup(&self, value: &str, namespace: Option<&str>) -> Vec<ObjKey> {
        let key = match namespace {
            Some(ns) => format!("{ns}/{value}"),
            None => value.to_string(),
        };
        self.by_value
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One long-running watch+index for a single kind.
pub struct InformerEntry {
    pub gvk: GvkKey,
    pub resource: ApiResource,
    pub namespaced: bool,
    store: Store<DynamicObject>,
    stop: CancellationToken,
    subscribers: parking_lot::RwLock<Vec<Arc<dyn EventSubscriber>>>,
    indexes: parking_lot::RwLock<HashMap<String, FieldIndex>>,
}

impl InformerEntry {
    /// Start the watch for `gvk` and return the entry. The store becomes
    /// ready once the initial list completes; callers wait via
    /// [`InformerEntry::wait_until_ready`].
    pub fn start(
        client: Client,
        gvk: GvkKey,
        resource: ApiResource,
        namespaced: bool,
        resync: Duration,
    ) -> Arc<Self> {
        let api: Api<DynamicObject> = Api::all_with(client, &resource);
        let writer = reflector::store::Writer::new(resource.clone());
        let store = writer.as_reader();
        let stop = CancellationToken::new();

        let entry = Arc::new(Self {
            gvk: gvk.clone(),
            resource,
            namespaced,
            store,
            stop: stop.clone(),
            subscribers: parking_lot::RwLock::new(Vec::new()),
            indexes: parking_lot::RwLock::new(HashMap::new()),
        });

        info!(gvk = %gvk, "starting informer");
        let task_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            task_entry.run(writer, api, resync).await;
        });

        entry
    }

    async fn run(
        self: Arc<Self>,
        writer: reflector::store::Writer<DynamicObject>,
        api: Api<DynamicObject>,
        resync: Duration,
    ) {
        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff();
        let mut stream = std::pin::pin!(stream);

        // Jitter the resync period so informers started together do not
        // re-deliver in lock-step.
        let period = jittered(resync);
        let mut next_resync = tokio::time::Instant::now() + period;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep_until(next_resync) => {
                    next_resync = tokio::time::Instant::now() + period;
                    for obj in self.store.state() {
                        self.dispatch(&obj);
                    }
                }
                event = stream.try_next() => {
                    match event {
                        Ok(Some(event)) => self.observe(&event),
                        Ok(None) => break,
                        Err(err) => {
                            warn!(gvk = %self.gvk, error = %err, "informer watch error");
                        }
                    }
                }
            }
        }
        debug!(gvk = %self.gvk, "informer stopped");
    }

    fn observe(&self, event: &watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Init => {
                let mut indexes = self.indexes.write();
                for index in indexes.values_mut() {
                    index.clear();
                }
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                {
                    let mut indexes = self.indexes.write();
                    for index in indexes.values_mut() {
                        index.upsert(obj);
                    }
                }
                self.dispatch(obj);
            }
            watcher::Event::Delete(obj) => {
                {
                    let mut indexes = self.indexes.write();
                    for index in indexes.values_mut() {
                        index.remove(obj);
                    }
                }
                self.dispatch(obj);
            }
            watcher::Event::InitDone => {}
        }
    }

    fn dispatch(&self, obj: &DynamicObject) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber.handle(obj);
        }
    }

    /// Wait for the initial list to complete.
    pub async fn wait_until_ready(&self) -> Result<(), ()> {
        self.store.wait_until_ready().await.map_err(|_| ())
    }

    /// Signal the watch task to stop. The entry is unusable afterwards.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn remove_subscriber(&self, subscriber: &Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Read one object from the store.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut objref = ObjectRef::<DynamicObject>::new_with(name, self.resource.clone());
        if let Some(ns) = namespace {
            objref = objref.within(ns);
        }
        self.store.get(&objref).map(|obj| (*obj).clone())
    }

    /// Snapshot the store contents.
    pub fn state(&self) -> Vec<DynamicObject> {
        self.store
            .state()
            .into_iter()
            .map(|obj| (*obj).clone())
            .collect()
    }

    /// Register a secondary index over the given field name. Existing store
    /// contents are indexed immediately; subsequent watch events keep the
    /// index current.
    pub fn add_index(&self, field: &str, extractor: IndexExtractor) {
        let mut index = FieldIndex::new(extractor);
        for obj in self.store.state() {
            index.upsert(&obj);
        }
        self.indexes.write().insert(field.to_string(), index);
    }

    /// Look up objects by an indexed field value, optionally scoped to a
    /// namespace.
    pub fn get_by_index(
        &self,
        field: &str,
        value: &str,
        namespace: Option<&str>,
    ) -> Vec<DynamicObject> {
        let keys = {
            let indexes = self.indexes.read();
            match indexes.get(field) {
                Some(index) => index.lookup(value, namespace),
                None => return Vec::new(),
            }
        };
        keys.into_iter()
            .filter_map(|(ns, name)| self.get(ns.as_deref(), &name))
            .collect()
    }
}

/// The actual resync period is `base × U[0.9, 1.1)`.
fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    let factor = 0.9 + rand::rng().random::<f64>() * 0.2;
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn test_object(ns: Option<&str>, name: &str, image: &str) -> DynamicObject {
        let mut obj = DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(str::to_string),
                ..Default::default()
            },
            data: serde_json::json!({ "spec": { "image": image } }),
        };
        obj.types = Some(kube::core::TypeMeta {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
        });
        obj
    }

    fn image_extractor() -> IndexExtractor {
        Arc::new(|obj: &DynamicObject| {
            obj.data
                .pointer("/spec/image")
                .and_then(|v| v.as_str())
                .map(|s| vec![s.to_string()])
                .unwrap_or_default()
        })
    }

    #[test]
    fn index_supports_scoped_and_cluster_lookups() {
        let mut index = FieldIndex::new(image_extractor());
        index.upsert(&test_object(Some("a"), "p1", "nginx"));
        index.upsert(&test_object(Some("b"), "p2", "nginx"));
        index.upsert(&test_object(Some("b"), "p3", "redis"));

        assert_eq!(index.lookup("nginx", None).len(), 2);
        assert_eq!(index.lookup("nginx", Some("a")).len(), 1);
        assert_eq!(index.lookup("redis", Some("a")).len(), 0);
        assert_eq!(index.lookup("redis", Some("b")).len(), 1);
    }

    #[test]
    fn index_update_replaces_old_values() {
        let mut index = FieldIndex::new(image_extractor());
        index.upsert(&test_object(Some("a"), "p1", "nginx"));
        index.upsert(&test_object(Some("a"), "p1", "redis"));

        assert_eq!(index.lookup("nginx", None).len(), 0);
        assert_eq!(index.lookup("redis", None).len(), 1);
    }

    #[test]
    fn index_remove_clears_all_keys() {
        let mut index = FieldIndex::new(image_extractor());
        let obj = test_object(Some("a"), "p1", "nginx");
        index.upsert(&obj);
        index.remove(&obj);

        assert!(index.lookup("nginx", None).is_empty());
        assert!(index.lookup("nginx", Some("a")).is_empty());
        assert!(index.by_object.is_empty());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(3600);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs_f64(3600.0 * 0.9));
            assert!(d < Duration::from_secs_f64(3600.0 * 1.1));
        }
    }
}
