//! Typed object cache: a process-wide map of lazily-started informers.
//!
//! Each group/version/kind gets one informer on first access. Informers carry
//! a last-used timestamp and are stopped by the periodic garbage collection
//! pass once they have been idle past the cleanup window and no background
//! policy subscribes to them.

mod informer;

pub use informer::{EventSubscriber, IndexExtractor, InformerEntry};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::Client;
use kube::core::discovery::{ApiResource, Scope};
use kube::discovery::Discovery;
use thiserror::Error;
use tracing::{debug, info};

/// How long a first list+sync may take before Get gives up.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Map key for one object kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GvkKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GvkKey {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Parse an `apiVersion` string ("v1" or "group/version") plus kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for GvkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("no API resource registered for {0}")]
    UnknownKind(String),

    #[error("timed out waiting for the {0} informer to sync")]
    SyncTimeout(String),

    #[error("invalid label selector: {0}")]
    Selector(String),
}

/// A discovery-resolved kind.
#[derive(Clone, Debug)]
pub struct ResolvedKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Process-wide informer cache.
pub struct ObjectCache {
    client: Client,
    resync: Duration,
    cleanup: Duration,
    // The informer map has a single exclusive lock; the last-used map a
    // separate one so cache reads do not contend with entry construction.
    informers: parking_lot::Mutex<HashMap<GvkKey, Arc<InformerEntry>>>,
    last_used: parking_lot::Mutex<HashMap<GvkKey, Instant>>,
    discovery: tokio::sync::Mutex<Option<Arc<Discovery>>>,
}

impl ObjectCache {
    pub fn new(client: Client, resync: Duration, cleanup: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            resync,
            cleanup,
            informers: parking_lot::Mutex::new(HashMap::new()),
            last_used: parking_lot::Mutex::new(HashMap::new()),
            discovery: tokio::sync::Mutex::new(None),
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve a GVK to its API resource via discovery. The discovery
    /// snapshot is cached; a miss refreshes it once before failing.
    pub async fn resolve(&self, gvk: &GvkKey) -> Result<ResolvedKind, CacheError> {
        if let Some(found) = self.lookup_resolved(gvk).await? {
            return Ok(found);
        }

        // Refresh and retry once: the kind may have been registered since
        // the snapshot was taken.
        self.refresh_discovery().await?;
        self.lookup_resolved(gvk)
            .await?
            .ok_or_else(|| CacheError::UnknownKind(gvk.to_string()))
    }

    async fn discovery(&self) -> Result<Arc<Discovery>, CacheError> {
        let mut guard = self.discovery.lock().await;
        if let Some(discovery) = guard.as_ref() {
            return Ok(Arc::clone(discovery));
        }
        let discovery = Arc::new(Discovery::new(self.client.clone()).run().await?);
        *guard = Some(Arc::clone(&discovery));
        Ok(discovery)
    }

    async fn refresh_discovery(&self) -> Result<(), CacheError> {
        let discovery = Arc::new(Discovery::new(self.client.clone()).run().await?);
        *self.discovery.lock().await = Some(discovery);
        Ok(())
    }

    async fn lookup_resolved(&self, gvk: &GvkKey) -> Result<Option<ResolvedKind>, CacheError> {
        let discovery = self.discovery().await?;
        for group in discovery.groups() {
            if group.name() != gvk.group {
                continue;
            }
            for (resource, caps) in group.versioned_resources(&gvk.version) {
                if resource.kind == gvk.kind {
                    return Ok(Some(ResolvedKind {
                        namespaced: caps.scope == Scope::Namespaced,
                        resource,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Resolve resource plurals into kinds, filtered by the allowed API
    /// groups and versions. At most one kind per group-kind pair is returned
    /// (the first version discovery lists, which is the server's preference).
    pub async fn kinds_for_resources(
        &self,
        resources: &[String],
        api_groups: &[String],
        api_versions: &[String],
    ) -> Result<Vec<(GvkKey, ResolvedKind)>, CacheError> {
        let discovery = self.discovery().await?;

        let mut out: Vec<(GvkKey, ResolvedKind)> = Vec::new();
        let mut seen_group_kinds: HashSet<(String, String)> = HashSet::new();
        for plural in resources {
            for group in discovery.groups() {
                let group_matches = api_groups.is_empty()
                    || api_groups
                        .iter()
                        .any(|g| g == "*" || g == group.name());
                if !group_matches {
                    continue;
                }
                for version in group.versions() {
                    let version_matches = api_versions.is_empty()
                        || api_versions.iter().any(|v| v == "*" || v == version);
                    if !version_matches {
                        continue;
                    }
                    for (resource, caps) in group.versioned_resources(version) {
                        if &resource.plural != plural {
                            continue;
                        }
                        let group_kind = (group.name().to_string(), resource.kind.clone());
                        if !seen_group_kinds.insert(group_kind) {
                            continue;
                        }
                        out.push((
                            GvkKey::new(group.name(), version, &resource.kind),
                            ResolvedKind {
                                namespaced: caps.scope == Scope::Namespaced,
                                resource,
                            },
                        ));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Return the informer for a kind, starting it on first access and
    /// waiting (bounded) for its initial list to complete.
    pub async fn entry_for(&self, gvk: &GvkKey) -> Result<Arc<InformerEntry>, CacheError> {
        let entry = {
            let informers = self.informers.lock();
            informers.get(gvk).cloned()
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                let resolved = self.resolve(gvk).await?;
                let mut informers = self.informers.lock();
                // Double-checked: another caller may have raced us here and
                // the map is the single source of truth.
                match informers.get(gvk) {
                    Some(entry) => Arc::clone(entry),
                    None => {
                        let entry = InformerEntry::start(
                            self.client.clone(),
                            gvk.clone(),
                            resolved.resource,
                            resolved.namespaced,
                            self.resync,
                        );
                        informers.insert(gvk.clone(), Arc::clone(&entry));
                        entry
                    }
                }
            }
        };

        self.touch(gvk);
        tokio::time::timeout(INITIAL_SYNC_TIMEOUT, entry.wait_until_ready())
            .await
            .map_err(|_| CacheError::SyncTimeout(gvk.to_string()))?
            .map_err(|_| CacheError::SyncTimeout(gvk.to_string()))?;
        Ok(entry)
    }

    fn touch(&self, gvk: &GvkKey) {
        self.last_used.lock().insert(gvk.clone(), Instant::now());
    }

    /// Look up an informer without starting one or touching last-used.
    pub fn peek(&self, gvk: &GvkKey) -> Option<Arc<InformerEntry>> {
        self.informers.lock().get(gvk).cloned()
    }

    /// Cached read of one object.
    pub async fn get(
        &self,
        gvk: &GvkKey,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<kube::api::DynamicObject>, CacheError> {
        let entry = self.entry_for(gvk).await?;
        self.touch(gvk);
        Ok(entry.get(namespace, name))
    }

    /// Cached list, optionally filtered by namespace and label selector.
    pub async fn list(
        &self,
        gvk: &GvkKey,
        namespace: Option<&str>,
        selector: Option<&kube::core::Selector>,
    ) -> Result<Vec<kube::api::DynamicObject>, CacheError> {
        use kube::ResourceExt;

        let entry = self.entry_for(gvk).await?;
        self.touch(gvk);
        let objects = entry
            .state()
            .into_iter()
            .filter(|obj| match namespace {
                Some(ns) => obj.namespace().as_deref() == Some(ns),
                None => true,
            })
            .filter(|obj| match selector {
                Some(selector) => selector.matches(obj.labels()),
                None => true,
            })
            .collect();
        Ok(objects)
    }

    /// Register a secondary index on a kind, starting its informer if needed.
    pub async fn index_field(
        &self,
        gvk: &GvkKey,
        field: &str,
        extractor: IndexExtractor,
    ) -> Result<(), CacheError> {
        let entry = self.entry_for(gvk).await?;
        entry.add_index(field, extractor);
        Ok(())
    }

    /// Stop the informer for a kind and forget it.
    pub fn delete(&self, gvk: &GvkKey) {
        let entry = self.informers.lock().remove(gvk);
        if let Some(entry) = entry {
            info!(gvk = %gvk, "stopping informer");
            entry.shutdown();
        }
        self.last_used.lock().remove(gvk);
    }

    /// Stop every informer that is not in the keep-set and has been idle
    /// past the cleanup window. The keep-set protects kinds with live
    /// background-policy subscribers regardless of idle time.
    pub fn garbage_collect(&self, keep: &HashSet<GvkKey>) {
        let now = Instant::now();
        let expired: Vec<GvkKey> = {
            let last_used = self.last_used.lock();
            last_used
                .iter()
                .filter(|(gvk, _)| !keep.contains(gvk))
                .filter(|(_, used)| now.duration_since(**used) > self.cleanup)
                .map(|(gvk, _)| gvk.clone())
                .collect()
        };
        for gvk in expired {
            debug!(gvk = %gvk, "garbage collecting idle informer");
            self.delete(&gvk);
        }
    }

    /// Kinds currently held in the cache.
    pub fn active_kinds(&self) -> Vec<GvkKey> {
        self.informers.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_parses_api_version_forms() {
        let core = GvkKey::from_api_version("v1", "Pod");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
        assert_eq!(core.api_version(), "v1");

        let grouped = GvkKey::from_api_version("apps/v1", "Deployment");
        assert_eq!(grouped.group, "apps");
        assert_eq!(grouped.version, "v1");
        assert_eq!(grouped.api_version(), "apps/v1");
    }

    #[test]
    fn gvk_key_display() {
        assert_eq!(GvkKey::new("", "v1", "Pod").to_string(), "v1/Pod");
        assert_eq!(
            GvkKey::new("apps", "v1", "Deployment").to_string(),
            "apps/v1/Deployment"
        );
    }
}
