//! Cluster registry
//!
//! Maps cluster id to the per-cluster components: stream manager, permission
//! cache, auth state manager, and display name. The application builds it
//! with [`ClusterRegistry::add`] / [`ClusterRegistry::remove`] and hands an
//! `Arc` of it to the adapter; there is no global instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use kubemux_auth::{
    AccessReviewer, AuthRecoveryConfig, AuthSnapshot, AuthStateManager, PermissionCache,
    PermissionCacheConfig, RecoveryProbe,
};
use kubemux_common::ClusterId;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::manager::{StreamConfig, StreamManager};
use crate::source::WatchSource;

/// Components serving one cluster
pub struct ClusterEntry {
    id: ClusterId,
    display_name: String,
    manager: StreamManager,
    permissions: Arc<PermissionCache>,
    auth: AuthStateManager,
}

impl ClusterEntry {
    /// Wire up the components for one cluster from its backends
    pub fn new(
        id: impl Into<ClusterId>,
        display_name: impl Into<String>,
        source: Arc<dyn WatchSource>,
        reviewer: Arc<dyn AccessReviewer>,
        probe: Arc<dyn RecoveryProbe>,
        config: ClusterConfig,
    ) -> Self {
        let id = id.into();
        let auth = AuthStateManager::new(id.clone(), probe, config.recovery);
        let permissions = Arc::new(PermissionCache::new(id.clone(), reviewer, config.permissions));
        let manager = StreamManager::new(id.clone(), source, auth.clone(), config.stream);
        Self {
            id,
            display_name: display_name.into(),
            manager,
            permissions,
            auth,
        }
    }

    /// Cluster id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name for logs, metrics, and the UI
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Stream manager
    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    /// Permission cache
    pub fn permissions(&self) -> &Arc<PermissionCache> {
        &self.permissions
    }

    /// Auth state manager
    pub fn auth(&self) -> &AuthStateManager {
        &self.auth
    }

    /// Stop watches, close feeds, and stop auth recovery
    pub async fn shutdown(&self) {
        self.manager.shutdown();
        self.auth.shutdown().await;
    }
}

/// Per-cluster component settings
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Permission cache
    pub permissions: PermissionCacheConfig,
    /// Auth recovery loop
    pub recovery: AuthRecoveryConfig,
    /// Stream manager
    pub stream: StreamConfig,
}

/// Serializable summary of a registered cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    /// Cluster id
    pub id: ClusterId,
    /// Display name
    pub display_name: String,
    /// Current auth state
    pub auth: AuthSnapshot,
    /// Running watches
    pub active_watches: usize,
}

/// All connected clusters
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<BTreeMap<ClusterId, Arc<ClusterEntry>>>,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster, shutting down any entry it replaces
    pub async fn add(&self, entry: ClusterEntry) -> Arc<ClusterEntry> {
        let entry = Arc::new(entry);
        let replaced = self
            .clusters
            .write()
            .insert(entry.id.clone(), entry.clone());
        info!(cluster = %entry.id, display_name = %entry.display_name, "Cluster registered");
        if let Some(old) = replaced {
            old.shutdown().await;
        }
        entry
    }

    /// Unregister a cluster and shut it down
    pub async fn remove(&self, id: &str) -> Option<Arc<ClusterEntry>> {
        let removed = self.clusters.write().remove(id)?;
        info!(cluster = %id, "Cluster removed");
        removed.shutdown().await;
        Some(removed)
    }

    /// Look up a cluster
    pub fn get(&self, id: &str) -> Option<Arc<ClusterEntry>> {
        self.clusters.read().get(id).cloned()
    }

    /// Ids of every registered cluster, sorted
    pub fn ids(&self) -> Vec<ClusterId> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Snapshot of every registered cluster, sorted by id
    pub fn entries(&self) -> Vec<Arc<ClusterEntry>> {
        self.clusters.read().values().cloned().collect()
    }

    /// Display name for `id`, falling back to the id itself
    pub fn display_name(&self, id: &str) -> String {
        self.get(id)
            .map(|entry| entry.display_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Summaries for the `/clusters` endpoint
    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.entries()
            .iter()
            .map(|entry| ClusterSummary {
                id: entry.id.clone(),
                display_name: entry.display_name.clone(),
                auth: entry.auth.snapshot(),
                active_watches: entry.manager.active_watches(),
            })
            .collect()
    }

    /// Number of registered clusters
    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    /// Whether no cluster is registered
    pub fn is_empty(&self) -> bool {
        self.clusters.read().is_empty()
    }

    /// Shut down and drop every cluster
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<ClusterEntry>> = std::mem::take(&mut *self.clusters.write())
            .into_values()
            .collect();
        for entry in entries {
            entry.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Scope;
    use crate::testing::idle_entry as entry;
    use kubemux_auth::AuthState;

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = ClusterRegistry::new();
        assert!(registry.is_empty());

        registry.add(entry("b", vec![])).await;
        registry.add(entry("a", vec![])).await;
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.display_name("a"), "a (display)");
        assert_eq!(registry.display_name("zzz"), "zzz");

        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.id(), "a");
        assert!(registry.get("a").is_none());
        assert!(registry.remove("a").await.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_replacing_entry_gets_fresh_manager() {
        let registry = ClusterRegistry::new();
        let first = registry.add(entry("c1", vec![])).await;
        let second = registry.add(entry("c1", vec![])).await;

        assert_ne!(first.manager().epoch(), second.manager().epoch());
        let pods = crate::catalog::ResourceCatalog::builtin().lookup("pods").unwrap().clone();
        assert!(first.manager().subscribe(&pods, &Scope::AllNamespaces).is_err());
        assert!(second.manager().subscribe(&pods, &Scope::AllNamespaces).is_ok());
    }

    #[tokio::test]
    async fn test_summaries_report_auth_state() {
        let registry = ClusterRegistry::new();
        registry.add(entry("c1", vec![])).await;

        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].auth.state, AuthState::Valid);
        assert_eq!(summaries[0].active_watches, 0);

        let json = serde_json::to_value(&summaries[0]).unwrap();
        assert_eq!(json["displayName"], "c1 (display)");
        assert_eq!(json["auth"]["state"], "valid");
    }
}
