//! Cluster adapter
//!
//! Routes (cluster, kind, scope) requests to the right stream manager. Every
//! request goes through the same steps:
//!
//! 1. resolve the kind and normalize the scope
//! 2. find the cluster (missing cluster is `UnknownCluster`, never a panic)
//! 3. check `list` and `watch` through the cluster's permission cache; a
//!    review rejected for bad credentials is reported to the cluster's auth
//!    state manager
//! 4. delegate to the stream manager, which applies auth-state admission

use std::sync::Arc;

use futures::future::join_all;
use kubemux_common::{ClusterId, Revision};
use tracing::{debug, warn};

use crate::catalog::{ResourceCatalog, ResourceKind, Scope};
use crate::error::StreamError;
use crate::manager::Feed;
use crate::registry::{ClusterEntry, ClusterRegistry};

/// Verbs a subscriber needs on a resource
const STREAM_VERBS: [&str; 2] = ["list", "watch"];

/// Result of subscribing one cluster during a broadcast subscribe
#[derive(Debug)]
pub struct BroadcastOutcome {
    /// Cluster id
    pub cluster: ClusterId,
    /// Feed, or why this cluster was not subscribed
    pub result: Result<Feed, StreamError>,
}

/// Routes stream requests to per-cluster managers
pub struct ClusterAdapter {
    registry: Arc<ClusterRegistry>,
    catalog: ResourceCatalog,
}

impl ClusterAdapter {
    /// Create an adapter over `registry`
    pub fn new(registry: Arc<ClusterRegistry>, catalog: ResourceCatalog) -> Self {
        Self { registry, catalog }
    }

    /// The registry requests are routed through
    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Resolve `kind` and normalize `raw` into a canonical scope
    pub fn normalize_scope(&self, kind: &str, raw: &str) -> Result<(ResourceKind, Scope), StreamError> {
        self.catalog.normalize(kind, raw)
    }

    /// Subscribe to `kind` in `scope` on one cluster
    pub async fn subscribe_cluster(
        &self,
        cluster: &str,
        kind: &str,
        scope: &str,
    ) -> Result<Feed, StreamError> {
        let (kind, scope) = self.normalize_scope(kind, scope)?;
        let entry = self.lookup(cluster)?;
        authorize(&entry, &kind).await?;
        entry.manager().subscribe(&kind, &scope)
    }

    /// Resume `kind` in `scope` on one cluster after revision `from`
    ///
    /// `epoch` must match the cluster's current manager.
    pub async fn resume_cluster(
        &self,
        cluster: &str,
        kind: &str,
        scope: &str,
        from: Revision,
        epoch: &str,
    ) -> Result<Feed, StreamError> {
        let (kind, scope) = self.normalize_scope(kind, scope)?;
        let entry = self.lookup(cluster)?;
        authorize(&entry, &kind).await?;
        entry.manager().resume(&kind, &scope, from, epoch)
    }

    /// Subscribe on every registered cluster
    ///
    /// Clusters where list/watch is not allowed, or cannot be checked, are
    /// reported as `PermissionDenied`. Rejected credentials are still reported
    /// to the cluster's auth state manager.
    pub async fn subscribe_all(
        &self,
        kind: &str,
        scope: &str,
    ) -> Result<Vec<BroadcastOutcome>, StreamError> {
        let (kind, scope) = self.normalize_scope(kind, scope)?;
        let entries = self.registry.entries();

        let outcomes = join_all(entries.iter().map(|entry| {
            let kind = &kind;
            let scope = &scope;
            async move {
                let result = match authorize(entry, kind).await {
                    Ok(()) => entry.manager().subscribe(kind, scope),
                    Err(err) => {
                        debug!(cluster = %entry.id(), kind = %kind.name, error = %err, "Skipping cluster, list/watch not allowed");
                        Err(StreamError::PermissionDenied {
                            cluster: entry.id().to_string(),
                            resource: kind.qualified_name(),
                            verb: STREAM_VERBS.join("/"),
                        })
                    }
                };
                BroadcastOutcome {
                    cluster: entry.id().to_string(),
                    result,
                }
            }
        }))
        .await;

        Ok(outcomes)
    }

    fn lookup(&self, cluster: &str) -> Result<Arc<ClusterEntry>, StreamError> {
        self.registry
            .get(cluster)
            .ok_or_else(|| StreamError::UnknownCluster(cluster.to_string()))
    }
}

async fn authorize(entry: &ClusterEntry, kind: &ResourceKind) -> Result<(), StreamError> {
    for verb in STREAM_VERBS {
        let decision = match entry.permissions().can(&kind.group, &kind.name, verb).await {
            Ok(decision) => decision,
            Err(err) => {
                if err.is_unauthenticated() {
                    warn!(cluster = %entry.id(), error = %err, "Access review rejected credentials, reporting auth failure");
                    entry.auth().report_failure(err.to_string());
                }
                return Err(err.into());
            }
        };
        if !decision.allowed {
            return Err(StreamError::PermissionDenied {
                cluster: entry.id().to_string(),
                resource: kind.qualified_name(),
                verb: verb.to_string(),
            });
        }
    }
    Ok(())
}
