//! Per-cluster permission cache
//!
//! Decisions are cached per (cluster, group, resource, verb) for a TTL.
//! Concurrent misses for the same key share one backend check through
//! [`Singleflight`]. When the backend fails transiently, an expired entry is
//! served as a `fallback` decision; an authoritative deny is never masked
//! because denials are cached decisions like any other.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kubemux_common::metrics::record_permission_check;
use kubemux_common::ErrorCode;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::review::{AccessReviewer, ReviewError};
use crate::singleflight::Singleflight;

/// Default lifetime of a cached decision
pub const DEFAULT_PERMISSION_TTL: Duration = Duration::from_secs(120);

/// Default timeout for a single backend check
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Unexpired cache entry
    Cache,
    /// Backend check performed for this call (or joined while in flight)
    Fresh,
    /// Expired entry served because the backend failed transiently
    Fallback,
}

impl DecisionSource {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Fresh => "fresh",
            Self::Fallback => "fallback",
        }
    }
}

/// An allow/deny decision and its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the action is allowed
    pub allowed: bool,
    /// Where the decision came from
    pub source: DecisionSource,
}

/// No decision could be produced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    /// The backend failed and no usable cached decision exists
    #[error("authorization unavailable for {verb} {resource} on cluster {cluster}: {source}")]
    Unavailable {
        /// Cluster the check was for
        cluster: String,
        /// `group/resource`, or just `resource` for the core group
        resource: String,
        /// Verb that was checked
        verb: String,
        /// Backend failure
        #[source]
        source: ReviewError,
    },
}

impl PermissionError {
    /// Wire-level error code
    pub fn code(&self) -> ErrorCode {
        ErrorCode::AuthorizationUnavailable
    }

    /// Whether the API server rejected the cluster credentials themselves
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::Unavailable {
                source: ReviewError::Unauthenticated(_),
                ..
            }
        )
    }
}

/// Configuration for [`PermissionCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCacheConfig {
    /// Lifetime of a cached decision; zero means [`DEFAULT_PERMISSION_TTL`]
    pub default_ttl: Duration,
    /// Upper bound on a single backend check
    pub check_timeout: Duration,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_PERMISSION_TTL,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PermissionKey {
    cluster_id: String,
    group: String,
    resource: String,
    verb: String,
}

impl PermissionKey {
    fn display_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}/{}", self.group, self.resource)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    allowed: bool,
    cached_at: Instant,
    expires_at: Instant,
}

/// Cached, deduplicated authorization decisions for one cluster identity
pub struct PermissionCache {
    cluster_id: String,
    reviewer: Arc<dyn AccessReviewer>,
    ttl: Duration,
    check_timeout: Duration,
    entries: Arc<DashMap<PermissionKey, CacheEntry>>,
    flights: Singleflight<PermissionKey, Result<bool, ReviewError>>,
}

impl PermissionCache {
    /// Create a cache for `cluster_id` backed by `reviewer`
    pub fn new(
        cluster_id: impl Into<String>,
        reviewer: Arc<dyn AccessReviewer>,
        config: PermissionCacheConfig,
    ) -> Self {
        let ttl = if config.default_ttl.is_zero() {
            DEFAULT_PERMISSION_TTL
        } else {
            config.default_ttl
        };
        Self {
            cluster_id: cluster_id.into(),
            reviewer,
            ttl,
            check_timeout: config.check_timeout,
            entries: Arc::new(DashMap::new()),
            flights: Singleflight::new(),
        }
    }

    /// Cluster this cache belongs to
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Effective TTL of cached decisions
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of cached decisions, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no decision has been cached yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decide whether `verb` on `group/resource` is allowed
    pub async fn can(
        &self,
        group: &str,
        resource: &str,
        verb: &str,
    ) -> Result<Decision, PermissionError> {
        let key = PermissionKey {
            cluster_id: self.cluster_id.clone(),
            group: group.to_string(),
            resource: resource.to_string(),
            verb: verb.to_string(),
        };

        if let Some(entry) = self.lookup(&key) {
            if Instant::now() < entry.expires_at {
                record_permission_check(DecisionSource::Cache.as_str(), Some(entry.allowed));
                return Ok(Decision {
                    allowed: entry.allowed,
                    source: DecisionSource::Cache,
                });
            }
        }

        let outcome = self
            .flights
            .run(key.clone(), || self.check(key.clone()))
            .await
            .unwrap_or(Err(ReviewError::Cancelled));

        match outcome {
            Ok(allowed) => {
                record_permission_check(DecisionSource::Fresh.as_str(), Some(allowed));
                Ok(Decision {
                    allowed,
                    source: DecisionSource::Fresh,
                })
            }
            Err(err) => {
                if err.is_transient() {
                    if let Some(stale) = self.lookup(&key) {
                        warn!(
                            cluster = %self.cluster_id,
                            resource = %key.display_resource(),
                            verb = %key.verb,
                            age_secs = stale.cached_at.elapsed().as_secs(),
                            error = %err,
                            "Permission check failed transiently, serving cached decision"
                        );
                        record_permission_check(
                            DecisionSource::Fallback.as_str(),
                            Some(stale.allowed),
                        );
                        return Ok(Decision {
                            allowed: stale.allowed,
                            source: DecisionSource::Fallback,
                        });
                    }
                }

                record_permission_check("error", None);
                Err(PermissionError::Unavailable {
                    cluster: self.cluster_id.clone(),
                    resource: key.display_resource(),
                    verb: key.verb,
                    source: err,
                })
            }
        }
    }

    /// Whether both `list` and `watch` are allowed; errors count as denial
    pub async fn can_list_watch(&self, group: &str, resource: &str) -> bool {
        let (list, watch) = tokio::join!(
            self.can(group, resource, "list"),
            self.can(group, resource, "watch"),
        );
        match (list, watch) {
            (Ok(list), Ok(watch)) => list.allowed && watch.allowed,
            (Err(e), _) | (_, Err(e)) => {
                debug!(cluster = %self.cluster_id, error = %e, "Treating failed list/watch check as denied");
                false
            }
        }
    }

    fn lookup(&self, key: &PermissionKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Build the flight body: one timed backend call whose success is cached
    fn check(
        &self,
        key: PermissionKey,
    ) -> impl std::future::Future<Output = Result<bool, ReviewError>> + Send + 'static {
        let reviewer = self.reviewer.clone();
        let entries = self.entries.clone();
        let ttl = self.ttl;
        let timeout = self.check_timeout;

        async move {
            let result =
                match tokio::time::timeout(timeout, reviewer.review(&key.group, &key.resource, &key.verb))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ReviewError::Timeout),
                };

            if let Ok(allowed) = result {
                let now = Instant::now();
                entries.insert(
                    key,
                    CacheEntry {
                        allowed,
                        cached_at: now,
                        expires_at: now + ttl,
                    },
                );
            }
            result
        }
    }
}
