//! Stream layer errors

use kubemux_auth::PermissionError;
use kubemux_common::{ErrorCode, Revision};
use thiserror::Error;

/// Failure to establish, resume, or continue a feed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// No stream manager is registered for the cluster
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// The resource kind is not in the catalog
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// The scope could not be normalized for the kind
    #[error("invalid scope {scope:?} for {kind}: {reason}")]
    InvalidScope {
        /// Canonical kind name
        kind: String,
        /// Scope as supplied by the caller
        scope: String,
        /// What is wrong with it
        reason: String,
    },

    /// RBAC denies list or watch on the resource
    #[error("permission denied: cannot {verb} {resource} on cluster {cluster}")]
    PermissionDenied {
        /// Cluster id
        cluster: String,
        /// `group/resource`
        resource: String,
        /// Denied verb
        verb: String,
    },

    /// The permission check itself failed
    #[error(transparent)]
    Authorization(#[from] PermissionError),

    /// The cluster's credentials are invalid and recovery has stopped
    #[error("cluster {cluster} unavailable: {reason}")]
    ClusterUnavailable {
        /// Cluster id
        cluster: String,
        /// Auth failure reason
        reason: String,
    },

    /// The requested revision is not retained by this manager
    #[error("cannot resume {kind} in {scope} on cluster {cluster} from revision {from}")]
    ResumeUnavailable {
        /// Cluster id
        cluster: String,
        /// Canonical kind name
        kind: String,
        /// Canonical scope
        scope: String,
        /// Revision the client asked to resume from
        from: Revision,
    },

    /// The underlying watch kept failing and was closed
    #[error("watch for {kind} in {scope} on cluster {cluster} failed after {attempts} attempts: {message}")]
    WatchFailed {
        /// Cluster id
        cluster: String,
        /// Canonical kind name
        kind: String,
        /// Canonical scope
        scope: String,
        /// Consecutive failed attempts
        attempts: u32,
        /// Last error
        message: String,
    },

    /// The cluster was removed while the feed was live
    #[error("cluster {0} was removed")]
    ClusterRemoved(String),
}

impl StreamError {
    /// Wire-level error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownCluster(_) | Self::ClusterRemoved(_) => ErrorCode::UnknownCluster,
            Self::UnknownKind(_) | Self::InvalidScope { .. } => ErrorCode::InvalidRequest,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::Authorization(e) => e.code(),
            Self::ClusterUnavailable { .. } => ErrorCode::ClusterUnavailable,
            Self::ResumeUnavailable { .. } => ErrorCode::ResumeUnavailable,
            Self::WatchFailed { .. } => ErrorCode::WatchFailed,
        }
    }
}
