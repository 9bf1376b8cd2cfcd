//! Error taxonomy shared by every kubemux component
//!
//! Component crates define their own `thiserror` enums and map each variant
//! onto an [`ErrorCode`], which is the only error vocabulary that crosses the
//! wire to UI clients.

use serde::{Deserialize, Serialize};

/// Wire-level error classification sent to UI clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// No stream manager is registered for the requested cluster
    UnknownCluster,
    /// The authorization check returned an authoritative deny
    PermissionDenied,
    /// The authorization check failed and no fallback decision exists
    AuthorizationUnavailable,
    /// The cluster's credentials are invalid and recovery has given up
    ClusterUnavailable,
    /// The requested revision is no longer retained; the client must reset
    ResumeUnavailable,
    /// The control message could not be parsed or is missing fields
    InvalidRequest,
    /// The underlying watch failed repeatedly and was closed
    WatchFailed,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCluster => "unknown-cluster",
            Self::PermissionDenied => "permission-denied",
            Self::AuthorizationUnavailable => "authorization-unavailable",
            Self::ClusterUnavailable => "cluster-unavailable",
            Self::ResumeUnavailable => "resume-unavailable",
            Self::InvalidRequest => "invalid-request",
            Self::WatchFailed => "watch-failed",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a failed Kubernetes API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeFailure {
    /// HTTP 401: credentials were rejected
    Unauthenticated,
    /// HTTP 403: credentials are valid but lack permission
    Forbidden,
    /// HTTP 429: the API server is throttling us
    RateLimited,
    /// Any other failure
    Other,
}

impl KubeFailure {
    /// Whether this failure carries an authentication/authorization signature
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthenticated | Self::Forbidden)
    }
}

/// Classify a kube-rs error by its API status code
pub fn classify_kube_error(err: &kube::Error) -> KubeFailure {
    match err {
        kube::Error::Api(ae) => classify_status_code(ae.code),
        _ => KubeFailure::Other,
    }
}

/// Classify a raw HTTP status code
pub fn classify_status_code(code: u16) -> KubeFailure {
    match code {
        401 => KubeFailure::Unauthenticated,
        403 => KubeFailure::Forbidden,
        429 => KubeFailure::RateLimited,
        _ => KubeFailure::Other,
    }
}
