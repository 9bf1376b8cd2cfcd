//! Authorization backends
//!
//! An [`AccessReviewer`] answers "may the current identity perform `verb` on
//! `group/resource`?". The production implementation posts a
//! SelfSubjectAccessReview to the cluster's API server.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use kubemux_common::{classify_kube_error, KubeFailure};
use thiserror::Error;

/// Failure of a single authorization check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReviewError {
    /// The check did not finish within the configured timeout
    #[error("access review timed out")]
    Timeout,

    /// The API server throttled the request
    #[error("access review rate limited: {0}")]
    RateLimited(String),

    /// The check was cancelled before completing
    #[error("access review cancelled")]
    Cancelled,

    /// The API server rejected our credentials
    #[error("access review unauthenticated: {0}")]
    Unauthenticated(String),

    /// Any other backend failure
    #[error("access review failed: {0}")]
    Backend(String),
}

impl ReviewError {
    /// Whether a stale cached decision may stand in for this failure
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited(_) | Self::Cancelled)
    }

    /// Map a kube-rs error onto the review taxonomy
    pub fn from_kube(err: &kube::Error) -> Self {
        match classify_kube_error(err) {
            KubeFailure::RateLimited => Self::RateLimited(err.to_string()),
            KubeFailure::Unauthenticated => Self::Unauthenticated(err.to_string()),
            KubeFailure::Forbidden | KubeFailure::Other => Self::Backend(err.to_string()),
        }
    }
}

/// Authorization backend for one cluster identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Ask whether `verb` on `group/resource` is allowed
    async fn review(&self, group: &str, resource: &str, verb: &str) -> Result<bool, ReviewError>;
}

/// SelfSubjectAccessReview-backed reviewer
#[derive(Clone)]
pub struct SelfSubjectAccessReviewer {
    client: Client,
}

impl SelfSubjectAccessReviewer {
    /// Create a reviewer using the cluster's client credentials
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessReviewer for SelfSubjectAccessReviewer {
    async fn review(&self, group: &str, resource: &str, verb: &str) -> Result<bool, ReviewError> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let request = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(group.to_string()),
                    resource: Some(resource.to_string()),
                    verb: Some(verb.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = api
            .create(&PostParams::default(), &request)
            .await
            .map_err(|e| ReviewError::from_kube(&e))?;

        let status = response
            .status
            .ok_or_else(|| ReviewError::Backend("review response carried no status".to_string()))?;
        Ok(status.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_transient_classification() {
        assert!(ReviewError::Timeout.is_transient());
        assert!(ReviewError::Cancelled.is_transient());
        assert!(ReviewError::RateLimited("slow down".into()).is_transient());
        assert!(!ReviewError::Unauthenticated("no".into()).is_transient());
        assert!(!ReviewError::Backend("500".into()).is_transient());
    }

    #[test]
    fn test_from_kube_maps_status_codes() {
        assert!(matches!(
            ReviewError::from_kube(&api_error(429)),
            ReviewError::RateLimited(_)
        ));
        assert!(matches!(
            ReviewError::from_kube(&api_error(401)),
            ReviewError::Unauthenticated(_)
        ));
        assert!(matches!(
            ReviewError::from_kube(&api_error(500)),
            ReviewError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn test_mock_reviewer_receives_attributes() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_review()
            .withf(|group, resource, verb| {
                group.is_empty() && resource.to_string() == "pods" && verb.to_string() == "list"
            })
            .times(1)
            .returning(|_, _, _| Ok(true));

        assert_eq!(reviewer.review("", "pods", "list").await, Ok(true));
    }
}
