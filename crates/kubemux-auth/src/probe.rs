//! Recovery probes
//!
//! A probe is the test the recovery loop runs after each backoff wait. The
//! API-server probe asks for `/version` with the cluster's credentials.

use async_trait::async_trait;
use kube::Client;
use kubemux_common::classify_kube_error;
use thiserror::Error;

/// Probe outcome when the cluster is still unusable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The API server answered but rejected our credentials
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// The API server could not be reached or failed
    #[error("probe failed: {0}")]
    Failed(String),
}

/// Test run by the recovery loop to decide whether credentials work again
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    /// `Ok(())` when the cluster accepts our credentials again
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// Probe that calls the API server's `/version` endpoint
#[derive(Clone)]
pub struct ApiServerProbe {
    client: Client,
}

impl ApiServerProbe {
    /// Create a probe for the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RecoveryProbe for ApiServerProbe {
    async fn probe(&self) -> Result<(), ProbeError> {
        match self.client.apiserver_version().await {
            Ok(_) => Ok(()),
            Err(e) if classify_kube_error(&e).is_auth_failure() => {
                Err(ProbeError::Rejected(e.to_string()))
            }
            Err(e) => Err(ProbeError::Failed(e.to_string())),
        }
    }
}
