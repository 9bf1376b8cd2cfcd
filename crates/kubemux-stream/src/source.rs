//! Watch sources
//!
//! A [`WatchSource`] starts a watch for a (kind, scope) and yields an ordered
//! stream of [`WatchEvent`]s that ends with an error or with the stream
//! closing. The stream manager owns restart policy; a source never retries on
//! its own.

use futures::stream::BoxStream;
use futures::{future, StreamExt};
use kube::api::DynamicObject;
use kube::runtime::watcher;
use kube::{Api, Client};
use kubemux_common::{classify_kube_error, KubeFailure};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::{ResourceKind, Scope};

/// One change observed by a watch
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The watch (re)listed: this is the complete current object set
    Restarted(Vec<Value>),
    /// An object was created or changed
    Applied(Value),
    /// An object was deleted
    Deleted(Value),
}

/// A watch ended with an error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The API server rejected the watch with 401 or 403
    #[error("watch unauthorized: {0}")]
    Unauthorized(String),

    /// Any other failure
    #[error("watch failed: {0}")]
    Failed(String),
}

impl WatchError {
    /// Whether this failure carries an authentication/authorization signature
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    fn from_kube(err: &kube::Error) -> Self {
        match classify_kube_error(err) {
            KubeFailure::Unauthenticated | KubeFailure::Forbidden => {
                Self::Unauthorized(err.to_string())
            }
            KubeFailure::RateLimited | KubeFailure::Other => Self::Failed(err.to_string()),
        }
    }

    fn from_watcher(err: &watcher::Error) -> Self {
        match err {
            watcher::Error::InitialListFailed(e)
            | watcher::Error::WatchStartFailed(e)
            | watcher::Error::WatchFailed(e) => Self::from_kube(e),
            watcher::Error::WatchError(status) => {
                if kubemux_common::error::classify_status_code(status.code).is_auth_failure() {
                    Self::Unauthorized(err.to_string())
                } else {
                    Self::Failed(err.to_string())
                }
            }
            _ => Self::Failed(err.to_string()),
        }
    }
}

/// Ordered events of one watch instance
pub type WatchStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

/// Capability to start resource watches on one cluster
#[cfg_attr(test, mockall::automock)]
pub trait WatchSource: Send + Sync {
    /// Start a watch for `kind` restricted to `scope`
    fn watch(&self, kind: &ResourceKind, scope: &Scope) -> WatchStream;
}

/// kube-runtime watcher over `DynamicObject`
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    /// Create a source for the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ResourceKind, scope: &Scope) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match scope.namespace() {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

impl WatchSource for KubeWatchSource {
    fn watch(&self, kind: &ResourceKind, scope: &Scope) -> WatchStream {
        let api = self.api(kind, scope);
        let mut initial: Vec<Value> = Vec::new();

        watcher(api, watcher::Config::default().any_semantic())
            .filter_map(move |event| {
                let mapped = match event {
                    Ok(watcher::Event::Init) => {
                        initial.clear();
                        None
                    }
                    Ok(watcher::Event::InitApply(obj)) => {
                        initial.push(to_value(&obj));
                        None
                    }
                    Ok(watcher::Event::InitDone) => {
                        Some(Ok(WatchEvent::Restarted(std::mem::take(&mut initial))))
                    }
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Applied(to_value(&obj)))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(to_value(&obj)))),
                    Err(e) => Some(Err(WatchError::from_watcher(&e))),
                };
                future::ready(mapped)
            })
            .boxed()
    }
}

fn to_value(obj: &DynamicObject) -> Value {
    serde_json::to_value(obj).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "denied".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_auth_signatures_classified() {
        assert!(WatchError::from_kube(&api_error(401)).is_auth_failure());
        assert!(WatchError::from_kube(&api_error(403)).is_auth_failure());
        assert!(!WatchError::from_kube(&api_error(500)).is_auth_failure());
        assert!(!WatchError::from_kube(&api_error(429)).is_auth_failure());
    }

    #[test]
    fn test_watcher_errors_classified() {
        let err = watcher::Error::InitialListFailed(api_error(401));
        assert!(WatchError::from_watcher(&err).is_auth_failure());

        let err = watcher::Error::WatchFailed(api_error(503));
        assert!(!WatchError::from_watcher(&err).is_auth_failure());
    }

    #[tokio::test]
    async fn test_mock_source_yields_scripted_events() {
        let mut source = MockWatchSource::new();
        source.expect_watch().times(1).returning(|_, _| {
            stream::iter(vec![
                Ok(WatchEvent::Restarted(vec![])),
                Err(WatchError::Failed("gone".into())),
            ])
            .boxed()
        });

        let kind = crate::catalog::ResourceCatalog::builtin().lookup("pods").unwrap().clone();
        let events: Vec<_> = source.watch(&kind, &Scope::AllNamespaces).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(WatchError::Failed(_))));
    }
}
