//! Cluster bootstrap from kubeconfig contexts
//!
//! Every selected context becomes one registered cluster whose id is the
//! context name. All three backends of a cluster share one kube `Client`.

use std::path::Path;
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use kubemux_auth::{ApiServerProbe, SelfSubjectAccessReviewer};
use kubemux_stream::{ClusterConfig, ClusterEntry, ClusterRegistry, KubeWatchSource};
use thiserror::Error;
use tracing::{info, warn};

/// Bootstrap errors
#[derive(Debug, Error)]
pub enum Error {
    /// The kubeconfig could not be read
    #[error("failed to read kubeconfig: {0}")]
    Kubeconfig(#[source] KubeconfigError),

    /// A requested context is not in the kubeconfig
    #[error("context {0} not found in kubeconfig")]
    UnknownContext(String),

    /// A context could not be turned into a client configuration
    #[error("invalid context {context}: {source}")]
    Context {
        /// Context name
        context: String,
        /// Underlying error
        source: KubeconfigError,
    },

    /// A client could not be built for a context
    #[error("failed to create client for context {context}: {source}")]
    Client {
        /// Context name
        context: String,
        /// Underlying error
        source: kube::Error,
    },

    /// No cluster could be connected
    #[error("no cluster could be connected")]
    NoClusters,
}

/// Read `path`, or the default kubeconfig chain when `None`
pub fn read_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig, Error> {
    match path {
        Some(path) => Kubeconfig::read_from(path),
        None => Kubeconfig::read(),
    }
    .map_err(Error::Kubeconfig)
}

/// Contexts to connect: `requested` in order, or every context when empty
pub fn select_contexts(kubeconfig: &Kubeconfig, requested: &[String]) -> Result<Vec<String>, Error> {
    let known: Vec<&str> = kubeconfig
        .contexts
        .iter()
        .map(|named| named.name.as_str())
        .collect();

    if requested.is_empty() {
        return Ok(known.iter().map(|name| name.to_string()).collect());
    }

    requested
        .iter()
        .map(|name| {
            if known.contains(&name.as_str()) {
                Ok(name.clone())
            } else {
                Err(Error::UnknownContext(name.clone()))
            }
        })
        .collect()
}

/// Display name for a context: its cluster name when set, else the context name
pub fn display_name(kubeconfig: &Kubeconfig, context: &str) -> String {
    kubeconfig
        .contexts
        .iter()
        .find(|named| named.name == context)
        .and_then(|named| named.context.as_ref())
        .map(|ctx| ctx.cluster.clone())
        .filter(|cluster| !cluster.is_empty())
        .unwrap_or_else(|| context.to_string())
}

/// Build a kube client for one context
pub async fn client_for_context(kubeconfig: &Kubeconfig, context: &str) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
        .await
        .map_err(|source| Error::Context {
            context: context.to_string(),
            source,
        })?;
    Client::try_from(config).map_err(|source| Error::Client {
        context: context.to_string(),
        source,
    })
}

/// Register one cluster per context
///
/// Contexts that cannot be connected are skipped with a warning; it is an
/// error only when none can. Returns the number registered.
pub async fn connect_clusters(
    registry: &ClusterRegistry,
    kubeconfig: &Kubeconfig,
    contexts: &[String],
    config: &ClusterConfig,
) -> Result<usize, Error> {
    let mut connected = 0;
    for context in contexts {
        let client = match client_for_context(kubeconfig, context).await {
            Ok(client) => client,
            Err(e) => {
                warn!(context = %context, error = %e, "Skipping context");
                continue;
            }
        };

        registry
            .add(ClusterEntry::new(
                context.clone(),
                display_name(kubeconfig, context),
                Arc::new(KubeWatchSource::new(client.clone())),
                Arc::new(SelfSubjectAccessReviewer::new(client.clone())),
                Arc::new(ApiServerProbe::new(client)),
                config.clone(),
            ))
            .await;
        connected += 1;
    }

    if connected == 0 {
        return Err(Error::NoClusters);
    }
    info!(clusters = connected, "Clusters connected");
    Ok(connected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
  - name: prod-east
    cluster:
      server: https://127.0.0.1:6443
  - name: staging
    cluster:
      server: https://127.0.0.1:7443
contexts:
  - name: prod
    context:
      cluster: prod-east
      user: admin
  - name: stage
    context:
      cluster: staging
      user: admin
users:
  - name: admin
    user:
      token: abc
current-context: prod
"#;

    fn kubeconfig() -> Kubeconfig {
        Kubeconfig::from_yaml(KUBECONFIG).unwrap()
    }

    #[test]
    fn test_select_all_contexts_by_default() {
        let contexts = select_contexts(&kubeconfig(), &[]).unwrap();
        assert_eq!(contexts, vec!["prod".to_string(), "stage".to_string()]);
    }

    #[test]
    fn test_select_requested_contexts() {
        let contexts = select_contexts(&kubeconfig(), &["stage".to_string()]).unwrap();
        assert_eq!(contexts, vec!["stage".to_string()]);

        let err = select_contexts(&kubeconfig(), &["nope".to_string()]).unwrap_err();
        assert!(matches!(err, Error::UnknownContext(name) if name == "nope"));
    }

    #[test]
    fn test_display_name_prefers_cluster() {
        assert_eq!(display_name(&kubeconfig(), "prod"), "prod-east");
        assert_eq!(display_name(&kubeconfig(), "missing"), "missing");
    }

    #[tokio::test]
    async fn test_connect_registers_each_context() {
        let registry = ClusterRegistry::new();
        let contexts = select_contexts(&kubeconfig(), &[]).unwrap();
        let connected = connect_clusters(&registry, &kubeconfig(), &contexts, &ClusterConfig::default())
            .await
            .unwrap();

        assert_eq!(connected, 2);
        assert_eq!(registry.ids(), vec!["prod".to_string(), "stage".to_string()]);
        assert_eq!(registry.display_name("stage"), "staging");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_nothing_is_an_error() {
        let registry = ClusterRegistry::new();
        let err = connect_clusters(&registry, &kubeconfig(), &[], &ClusterConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoClusters));
    }
}
