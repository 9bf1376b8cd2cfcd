//! HTTP and WebSocket server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{future, SinkExt, StreamExt};
use kubemux_common::STREAM_PATH;
use kubemux_stream::{ClusterRegistry, ClusterSummary};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handler::StreamHandler;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Stream multiplexer
    pub handler: Arc<StreamHandler>,
    /// Registered clusters
    pub registry: Arc<ClusterRegistry>,
}

impl AppState {
    /// State serving `handler`, whose adapter owns the registry
    pub fn new(handler: Arc<StreamHandler>) -> Self {
        let registry = handler.adapter().registry().clone();
        Self { handler, registry }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/clusters", get(list_clusters))
        .route("/clusters/{cluster}", get(get_cluster))
        .route(STREAM_PATH, get(stream_handler))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn start_server(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|source| Error::Bind {
            addr: config.addr,
            source,
        })?;

    info!(addr = %config.addr, "Starting stream server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Error::Serve)?;

    info!("Stream server stopped");
    Ok(())
}

async fn list_clusters(State(state): State<AppState>) -> Json<Vec<ClusterSummary>> {
    Json(state.registry.summaries())
}

async fn get_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
) -> Result<Json<ClusterSummary>> {
    state
        .registry
        .summaries()
        .into_iter()
        .find(|summary| summary.id == cluster)
        .map(Json)
        .ok_or(Error::ClusterNotFound(cluster))
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(state.handler, socket))
}

/// Bridge a WebSocket onto the text-frame transport the handler speaks
async fn serve_socket(handler: Arc<StreamHandler>, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let inbound = stream
        .take_while(|frame| {
            future::ready(match frame {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    debug!(error = %e, "WebSocket read failed");
                    false
                }
            })
        })
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    let outbound =
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));

    handler.serve(Box::pin(inbound), Box::pin(outbound)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use kubemux_stream::testing::{DenyList, IdleSource, HealthyRecovery};
    use kubemux_stream::{ClusterAdapter, ClusterConfig, ClusterEntry, ResourceCatalog};
    use tower::ServiceExt;

    async fn state() -> AppState {
        let registry = Arc::new(ClusterRegistry::new());
        registry
            .add(ClusterEntry::new(
                "c1",
                "Cluster One",
                Arc::new(IdleSource),
                Arc::new(DenyList::allow_all()),
                Arc::new(HealthyRecovery),
                ClusterConfig::default(),
            ))
            .await;
        let adapter = Arc::new(ClusterAdapter::new(registry, ResourceCatalog::builtin()));
        AppState::new(Arc::new(StreamHandler::new(adapter, HandlerConfig::default())))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = router(state().await)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_clusters_lists_summaries() {
        let (status, body) = get_json(router(state().await), "/clusters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "c1");
        assert_eq!(body[0]["displayName"], "Cluster One");
        assert_eq!(body[0]["auth"]["state"], "valid");
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_not_found() {
        let (status, body) = get_json(router(state().await), "/clusters/missing-cluster").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown-cluster");
    }

    #[tokio::test]
    async fn test_stream_requires_upgrade() {
        let response = router(state().await)
            .oneshot(Request::builder().uri(STREAM_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
