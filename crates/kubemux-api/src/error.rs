//! HTTP surface errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kubemux_common::ErrorCode;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the HTTP surface
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No cluster with this id is registered
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// The listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: std::net::SocketAddr,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The server stopped with an error
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

impl Error {
    /// Wire error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ClusterNotFound(_) => ErrorCode::UnknownCluster,
            Error::Bind { .. } | Error::Serve(_) => ErrorCode::Internal,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::ClusterNotFound(_) => StatusCode::NOT_FOUND,
            Error::Bind { .. } | Error::Serve(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
