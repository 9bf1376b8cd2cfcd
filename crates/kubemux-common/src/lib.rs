//! Common types for kubemux: error codes, retry policy, metrics, and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::{classify_kube_error, ErrorCode, KubeFailure};
pub use retry::RetryConfig;

/// Identifier of a connected cluster (usually the kubeconfig context name)
pub type ClusterId = String;

/// Revision number stamped on every emitted update of a stream series
pub type Revision = u64;

/// Default bind address for the stream server
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7420";

/// Path of the WebSocket stream endpoint
pub const STREAM_PATH: &str = "/stream";
