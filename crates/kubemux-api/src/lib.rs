//! kubemux API
//!
//! The client-facing side of kubemux: the JSON [`protocol`], the stream
//! multiplexer in [`handler`], subscription [`telemetry`], and the axum
//! [`server`] exposing `/healthz`, `/clusters`, and the `/stream` WebSocket.

#![deny(missing_docs)]

pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod telemetry;

pub use error::Error;
pub use handler::{HandlerConfig, StreamHandler};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{router, start_server, AppState, ServerConfig};
pub use telemetry::{DisplayNames, MetricsRecorder, NoopRecorder, StreamRecorder, StreamTelemetryEvent};
