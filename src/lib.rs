//! kubemux: multi-cluster Kubernetes resource stream multiplexer
//!
//! One WebSocket connection from a UI client carries many resumable
//! subscriptions to resources across every connected cluster. Permission
//! checks are cached per cluster and every cluster runs its own auth
//! recovery loop.
//!
//! The work lives in the member crates; this crate wires them to kubeconfig
//! contexts and ships the binary.

#![deny(missing_docs)]

pub mod clusters;

pub use kubemux_api as api;
pub use kubemux_auth as auth;
pub use kubemux_common as common;
pub use kubemux_stream as stream;
