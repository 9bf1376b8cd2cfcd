//! kubemux stream layer
//!
//! Turns "give me `pods` in `namespace:default` on cluster `c1`" into a
//! revisioned, resumable feed:
//!
//! - [`catalog`]: known resource kinds and canonical [`Scope`] normalization
//! - [`source`]: the [`WatchSource`] seam and its kube-runtime implementation
//! - [`manager`]: one [`StreamManager`] per cluster, one watch per series,
//!   reference-counted fan-out, revision backlog for resume
//! - [`registry`]: the explicitly owned [`ClusterRegistry`]
//! - [`adapter`]: [`ClusterAdapter`], routing requests by cluster id and
//!   applying permission and auth admission checks
//!
//! The `testing` feature exposes in-memory backends for downstream tests.

#![deny(missing_docs)]

pub mod adapter;
pub mod catalog;
pub mod error;
pub mod manager;
pub mod registry;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::{BroadcastOutcome, ClusterAdapter};
pub use catalog::{normalize_scope, ResourceCatalog, ResourceKind, Scope};
pub use error::StreamError;
pub use manager::{Change, Feed, FeedItem, SeriesKey, StreamConfig, StreamManager, Update};
pub use registry::{ClusterConfig, ClusterEntry, ClusterRegistry, ClusterSummary};
pub use source::{KubeWatchSource, WatchError, WatchEvent, WatchSource, WatchStream};
