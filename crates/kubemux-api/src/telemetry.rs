//! Subscription telemetry
//!
//! The handler reports every subscription lifecycle event through an injected
//! [`StreamRecorder`]. [`MetricsRecorder`] feeds the OpenTelemetry
//! instruments; [`NoopRecorder`] drops everything. Cluster labels use display
//! names resolved through [`DisplayNames`].

use dashmap::DashMap;
use kubemux_common::metrics::{record_stream_event, StreamEventKind, SUBSCRIPTIONS_ACTIVE};
use kubemux_common::ErrorCode;
use kubemux_stream::ClusterRegistry;
use opentelemetry::KeyValue;
use tracing::debug;

/// One subscription lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTelemetryEvent {
    /// What happened
    pub kind: StreamEventKind,
    /// Connection the subscription belongs to
    pub connection_id: String,
    /// Cluster id
    pub cluster_id: String,
    /// Cluster display name
    pub cluster_name: String,
    /// Resource kind
    pub resource: String,
    /// Scope
    pub scope: String,
    /// Subscription, once one was assigned
    pub subscription_id: Option<String>,
    /// Error code for `Error` and `Reset` events
    pub code: Option<ErrorCode>,
}

/// Sink for subscription lifecycle events
#[cfg_attr(test, mockall::automock)]
pub trait StreamRecorder: Send + Sync {
    /// Record one event
    fn record(&self, event: &StreamTelemetryEvent);
}

/// Records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl StreamRecorder for NoopRecorder {
    fn record(&self, _: &StreamTelemetryEvent) {}
}

/// Records events into the global OpenTelemetry meter
///
/// `Subscribe` and `Unsubscribe` also move the per-cluster active gauge.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    active: DashMap<String, i64>,
}

impl MetricsRecorder {
    /// Create a recorder with every gauge at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current active subscription count for a cluster display name
    pub fn active(&self, cluster_name: &str) -> i64 {
        self.active.get(cluster_name).map(|v| *v).unwrap_or(0)
    }

    fn adjust(&self, cluster_name: &str, delta: i64) {
        let mut count = self.active.entry(cluster_name.to_string()).or_insert(0);
        *count = (*count + delta).max(0);
        SUBSCRIPTIONS_ACTIVE.record(*count, &[KeyValue::new("cluster", cluster_name.to_string())]);
    }
}

impl StreamRecorder for MetricsRecorder {
    fn record(&self, event: &StreamTelemetryEvent) {
        debug!(
            event = event.kind.as_str(),
            connection = %event.connection_id,
            cluster = %event.cluster_name,
            resource = %event.resource,
            scope = %event.scope,
            subscription = event.subscription_id.as_deref().unwrap_or(""),
            code = event.code.map(|c| c.as_str()).unwrap_or(""),
            "Stream event"
        );
        record_stream_event(event.kind, &event.cluster_name);
        match event.kind {
            StreamEventKind::Subscribe => self.adjust(&event.cluster_name, 1),
            StreamEventKind::Unsubscribe => self.adjust(&event.cluster_name, -1),
            StreamEventKind::Reset | StreamEventKind::Error => {}
        }
    }
}

/// Resolves cluster ids to display names for telemetry labels
pub trait DisplayNames: Send + Sync {
    /// Display name for `cluster`, or the id when unknown
    fn display_name(&self, cluster: &str) -> String;
}

impl DisplayNames for ClusterRegistry {
    fn display_name(&self, cluster: &str) -> String {
        ClusterRegistry::display_name(self, cluster)
    }
}
