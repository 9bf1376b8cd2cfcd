//! Metrics registry for kubemux observability
//!
//! Provides OpenTelemetry metrics for:
//! - Stream subscriptions (active count, lifecycle events)
//! - Permission checks (by decision source)
//! - Auth state transitions
//! - Watch restarts
//!
//! Instruments come from the global meter; with no meter provider installed
//! every recording is a no-op.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Global meter for kubemux metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("kubemux"));

/// Gauge of active subscriptions
///
/// Labels:
/// - `cluster`: cluster display name
pub static SUBSCRIPTIONS_ACTIVE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("kubemux_subscriptions_active")
        .with_description("Number of active stream subscriptions")
        .with_unit("{subscriptions}")
        .build()
});

/// Counter of subscription lifecycle events
///
/// Labels:
/// - `event`: subscribe, unsubscribe, reset, error
/// - `cluster`: cluster display name
pub static STREAM_EVENTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubemux_stream_events_total")
        .with_description("Total number of stream subscription lifecycle events")
        .with_unit("{events}")
        .build()
});

/// Counter of permission checks
///
/// Labels:
/// - `source`: cache, fresh, fallback, error
/// - `decision`: allow, deny, none
pub static PERMISSION_CHECKS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubemux_permission_checks_total")
        .with_description("Total number of permission checks by decision source")
        .with_unit("{checks}")
        .build()
});

/// Counter of auth state transitions
///
/// Labels:
/// - `cluster`: cluster id
/// - `state`: valid, recovering, invalid
pub static AUTH_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubemux_auth_transitions_total")
        .with_description("Total number of cluster auth state transitions")
        .with_unit("{transitions}")
        .build()
});

/// Counter of watch restarts
///
/// Labels:
/// - `cluster`: cluster id
/// - `reason`: auth, error, ended
pub static WATCH_RESTARTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubemux_watch_restarts_total")
        .with_description("Total number of underlying watch restarts")
        .with_unit("{restarts}")
        .build()
});

/// Labels for subscription lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    /// A subscription was established (subscribe or resume)
    Subscribe,
    /// A subscription was removed
    Unsubscribe,
    /// A reset was issued to the client
    Reset,
    /// An error was reported to the client
    Error,
}

impl StreamEventKind {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Reset => "reset",
            Self::Error => "error",
        }
    }
}

/// Labels for watch restart reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Watch failed with an authentication/authorization signature
    Auth,
    /// Watch failed with any other error
    Error,
    /// Watch stream ended without an error
    Ended,
}

impl RestartReason {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Error => "error",
            Self::Ended => "ended",
        }
    }
}

/// Record a subscription lifecycle event
pub fn record_stream_event(event: StreamEventKind, cluster: &str) {
    STREAM_EVENTS.add(
        1,
        &[
            KeyValue::new("event", event.as_str()),
            KeyValue::new("cluster", cluster.to_string()),
        ],
    );
}

/// Record a permission check outcome
pub fn record_permission_check(source: &'static str, allowed: Option<bool>) {
    let decision = match allowed {
        Some(true) => "allow",
        Some(false) => "deny",
        None => "none",
    };
    PERMISSION_CHECKS.add(
        1,
        &[
            KeyValue::new("source", source),
            KeyValue::new("decision", decision),
        ],
    );
}

/// Record an auth state transition
pub fn record_auth_transition(cluster: &str, state: &'static str) {
    AUTH_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("state", state),
        ],
    );
}

/// Record a watch restart
pub fn record_watch_restart(cluster: &str, reason: RestartReason) {
    WATCH_RESTARTS.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("reason", reason.as_str()),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_labels() {
        assert_eq!(StreamEventKind::Subscribe.as_str(), "subscribe");
        assert_eq!(StreamEventKind::Unsubscribe.as_str(), "unsubscribe");
        assert_eq!(StreamEventKind::Reset.as_str(), "reset");
        assert_eq!(StreamEventKind::Error.as_str(), "error");
    }

    #[test]
    fn test_restart_reason_labels() {
        assert_eq!(RestartReason::Auth.as_str(), "auth");
        assert_eq!(RestartReason::Error.as_str(), "error");
        assert_eq!(RestartReason::Ended.as_str(), "ended");
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_stream_event(StreamEventKind::Subscribe, "c1");
        record_permission_check("cache", Some(true));
        record_auth_transition("c1", "recovering");
        record_watch_restart("c1", RestartReason::Ended);
        SUBSCRIPTIONS_ACTIVE.record(3, &[KeyValue::new("cluster", "c1")]);
    }
}
