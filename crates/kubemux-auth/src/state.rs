//! Per-cluster authentication state machine
//!
//! ```text
//!            report_failure              probe ok
//!   Valid ─────────────────► Recovering ─────────► Valid
//!     ▲                        │    ▲
//!     │ report_success         │    │ trigger_retry
//!     │                        ▼    │
//!     └──────────────────── Invalid ┘
//!                     (attempts exhausted)
//! ```
//!
//! All transitions happen under one lock, so they are totally ordered per
//! cluster. The recovery loop is a spawned task owning a cancellation token;
//! starting a new loop always cancels the previous one first, and a cancelled
//! loop re-checks its token under the lock before every write, so it never
//! touches state after being replaced.
//!
//! Readers get snapshots through a `watch` channel. Progress ticks and
//! transitions are also published on a broadcast channel for UI push.

use std::sync::Arc;
use std::time::Duration;

use kubemux_common::metrics::record_auth_transition;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe::RecoveryProbe;

/// Reason recorded when every recovery attempt failed
pub const RECOVERY_EXHAUSTED_REASON: &str =
    "authentication recovery failed: credentials still rejected after all retry attempts";

const EVENT_CHANNEL_CAPACITY: usize = 128;
const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Authentication state of one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    /// Credentials work; streams deliver normally
    Valid,
    /// Credentials failed; the recovery loop is running
    Recovering,
    /// Recovery gave up (or is disabled); waiting for a manual retry
    Invalid,
}

impl AuthState {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Recovering => "recovering",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery loop progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryProgress {
    /// 1-based attempt currently waiting or probing
    pub current_attempt: u32,
    /// Attempts in this cycle
    pub max_attempts: u32,
    /// Whole seconds until the probe runs (0 while probing)
    pub seconds_until_retry: u64,
}

/// Point-in-time view of a cluster's auth state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSnapshot {
    /// Current state
    pub state: AuthState,
    /// Failure reason; empty when `Valid`
    pub reason: String,
    /// Loop progress while `Recovering`
    pub progress: Option<RecoveryProgress>,
}

impl AuthSnapshot {
    fn valid() -> Self {
        Self {
            state: AuthState::Valid,
            reason: String::new(),
            progress: None,
        }
    }
}

/// Published on every transition and every progress tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// The state (or reason) changed
    StateChanged(AuthSnapshot),
    /// The recovery loop advanced
    Progress(RecoveryProgress),
}

/// Recovery loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecoveryConfig {
    /// Run the loop on failure; when false failures go straight to `Invalid`
    pub enabled: bool,
    /// Probes per cycle
    pub max_attempts: u32,
    /// Wait before attempt `i` is `backoff[min(i, len-1)]`
    pub backoff: Vec<Duration>,
}

impl Default for AuthRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 4,
            backoff: vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ],
        }
    }
}

impl AuthRecoveryConfig {
    /// Wait before the 0-based attempt `index`
    pub fn backoff_for_attempt(&self, index: u32) -> Duration {
        match self.backoff.len() {
            0 => Duration::ZERO,
            len => self.backoff[(index as usize).min(len - 1)],
        }
    }
}

struct RecoveryTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    recovery: Option<RecoveryTask>,
    closed: bool,
}

struct Inner {
    cluster_id: String,
    config: AuthRecoveryConfig,
    probe: Arc<dyn RecoveryProbe>,
    control: Mutex<Control>,
    snapshot: watch::Sender<AuthSnapshot>,
    events: broadcast::Sender<AuthEvent>,
}

impl Inner {
    fn current(&self) -> AuthSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Caller holds `control`
    fn transition(&self, next: AuthSnapshot) {
        let previous = self.snapshot.send_replace(next.clone());
        if previous.state != next.state {
            info!(
                cluster = %self.cluster_id,
                from = %previous.state,
                to = %next.state,
                reason = %next.reason,
                "Auth state changed"
            );
            record_auth_transition(&self.cluster_id, next.state.as_str());
        }
        let _ = self.events.send(AuthEvent::StateChanged(next));
    }

    /// Publish a tick unless `token` was cancelled; returns false when cancelled
    fn publish_progress(&self, token: &CancellationToken, progress: RecoveryProgress) -> bool {
        let _control = self.control.lock();
        if token.is_cancelled() {
            return false;
        }
        self.snapshot.send_modify(|snapshot| snapshot.progress = Some(progress));
        let _ = self.events.send(AuthEvent::Progress(progress));
        true
    }

    /// Apply the loop's final transition unless cancelled or superseded
    fn finish(&self, token: &CancellationToken, next: AuthSnapshot) {
        let mut control = self.control.lock();
        if token.is_cancelled() || self.current().state != AuthState::Recovering {
            return;
        }
        control.recovery = None;
        self.transition(next);
    }
}

/// Auth state machine and recovery loop owner for one cluster
#[derive(Clone)]
pub struct AuthStateManager {
    inner: Arc<Inner>,
}

impl AuthStateManager {
    /// Create a manager in the `Valid` state
    pub fn new(
        cluster_id: impl Into<String>,
        probe: Arc<dyn RecoveryProbe>,
        config: AuthRecoveryConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(AuthSnapshot::valid());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                cluster_id: cluster_id.into(),
                config,
                probe,
                control: Mutex::new(Control::default()),
                snapshot,
                events,
            }),
        }
    }

    /// Cluster this manager belongs to
    pub fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    /// Current state, reason, and progress
    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.current()
    }

    /// Current state only
    pub fn state(&self) -> AuthState {
        self.inner.snapshot.borrow().state
    }

    /// Receiver that always holds the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Receiver for transitions and progress ticks
    pub fn events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Record an authentication failure observed by a caller
    ///
    /// Only acts in `Valid`; repeated reports while recovering are ignored.
    /// Must be called from within a Tokio runtime.
    pub fn report_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut control = self.inner.control.lock();
        if control.closed {
            return;
        }
        if self.inner.current().state != AuthState::Valid {
            debug!(cluster = %self.inner.cluster_id, reason = %reason, "Ignoring auth failure report, not valid");
            return;
        }

        if self.inner.config.enabled {
            self.inner.transition(AuthSnapshot {
                state: AuthState::Recovering,
                reason,
                progress: None,
            });
            self.start_recovery(&mut control);
        } else {
            self.inner.transition(AuthSnapshot {
                state: AuthState::Invalid,
                reason,
                progress: None,
            });
        }
    }

    /// Record that the cluster works again; cancels any running recovery
    pub fn report_success(&self) {
        let mut control = self.inner.control.lock();
        Self::cancel_recovery(&mut control);
        if self.inner.current().state != AuthState::Valid {
            self.inner.transition(AuthSnapshot::valid());
        }
    }

    /// Restart recovery from attempt 1
    ///
    /// No-op when `Valid`. Must be called from within a Tokio runtime.
    pub fn trigger_retry(&self) {
        let mut control = self.inner.control.lock();
        if control.closed {
            return;
        }
        let current = self.inner.current();
        if current.state == AuthState::Valid {
            return;
        }

        Self::cancel_recovery(&mut control);
        info!(cluster = %self.inner.cluster_id, "Manual auth retry requested");
        self.inner.transition(AuthSnapshot {
            state: AuthState::Recovering,
            reason: current.reason,
            progress: None,
        });
        self.start_recovery(&mut control);
    }

    /// Whether a recovery loop is currently running
    pub fn is_recovering(&self) -> bool {
        self.inner
            .control
            .lock()
            .recovery
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stop the recovery loop and wait for it to exit
    ///
    /// After shutdown, failure reports and retries are ignored.
    pub async fn shutdown(&self) {
        let task = {
            let mut control = self.inner.control.lock();
            control.closed = true;
            control.recovery.take()
        };
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    fn cancel_recovery(control: &mut Control) {
        if let Some(task) = control.recovery.take() {
            task.cancel.cancel();
        }
    }

    fn start_recovery(&self, control: &mut Control) {
        Self::cancel_recovery(control);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_recovery(self.inner.clone(), cancel.clone()));
        control.recovery = Some(RecoveryTask { cancel, handle });
    }
}

async fn run_recovery(inner: Arc<Inner>, token: CancellationToken) {
    let max_attempts = inner.config.max_attempts.max(1);

    for index in 0..max_attempts {
        let attempt = index + 1;
        let deadline = Instant::now() + inner.config.backoff_for_attempt(index);

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let progress = RecoveryProgress {
                current_attempt: attempt,
                max_attempts,
                seconds_until_retry: left.as_secs() + u64::from(left.subsec_nanos() > 0),
            };
            if !inner.publish_progress(&token, progress) {
                return;
            }
            if left.is_zero() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(left.min(PROGRESS_TICK)) => {}
            }
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            outcome = inner.probe.probe() => outcome,
        };

        match outcome {
            Ok(()) => {
                info!(cluster = %inner.cluster_id, attempt, "Auth recovery succeeded");
                inner.finish(&token, AuthSnapshot::valid());
                return;
            }
            Err(e) => {
                warn!(
                    cluster = %inner.cluster_id,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Auth recovery attempt failed"
                );
            }
        }
    }

    inner.finish(
        &token,
        AuthSnapshot {
            state: AuthState::Invalid,
            reason: RECOVERY_EXHAUSTED_REASON.to_string(),
            progress: None,
        },
    );
}
