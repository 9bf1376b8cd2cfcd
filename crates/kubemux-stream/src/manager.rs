//! Per-cluster stream manager
//!
//! A *series* is one (kind, scope) on one cluster. Each series has:
//!
//! - one watch task, started by the first subscriber and stopped once the
//!   last subscriber has been gone for `idle_linger`
//! - a revision counter that only ever grows, even across watch restarts and
//!   after the series is dropped from memory (its watermark is kept)
//! - a count-bounded backlog of recent updates used to satisfy resume
//! - the current object set, used to hand new subscribers a snapshot
//! - a bounded broadcast channel fanning updates out to feeds
//!
//! Every write to a series (apply, attach, stop) happens under the series
//! lock, and the broadcast send happens inside it too. A subscriber that
//! reads the backlog and subscribes to the channel under the same lock can
//! therefore never see a gap or a duplicate.
//!
//! While the cluster's auth state is not `Valid` the watch is paused; it is
//! restarted (with a fresh snapshot revision) once auth recovers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use kubemux_auth::{AuthSnapshot, AuthState, AuthStateManager};
use kubemux_common::metrics::{record_watch_restart, RestartReason};
use kubemux_common::{RetryConfig, Revision};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{ResourceKind, Scope};
use crate::error::StreamError;
use crate::source::{WatchError, WatchEvent, WatchSource};

/// Stream manager settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Updates retained per series for resume
    pub backlog_capacity: usize,
    /// Per-series broadcast capacity; a feed this far behind is lagged
    pub channel_capacity: usize,
    /// How long a watch keeps running after its last subscriber leaves
    pub idle_linger: Duration,
    /// Restart policy for failed watches; rejected credentials count against
    /// the same budget
    pub watch_retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 256,
            channel_capacity: 128,
            idle_linger: Duration::from_secs(30),
            watch_retry: RetryConfig::with_max_attempts(5),
        }
    }
}

/// Identity of a series within one manager
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    /// Canonical kind name
    pub kind: String,
    /// Canonical scope
    pub scope: Scope,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.scope)
    }
}

/// Payload of one revision
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "kebab-case")]
pub enum Change {
    /// Complete object set
    Snapshot {
        /// Every object in the series
        objects: Vec<Value>,
    },
    /// Object created
    Added {
        /// The new object
        object: Value,
    },
    /// Object changed
    Modified {
        /// The object after the change
        object: Value,
    },
    /// Object removed
    Deleted {
        /// Last known state of the object
        object: Value,
    },
}

/// One revisioned change of a series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    /// Series revision
    pub revision: Revision,
    /// What changed
    #[serde(flatten)]
    pub change: Change,
}

#[derive(Debug, Clone)]
enum Broadcast {
    Update(Arc<Update>),
    Closed(StreamError),
}

/// What a feed yields
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// Next update, strictly newer than anything yielded before
    Update(Arc<Update>),
    /// The feed fell this many updates behind and was cut off
    Lagged(u64),
    /// The series was closed; no further items follow
    Closed(StreamError),
}

struct Series {
    key: SeriesKey,
    kind: ResourceKind,
    tx: broadcast::Sender<Broadcast>,
    state: Mutex<SeriesState>,
}

#[derive(Default)]
struct SeriesState {
    revision: Revision,
    backlog: VecDeque<Arc<Update>>,
    objects: BTreeMap<String, Value>,
    /// At least one event applied since the current watch started
    primed: bool,
    subscribers: usize,
    watch: Option<CancellationToken>,
    linger: Option<CancellationToken>,
    /// Dropped from the series table; attach to a fresh series instead
    retired: bool,
}

impl SeriesState {
    fn clear_live_state(&mut self) {
        self.backlog.clear();
        self.objects.clear();
        self.primed = false;
    }

    fn snapshot(&self) -> Arc<Update> {
        Arc::new(Update {
            revision: self.revision,
            change: Change::Snapshot {
                objects: self.objects.values().cloned().collect(),
            },
        })
    }
}

impl Series {
    /// Stamp `event` with the next revision and fan it out
    ///
    /// Returns false when `token` was cancelled, i.e. this watch was replaced.
    fn apply(&self, event: WatchEvent, token: &CancellationToken, backlog_capacity: usize) -> bool {
        let mut state = self.state.lock();
        if token.is_cancelled() {
            return false;
        }

        let change = match event {
            WatchEvent::Restarted(objects) => {
                state.objects = objects.iter().map(|o| (object_key(o), o.clone())).collect();
                Change::Snapshot { objects }
            }
            WatchEvent::Applied(object) => {
                match state.objects.insert(object_key(&object), object.clone()) {
                    Some(_) => Change::Modified { object },
                    None => Change::Added { object },
                }
            }
            WatchEvent::Deleted(object) => {
                state.objects.remove(&object_key(&object));
                Change::Deleted { object }
            }
        };

        state.revision += 1;
        state.primed = true;
        let update = Arc::new(Update {
            revision: state.revision,
            change,
        });
        state.backlog.push_back(update.clone());
        while state.backlog.len() > backlog_capacity {
            state.backlog.pop_front();
        }
        let _ = self.tx.send(Broadcast::Update(update));
        true
    }
}

/// Identity of an object within a series: uid, else namespace/name
fn object_key(object: &Value) -> String {
    let metadata = &object["metadata"];
    if let Some(uid) = metadata["uid"].as_str() {
        return uid.to_string();
    }
    let name = metadata["name"].as_str().unwrap_or_default();
    match metadata["namespace"].as_str() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// A subscriber's view of one series
///
/// Dropping the feed releases its reference on the series.
pub struct Feed {
    key: SeriesKey,
    epoch: String,
    revision: Revision,
    degraded: bool,
    last: Revision,
    replay: VecDeque<Arc<Update>>,
    rx: broadcast::Receiver<Broadcast>,
    done: bool,
    _lease: Lease,
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .field("revision", &self.revision)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl Feed {
    /// Series this feed follows
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Epoch of the manager that issued the feed
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Series revision when the feed was attached
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Whether the cluster was recovering auth when the feed was attached
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Highest revision yielded so far
    pub fn last_delivered(&self) -> Revision {
        self.last
    }

    /// Wait for the next item; `None` once the feed is finished
    pub async fn recv(&mut self) -> Option<FeedItem> {
        if self.done {
            return None;
        }
        if let Some(update) = self.replay.pop_front() {
            self.last = update.revision;
            return Some(FeedItem::Update(update));
        }

        loop {
            match self.rx.recv().await {
                Ok(Broadcast::Update(update)) => {
                    if update.revision <= self.last {
                        continue;
                    }
                    self.last = update.revision;
                    return Some(FeedItem::Update(update));
                }
                Ok(Broadcast::Closed(err)) => {
                    self.done = true;
                    return Some(FeedItem::Closed(err));
                }
                Err(RecvError::Lagged(missed)) => {
                    self.done = true;
                    return Some(FeedItem::Lagged(missed));
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

struct Lease {
    manager: Weak<ManagerInner>,
    series: Arc<Series>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.series);
        }
    }
}

/// Owns every live watch of one cluster
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cluster_id: String,
    epoch: String,
    config: StreamConfig,
    source: Arc<dyn WatchSource>,
    auth: AuthStateManager,
    series: Mutex<SeriesTable>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct SeriesTable {
    live: HashMap<SeriesKey, Arc<Series>>,
    /// Last revision of each series dropped from `live`
    watermarks: HashMap<SeriesKey, Revision>,
}

impl StreamManager {
    /// Create a manager with a fresh epoch and no series
    pub fn new(
        cluster_id: impl Into<String>,
        source: Arc<dyn WatchSource>,
        auth: AuthStateManager,
        config: StreamConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cluster_id: cluster_id.into(),
                epoch: Uuid::new_v4().to_string(),
                config,
                source,
                auth,
                series: Mutex::new(SeriesTable::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Cluster this manager serves
    pub fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    /// Random id distinguishing this manager from earlier ones for the cluster
    pub fn epoch(&self) -> &str {
        &self.inner.epoch
    }

    /// The cluster's auth state manager
    pub fn auth(&self) -> &AuthStateManager {
        &self.inner.auth
    }

    /// Attach a subscriber at the current revision
    ///
    /// When the series already has state, the feed starts with a snapshot
    /// stamped with the current revision.
    pub fn subscribe(&self, kind: &ResourceKind, scope: &Scope) -> Result<Feed, StreamError> {
        let degraded = self.inner.admit()?;
        let (series, replay, rx, revision) = loop {
            let series = self.inner.series_for(kind, scope);
            let mut state = series.state.lock();
            if state.retired {
                continue;
            }
            let replay = if state.primed && state.watch.is_some() {
                VecDeque::from([state.snapshot()])
            } else {
                VecDeque::new()
            };
            let rx = self.inner.attach(&series, &mut state);
            let revision = state.revision;
            drop(state);
            break (series, replay, rx, revision);
        };

        debug!(cluster = %self.inner.cluster_id, series = %series.key, revision, "Subscriber attached");
        Ok(self.inner.feed(series, revision, revision, degraded, replay, rx))
    }

    /// Attach a subscriber that continues after `from`
    ///
    /// Fails with `ResumeUnavailable` when `epoch` names another manager, when
    /// `from` is ahead of the series, or when updates after `from` have left
    /// the backlog. Resuming at the current revision replays nothing.
    pub fn resume(
        &self,
        kind: &ResourceKind,
        scope: &Scope,
        from: Revision,
        epoch: &str,
    ) -> Result<Feed, StreamError> {
        let degraded = self.inner.admit()?;
        let unavailable = || StreamError::ResumeUnavailable {
            cluster: self.inner.cluster_id.clone(),
            kind: kind.name.clone(),
            scope: scope.to_string(),
            from,
        };

        if epoch != self.inner.epoch {
            debug!(cluster = %self.inner.cluster_id, from, "Resume rejected, epoch mismatch");
            return Err(unavailable());
        }

        let key = SeriesKey {
            kind: kind.name.clone(),
            scope: scope.clone(),
        };
        let series = self
            .inner
            .series
            .lock()
            .live
            .get(&key)
            .cloned()
            .ok_or_else(unavailable)?;

        let mut state = series.state.lock();
        let retained = state.watch.is_some()
            && from <= state.revision
            && (from == state.revision
                || state
                    .backlog
                    .front()
                    .is_some_and(|oldest| oldest.revision <= from + 1));
        if !retained {
            debug!(
                cluster = %self.inner.cluster_id,
                series = %series.key,
                from,
                current = state.revision,
                "Resume rejected, revision not retained"
            );
            return Err(unavailable());
        }

        let replay: VecDeque<Arc<Update>> = state
            .backlog
            .iter()
            .filter(|update| update.revision > from)
            .cloned()
            .collect();
        let rx = self.inner.attach(&series, &mut state);
        let revision = state.revision;
        drop(state);

        debug!(
            cluster = %self.inner.cluster_id,
            series = %series.key,
            from,
            replayed = replay.len(),
            "Subscriber resumed"
        );
        Ok(self.inner.feed(series, revision, from, degraded, replay, rx))
    }

    /// Current revision of a series, if it was ever started
    pub fn current_revision(&self, kind: &str, scope: &Scope) -> Option<Revision> {
        let key = SeriesKey {
            kind: kind.to_string(),
            scope: scope.clone(),
        };
        let series = {
            let table = self.inner.series.lock();
            match table.live.get(&key) {
                Some(series) => series.clone(),
                None => return table.watermarks.get(&key).copied(),
            }
        };
        let revision = series.state.lock().revision;
        Some(revision)
    }

    /// Number of series held in memory
    pub fn series_count(&self) -> usize {
        self.inner.series.lock().live.len()
    }

    /// Number of series with a running watch
    pub fn active_watches(&self) -> usize {
        let series: Vec<Arc<Series>> = self.inner.series.lock().live.values().cloned().collect();
        series
            .iter()
            .filter(|series| series.state.lock().watch.is_some())
            .count()
    }

    /// Stop every watch and close every feed with `ClusterRemoved`
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let series: Vec<Arc<Series>> = self.inner.series.lock().live.values().cloned().collect();
        for series in series {
            let mut state = series.state.lock();
            state.watch = None;
            if let Some(linger) = state.linger.take() {
                linger.cancel();
            }
            state.clear_live_state();
            let _ = series
                .tx
                .send(Broadcast::Closed(StreamError::ClusterRemoved(self.inner.cluster_id.clone())));
        }
        info!(cluster = %self.inner.cluster_id, "Stream manager shut down");
    }
}

impl ManagerInner {
    /// Admission by auth state; returns whether the feed starts degraded
    fn admit(&self) -> Result<bool, StreamError> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::ClusterRemoved(self.cluster_id.clone()));
        }
        let snapshot = self.auth.snapshot();
        match snapshot.state {
            AuthState::Valid => Ok(false),
            AuthState::Recovering => Ok(true),
            AuthState::Invalid => Err(StreamError::ClusterUnavailable {
                cluster: self.cluster_id.clone(),
                reason: snapshot.reason,
            }),
        }
    }

    fn series_for(&self, kind: &ResourceKind, scope: &Scope) -> Arc<Series> {
        let key = SeriesKey {
            kind: kind.name.clone(),
            scope: scope.clone(),
        };
        let mut table = self.series.lock();
        if let Some(series) = table.live.get(&key) {
            return series.clone();
        }

        let revision = table.watermarks.remove(&key).unwrap_or_default();
        let (tx, _) = broadcast::channel(self.config.channel_capacity.max(1));
        let series = Arc::new(Series {
            key: key.clone(),
            kind: kind.clone(),
            tx,
            state: Mutex::new(SeriesState {
                revision,
                ..SeriesState::default()
            }),
        });
        table.live.insert(key, series.clone());
        series
    }

    /// Drop a stopped series nobody follows, keeping its revision
    ///
    /// Caller holds the series lock.
    fn retire(&self, series: &Series, state: &mut SeriesState) {
        if state.retired || state.subscribers > 0 || state.watch.is_some() {
            return;
        }
        state.retired = true;
        let mut table = self.series.lock();
        if table
            .live
            .get(&series.key)
            .is_some_and(|live| std::ptr::eq(live.as_ref(), series))
        {
            table.live.remove(&series.key);
            table.watermarks.insert(series.key.clone(), state.revision);
            debug!(cluster = %self.cluster_id, series = %series.key, revision = state.revision, "Series dropped");
        }
    }

    fn feed(
        self: &Arc<Self>,
        series: Arc<Series>,
        revision: Revision,
        last: Revision,
        degraded: bool,
        replay: VecDeque<Arc<Update>>,
        rx: broadcast::Receiver<Broadcast>,
    ) -> Feed {
        Feed {
            key: series.key.clone(),
            epoch: self.epoch.clone(),
            revision,
            degraded,
            last,
            replay,
            rx,
            done: false,
            _lease: Lease {
                manager: Arc::downgrade(self),
                series,
            },
        }
    }

    /// Caller holds the series lock
    fn attach(
        self: &Arc<Self>,
        series: &Arc<Series>,
        state: &mut SeriesState,
    ) -> broadcast::Receiver<Broadcast> {
        state.subscribers += 1;
        if let Some(linger) = state.linger.take() {
            linger.cancel();
        }
        if state.watch.is_none() {
            let token = self.shutdown.child_token();
            state.watch = Some(token.clone());
            state.primed = false;
            tokio::spawn(run_series(self.clone(), series.clone(), token));
        }
        series.tx.subscribe()
    }

    fn release(self: &Arc<Self>, series: &Arc<Series>) {
        let mut state = series.state.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers > 0 {
            return;
        }
        if state.watch.is_none() {
            self.retire(series, &mut state);
            return;
        }

        let linger = self.config.idle_linger;
        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(runtime) if !linger.is_zero() => {
                let token = CancellationToken::new();
                state.linger = Some(token.clone());
                let manager = self.clone();
                let series = series.clone();
                runtime.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(linger) => manager.stop_idle(&series, &token),
                    }
                });
            }
            _ => {
                drop(state);
                self.stop_idle(series, &CancellationToken::new());
            }
        }
    }

    fn stop_idle(&self, series: &Series, linger: &CancellationToken) {
        let mut state = series.state.lock();
        if linger.is_cancelled() || state.subscribers > 0 {
            return;
        }
        state.linger = None;
        if let Some(watch) = state.watch.take() {
            watch.cancel();
            debug!(cluster = %self.cluster_id, series = %series.key, revision = state.revision, "Idle watch stopped");
        }
        state.clear_live_state();
        self.retire(series, &mut state);
    }

    /// Close a series whose watch failed for good
    fn fail(&self, series: &Series, token: &CancellationToken, attempts: u32, error: &WatchError) {
        let mut state = series.state.lock();
        if token.is_cancelled() {
            return;
        }
        state.watch = None;
        if let Some(linger) = state.linger.take() {
            linger.cancel();
        }
        state.clear_live_state();
        let err = StreamError::WatchFailed {
            cluster: self.cluster_id.clone(),
            kind: series.key.kind.clone(),
            scope: series.key.scope.to_string(),
            attempts,
            message: error.to_string(),
        };
        warn!(cluster = %self.cluster_id, series = %series.key, error = %err, "Closing series");
        let _ = series.tx.send(Broadcast::Closed(err));
        self.retire(series, &mut state);
    }
}

enum WatchOutcome {
    Suspended,
    Failed(WatchError),
    Ended,
}

async fn wait_until_valid(
    auth: &mut watch::Receiver<AuthSnapshot>,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        valid = auth.wait_for(|snapshot| snapshot.state == AuthState::Valid) => valid.is_ok(),
    }
}

async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Watch loop of one series; exits when `token` is cancelled or retries run out
async fn run_series(manager: Arc<ManagerInner>, series: Arc<Series>, token: CancellationToken) {
    let cluster = manager.cluster_id.clone();
    let retry = manager.config.watch_retry.clone();
    let mut auth = manager.auth.subscribe();
    let mut failures = 0u32;

    loop {
        if !wait_until_valid(&mut auth, &token).await {
            return;
        }

        debug!(cluster = %cluster, series = %series.key, "Starting watch");
        let mut stream = manager.source.watch(&series.kind, &series.key.scope);

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = auth.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if auth.borrow_and_update().state != AuthState::Valid {
                        break WatchOutcome::Suspended;
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        failures = 0;
                        if !series.apply(event, &token, manager.config.backlog_capacity) {
                            return;
                        }
                    }
                    Some(Err(e)) => break WatchOutcome::Failed(e),
                    None => break WatchOutcome::Ended,
                },
            }
        };
        drop(stream);

        let delay = match outcome {
            WatchOutcome::Suspended => {
                info!(cluster = %cluster, series = %series.key, "Auth not valid, pausing watch");
                record_watch_restart(&cluster, RestartReason::Auth);
                continue;
            }
            WatchOutcome::Failed(e) => {
                failures += 1;
                let rejected = e.is_auth_failure();
                let reason = if rejected {
                    RestartReason::Auth
                } else {
                    RestartReason::Error
                };
                record_watch_restart(&cluster, reason);
                if retry.is_exhausted(failures) {
                    manager.fail(&series, &token, failures, &e);
                    return;
                }
                if rejected {
                    warn!(cluster = %cluster, series = %series.key, error = %e, "Watch rejected, reporting auth failure");
                    manager.auth.report_failure(e.to_string());
                }
                let delay = retry.delay_for_attempt(failures);
                warn!(
                    cluster = %cluster,
                    series = %series.key,
                    attempt = failures,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Watch failed, restarting"
                );
                delay
            }
            WatchOutcome::Ended => {
                debug!(cluster = %cluster, series = %series.key, "Watch stream ended, restarting");
                record_watch_restart(&cluster, RestartReason::Ended);
                retry.delay_for_attempt(1)
            }
        };

        if !sleep_or_cancel(delay, &token).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceCatalog;
    use crate::testing::{FailingSource, HealthyRecovery, ScriptedSource};
    use async_trait::async_trait;
    use kubemux_auth::{AuthRecoveryConfig, ProbeError, RecoveryProbe};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SwitchProbe(AtomicBool);

    #[async_trait]
    impl RecoveryProbe for SwitchProbe {
        async fn probe(&self) -> Result<(), ProbeError> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProbeError::Rejected("401".into()))
            }
        }
    }

    fn pod(name: &str, phase: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "default"},
            "status": {"phase": phase},
        })
    }

    fn pods() -> ResourceKind {
        ResourceCatalog::builtin().lookup("pods").unwrap().clone()
    }

    fn default_ns() -> Scope {
        Scope::Namespace("default".into())
    }

    fn setup(config: StreamConfig) -> (StreamManager, Arc<ScriptedSource>, Arc<SwitchProbe>) {
        let source = Arc::new(ScriptedSource::default());
        let probe = Arc::new(SwitchProbe(AtomicBool::new(false)));
        let auth = AuthStateManager::new("c1", probe.clone(), AuthRecoveryConfig::default());
        let manager = StreamManager::new("c1", source.clone(), auth, config);
        (manager, source, probe)
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            backlog_capacity: 4,
            channel_capacity: 16,
            idle_linger: Duration::from_secs(30),
            watch_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
                jitter: false,
            },
        }
    }

    async fn next_update(feed: &mut Feed) -> Arc<Update> {
        match feed.recv().await {
            Some(FeedItem::Update(update)) => update,
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_object_key_prefers_uid() {
        let with_uid = json!({"metadata": {"uid": "abc", "name": "p", "namespace": "ns"}});
        assert_eq!(object_key(&with_uid), "abc");
        assert_eq!(object_key(&pod("web", "Running")), "default/web");
        assert_eq!(object_key(&json!({"metadata": {"name": "node-1"}})), "node-1");
    }

    #[test]
    fn test_update_serializes_flat() {
        let update = Update {
            revision: 7,
            change: Change::Added {
                object: json!({"metadata": {"name": "p"}}),
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["revision"], 7);
        assert_eq!(json["change"], "added");
        assert_eq!(json["object"]["metadata"]["name"], "p");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_share_one_watch_with_increasing_revisions() {
        let (manager, source, _) = setup(fast_config());
        let mut a = manager.subscribe(&pods(), &default_ns()).unwrap();
        let mut b = manager.subscribe(&pods(), &default_ns()).unwrap();
        assert_eq!(a.revision(), 0);

        let tx = source.watch_number(1).await;
        tx.send(Ok(WatchEvent::Applied(pod("web", "Pending")))).await.unwrap();
        tx.send(Ok(WatchEvent::Applied(pod("web", "Running")))).await.unwrap();
        tx.send(Ok(WatchEvent::Deleted(pod("web", "Running")))).await.unwrap();

        for feed in [&mut a, &mut b] {
            let revisions: Vec<Revision> = vec![
                next_update(feed).await.revision,
                next_update(feed).await.revision,
                next_update(feed).await.revision,
            ];
            assert_eq!(revisions, vec![1, 2, 3]);
        }
        assert_eq!(source.started(), 1);
        assert_eq!(manager.active_watches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_applied_distinguishes_added_and_modified() {
        let (manager, source, _) = setup(fast_config());
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;

        tx.send(Ok(WatchEvent::Applied(pod("web", "Pending")))).await.unwrap();
        tx.send(Ok(WatchEvent::Applied(pod("web", "Running")))).await.unwrap();

        assert!(matches!(next_update(&mut feed).await.change, Change::Added { .. }));
        assert!(matches!(next_update(&mut feed).await.change, Change::Modified { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_starts_with_snapshot() {
        let (manager, source, _) = setup(fast_config());
        let mut first = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        tx.send(Ok(WatchEvent::Restarted(vec![pod("a", "Running")]))).await.unwrap();
        tx.send(Ok(WatchEvent::Applied(pod("b", "Pending")))).await.unwrap();
        next_update(&mut first).await;
        next_update(&mut first).await;

        let mut late = manager.subscribe(&pods(), &default_ns()).unwrap();
        assert_eq!(late.revision(), 2);
        let snapshot = next_update(&mut late).await;
        assert_eq!(snapshot.revision, 2);
        match &snapshot.change {
            Change::Snapshot { objects } => assert_eq!(objects.len(), 2),
            other => panic!("expected snapshot, got {other:?}"),
        }

        tx.send(Ok(WatchEvent::Deleted(pod("a", "Running")))).await.unwrap();
        assert_eq!(next_update(&mut late).await.revision, 3);
        assert_eq!(next_update(&mut first).await.revision, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_replays_only_newer_revisions() {
        let (manager, source, _) = setup(fast_config());
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        for name in ["a", "b", "c"] {
            tx.send(Ok(WatchEvent::Applied(pod(name, "Running")))).await.unwrap();
        }
        for _ in 0..3 {
            next_update(&mut feed).await;
        }

        let mut resumed = manager
            .resume(&pods(), &default_ns(), 1, manager.epoch())
            .unwrap();
        assert_eq!(next_update(&mut resumed).await.revision, 2);
        assert_eq!(next_update(&mut resumed).await.revision, 3);

        tx.send(Ok(WatchEvent::Applied(pod("d", "Running")))).await.unwrap();
        assert_eq!(next_update(&mut resumed).await.revision, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_at_current_revision_replays_nothing() {
        let (manager, source, _) = setup(fast_config());
        let _feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        tx.send(Ok(WatchEvent::Applied(pod("a", "Running")))).await.unwrap();
        while manager.current_revision("pods", &default_ns()) != Some(1) {
            tokio::task::yield_now().await;
        }

        let mut resumed = manager.resume(&pods(), &default_ns(), 1, manager.epoch()).unwrap();
        tx.send(Ok(WatchEvent::Applied(pod("b", "Running")))).await.unwrap();
        assert_eq!(next_update(&mut resumed).await.revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_older_than_backlog_is_unavailable() {
        let (manager, source, _) = setup(fast_config());
        let _feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        for i in 0..6 {
            tx.send(Ok(WatchEvent::Applied(pod(&format!("p{i}"), "Running"))))
                .await
                .unwrap();
        }
        while manager.current_revision("pods", &default_ns()) != Some(6) {
            tokio::task::yield_now().await;
        }

        // Backlog holds revisions 3..=6
        let err = manager.resume(&pods(), &default_ns(), 1, manager.epoch()).unwrap_err();
        assert!(matches!(err, StreamError::ResumeUnavailable { from: 1, .. }));
        assert!(manager.resume(&pods(), &default_ns(), 2, manager.epoch()).is_ok());
        assert!(manager.resume(&pods(), &default_ns(), 9, manager.epoch()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_with_foreign_epoch_is_unavailable() {
        let (manager, _source, _) = setup(fast_config());
        let _feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let err = manager
            .resume(&pods(), &default_ns(), 0, "some-other-manager")
            .unwrap_err();
        assert!(matches!(err, StreamError::ResumeUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn story_idle_watch_lingers_then_stops_keeping_watermark() {
        let (manager, source, _) = setup(fast_config());

        // A subscriber sees two revisions, then disconnects
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        tx.send(Ok(WatchEvent::Restarted(vec![]))).await.unwrap();
        tx.send(Ok(WatchEvent::Applied(pod("a", "Running")))).await.unwrap();
        next_update(&mut feed).await;
        next_update(&mut feed).await;
        drop(feed);

        // Within the linger window the watch keeps running and resume works
        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(Ok(WatchEvent::Applied(pod("b", "Running")))).await.unwrap();
        let mut resumed = manager.resume(&pods(), &default_ns(), 2, manager.epoch()).unwrap();
        assert_eq!(next_update(&mut resumed).await.revision, 3);
        drop(resumed);

        // After the linger window the watch stops and the series is dropped,
        // keeping only its revision
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.active_watches(), 0);
        assert_eq!(manager.series_count(), 0);
        assert_eq!(manager.current_revision("pods", &default_ns()), Some(3));
        assert!(tx.is_closed());
        assert!(manager.resume(&pods(), &default_ns(), 3, manager.epoch()).is_err());

        // A new subscriber restarts the watch and revisions keep counting up
        let mut again = manager.subscribe(&pods(), &default_ns()).unwrap();
        assert_eq!(again.revision(), 3);
        let tx = source.watch_number(2).await;
        tx.send(Ok(WatchEvent::Restarted(vec![pod("a", "Running")]))).await.unwrap();
        assert_eq!(next_update(&mut again).await.revision, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_reported_and_watch_resumes_after_recovery() {
        let (manager, source, probe) = setup(fast_config());
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;

        tx.send(Err(WatchError::Unauthorized("401".into()))).await.unwrap();
        let mut auth = manager.auth().subscribe();
        auth.wait_for(|s| s.state == AuthState::Recovering).await.unwrap();

        probe.0.store(true, Ordering::SeqCst);
        auth.wait_for(|s| s.state == AuthState::Valid).await.unwrap();

        let tx = source.watch_number(2).await;
        tx.send(Ok(WatchEvent::Restarted(vec![pod("a", "Running")]))).await.unwrap();
        assert_eq!(next_update(&mut feed).await.revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_watch_errors_close_series() {
        let (manager, source, _) = setup(fast_config());
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();

        for n in 1..=3 {
            let tx = source.watch_number(n).await;
            tx.send(Err(WatchError::Failed("connection reset".into()))).await.unwrap();
        }

        match feed.recv().await {
            Some(FeedItem::Closed(StreamError::WatchFailed { attempts, .. })) => assert_eq!(attempts, 3),
            other => panic!("expected watch failure, got {other:?}"),
        }
        assert!(feed.recv().await.is_none());
        assert_eq!(manager.auth().state(), AuthState::Valid);
        assert_eq!(manager.active_watches(), 0);

        // The closed series is dropped once its last feed goes away
        assert_eq!(manager.series_count(), 1);
        drop(feed);
        assert_eq!(manager.series_count(), 0);
        assert_eq!(manager.current_revision("pods", &default_ns()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_watch_closes_series_after_retry_budget() {
        let source = Arc::new(FailingSource::new(WatchError::Unauthorized("403".into())));
        let auth = AuthStateManager::new("c1", Arc::new(HealthyRecovery), AuthRecoveryConfig::default());
        let manager = StreamManager::new("c1", source.clone(), auth, fast_config());
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(60), feed.recv())
            .await
            .expect("series never closed");
        match closed {
            Some(FeedItem::Closed(StreamError::WatchFailed { attempts, message, .. })) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("403"));
            }
            other => panic!("expected watch failure, got {other:?}"),
        }
        assert_eq!(source.started(), 3);
        assert_eq!(manager.active_watches(), 0);

        // Nothing restarts the watch afterwards
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.started(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_after_series_dropped_keeps_counting() {
        let config = StreamConfig {
            idle_linger: Duration::ZERO,
            ..fast_config()
        };
        let (manager, source, _) = setup(config);
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        tx.send(Ok(WatchEvent::Applied(pod("a", "Running")))).await.unwrap();
        assert_eq!(next_update(&mut feed).await.revision, 1);
        drop(feed);
        assert_eq!(manager.series_count(), 0);

        let mut again = manager.subscribe(&pods(), &default_ns()).unwrap();
        assert_eq!(again.revision(), 1);
        assert_eq!(manager.series_count(), 1);
        let tx = source.watch_number(2).await;
        tx.send(Ok(WatchEvent::Restarted(vec![]))).await.unwrap();
        assert_eq!(next_update(&mut again).await.revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_requires_matching_epoch() {
        let (manager, source, _) = setup(fast_config());
        let _feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;
        tx.send(Ok(WatchEvent::Applied(pod("a", "Running")))).await.unwrap();
        while manager.current_revision("pods", &default_ns()) != Some(1) {
            tokio::task::yield_now().await;
        }

        for epoch in ["", "some-other-manager"] {
            let err = manager.resume(&pods(), &default_ns(), 0, epoch).unwrap_err();
            assert!(matches!(err, StreamError::ResumeUnavailable { from: 0, .. }));
        }
        assert!(manager.resume(&pods(), &default_ns(), 0, manager.epoch()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_follows_auth_state() {
        let (manager, _source, _) = setup(fast_config());

        manager.auth().report_failure("expired");
        let feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        assert!(feed.degraded());

        let mut auth = manager.auth().subscribe();
        auth.wait_for(|s| s.state == AuthState::Invalid).await.unwrap();
        let err = manager.subscribe(&pods(), &default_ns()).unwrap_err();
        assert!(matches!(err, StreamError::ClusterUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_feed_is_lagged() {
        let config = StreamConfig {
            channel_capacity: 2,
            ..fast_config()
        };
        let (manager, source, _) = setup(config);
        let mut slow = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;

        for i in 0..5 {
            tx.send(Ok(WatchEvent::Applied(pod(&format!("p{i}"), "Running"))))
                .await
                .unwrap();
        }
        while manager.current_revision("pods", &default_ns()) != Some(5) {
            tokio::task::yield_now().await;
        }

        assert!(matches!(slow.recv().await, Some(FeedItem::Lagged(_))));
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_feeds_and_rejects_new_subscribers() {
        let (manager, source, _) = setup(fast_config());
        let mut feed = manager.subscribe(&pods(), &default_ns()).unwrap();
        let tx = source.watch_number(1).await;

        manager.shutdown();
        assert!(matches!(
            feed.recv().await,
            Some(FeedItem::Closed(StreamError::ClusterRemoved(_)))
        ));
        assert!(matches!(
            manager.subscribe(&pods(), &default_ns()),
            Err(StreamError::ClusterRemoved(_))
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tx.is_closed());
    }
}
