//! In-memory backends for tests
//!
//! Enabled for this crate's unit tests and, through the `testing` feature,
//! for downstream crates and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kubemux_auth::{AccessReviewer, ProbeError, RecoveryProbe, ReviewError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::catalog::{ResourceKind, Scope};
use crate::registry::{ClusterConfig, ClusterEntry};
use crate::source::{WatchError, WatchEvent, WatchSource, WatchStream};

/// Sending half of one scripted watch
pub type Script = mpsc::Sender<Result<WatchEvent, WatchError>>;

/// Source whose watches never produce events
pub struct IdleSource;

impl WatchSource for IdleSource {
    fn watch(&self, _: &ResourceKind, _: &Scope) -> WatchStream {
        futures::stream::pending().boxed()
    }
}

/// Source whose watches are fed by the test, one channel per started watch
#[derive(Default)]
pub struct ScriptedSource {
    watches: Mutex<Vec<Script>>,
}

impl ScriptedSource {
    /// Watches started so far
    pub fn started(&self) -> usize {
        self.watches.lock().len()
    }

    /// Wait until at least `count` watches were started
    pub async fn wait_for_watches(&self, count: usize) {
        while self.started() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Script of the `n`-th watch (1-based), once it has started
    pub async fn watch_number(&self, n: usize) -> Script {
        self.wait_for_watches(n).await;
        self.watches.lock()[n - 1].clone()
    }

    /// Feed `event` to the most recent watch
    pub async fn send(&self, event: Result<WatchEvent, WatchError>) {
        self.wait_for_watches(1).await;
        let script = self.watches.lock().last().cloned();
        if let Some(script) = script {
            script.send(event).await.expect("watch stream dropped");
        }
    }

    /// Feed a successful event to the most recent watch
    pub async fn emit(&self, event: WatchEvent) {
        self.send(Ok(event)).await;
    }
}

impl WatchSource for ScriptedSource {
    fn watch(&self, _: &ResourceKind, _: &Scope) -> WatchStream {
        let (tx, rx) = mpsc::channel(64);
        self.watches.lock().push(tx);
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}

/// Source whose every watch fails straight away with the same error
pub struct FailingSource {
    error: WatchError,
    started: AtomicUsize,
}

impl FailingSource {
    /// Fail every watch with `error`
    pub fn new(error: WatchError) -> Self {
        Self {
            error,
            started: AtomicUsize::new(0),
        }
    }

    /// Watches started so far
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl WatchSource for FailingSource {
    fn watch(&self, _: &ResourceKind, _: &Scope) -> WatchStream {
        self.started.fetch_add(1, Ordering::SeqCst);
        let error = self.error.clone();
        futures::stream::once(async move { Err(error) })
            .chain(futures::stream::pending())
            .boxed()
    }
}

/// Reviewer that allows everything except the listed resources
#[derive(Default)]
pub struct DenyList(pub Vec<&'static str>);

impl DenyList {
    /// Reviewer that allows everything
    pub fn allow_all() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessReviewer for DenyList {
    async fn review(&self, _: &str, resource: &str, _: &str) -> Result<bool, ReviewError> {
        Ok(!self.0.iter().any(|denied| *denied == resource))
    }
}

/// Reviewer that always fails with the same error
pub struct FailingReviewer(pub ReviewError);

#[async_trait]
impl AccessReviewer for FailingReviewer {
    async fn review(&self, _: &str, _: &str, _: &str) -> Result<bool, ReviewError> {
        Err(self.0.clone())
    }
}

/// Reviewer that holds reviews of one resource until released and allows
/// everything
pub struct GatedReviewer {
    resource: &'static str,
    open: watch::Sender<bool>,
}

impl GatedReviewer {
    /// Hold reviews of `resource`
    pub fn new(resource: &'static str) -> Self {
        Self {
            resource,
            open: watch::channel(false).0,
        }
    }

    /// Let held and future reviews complete
    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl AccessReviewer for GatedReviewer {
    async fn review(&self, _: &str, resource: &str, _: &str) -> Result<bool, ReviewError> {
        if resource == self.resource {
            let mut open = self.open.subscribe();
            // The sender lives as long as the reviewer.
            let _ = open.wait_for(|open| *open).await;
        }
        Ok(true)
    }
}

/// Recovery check that always reports healthy credentials
pub struct HealthyRecovery;

#[async_trait]
impl RecoveryProbe for HealthyRecovery {
    async fn probe(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// Entry with an idle source, `deny` refused by RBAC, and default settings
pub fn idle_entry(id: &str, deny: Vec<&'static str>) -> ClusterEntry {
    ClusterEntry::new(
        id,
        format!("{id} (display)"),
        Arc::new(IdleSource),
        Arc::new(DenyList(deny)),
        Arc::new(HealthyRecovery),
        ClusterConfig::default(),
    )
}

/// Entry fed by `source`, allowing everything
pub fn scripted_entry(
    id: &str,
    display_name: impl Into<String>,
    source: Arc<ScriptedSource>,
    deny: Vec<&'static str>,
    config: ClusterConfig,
) -> ClusterEntry {
    ClusterEntry::new(
        id,
        display_name,
        source,
        Arc::new(DenyList(deny)),
        Arc::new(HealthyRecovery),
        config,
    )
}
