//! Stream multiplexer
//!
//! One [`StreamHandler::serve`] call owns one client connection. It parses
//! control frames, keeps the connection's subscriptions, and relays every
//! feed back over the single transport.
//!
//! Tasks per connection:
//! - the control loop (the `serve` future itself)
//! - one writer draining a bounded queue into the transport
//! - one short-lived task per subscribe or resume, resolving permissions and
//!   handing the result back to the control loop
//! - one forwarder per subscription, feed to queue
//! - one auth-state pusher per subscribed cluster
//!
//! Every task hangs off the connection's cancellation token, so closing the
//! connection releases every feed it holds. A failing subscription reports
//! an error on its own id and never touches its siblings.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use kubemux_auth::{AuthEvent, AuthState, AuthStateManager};
use kubemux_common::metrics::StreamEventKind;
use kubemux_common::{ClusterId, ErrorCode, Revision};
use kubemux_stream::{ClusterAdapter, Feed, FeedItem, StreamError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::telemetry::{DisplayNames, NoopRecorder, StreamRecorder, StreamTelemetryEvent};

/// Multiplexer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Accept `subscribe` without a cluster and fan it out to every cluster
    pub allow_cluster_scoped_requests: bool,
    /// Answer unsatisfiable resumes and lagging feeds with `reset`; when
    /// false the handler resubscribes silently instead
    pub send_reset: bool,
    /// Outbound messages queued per connection before senders wait
    pub outbound_queue_capacity: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            allow_cluster_scoped_requests: false,
            send_reset: true,
            outbound_queue_capacity: 256,
        }
    }
}

/// Serves stream connections against a cluster adapter
pub struct StreamHandler {
    adapter: Arc<ClusterAdapter>,
    config: HandlerConfig,
    recorder: Arc<dyn StreamRecorder>,
    names: Arc<dyn DisplayNames>,
}

impl StreamHandler {
    /// Create a handler; telemetry is dropped and labels use the registry's
    /// display names until overridden
    pub fn new(adapter: Arc<ClusterAdapter>, config: HandlerConfig) -> Self {
        let names: Arc<dyn DisplayNames> = adapter.registry().clone();
        Self {
            adapter,
            config,
            recorder: Arc::new(NoopRecorder),
            names,
        }
    }

    /// Report lifecycle events to `recorder`
    pub fn with_recorder(mut self, recorder: Arc<dyn StreamRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Resolve telemetry cluster labels through `names`
    pub fn with_display_names(mut self, names: Arc<dyn DisplayNames>) -> Self {
        self.names = names;
        self
    }

    /// Handler settings
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Adapter requests are routed through
    pub fn adapter(&self) -> &Arc<ClusterAdapter> {
        &self.adapter
    }

    /// Serve one connection until `inbound` ends or `outbound` fails
    ///
    /// Subscribe and resume requests are resolved concurrently, so their
    /// replies may arrive in any order; each reply echoes its request id.
    pub async fn serve<I, O>(self: &Arc<Self>, mut inbound: I, outbound: O)
    where
        I: Stream<Item = String> + Send + Unpin,
        O: Sink<String> + Send + Unpin + 'static,
        O::Error: fmt::Display,
    {
        let capacity = self.config.outbound_queue_capacity.max(1);
        let id = Uuid::new_v4().to_string();
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (ended_tx, mut ended_rx) = mpsc::channel(capacity);
        let (admissions_tx, mut admissions_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(write_loop(id.clone(), out_rx, outbound, cancel.clone()));
        info!(connection = %id, "Stream connection opened");

        let mut conn = Connection {
            id: id.clone(),
            handler: self.clone(),
            out: out_tx,
            ended: ended_tx,
            admissions: admissions_tx,
            cancel: cancel.clone(),
            subscriptions: HashMap::new(),
            auth_watches: HashMap::new(),
        };

        loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(text) => conn.handle_frame(&text).await,
                    None => break,
                },
                Some(admission) = admissions_rx.recv() => conn.admit(admission).await,
                Some(subscription_id) = ended_rx.recv() => conn.finish(&subscription_id),
                _ = cancel.cancelled() => break,
            }
        }

        let subscriptions = conn.close();
        drop(conn);
        if writer.await.is_err() {
            warn!(connection = %id, "Stream writer task panicked");
        }
        info!(connection = %id, subscriptions, "Stream connection closed");
    }

    fn record(
        &self,
        kind: StreamEventKind,
        connection: &str,
        target: &Target,
        subscription_id: Option<&str>,
        code: Option<ErrorCode>,
    ) {
        self.recorder.record(&StreamTelemetryEvent {
            kind,
            connection_id: connection.to_string(),
            cluster_id: target.cluster.clone(),
            cluster_name: self.names.display_name(&target.cluster),
            resource: target.kind.clone(),
            scope: target.scope.clone(),
            subscription_id: subscription_id.map(str::to_string),
            code,
        });
    }
}

/// What a subscription follows, in canonical form
#[derive(Debug, Clone)]
struct Target {
    cluster: ClusterId,
    kind: String,
    scope: String,
}

/// A resolved subscribe or resume, applied by the control loop
enum Admission {
    Open {
        request_id: Option<String>,
        cluster: ClusterId,
        feed: Feed,
        resumed: bool,
    },
    Reject {
        request_id: Option<String>,
        cluster: Option<ClusterId>,
        kind: String,
        scope: String,
        error: StreamError,
    },
    Reset {
        request_id: Option<String>,
        target: Target,
        from: Revision,
    },
}

struct ActiveSubscription {
    target: Target,
    cancel: CancellationToken,
}

struct AuthWatch {
    epoch: String,
    cancel: CancellationToken,
}

struct Connection {
    id: String,
    handler: Arc<StreamHandler>,
    out: mpsc::Sender<ServerMessage>,
    ended: mpsc::Sender<String>,
    admissions: mpsc::Sender<Admission>,
    cancel: CancellationToken,
    subscriptions: HashMap<String, ActiveSubscription>,
    auth_watches: HashMap<ClusterId, AuthWatch>,
}

impl Connection {
    async fn handle_frame(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection = %self.id, error = %err, "Rejected control frame");
                self.send(ServerMessage::Error {
                    request_id: None,
                    subscription_id: None,
                    cluster: None,
                    code: err.code(),
                    message: err.to_string(),
                })
                .await;
                return;
            }
        };

        let handler = self.handler.clone();
        match message {
            ClientMessage::Subscribe {
                request_id,
                cluster: Some(cluster),
                kind,
                scope,
            } => self.resolve(async move {
                vec![subscribe(&handler, request_id, cluster, &kind, &scope).await]
            }),
            ClientMessage::Subscribe {
                request_id,
                cluster: None,
                kind,
                scope,
            } => {
                if !self.handler.config.allow_cluster_scoped_requests {
                    self.send(ServerMessage::Error {
                        request_id,
                        subscription_id: None,
                        cluster: None,
                        code: ErrorCode::InvalidRequest,
                        message: "subscribe requires a cluster".to_string(),
                    })
                    .await;
                    return;
                }
                let connection = self.id.clone();
                self.resolve(async move {
                    broadcast(&handler, &connection, request_id, kind, scope).await
                });
            }
            ClientMessage::Resume {
                request_id,
                cluster,
                kind,
                scope,
                from_revision,
                epoch,
            } => {
                let connection = self.id.clone();
                self.resolve(async move {
                    let request = ResumeRequest {
                        request_id,
                        cluster,
                        kind,
                        scope,
                        from: from_revision,
                        epoch,
                    };
                    vec![resume(&handler, &connection, request).await]
                });
            }
            ClientMessage::Unsubscribe { subscription_id } => self.unsubscribe(subscription_id).await,
            ClientMessage::RetryAuth { cluster } => self.retry_auth(cluster).await,
        }
    }

    /// Resolve a request off the control loop and queue its admissions
    fn resolve<F>(&self, work: F)
    where
        F: Future<Output = Vec<Admission>> + Send + 'static,
    {
        let admissions = self.admissions.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let resolved = tokio::select! {
                _ = cancel.cancelled() => return,
                resolved = work => resolved,
            };
            for admission in resolved {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = admissions.send(admission) => if sent.is_err() { return },
                }
            }
        });
    }

    async fn admit(&mut self, admission: Admission) {
        match admission {
            Admission::Open {
                request_id,
                cluster,
                feed,
                resumed,
            } => self.open(request_id, cluster, feed, resumed).await,
            Admission::Reject {
                request_id,
                cluster,
                kind,
                scope,
                error,
            } => self.reject(request_id, cluster, &kind, &scope, &error).await,
            Admission::Reset {
                request_id,
                target,
                from,
            } => self.reset(request_id, target, from).await,
        }
    }

    async fn unsubscribe(&mut self, subscription_id: String) {
        let Some(subscription) = self.subscriptions.remove(&subscription_id) else {
            self.send(ServerMessage::Error {
                request_id: None,
                subscription_id: Some(subscription_id.clone()),
                cluster: None,
                code: ErrorCode::InvalidRequest,
                message: format!("unknown subscription: {subscription_id}"),
            })
            .await;
            return;
        };

        subscription.cancel.cancel();
        self.handler.record(
            StreamEventKind::Unsubscribe,
            &self.id,
            &subscription.target,
            Some(&subscription_id),
            None,
        );
        debug!(connection = %self.id, subscription = %subscription_id, "Unsubscribed");
        self.send(ServerMessage::Unsubscribed { subscription_id }).await;
    }

    async fn retry_auth(&mut self, cluster: ClusterId) {
        let Some(entry) = self.handler.adapter.registry().get(&cluster) else {
            let err = StreamError::UnknownCluster(cluster.clone());
            self.send(ServerMessage::stream_error(None, None, Some(cluster), &err))
                .await;
            return;
        };
        info!(connection = %self.id, cluster = %cluster, "Auth retry requested");
        self.watch_auth(&cluster, entry.manager().epoch(), entry.auth().clone());
        entry.auth().trigger_retry();
    }

    async fn open(&mut self, request_id: Option<String>, cluster: ClusterId, feed: Feed, resumed: bool) {
        let subscription_id = Uuid::new_v4().to_string();
        let target = Target {
            cluster,
            kind: feed.key().kind.clone(),
            scope: feed.key().scope.to_string(),
        };

        // The acknowledgement must be queued before the forwarder can queue updates.
        self.send(ServerMessage::Subscribed {
            request_id,
            subscription_id: subscription_id.clone(),
            cluster: target.cluster.clone(),
            kind: target.kind.clone(),
            scope: target.scope.clone(),
            epoch: feed.epoch().to_string(),
            revision: feed.revision(),
            degraded: feed.degraded(),
            resumed,
        })
        .await;

        if let Some(entry) = self.handler.adapter.registry().get(&target.cluster) {
            self.watch_auth(&target.cluster, entry.manager().epoch(), entry.auth().clone());
        }

        let cancel = self.cancel.child_token();
        tokio::spawn(forward(
            self.handler.clone(),
            self.id.clone(),
            subscription_id.clone(),
            target.clone(),
            feed,
            self.out.clone(),
            self.ended.clone(),
            cancel.clone(),
        ));

        info!(connection = %self.id, subscription = %subscription_id, cluster = %target.cluster, kind = %target.kind, scope = %target.scope, resumed, "Subscribed");
        self.handler.record(
            StreamEventKind::Subscribe,
            &self.id,
            &target,
            Some(&subscription_id),
            None,
        );
        self.subscriptions
            .insert(subscription_id, ActiveSubscription { target, cancel });
    }

    async fn reject(
        &mut self,
        request_id: Option<String>,
        cluster: Option<ClusterId>,
        kind: &str,
        scope: &str,
        err: &StreamError,
    ) {
        debug!(connection = %self.id, cluster = cluster.as_deref().unwrap_or(""), kind, scope, error = %err, "Subscription rejected");
        let target = Target {
            cluster: cluster.clone().unwrap_or_default(),
            kind: kind.to_string(),
            scope: scope.to_string(),
        };
        self.handler
            .record(StreamEventKind::Error, &self.id, &target, None, Some(err.code()));
        self.send(ServerMessage::stream_error(request_id, None, cluster, err))
            .await;
    }

    async fn reset(&mut self, request_id: Option<String>, target: Target, from: Revision) {
        info!(connection = %self.id, cluster = %target.cluster, kind = %target.kind, scope = %target.scope, from, "Resume unavailable, sending reset");
        self.handler.record(
            StreamEventKind::Reset,
            &self.id,
            &target,
            None,
            Some(ErrorCode::ResumeUnavailable),
        );
        self.send(ServerMessage::Reset {
            request_id,
            subscription_id: None,
            reason: format!("revision {from} cannot be resumed"),
            cluster: target.cluster,
            kind: target.kind,
            scope: target.scope,
        })
        .await;
    }

    /// Push auth state for `cluster`, once per manager incarnation
    fn watch_auth(&mut self, cluster: &str, epoch: &str, auth: AuthStateManager) {
        if let Some(existing) = self.auth_watches.get(cluster) {
            if existing.epoch == epoch {
                return;
            }
            existing.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        tokio::spawn(push_auth_state(
            cluster.to_string(),
            auth,
            self.out.clone(),
            cancel.clone(),
        ));
        self.auth_watches.insert(
            cluster.to_string(),
            AuthWatch {
                epoch: epoch.to_string(),
                cancel,
            },
        );
    }

    /// A forwarder stopped on its own after reporting an error or reset
    fn finish(&mut self, subscription_id: &str) {
        if let Some(subscription) = self.subscriptions.remove(subscription_id) {
            self.handler.record(
                StreamEventKind::Unsubscribe,
                &self.id,
                &subscription.target,
                Some(subscription_id),
                None,
            );
        }
    }

    /// Cancel every task and release every feed; returns how many
    /// subscriptions were still open
    fn close(&mut self) -> usize {
        self.cancel.cancel();
        let open = self.subscriptions.len();
        for (subscription_id, subscription) in self.subscriptions.drain() {
            self.handler.record(
                StreamEventKind::Unsubscribe,
                &self.id,
                &subscription.target,
                Some(&subscription_id),
                None,
            );
        }
        self.auth_watches.clear();
        open
    }

    async fn send(&self, message: ServerMessage) {
        // A closed queue or a cancelled token means the writer is gone and
        // the control loop is about to stop.
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.out.send(message) => {}
        }
    }
}

async fn subscribe(
    handler: &StreamHandler,
    request_id: Option<String>,
    cluster: ClusterId,
    kind: &str,
    scope: &str,
) -> Admission {
    match handler.adapter.subscribe_cluster(&cluster, kind, scope).await {
        Ok(feed) => Admission::Open {
            request_id,
            cluster,
            feed,
            resumed: false,
        },
        Err(error) => Admission::Reject {
            request_id,
            cluster: Some(cluster),
            kind: kind.to_string(),
            scope: scope.to_string(),
            error,
        },
    }
}

async fn broadcast(
    handler: &StreamHandler,
    connection: &str,
    request_id: Option<String>,
    kind: String,
    scope: String,
) -> Vec<Admission> {
    let outcomes = match handler.adapter.subscribe_all(&kind, &scope).await {
        Ok(outcomes) => outcomes,
        Err(error) => {
            return vec![Admission::Reject {
                request_id,
                cluster: None,
                kind,
                scope,
                error,
            }]
        }
    };

    outcomes
        .into_iter()
        .filter_map(|outcome| match outcome.result {
            Ok(feed) => Some(Admission::Open {
                request_id: request_id.clone(),
                cluster: outcome.cluster,
                feed,
                resumed: false,
            }),
            Err(StreamError::PermissionDenied { .. }) => {
                debug!(connection, cluster = %outcome.cluster, kind = %kind, "Broadcast skipped cluster without list/watch");
                None
            }
            Err(error) => Some(Admission::Reject {
                request_id: request_id.clone(),
                cluster: Some(outcome.cluster),
                kind: kind.clone(),
                scope: scope.clone(),
                error,
            }),
        })
        .collect()
}

struct ResumeRequest {
    request_id: Option<String>,
    cluster: ClusterId,
    kind: String,
    scope: String,
    from: Revision,
    epoch: String,
}

async fn resume(handler: &StreamHandler, connection: &str, request: ResumeRequest) -> Admission {
    let ResumeRequest {
        request_id,
        cluster,
        kind,
        scope,
        from,
        epoch,
    } = request;

    let result = handler
        .adapter
        .resume_cluster(&cluster, &kind, &scope, from, &epoch)
        .await;

    match result {
        Ok(feed) => Admission::Open {
            request_id,
            cluster,
            feed,
            resumed: true,
        },
        Err(err @ StreamError::ResumeUnavailable { .. }) if !handler.config.send_reset => {
            debug!(connection, cluster = %cluster, error = %err, "Resume unavailable, resubscribing");
            subscribe(handler, request_id, cluster, &kind, &scope).await
        }
        Err(StreamError::ResumeUnavailable {
            cluster,
            kind,
            scope,
            from,
        }) => Admission::Reset {
            request_id,
            target: Target { cluster, kind, scope },
            from,
        },
        Err(error) => Admission::Reject {
            request_id,
            cluster: Some(cluster),
            kind,
            scope,
            error,
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    handler: Arc<StreamHandler>,
    connection: String,
    subscription_id: String,
    target: Target,
    mut feed: Feed,
    out: mpsc::Sender<ServerMessage>,
    ended: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = feed.recv() => item,
        };

        let message = match item {
            Some(FeedItem::Update(update)) => ServerMessage::Update {
                subscription_id: subscription_id.clone(),
                cluster: target.cluster.clone(),
                epoch: feed.epoch().to_string(),
                update,
            },
            Some(FeedItem::Lagged(missed)) if !handler.config.send_reset => {
                warn!(connection = %connection, subscription = %subscription_id, missed, "Subscriber lagged, resubscribing");
                match handler
                    .adapter
                    .subscribe_cluster(&target.cluster, &target.kind, &target.scope)
                    .await
                {
                    Ok(next) => {
                        feed = next;
                        continue;
                    }
                    Err(err) => {
                        handler.record(
                            StreamEventKind::Error,
                            &connection,
                            &target,
                            Some(&subscription_id),
                            Some(err.code()),
                        );
                        let message = ServerMessage::stream_error(
                            None,
                            Some(subscription_id.clone()),
                            Some(target.cluster.clone()),
                            &err,
                        );
                        send_then_end(message, &out, &ended, subscription_id, &cancel).await;
                        return;
                    }
                }
            }
            Some(FeedItem::Lagged(missed)) => {
                warn!(connection = %connection, subscription = %subscription_id, missed, "Subscriber lagged, sending reset");
                handler.record(
                    StreamEventKind::Reset,
                    &connection,
                    &target,
                    Some(&subscription_id),
                    None,
                );
                let message = ServerMessage::Reset {
                    request_id: None,
                    subscription_id: Some(subscription_id.clone()),
                    cluster: target.cluster.clone(),
                    kind: target.kind.clone(),
                    scope: target.scope.clone(),
                    reason: format!("subscriber fell {missed} updates behind"),
                };
                send_then_end(message, &out, &ended, subscription_id, &cancel).await;
                return;
            }
            Some(FeedItem::Closed(err)) => {
                info!(connection = %connection, subscription = %subscription_id, error = %err, "Feed closed");
                handler.record(
                    StreamEventKind::Error,
                    &connection,
                    &target,
                    Some(&subscription_id),
                    Some(err.code()),
                );
                let message = ServerMessage::stream_error(
                    None,
                    Some(subscription_id.clone()),
                    Some(target.cluster.clone()),
                    &err,
                );
                send_then_end(message, &out, &ended, subscription_id, &cancel).await;
                return;
            }
            None => {
                notify_ended(&ended, subscription_id, &cancel).await;
                return;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = out.send(message) => if sent.is_err() { return },
        }
    }
}

async fn send_then_end(
    message: ServerMessage,
    out: &mpsc::Sender<ServerMessage>,
    ended: &mpsc::Sender<String>,
    subscription_id: String,
    cancel: &CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        sent = out.send(message) => if sent.is_err() { return },
    }
    notify_ended(ended, subscription_id, cancel).await;
}

/// Tell the control loop a forwarder stopped, unless the connection is closing
async fn notify_ended(
    ended: &mpsc::Sender<String>,
    subscription_id: String,
    cancel: &CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = ended.send(subscription_id) => {}
    }
}

async fn push_auth_state(
    cluster: ClusterId,
    auth: AuthStateManager,
    out: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) {
    let mut events = auth.events();
    let mut last = auth.snapshot();
    if last.state != AuthState::Valid
        && out
            .send(ServerMessage::AuthState {
                cluster: cluster.clone(),
                snapshot: last.clone(),
            })
            .await
            .is_err()
    {
        return;
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let snapshot = match event {
            Ok(AuthEvent::StateChanged(snapshot)) => snapshot,
            Ok(AuthEvent::Progress(_)) | Err(RecvError::Lagged(_)) => auth.snapshot(),
            Err(RecvError::Closed) => return,
        };
        if snapshot == last {
            continue;
        }
        last = snapshot.clone();
        let message = ServerMessage::AuthState {
            cluster: cluster.clone(),
            snapshot,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = out.send(message) => if sent.is_err() { return },
        }
    }
}

async fn write_loop<O>(
    connection: String,
    mut queue: mpsc::Receiver<ServerMessage>,
    mut sink: O,
    failed: CancellationToken,
) where
    O: Sink<String> + Unpin,
    O::Error: fmt::Display,
{
    while let Some(message) = queue.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(connection = %connection, error = %err, "Dropping unencodable message");
                continue;
            }
        };
        if let Err(err) = sink.send(text).await {
            debug!(connection = %connection, error = %err, "Stream write failed");
            failed.cancel();
            return;
        }
    }
    let _ = sink.close().await;
}
