//! The reconciliation engine: one `Session` per configured endpoint,
//! driving its subscriptions toward whatever the config says they
//! should be.
//!
//! Lock ordering is Registry -> Config -> Session; nothing in this
//! module ever acquires a `SessionRegistry` or config lock, so it
//! always sits at the bottom of that order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::egress::EgressQueue;
use crate::opcua::client::{KeepAliveEvent, OpcClient, OpcSession};
use crate::opcua::error::{OpcFault, ReconcileError};
use crate::opcua::identity::{NodeIdentity, NodeQuery};
use crate::opcua::monitored_item::{ItemState, MonitoredItem, NotificationContext};
use crate::opcua::namespace::NamespaceTable;
use crate::opcua::subscription::Subscription;

/// Shutdown is folded into the session's own state machine rather than
/// tracked as a side flag next to `Connected`/`Disconnected`, so a
/// mutator racing against an in-flight shutdown sees one source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
    Shutdown,
}

/// How many reconciliation ticks per minute to run absent a kick.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

pub struct SessionConfig {
    pub session_timeout_ms: u64,
    pub keep_alive_interval_sec: u64,
    pub keep_alive_disconnect_threshold: u32,
    pub backoff_max: u32,
    pub fetch_display_name: bool,
    pub application_uri: String,
    pub shopfloor_domain: Option<String>,
}

struct SessionInner {
    state: SessionState,
    /// Keyed by the requested publishing interval, rounded to whole
    /// milliseconds, so "one subscription per distinct publishing
    /// interval" is a structural property of the map instead of an
    /// invariant enforced by scanning a flat list.
    subscriptions: HashMap<u64, Subscription>,
    namespace_table: NamespaceTable,
    min_supported_sampling_interval_ms: f64,
    unsuccessful_connects: u32,
    missed_keep_alives: u32,
    opc_session: Option<Arc<dyn OpcSession>>,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            subscriptions: HashMap::new(),
            namespace_table: NamespaceTable::default(),
            min_supported_sampling_interval_ms: 50.0,
            unsuccessful_connects: 0,
            missed_keep_alives: 0,
            opc_session: None,
        }
    }
}

/// One OPC UA session toward one configured endpoint, plus the
/// subscriptions/items reconciliation keeps in sync with the config.
pub struct Session {
    pub endpoint_uri: String,
    session_timeout_ms: u64,
    keep_alive_interval_sec: u64,
    keep_alive_disconnect_threshold: u32,
    backoff_max: u32,
    fetch_display_name: bool,
    application_uri: String,
    shopfloor_domain: Option<String>,
    egress: Arc<dyn EgressQueue>,
    client: Arc<dyn OpcClient>,
    inner: Mutex<SessionInner>,
    cancellation: CancellationToken,
    kick_tx: mpsc::Sender<()>,
    dirty: AtomicBool,
}

/// A read-only view of what a session currently wants persisted,
/// consumed by the config writer (`config/file.rs`).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSnapshot {
    pub identity: NodeIdentity,
    pub sampling_interval_ms: f64,
}

pub struct SubscriptionSnapshot {
    pub publishing_interval_ms: f64,
    pub items: Vec<ItemSnapshot>,
}

pub struct SessionSnapshot {
    pub endpoint_uri: String,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

impl Session {
    /// Builds the session and spawns its private reconciliation loop.
    /// The returned `Arc` is what `SessionRegistry` keeps in its map.
    pub fn spawn(
        endpoint_uri: String,
        config: SessionConfig,
        client: Arc<dyn OpcClient>,
        egress: Arc<dyn EgressQueue>,
        cancellation: CancellationToken,
    ) -> Arc<Session> {
        let (kick_tx, kick_rx) = mpsc::channel(1);

        let session = Arc::new(Session {
            endpoint_uri,
            session_timeout_ms: config.session_timeout_ms,
            keep_alive_interval_sec: config.keep_alive_interval_sec,
            keep_alive_disconnect_threshold: config.keep_alive_disconnect_threshold,
            backoff_max: config.backoff_max,
            fetch_display_name: config.fetch_display_name,
            application_uri: config.application_uri,
            shopfloor_domain: config.shopfloor_domain,
            egress,
            client,
            inner: Mutex::new(SessionInner::default()),
            cancellation,
            kick_tx,
            dirty: AtomicBool::new(false),
        });

        let driver = session.clone();
        tokio::spawn(async move { driver.drive(kick_rx).await });

        session
    }

    /// Wakes the reconciliation loop ahead of its next scheduled tick.
    /// Non-blocking: a pending kick already in flight is enough, so a
    /// full channel is not an error.
    fn kick(&self) {
        let _ = self.kick_tx.try_send(());
    }

    async fn drive(self: Arc<Self>, mut kick_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                _ = interval.tick() => {},
                _ = kick_rx.recv() => {},
            }
            if self.cancellation.is_cancelled() {
                break;
            }
            self.reconcile().await;
        }
    }

    /// Driver operations, run in order each tick: connect, monitorNodes,
    /// stopMonitoringNodes, removeUnusedSubscriptions.
    /// `removeUnusedSessions` lives a level up, in `SessionRegistry`.
    pub async fn reconcile(&self) {
        if self.cancellation.is_cancelled() {
            return;
        }

        self.connect_phase().await;

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return;
        }
        self.monitor_nodes(&mut inner).await;
        if inner.state != SessionState::Connected {
            return;
        }
        self.stop_monitoring_nodes(&mut inner).await;
        if inner.state != SessionState::Connected {
            return;
        }
        self.remove_unused_subscriptions(&mut inner).await;
    }

    /// The blocking `connect()` call deliberately runs with the session
    /// mutex released, so a
    /// `shutdown()` or mutator racing in on another task is never
    /// blocked behind it; the lock is reacquired only to commit the
    /// outcome.
    async fn connect_phase(&self) {
        let (endpoint_uri, timeout, keep_alive_interval) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Disconnected {
                return;
            }
            inner.state = SessionState::Connecting;
            let backoff = (inner.unsuccessful_connects + 1).min(self.backoff_max);
            let timeout = Duration::from_millis(self.session_timeout_ms * backoff as u64);
            (
                self.endpoint_uri.clone(),
                timeout,
                Duration::from_secs(self.keep_alive_interval_sec),
            )
        };

        let result = self.client.connect(&endpoint_uri, timeout, keep_alive_interval).await;

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connecting {
            // A concurrent shutdown() moved the state while connect() was
            // in flight. Discard whatever we just connected.
            if let Ok(connected) = result {
                let session = connected.session;
                tokio::spawn(async move { session.close().await });
            }
            return;
        }

        match result {
            Ok(connected) => {
                inner.unsuccessful_connects = 0;
                inner.namespace_table = NamespaceTable::from_array(connected.session.namespace_array());
                inner.min_supported_sampling_interval_ms = connected.session.min_supported_sampling_interval_ms();
                inner.opc_session = Some(connected.session);
                inner.state = SessionState::Connected;
                tracing::info!(endpoint = %self.endpoint_uri, "session connected");
                self.spawn_keep_alive_listener(connected.keep_alive_events);
            }
            Err(e) => {
                inner.unsuccessful_connects += 1;
                inner.state = SessionState::Disconnected;
                tracing::warn!(
                    endpoint = %self.endpoint_uri,
                    error = ?e,
                    attempts = inner.unsuccessful_connects,
                    "connect failed, retrying with backoff"
                );
            }
        }
    }

    fn spawn_keep_alive_listener(self: &Arc<Self>, mut events: mpsc::Receiver<KeepAliveEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_keep_alive(event).await;
            }
        });
    }

    /// A run of missed keep-alives past the configured threshold forces
    /// a disconnect, so the next tick's connect phase can reconnect and
    /// rebuild state from scratch.
    async fn handle_keep_alive(&self, event: KeepAliveEvent) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return;
        }
        if event.good {
            inner.missed_keep_alives = 0;
            return;
        }
        inner.missed_keep_alives += 1;
        if inner.missed_keep_alives >= self.keep_alive_disconnect_threshold {
            tracing::warn!(
                endpoint = %self.endpoint_uri,
                missed = inner.missed_keep_alives,
                "keep-alive threshold exceeded, disconnecting"
            );
            self.internal_disconnect(&mut inner).await;
        }
    }

    /// Closes the live session (if any) and resets every previously
    /// `Monitored` item back to `Unmonitored` so the next successful
    /// connect re-creates subscriptions and items from scratch.
    async fn internal_disconnect(&self, inner: &mut SessionInner) {
        if let Some(session) = inner.opc_session.take() {
            session.close().await;
        }
        inner.state = SessionState::Disconnected;
        inner.missed_keep_alives = 0;
        for sub in inner.subscriptions.values_mut() {
            sub.server_handle = None;
            for item in sub.items.iter_mut() {
                if item.state == ItemState::Monitored {
                    item.state = ItemState::Unmonitored;
                    item.server_handle = None;
                }
            }
        }
    }

    /// For every subscription, make sure it's created, resolve any
    /// pending namespace updates, then add every `Unmonitored` item.
    async fn monitor_nodes(&self, inner: &mut SessionInner) {
        let Some(opc_session) = inner.opc_session.clone() else {
            return;
        };

        for sub in inner.subscriptions.values_mut() {
            if sub.server_handle.is_none() {
                if let Err(e) = sub.ensure_created(opc_session.as_ref()).await {
                    tracing::warn!(endpoint = %self.endpoint_uri, error = ?e, "failed to create subscription, retrying next tick");
                    continue;
                }
            }

            sub.resolve_namespace_updates(&inner.namespace_table);
        }

        for sub in inner.subscriptions.values_mut() {
            if sub.server_handle.is_none() {
                continue;
            }

            let mut i = 0;
            while i < sub.items.len() {
                if sub.items[i].state != ItemState::Unmonitored {
                    i += 1;
                    continue;
                }

                if self.fetch_display_name {
                    if let Some(node_id) = sub.items[i].effective_node_id() {
                        sub.items[i].display_name = opc_session
                            .read_display_name(&node_id)
                            .await
                            .unwrap_or_else(|_| sub.items[i].identity.to_string());
                    }
                } else if sub.items[i].display_name.is_empty() {
                    sub.items[i].display_name = sub.items[i].identity.to_string();
                }

                match sub.add_item(opc_session.as_ref(), i).await {
                    Ok(()) => {
                        self.dirty.store(true, Ordering::Relaxed);
                        i += 1;
                    }
                    Err(OpcFault::BadSessionIdInvalid) => {
                        self.internal_disconnect(inner).await;
                        return;
                    }
                    Err(fault) => {
                        sub.apply_node_fault(i, &fault);
                        i += 1;
                    }
                }
            }
        }
    }

    /// Batch-remove every item tagged `RemovalRequested` in every
    /// subscription.
    async fn stop_monitoring_nodes(&self, inner: &mut SessionInner) {
        let Some(opc_session) = inner.opc_session.clone() else {
            return;
        };

        let mut any_removed = false;
        for sub in inner.subscriptions.values_mut() {
            if sub.remove_tagged_items(opc_session.as_ref()).await {
                any_removed = true;
            }
        }
        if any_removed {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Garbage-collect subscriptions that lost their last item.
    async fn remove_unused_subscriptions(&self, inner: &mut SessionInner) {
        let opc_session = inner.opc_session.clone();
        let empty: Vec<u64> = inner
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.is_empty())
            .map(|(key, _)| *key)
            .collect();

        for key in empty {
            if let Some(mut sub) = inner.subscriptions.remove(&key) {
                if let Some(session) = &opc_session {
                    sub.teardown(session.as_ref()).await;
                }
            }
        }
    }

    /// Adds a node to be monitored at the given intervals, creating its
    /// subscription bucket if needed. Idempotent: a node already
    /// monitored under an equivalent identity is a no-op.
    pub async fn add_node_for_monitoring(
        &self,
        identity: NodeIdentity,
        publishing_interval_ms: f64,
        sampling_interval_ms: f64,
    ) -> Result<(), ReconcileError> {
        if self.cancellation.is_cancelled() {
            return Err(ReconcileError::ShuttingDown);
        }

        let mut inner = self.inner.lock().await;
        if matches!(inner.state, SessionState::ShuttingDown | SessionState::Shutdown) {
            return Err(ReconcileError::SessionShutDown);
        }

        let namespace_table = inner.namespace_table.clone();
        let query = NodeQuery::from_identity(&identity);
        let already_monitored = inner
            .subscriptions
            .values()
            .any(|sub| sub.items.iter().any(|item| item.is_monitoring_this_node(&query, &namespace_table)));
        if already_monitored {
            return Ok(());
        }

        let key = publishing_interval_ms.round().max(0.0) as u64;
        let endpoint_uri = self.endpoint_uri.clone();
        let sub = inner.subscriptions.entry(key).or_insert_with(|| {
            Subscription::new(publishing_interval_ms, self.egress.clone(), self.notification_context())
        });

        let mut item = MonitoredItem::new(identity, endpoint_uri, sampling_interval_ms);
        if let NodeIdentity::NodeId { .. } = &item.identity {
            // The caller supplied a bare NodeId, not an ExpandedNodeId:
            // resolve it against this session's namespace table before
            // trying to monitor it, so the same config entry works
            // across servers that assign that URI a different index.
            item.state = ItemState::UnmonitoredNamespaceUpdateRequested;
        }
        sub.items.push(item);

        drop(inner);
        self.dirty.store(true, Ordering::Relaxed);
        self.kick();
        Ok(())
    }

    /// Tags every item matching `identity` across all subscriptions for
    /// removal on the next tick.
    pub async fn request_monitor_item_removal(&self, identity: NodeIdentity) -> Result<(), ReconcileError> {
        if self.cancellation.is_cancelled() {
            return Err(ReconcileError::ShuttingDown);
        }

        let mut inner = self.inner.lock().await;
        if matches!(inner.state, SessionState::ShuttingDown | SessionState::Shutdown) {
            return Err(ReconcileError::SessionShutDown);
        }

        let namespace_table = inner.namespace_table.clone();
        let query = NodeQuery::from_identity(&identity);
        let mut matched = false;
        for sub in inner.subscriptions.values_mut() {
            for item in sub.items.iter_mut() {
                if item.is_monitoring_this_node(&query, &namespace_table) {
                    item.state = ItemState::RemovalRequested;
                    matched = true;
                }
            }
        }

        drop(inner);
        if matched {
            self.kick();
        }
        Ok(())
    }

    /// Tags every monitored item whose identity doesn't match any entry
    /// in `wanted` for removal. Used by `SessionRegistry::reconcile_all`
    /// after re-reading the config file, both to drop nodes dropped
    /// from an endpoint's entry and, with an empty `wanted`, to drain
    /// an endpoint removed from the config entirely ahead of
    /// `removeUnusedSessions`.
    pub async fn prune_nodes_not_in(&self, wanted: &[NodeIdentity]) {
        let mut inner = self.inner.lock().await;
        let namespace_table = inner.namespace_table.clone();
        let queries: Vec<NodeQuery> = wanted.iter().map(NodeQuery::from_identity).collect();
        let mut matched = false;
        for sub in inner.subscriptions.values_mut() {
            for item in sub.items.iter_mut() {
                if item.state == ItemState::RemovalRequested {
                    continue;
                }
                let keep = queries.iter().any(|q| item.is_monitoring_this_node(q, &namespace_table));
                if !keep {
                    item.state = ItemState::RemovalRequested;
                    matched = true;
                }
            }
        }
        drop(inner);
        if matched {
            self.kick();
        }
    }

    /// Whether this session currently monitors the given node, used by
    /// `SessionRegistry::is_node_published` to answer the cross-session
    /// question.
    pub async fn is_node_published(&self, identity: &NodeIdentity) -> bool {
        let inner = self.inner.lock().await;
        let query = NodeQuery::from_identity(identity);
        inner
            .subscriptions
            .values()
            .any(|sub| sub.items.iter().any(|item| item.is_monitoring_this_node(&query, &inner.namespace_table)))
    }

    pub async fn has_no_subscriptions(&self) -> bool {
        self.inner.lock().await.subscriptions.is_empty()
    }

    /// Resolves a namespace index to its URI through the session's own
    /// namespace table. Takes the session mutex properly rather than
    /// racing a synchronous read against the connect phase populating it.
    pub async fn namespace_uri(&self, index: u16) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.namespace_table.uri_at(index).map(str::to_string)
    }

    /// Resolves a namespace URI to its index through the session's own
    /// namespace table, case-insensitively.
    pub async fn namespace_index(&self, uri: &str) -> Option<u16> {
        let inner = self.inner.lock().await;
        inner.namespace_table.index_of(uri)
    }

    /// Operator-facing reset: folds every `PermanentlyFailed` item back
    /// to `Unmonitored` across all subscriptions, so the next tick
    /// retries them. Used to recover after an operator fixes a
    /// misconfigured node id without restarting the gateway.
    pub async fn clear_permanent_failures(&self) {
        let mut inner = self.inner.lock().await;
        let mut cleared = false;
        for sub in inner.subscriptions.values_mut() {
            for item in sub.items.iter_mut() {
                if item.state == ItemState::PermanentlyFailed {
                    item.state = ItemState::Unmonitored;
                    item.consecutive_node_faults = 0;
                    cleared = true;
                }
            }
        }
        drop(inner);
        if cleared {
            self.kick();
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /// Idempotent, terminal. Removes every item and subscription
    /// server-side on a best-effort basis, closes the session, and
    /// leaves every item `Unmonitored` rather than dropping it, so a
    /// later restart sees the same config and rebuilds identical state.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Shutdown {
            return;
        }
        inner.state = SessionState::ShuttingDown;

        if let Some(opc_session) = inner.opc_session.clone() {
            for sub in inner.subscriptions.values_mut() {
                sub.teardown(opc_session.as_ref()).await;
            }
            opc_session.close().await;
        } else {
            for sub in inner.subscriptions.values_mut() {
                for item in sub.items.iter_mut() {
                    item.state = ItemState::Unmonitored;
                    item.server_handle = None;
                }
            }
        }

        inner.opc_session = None;
        inner.state = SessionState::Shutdown;
        self.cancellation.cancel();
        tracing::info!(endpoint = %self.endpoint_uri, "session shut down");
    }

    /// Dumps live state for config persistence. By default each item's
    /// *current* identity form is preserved as-is (an `ExpandedNodeId`
    /// stays an `ExpandedNodeId`, even once its namespace index is
    /// known); passing `force_node_id_form` downgrades any resolved
    /// `ExpandedNodeId` to the bare `NodeId` form via the session's own
    /// namespace table instead.
    pub async fn snapshot(&self, force_node_id_form: bool) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            endpoint_uri: self.endpoint_uri.clone(),
            subscriptions: inner
                .subscriptions
                .values()
                .map(|sub| SubscriptionSnapshot {
                    publishing_interval_ms: sub.requested_publishing_interval_ms,
                    items: sub
                        .items
                        .iter()
                        .filter(|item| item.state != ItemState::RemovalRequested)
                        .map(|item| ItemSnapshot {
                            identity: if force_node_id_form {
                                let index = match &item.identity {
                                    NodeIdentity::ExpandedNodeId { namespace_uri, .. } => {
                                        inner.namespace_table.index_of(namespace_uri)
                                    }
                                    NodeIdentity::NodeId { .. } => None,
                                };
                                item.identity.to_node_id_form(index)
                            } else {
                                item.identity.clone()
                            },
                            sampling_interval_ms: item.requested_sampling_interval_ms,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn notification_context(&self) -> NotificationContext {
        NotificationContext {
            application_uri: self.application_uri.clone(),
            shopfloor_domain: self.shopfloor_domain.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::testing::RecordingEgressQueue;
    use crate::opcua::client::testing::FakeOpcClient;

    fn config() -> SessionConfig {
        SessionConfig {
            session_timeout_ms: 1000,
            keep_alive_interval_sec: 1,
            keep_alive_disconnect_threshold: 3,
            backoff_max: 5,
            fetch_display_name: false,
            application_uri: "urn:gateway".to_string(),
            shopfloor_domain: None,
        }
    }

    #[tokio::test]
    async fn add_node_then_reconcile_reaches_monitored() {
        let client = Arc::new(FakeOpcClient::new(vec!["urn:x".to_string()]));
        let egress = Arc::new(RecordingEgressQueue::default());
        let cancellation = CancellationToken::new();
        let session = Session::spawn(
            "opc.tcp://a".to_string(),
            config(),
            client,
            egress,
            cancellation.clone(),
        );

        session
            .add_node_for_monitoring(
                NodeIdentity::ExpandedNodeId {
                    namespace_uri: "urn:x".to_string(),
                    identifier: "i=7".to_string(),
                    namespace_index: None,
                },
                1000.0,
                500.0,
            )
            .await
            .unwrap();

        session.reconcile().await;
        session.reconcile().await;

        let identity = NodeIdentity::ExpandedNodeId {
            namespace_uri: "urn:x".to_string(),
            identifier: "i=7".to_string(),
            namespace_index: None,
        };
        assert!(session.is_node_published(&identity).await);
        cancellation.cancel();
    }

    #[tokio::test]
    async fn removal_request_clears_item_next_tick() {
        let client = Arc::new(FakeOpcClient::new(vec!["urn:x".to_string()]));
        let egress = Arc::new(RecordingEgressQueue::default());
        let cancellation = CancellationToken::new();
        let session = Session::spawn(
            "opc.tcp://a".to_string(),
            config(),
            client,
            egress,
            cancellation.clone(),
        );

        let identity = NodeIdentity::NodeId {
            namespace_index: 1,
            identifier: "i=7".to_string(),
        };
        session.add_node_for_monitoring(identity.clone(), 1000.0, 500.0).await.unwrap();
        session.reconcile().await;
        session.reconcile().await;
        assert!(session.is_node_published(&identity).await);

        session.request_monitor_item_removal(identity.clone()).await.unwrap();
        session.reconcile().await;
        assert!(!session.is_node_published(&identity).await);
        assert!(session.has_no_subscriptions().await);
        cancellation.cancel();
    }

    #[tokio::test]
    async fn failed_connect_backs_off_and_retries() {
        let client = Arc::new(FakeOpcClient::new(vec!["urn:x".to_string()]));
        client.fail_next_connects(1);
        let egress = Arc::new(RecordingEgressQueue::default());
        let cancellation = CancellationToken::new();
        let session = Session::spawn(
            "opc.tcp://a".to_string(),
            config(),
            client,
            egress,
            cancellation.clone(),
        );

        session.reconcile().await;
        assert_eq!(session.inner.lock().await.unsuccessful_connects, 1);

        session.reconcile().await;
        assert_eq!(session.inner.lock().await.state, SessionState::Connected);
        cancellation.cancel();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_terminal() {
        let client = Arc::new(FakeOpcClient::new(vec!["urn:x".to_string()]));
        let egress = Arc::new(RecordingEgressQueue::default());
        let cancellation = CancellationToken::new();
        let session = Session::spawn(
            "opc.tcp://a".to_string(),
            config(),
            client,
            egress,
            cancellation.clone(),
        );

        session
            .add_node_for_monitoring(
                NodeIdentity::NodeId {
                    namespace_index: 0,
                    identifier: "i=1".to_string(),
                },
                1000.0,
                500.0,
            )
            .await
            .unwrap();
        session.reconcile().await;

        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(session.inner.lock().await.state, SessionState::Shutdown);
    }

    #[tokio::test]
    async fn clear_permanent_failures_retries_a_parked_node() {
        let client = Arc::new(FakeOpcClient::new(vec!["urn:x".to_string()]));
        client.reject_node("ns=1;i=1");
        let egress = Arc::new(RecordingEgressQueue::default());
        let cancellation = CancellationToken::new();
        let session = Session::spawn(
            "opc.tcp://a".to_string(),
            config(),
            client.clone(),
            egress,
            cancellation.clone(),
        );

        let identity = NodeIdentity::NodeId {
            namespace_index: 1,
            identifier: "i=1".to_string(),
        };
        session.add_node_for_monitoring(identity.clone(), 1000.0, 500.0).await.unwrap();
        for _ in 0..(crate::opcua::monitored_item::PERMANENT_FAULT_THRESHOLD + 1) {
            session.reconcile().await;
        }
        assert!(!session.is_node_published(&identity).await);

        client.unreject_node("ns=1;i=1");
        session.clear_permanent_failures().await;
        session.reconcile().await;
        session.reconcile().await;

        assert!(session.is_node_published(&identity).await);
        cancellation.cancel();
    }

    #[tokio::test]
    async fn snapshot_preserves_form_by_default_and_downgrades_when_forced() {
        let client = Arc::new(FakeOpcClient::new(vec!["urn:x".to_string()]));
        let egress = Arc::new(RecordingEgressQueue::default());
        let cancellation = CancellationToken::new();
        let session = Session::spawn(
            "opc.tcp://a".to_string(),
            config(),
            client,
            egress,
            cancellation.clone(),
        );

        let identity = NodeIdentity::ExpandedNodeId {
            namespace_uri: "urn:x".to_string(),
            identifier: "i=7".to_string(),
            namespace_index: None,
        };
        session.add_node_for_monitoring(identity, 1000.0, 500.0).await.unwrap();
        session.reconcile().await;
        session.reconcile().await;

        let preserved = session.snapshot(false).await;
        assert!(matches!(
            preserved.subscriptions[0].items[0].identity,
            NodeIdentity::ExpandedNodeId { .. }
        ));

        let downgraded = session.snapshot(true).await;
        assert_eq!(
            downgraded.subscriptions[0].items[0].identity,
            NodeIdentity::NodeId {
                namespace_index: 0,
                identifier: "i=7".to_string(),
            }
        );

        cancellation.cancel();
    }
}
