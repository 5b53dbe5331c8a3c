//! The top-level reconciliation driver: owns every `Session`, reconciles
//! them against the config file on a fixed cadence, and persists
//! whatever sessions report dirty.
//!
//! Lock ordering is Registry -> Config -> Session: `reconcile_all`
//! always takes `sessions` before touching the config file, and never
//! holds `sessions` across a `Session` method that itself awaits on
//! the session's own mutex from inside a write-locked block for longer
//! than constructing the session.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::file::{self, ResolvedEndpoint};
use crate::egress::EgressQueue;
use crate::opcua::client::OpcClient;
use crate::opcua::identity::NodeIdentity;
use crate::opcua::session::{Session, SessionConfig};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Endpoint-independent knobs every spawned `Session` shares, sourced
/// from process configuration (CLI flags and environment variables).
#[derive(Clone)]
pub struct SessionDefaults {
    pub session_timeout_ms: u64,
    pub keep_alive_interval_sec: u64,
    pub keep_alive_disconnect_threshold: u32,
    pub backoff_max: u32,
    pub fetch_display_name: bool,
    pub application_uri: String,
    pub shopfloor_domain: Option<String>,
    /// When persisting, downgrade every resolved `ExpandedNodeId` item
    /// back to the bare `NodeId` form instead of preserving whichever
    /// form the operator originally configured.
    pub force_node_id_on_persist: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    client: Arc<dyn OpcClient>,
    egress: Arc<dyn EgressQueue>,
    config_path: PathBuf,
    config_lock: Mutex<()>,
    defaults: SessionDefaults,
    cancellation: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        config_path: PathBuf,
        client: Arc<dyn OpcClient>,
        egress: Arc<dyn EgressQueue>,
        defaults: SessionDefaults,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            client,
            egress,
            config_path,
            config_lock: Mutex::new(()),
            defaults,
            cancellation,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            session_timeout_ms: self.defaults.session_timeout_ms,
            keep_alive_interval_sec: self.defaults.keep_alive_interval_sec,
            keep_alive_disconnect_threshold: self.defaults.keep_alive_disconnect_threshold,
            backoff_max: self.defaults.backoff_max,
            fetch_display_name: self.defaults.fetch_display_name,
            application_uri: self.defaults.application_uri.clone(),
            shopfloor_domain: self.defaults.shopfloor_domain.clone(),
        }
    }

    /// Runs `reconcile_all` on `RECONCILE_INTERVAL` until cancelled.
    /// Each individual `Session` additionally drives its own faster
    /// reconciliation loop (`Session::spawn`); this loop's job is
    /// purely config-file re-reads and session-level bookkeeping.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                _ = interval.tick() => {},
            }
            self.reconcile_all().await;
        }
        self.shutdown_all().await;
    }

    fn read_config(&self) -> Vec<ResolvedEndpoint> {
        match file::read_config(&self.config_path) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(error = ?e, path = %self.config_path.display(), "failed to read node configuration");
                Vec::new()
            }
        }
    }

    /// The per-tick sequence: read the config, create sessions for new
    /// endpoints, push mutator calls for added/removed nodes, then
    /// shut down and drop sessions for endpoints that both dropped out
    /// of the config and finished draining their subscriptions.
    pub async fn reconcile_all(&self) {
        let resolved = {
            let _config_guard = self.config_lock.lock().await;
            self.read_config()
        };

        let wanted_endpoints: HashSet<String> = resolved.iter().map(|e| e.endpoint_url.clone()).collect();

        {
            let mut sessions = self.sessions.write().await;
            for endpoint in &resolved {
                if sessions.contains_key(&endpoint.endpoint_url) {
                    continue;
                }
                // A child token: an individual `Session::shutdown()` (e.g.
                // once its endpoint drops out of the config) must not
                // cancel every other session's reconciliation loop, only
                // the registry-wide token cancelling should do that.
                let session = Session::spawn(
                    endpoint.endpoint_url.clone(),
                    self.session_config(),
                    self.client.clone(),
                    self.egress.clone(),
                    self.cancellation.child_token(),
                );
                tracing::info!(endpoint = %endpoint.endpoint_url, "session created for new configuration entry");
                sessions.insert(endpoint.endpoint_url.clone(), session);
            }
        }

        {
            let sessions = self.sessions.read().await;
            for endpoint in &resolved {
                let Some(session) = sessions.get(&endpoint.endpoint_url) else {
                    continue;
                };

                for node in &endpoint.nodes {
                    if let Err(e) = session
                        .add_node_for_monitoring(node.identity.clone(), node.publishing_interval_ms, node.sampling_interval_ms)
                        .await
                    {
                        tracing::warn!(endpoint = %endpoint.endpoint_url, error = ?e, "failed to request node monitoring");
                    }
                }

                let wanted: Vec<NodeIdentity> = endpoint.nodes.iter().map(|n| n.identity.clone()).collect();
                session.prune_nodes_not_in(&wanted).await;
            }

            for (endpoint_uri, session) in sessions.iter() {
                if !wanted_endpoints.contains(endpoint_uri) {
                    session.prune_nodes_not_in(&[]).await;
                }
            }
        }

        self.remove_unused_sessions(&wanted_endpoints).await;
        self.persist_if_dirty().await;
    }

    async fn remove_unused_sessions(&self, wanted_endpoints: &HashSet<String>) {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut stale = Vec::new();
            for (endpoint_uri, session) in sessions.iter() {
                if !wanted_endpoints.contains(endpoint_uri) && session.has_no_subscriptions().await {
                    stale.push(endpoint_uri.clone());
                }
            }
            stale
        };

        if stale.is_empty() {
            return;
        }

        let mut sessions = self.sessions.write().await;
        for endpoint_uri in stale {
            if let Some(session) = sessions.remove(&endpoint_uri) {
                session.shutdown().await;
                tracing::info!(endpoint = %endpoint_uri, "session removed, no longer in configuration");
            }
        }
    }

    /// Writes the config file back out if any session reports having
    /// mutated its monitored set since the last persist.
    async fn persist_if_dirty(&self) {
        let sessions = self.sessions.read().await;
        let mut any_dirty = false;
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            if session.take_dirty() {
                any_dirty = true;
            }
            snapshots.push(session.snapshot(self.defaults.force_node_id_on_persist).await);
        }

        if !any_dirty {
            return;
        }

        let _config_guard = self.config_lock.lock().await;
        if let Err(e) = file::write_config(&self.config_path, &snapshots) {
            tracing::error!(error = ?e, path = %self.config_path.display(), "failed to persist node configuration");
        }
    }

    /// Whether any session currently monitors the given node,
    /// independent of which endpoint it lives on.
    pub async fn is_node_published(&self, identity: &NodeIdentity) -> bool {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.is_node_published(identity).await {
                return true;
            }
        }
        false
    }

    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (endpoint_uri, session) in sessions.drain() {
            session.shutdown().await;
            tracing::info!(endpoint = %endpoint_uri, "session shut down for process exit");
        }
    }
}
