//! Groups monitored items sharing a publishing interval on one session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::egress::EgressQueue;
use crate::opcua::client::{
    ClientHandle, NotificationSink, OpcSession, RawDataValue, ServerSubscriptionHandle,
};
use crate::opcua::error::OpcFault;
use crate::opcua::identity::NodeIdentity;
use crate::opcua::monitored_item::{ItemState, MonitoredItem, NotificationContext, PERMANENT_FAULT_THRESHOLD};
use crate::opcua::namespace::NamespaceTable;

static NEXT_CLIENT_HANDLE: AtomicU32 = AtomicU32::new(1);

fn next_client_handle() -> ClientHandle {
    NEXT_CLIENT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Routes a server notification callback (keyed by `ClientHandle`) back
/// to the owning item's `NodeIdentity`, and formats + enqueues the
/// envelope. Shared with the `OpcSession::create_subscription` callback,
/// which runs on whatever thread the client library delivers
/// notifications on (`DataChangeCallback` is `Send + Sync` and may run
/// off the tokio runtime).
struct NotificationRouter {
    handle_to_identity: Mutex<HashMap<ClientHandle, NodeIdentity>>,
    egress: Arc<dyn EgressQueue>,
    display_names: Mutex<HashMap<NodeIdentity, String>>,
    context: NotificationContext,
}

impl NotificationRouter {
    fn route(&self, handle: ClientHandle, raw: RawDataValue) {
        let identity = {
            let map = self.handle_to_identity.lock().unwrap();
            match map.get(&handle) {
                Some(id) => id.clone(),
                None => {
                    tracing::debug!(handle, "notification for unregistered client handle dropped");
                    return;
                }
            }
        };

        let display_name = self
            .display_names
            .lock()
            .unwrap()
            .get(&identity)
            .cloned()
            .unwrap_or_default();

        let stand_in = MonitoredItem {
            identity,
            state: ItemState::Monitored,
            display_name,
            requested_sampling_interval_ms: 0.0,
            revised_sampling_interval_ms: 0.0,
            queue_size: 0,
            discard_oldest: true,
            monitoring_mode: Default::default(),
            attribute_id: Default::default(),
            endpoint_uri: String::new(),
            server_handle: None,
            consecutive_node_faults: 0,
        };

        let envelope = stand_in.on_notification(raw, &self.context);
        self.egress.enqueue(envelope.to_json());
    }
}

pub struct Subscription {
    pub requested_publishing_interval_ms: f64,
    pub revised_publishing_interval_ms: f64,
    pub items: Vec<MonitoredItem>,
    pub server_handle: Option<ServerSubscriptionHandle>,
    router: Arc<NotificationRouter>,
}

impl Subscription {
    pub fn new(requested_publishing_interval_ms: f64, egress: Arc<dyn EgressQueue>, context: NotificationContext) -> Self {
        Self {
            requested_publishing_interval_ms,
            revised_publishing_interval_ms: requested_publishing_interval_ms,
            items: Vec::new(),
            server_handle: None,
            router: Arc::new(NotificationRouter {
                handle_to_identity: Mutex::new(HashMap::new()),
                egress,
                display_names: Mutex::new(HashMap::new()),
                context,
            }),
        }
    }

    /// Issued when reconciliation finds a subscription lacking a
    /// `server_handle`. Failure here is fatal for this pass; the caller
    /// retries on the next tick.
    pub async fn ensure_created(&mut self, session: &dyn OpcSession) -> Result<(), OpcFault> {
        if self.server_handle.is_some() {
            return Ok(());
        }

        let router = self.router.clone();
        let notify: NotificationSink = Arc::new(move |handle, raw| router.route(handle, raw));

        let (handle, revised) = session
            .create_subscription(self.requested_publishing_interval_ms, notify)
            .await?;

        self.server_handle = Some(handle);
        self.revised_publishing_interval_ms = revised;
        Ok(())
    }

    fn register_routing(&self, identity: NodeIdentity, display_name: &str) -> ClientHandle {
        let handle = next_client_handle();
        self.router
            .handle_to_identity
            .lock()
            .unwrap()
            .insert(handle, identity.clone());
        self.router
            .display_names
            .lock()
            .unwrap()
            .insert(identity, display_name.to_string());
        handle
    }

    fn unregister_routing(&self, identity: &NodeIdentity) {
        let handle = {
            let map = self.router.handle_to_identity.lock().unwrap();
            map.iter()
                .find(|(_, id)| *id == identity)
                .map(|(h, _)| *h)
        };
        if let Some(handle) = handle {
            self.router.handle_to_identity.lock().unwrap().remove(&handle);
        }
        self.router.display_names.lock().unwrap().remove(identity);
    }

    /// Creates the server-side monitored item and applies the change.
    /// Returns the fault (if any) so the caller (`Session::monitor_nodes`)
    /// can run its per-fault classification.
    pub async fn add_item(
        &mut self,
        session: &dyn OpcSession,
        item_index: usize,
    ) -> Result<(), OpcFault> {
        let subscription_handle = self.server_handle.ok_or(OpcFault::Other("subscription not created".into()))?;

        let node_id = {
            let item = &self.items[item_index];
            item.effective_node_id()
                .ok_or(OpcFault::Other("namespace index unresolved".into()))?
        };

        let client_handle = {
            let item = &self.items[item_index];
            self.register_routing(item.identity.clone(), &item.display_name)
        };

        session.set_publishing_mode(subscription_handle, true).await?;

        let result = session
            .add_monitored_item(
                subscription_handle,
                &node_id,
                self.items[item_index].requested_sampling_interval_ms,
                client_handle,
            )
            .await;

        match result {
            Ok((server_handle, revised)) => {
                session.apply_changes(subscription_handle).await?;
                let item = &mut self.items[item_index];
                item.server_handle = Some(server_handle);
                item.revised_sampling_interval_ms = revised;
                item.state = ItemState::Monitored;
                item.consecutive_node_faults = 0;
                Ok(())
            }
            Err(fault) => {
                self.unregister_routing(&self.items[item_index].identity.clone());
                Err(fault)
            }
        }
    }

    /// Batch-remove items tagged `RemovalRequested`; failures are
    /// ignored (best-effort, the items may never have been created
    /// server-side).
    pub async fn remove_tagged_items(&mut self, session: &dyn OpcSession) -> bool {
        let Some(subscription_handle) = self.server_handle else {
            let had = self.items.iter().any(|i| i.state == ItemState::RemovalRequested);
            self.items.retain(|i| i.state != ItemState::RemovalRequested);
            return had;
        };

        let to_remove: Vec<_> = self
            .items
            .iter()
            .filter(|i| i.state == ItemState::RemovalRequested)
            .filter_map(|i| i.server_handle)
            .collect();

        if !to_remove.is_empty() {
            if let Err(e) = session.remove_monitored_items(subscription_handle, &to_remove).await {
                tracing::warn!(error = ?e, "remove_monitored_items failed, continuing anyway");
            }
        }

        let had_removals = self.items.iter().any(|i| i.state == ItemState::RemovalRequested);
        for item in self.items.iter().filter(|i| i.state == ItemState::RemovalRequested) {
            self.unregister_routing(&item.identity);
        }
        self.items.retain(|i| i.state != ItemState::RemovalRequested);
        had_removals
    }

    /// Used by `Session::shutdown` and by garbage collection of empty
    /// subscriptions: delete the server-side subscription and
    /// server-side items (failures ignored, best-effort), then fold
    /// every surviving item back to `Unmonitored` rather than
    /// discarding it. `shutdown()` must leave items monitorable again
    /// on the next connect.
    pub async fn teardown(&mut self, session: &dyn OpcSession) {
        if let Some(subscription_handle) = self.server_handle {
            let item_handles: Vec<_> = self.items.iter().filter_map(|i| i.server_handle).collect();
            if !item_handles.is_empty() {
                if let Err(e) = session.remove_monitored_items(subscription_handle, &item_handles).await {
                    tracing::warn!(error = ?e, "teardown: remove_monitored_items failed, continuing anyway");
                }
            }
            if let Err(e) = session.delete_subscription(subscription_handle).await {
                tracing::warn!(error = ?e, "teardown: delete_subscription failed, continuing anyway");
            }
        }
        self.server_handle = None;
        for item in self.items.iter_mut() {
            item.state = ItemState::Unmonitored;
            item.server_handle = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Classify a fault from `add_item`: permanent node faults escalate
    /// the item's `consecutive_node_faults` counter and, past the
    /// threshold, park it in `PermanentlyFailed`.
    pub fn apply_node_fault(&mut self, item_index: usize, fault: &OpcFault) {
        let item = &mut self.items[item_index];
        match fault {
            OpcFault::BadNodeIdInvalid | OpcFault::BadNodeIdUnknown => {
                item.consecutive_node_faults += 1;
                tracing::warn!(
                    node = %item.identity,
                    fault = ?fault,
                    count = item.consecutive_node_faults,
                    "permanent node fault"
                );
                if item.consecutive_node_faults >= PERMANENT_FAULT_THRESHOLD {
                    item.state = ItemState::PermanentlyFailed;
                } else {
                    item.state = ItemState::Unmonitored;
                }
            }
            other => {
                tracing::warn!(node = %item.identity, fault = ?other, "transient fault adding item, retrying next tick");
                item.state = ItemState::Unmonitored;
            }
        }
    }

    /// Resolve any items in `UnmonitoredNamespaceUpdateRequested` against
    /// `ns`. Returns the number resolved.
    pub fn resolve_namespace_updates(&mut self, ns: &NamespaceTable) -> usize {
        let mut resolved = 0;
        for item in self.items.iter_mut() {
            if item.state != ItemState::UnmonitoredNamespaceUpdateRequested {
                continue;
            }
            match &mut item.identity {
                NodeIdentity::ExpandedNodeId {
                    namespace_uri,
                    namespace_index,
                    ..
                } => match ns.index_of(namespace_uri) {
                    Some(idx) => {
                        *namespace_index = Some(idx);
                        item.state = ItemState::Unmonitored;
                        resolved += 1;
                    }
                    None => {
                        tracing::warn!(uri = %namespace_uri, "namespace URI not found on server, retrying next tick");
                    }
                },
                NodeIdentity::NodeId {
                    namespace_index,
                    identifier,
                } => match ns.uri_at(*namespace_index) {
                    Some(uri) if !uri.is_empty() => {
                        item.identity = NodeIdentity::ExpandedNodeId {
                            namespace_uri: uri.to_string(),
                            identifier: identifier.clone(),
                            namespace_index: Some(*namespace_index),
                        };
                        item.state = ItemState::Unmonitored;
                        resolved += 1;
                    }
                    _ => {
                        tracing::warn!(namespace_index, "namespace index has no URI, retrying next tick");
                    }
                },
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::testing::RecordingEgressQueue;
    use crate::opcua::client::testing::FakeOpcClient;
    use crate::opcua::client::OpcClient;
    use std::time::Duration;

    fn ctx() -> NotificationContext {
        NotificationContext {
            application_uri: "urn:gateway".to_string(),
            shopfloor_domain: None,
        }
    }

    #[tokio::test]
    async fn create_then_add_item_reaches_monitored() {
        let client = FakeOpcClient::new(vec!["urn:x".to_string()]);
        let connected = client
            .connect("opc.tcp://a", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        let egress = Arc::new(RecordingEgressQueue::default());
        let mut sub = Subscription::new(1000.0, egress, ctx());
        sub.items.push(MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 1,
                identifier: "i=7".to_string(),
            },
            "opc.tcp://a".to_string(),
            500.0,
        ));

        sub.ensure_created(connected.session.as_ref()).await.unwrap();
        sub.add_item(connected.session.as_ref(), 0).await.unwrap();

        assert_eq!(sub.items[0].state, ItemState::Monitored);
        assert!(sub.items[0].server_handle.is_some());
    }

    #[tokio::test]
    async fn unknown_node_is_classified_as_permanent() {
        let client = FakeOpcClient::new(vec!["urn:x".to_string()]);
        client.reject_node("ns=1;i=999");
        let connected = client
            .connect("opc.tcp://a", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        let egress = Arc::new(RecordingEgressQueue::default());
        let mut sub = Subscription::new(1000.0, egress, ctx());
        sub.items.push(MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 1,
                identifier: "i=999".to_string(),
            },
            "opc.tcp://a".to_string(),
            500.0,
        ));

        sub.ensure_created(connected.session.as_ref()).await.unwrap();
        let err = sub.add_item(connected.session.as_ref(), 0).await.unwrap_err();
        sub.apply_node_fault(0, &err);

        assert_eq!(sub.items[0].state, ItemState::Unmonitored);
        assert_eq!(sub.items[0].consecutive_node_faults, 1);
    }

    #[tokio::test]
    async fn remove_tagged_items_drops_from_list() {
        let client = FakeOpcClient::new(vec!["urn:x".to_string()]);
        let connected = client
            .connect("opc.tcp://a", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        let egress = Arc::new(RecordingEgressQueue::default());
        let mut sub = Subscription::new(1000.0, egress, ctx());
        sub.items.push(MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 1,
                identifier: "i=7".to_string(),
            },
            "opc.tcp://a".to_string(),
            500.0,
        ));
        sub.ensure_created(connected.session.as_ref()).await.unwrap();
        sub.add_item(connected.session.as_ref(), 0).await.unwrap();
        sub.items[0].state = ItemState::RemovalRequested;

        let removed = sub.remove_tagged_items(connected.session.as_ref()).await;
        assert!(removed);
        assert!(sub.items.is_empty());
    }
}
