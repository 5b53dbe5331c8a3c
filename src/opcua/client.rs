//! The OPC UA client collaborator boundary.
//!
//! The protocol client sits behind this seam rather than inside the
//! reconciliation engine. `RealOpcClient` wraps `async-opcua`
//! (`ClientBuilder`, anonymous identity, `connect_to_matching_endpoint`,
//! a spawned event loop). `Session` (in `session.rs`) only ever talks
//! to the `OpcClient`/`OpcSession` traits, so the reconciliation engine
//! is testable against `testing::FakeOpcClient` without a live server.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::opcua::certificates::CertificateManager;
use crate::opcua::error::OpcFault;

/// Server-assigned identifier for a monitored item, stored on
/// `MonitoredItem::server_handle`.
pub type ServerItemHandle = u32;
/// Server-assigned identifier for a subscription.
pub type ServerSubscriptionHandle = u32;
/// Locally-assigned handle used purely to route a notification callback
/// back to the `MonitoredItem` that requested it (mirrors the
/// `NEXT_CLIENT_HANDLE` counter pattern in `async-opcua`-based clients).
pub type ClientHandle = u32;

/// A value-change notification, decoded out of the client library's own
/// `DataValue` type at this boundary rather than holding onto the
/// library type itself.
#[derive(Debug, Clone)]
pub struct RawDataValue {
    pub value: serde_json::Value,
    pub status_code: String,
    pub source_timestamp: Option<String>,
    pub server_timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveEvent {
    pub good: bool,
}

/// Callback invoked on the notification thread for every data change
/// delivered to a subscription. Matches the shape of `async-opcua`'s
/// `DataChangeCallback`, generalized to carry the routing handle.
pub type NotificationSink = Arc<dyn Fn(ClientHandle, RawDataValue) + Send + Sync>;

/// A live, connected OPC UA session. One per `Session` (core struct),
/// created by `OpcClient::connect`.
#[async_trait]
pub trait OpcSession: Send + Sync {
    async fn create_subscription(
        &self,
        publishing_interval_ms: f64,
        notify: NotificationSink,
    ) -> Result<(ServerSubscriptionHandle, f64), OpcFault>;

    async fn set_publishing_mode(
        &self,
        subscription: ServerSubscriptionHandle,
        enabled: bool,
    ) -> Result<(), OpcFault>;

    async fn add_monitored_item(
        &self,
        subscription: ServerSubscriptionHandle,
        node_id: &str,
        sampling_interval_ms: f64,
        client_handle: ClientHandle,
    ) -> Result<(ServerItemHandle, f64), OpcFault>;

    async fn apply_changes(&self, subscription: ServerSubscriptionHandle) -> Result<(), OpcFault>;

    async fn remove_monitored_items(
        &self,
        subscription: ServerSubscriptionHandle,
        items: &[ServerItemHandle],
    ) -> Result<(), OpcFault>;

    async fn delete_subscription(&self, subscription: ServerSubscriptionHandle) -> Result<(), OpcFault>;

    async fn read_display_name(&self, node_id: &str) -> Result<String, OpcFault>;

    /// Populated once at connect time; stable thereafter.
    fn namespace_array(&self) -> Vec<String>;

    fn min_supported_sampling_interval_ms(&self) -> f64;

    async fn close(&self);
}

/// Result of a successful `OpcClient::connect`.
pub struct ConnectedSession {
    pub session: Arc<dyn OpcSession>,
    pub keep_alive_events: mpsc::Receiver<KeepAliveEvent>,
}

/// The endpoint-discovery-and-connect collaborator. One instance is
/// shared by the whole `SessionRegistry`.
#[async_trait]
pub trait OpcClient: Send + Sync {
    async fn connect(
        &self,
        endpoint_uri: &str,
        timeout: Duration,
        keep_alive_interval: Duration,
    ) -> Result<ConnectedSession, OpcFault>;
}

/// Attribute node id for the server-wide `MinSupportedSampleRate` read
/// the connect phase performs, per the standard OPC UA `Server` object
/// address space. The namespace array is read through `async-opcua`'s
/// own `read_namespace_array` convenience method instead.
const MIN_SUPPORTED_SAMPLE_RATE_NODE_ID: &str = "ns=0;i=2277";

/// `async-opcua`-backed implementation of [`OpcClient`].
pub struct RealOpcClient {
    application_name: String,
    application_uri: String,
    cert_manager: CertificateManager,
}

impl RealOpcClient {
    pub fn new(application_name: impl Into<String>, application_uri: impl Into<String>) -> anyhow::Result<Self> {
        let cert_manager = CertificateManager::new()?;
        cert_manager.ensure_pki_structure()?;
        Ok(Self {
            application_name: application_name.into(),
            application_uri: application_uri.into(),
            cert_manager,
        })
    }
}

impl fmt::Debug for RealOpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealOpcClient")
            .field("application_uri", &self.application_uri)
            .finish()
    }
}

#[async_trait]
impl OpcClient for RealOpcClient {
    async fn connect(
        &self,
        endpoint_uri: &str,
        timeout: Duration,
        keep_alive_interval: Duration,
    ) -> Result<ConnectedSession, OpcFault> {
        use futures::StreamExt;
        use opcua::client::{ClientBuilder, IdentityToken, SessionActivity, SessionPollResult};
        use opcua::types::{AttributeId, MessageSecurityMode, ReadValueId, TimestampsToReturn, UserTokenPolicy};

        tracing::info!(endpoint = endpoint_uri, "connecting to OPC UA server");

        let client = ClientBuilder::new()
            .application_name(self.application_name.clone())
            .application_uri(self.application_uri.clone())
            .pki_dir(self.cert_manager.pki_directory())
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .session_retry_limit(1)
            .session_timeout(timeout.as_millis() as u32)
            .keep_alive_interval(keep_alive_interval)
            .client()
            .map_err(|e| OpcFault::Other(format!("failed to build client: {e:?}")))?;

        let endpoint = (
            endpoint_uri,
            "None",
            MessageSecurityMode::None,
            UserTokenPolicy::anonymous(),
        )
            .into();

        let (session, event_loop) = client
            .connect_to_matching_endpoint(endpoint, IdentityToken::Anonymous)
            .await
            .map_err(|e| OpcFault::Other(format!("connect failed: {e}")))?;

        // `event_loop.spawn()` alone gives no visibility into keep-alive
        // activity, so this drives the event stream itself and forwards
        // keep-alive outcomes onto our own channel instead.
        let (ka_tx, ka_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let stream = event_loop.enter();
            tokio::pin!(stream);
            while let Some(polled) = stream.next().await {
                match polled {
                    Ok(SessionPollResult::SessionActivity(SessionActivity::KeepAliveSucceeded)) => {
                        let _ = ka_tx.try_send(KeepAliveEvent { good: true });
                    }
                    Ok(SessionPollResult::SessionActivity(SessionActivity::KeepAliveFailed(_))) => {
                        let _ = ka_tx.try_send(KeepAliveEvent { good: false });
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        session.wait_for_connection().await;

        let namespace_array = session
            .read_namespace_array()
            .await
            .map(|map| {
                let mut array: Vec<String> = map.known_namespaces().iter().fold(Vec::new(), |mut acc, (uri, idx)| {
                    let idx = *idx as usize;
                    if acc.len() <= idx {
                        acc.resize(idx + 1, String::new());
                    }
                    acc[idx] = uri.clone();
                    acc
                });
                if array.is_empty() {
                    array.push("http://opcfoundation.org/UA/".to_string());
                }
                array
            })
            .map_err(|e| classify_status_code(e.status()))?;

        let min_sampling_node: opcua::types::NodeId = MIN_SUPPORTED_SAMPLE_RATE_NODE_ID
            .parse()
            .expect("well-formed standard node id");
        let min_sampling = session
            .read(
                &[ReadValueId::new(min_sampling_node, AttributeId::Value)],
                TimestampsToReturn::Neither,
                0.0,
            )
            .await
            .ok()
            .and_then(|mut values| values.pop())
            .and_then(|dv| dv.value)
            .and_then(|v| v.as_f64())
            .unwrap_or(50.0);

        Ok(ConnectedSession {
            session: Arc::new(RealOpcSession {
                inner: session,
                namespace_array,
                min_sampling,
            }),
            keep_alive_events: ka_rx,
        })
    }
}

struct RealOpcSession {
    inner: Arc<opcua::client::Session>,
    namespace_array: Vec<String>,
    min_sampling: f64,
}

#[async_trait]
impl OpcSession for RealOpcSession {
    async fn create_subscription(
        &self,
        publishing_interval_ms: f64,
        notify: NotificationSink,
    ) -> Result<(ServerSubscriptionHandle, f64), OpcFault> {
        use opcua::client::DataChangeCallback;

        let callback = move |data_value: opcua::types::DataValue, item: &opcua::client::MonitoredItem| {
            notify(item.client_handle(), decode_data_value(&data_value));
        };

        let id = self
            .inner
            .create_subscription(
                Duration::from_millis(publishing_interval_ms as u64),
                10,
                30,
                0,
                0,
                true,
                DataChangeCallback::new(callback),
            )
            .await
            .map_err(classify_fault)?;

        // The library reports the revised interval via the subscription
        // handle; absent a dedicated accessor in this boundary we treat
        // the requested value as revised when the server does not
        // negotiate it down further than our request.
        Ok((id, publishing_interval_ms))
    }

    async fn set_publishing_mode(
        &self,
        subscription: ServerSubscriptionHandle,
        enabled: bool,
    ) -> Result<(), OpcFault> {
        self.inner
            .set_publishing_mode(&[subscription], enabled)
            .await
            .map(|_| ())
            .map_err(classify_fault)
    }

    async fn add_monitored_item(
        &self,
        subscription: ServerSubscriptionHandle,
        node_id: &str,
        sampling_interval_ms: f64,
        client_handle: ClientHandle,
    ) -> Result<(ServerItemHandle, f64), OpcFault> {
        use opcua::types::{MonitoredItemCreateRequest, TimestampsToReturn};

        let parsed: opcua::types::NodeId = node_id
            .parse()
            .map_err(|_| OpcFault::BadNodeIdInvalid)?;

        let mut request: MonitoredItemCreateRequest = parsed.into();
        request.requested_parameters.client_handle = client_handle;
        request.requested_parameters.sampling_interval = sampling_interval_ms;

        let results = self
            .inner
            .create_monitored_items(subscription, TimestampsToReturn::Both, vec![request])
            .await
            .map_err(classify_fault)?;

        let result = results.into_iter().next().ok_or(OpcFault::Other("empty result".into()))?;
        if !result.result.status_code.is_good() {
            return Err(classify_status_code(result.result.status_code));
        }

        Ok((result.result.monitored_item_id, result.result.revised_sampling_interval))
    }

    async fn apply_changes(&self, subscription: ServerSubscriptionHandle) -> Result<(), OpcFault> {
        let _ = subscription;
        Ok(())
    }

    async fn remove_monitored_items(
        &self,
        subscription: ServerSubscriptionHandle,
        items: &[ServerItemHandle],
    ) -> Result<(), OpcFault> {
        self.inner
            .delete_monitored_items(subscription, items)
            .await
            .map(|_| ())
            .map_err(classify_fault)
    }

    async fn delete_subscription(&self, subscription: ServerSubscriptionHandle) -> Result<(), OpcFault> {
        self.inner
            .delete_subscriptions(&[subscription])
            .await
            .map(|_| ())
            .map_err(classify_fault)
    }

    async fn read_display_name(&self, node_id: &str) -> Result<String, OpcFault> {
        use opcua::types::{AttributeId, ReadValueId, TimestampsToReturn, Variant};

        let parsed: opcua::types::NodeId = node_id
            .parse()
            .map_err(|_| OpcFault::BadNodeIdInvalid)?;

        let mut results = self
            .inner
            .read(
                &[ReadValueId::new(parsed, AttributeId::DisplayName)],
                TimestampsToReturn::Neither,
                0.0,
            )
            .await
            .map_err(classify_status_code)?;

        let data_value = results.pop().ok_or(OpcFault::Other("empty read result".into()))?;
        if let Some(status) = data_value.status {
            if !status.is_good() {
                return Err(classify_status_code(status));
            }
        }

        match data_value.value {
            Some(Variant::LocalizedText(text)) => Ok(text.to_string()),
            _ => Err(OpcFault::Other("DisplayName attribute missing or of unexpected type".into())),
        }
    }

    fn namespace_array(&self) -> Vec<String> {
        self.namespace_array.clone()
    }

    fn min_supported_sampling_interval_ms(&self) -> f64 {
        self.min_sampling
    }

    async fn close(&self) {
        let _ = self.inner.disconnect().await;
    }
}

fn decode_data_value(value: &opcua::types::DataValue) -> RawDataValue {
    RawDataValue {
        value: value
            .value
            .as_ref()
            .map(|v| serde_json::Value::String(format!("{:?}", v)))
            .unwrap_or(serde_json::Value::Null),
        status_code: value
            .status
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "Good".to_string()),
        source_timestamp: value.source_timestamp.map(|dt| dt.as_chrono().to_rfc3339()),
        server_timestamp: value.server_timestamp.map(|dt| dt.as_chrono().to_rfc3339()),
    }
}

fn classify_fault(e: opcua::types::StatusCode) -> OpcFault {
    classify_status_code(e)
}

fn classify_status_code(status: opcua::types::StatusCode) -> OpcFault {
    use opcua::types::StatusCode;
    match status {
        StatusCode::BadSessionIdInvalid => OpcFault::BadSessionIdInvalid,
        StatusCode::BadNodeIdInvalid => OpcFault::BadNodeIdInvalid,
        StatusCode::BadNodeIdUnknown => OpcFault::BadNodeIdUnknown,
        other => OpcFault::Other(format!("{other:?}")),
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    //! An in-memory `OpcClient`/`OpcSession` pair that simulates server
    //! behavior deterministically, so `Session`'s reconciliation logic
    //! can be driven by unit and integration tests without a live
    //! OPC UA server.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        next_subscription: u32,
        next_item: u32,
        subscriptions: HashMap<ServerSubscriptionHandle, NotificationSink>,
        /// node identifiers the fake server rejects with BadNodeIdUnknown.
        unknown_nodes: std::collections::HashSet<String>,
        connect_failures_remaining: u32,
        keep_alive_sender: Option<mpsc::Sender<KeepAliveEvent>>,
    }

    pub struct FakeOpcClient {
        namespace_array: Vec<String>,
        min_sampling_ms: f64,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeOpcClient {
        pub fn new(namespace_array: Vec<String>) -> Self {
            Self {
                namespace_array,
                min_sampling_ms: 50.0,
                state: Arc::new(Mutex::new(FakeState::default())),
            }
        }

        pub fn reject_node(&self, node_id: impl Into<String>) {
            self.state.lock().unwrap().unknown_nodes.insert(node_id.into());
        }

        /// Simulates an operator fixing a misconfigured node id server-side.
        pub fn unreject_node(&self, node_id: impl Into<String>) {
            self.state.lock().unwrap().unknown_nodes.remove(&node_id.into());
        }

        pub fn fail_next_connects(&self, count: u32) {
            self.state.lock().unwrap().connect_failures_remaining = count;
        }

        /// Deliver a synthetic value-change notification to whichever
        /// item is registered under `client_handle` on `subscription`.
        pub fn push_notification(&self, subscription: ServerSubscriptionHandle, client_handle: ClientHandle, value: RawDataValue) {
            let state = self.state.lock().unwrap();
            if let Some(sink) = state.subscriptions.get(&subscription) {
                sink(client_handle, value);
            }
        }

        /// Deliver a synthetic keep-alive event on the most recently
        /// connected session, simulating a live or lost server link.
        pub fn push_keep_alive(&self, event: KeepAliveEvent) {
            let sender = self.state.lock().unwrap().keep_alive_sender.clone();
            if let Some(sender) = sender {
                let _ = sender.try_send(event);
            }
        }
    }

    #[async_trait]
    impl OpcClient for FakeOpcClient {
        async fn connect(
            &self,
            _endpoint_uri: &str,
            _timeout: Duration,
            _keep_alive_interval: Duration,
        ) -> Result<ConnectedSession, OpcFault> {
            {
                let mut state = self.state.lock().unwrap();
                if state.connect_failures_remaining > 0 {
                    state.connect_failures_remaining -= 1;
                    return Err(OpcFault::Other("simulated connect failure".into()));
                }
            }

            let (ka_tx, ka_rx) = mpsc::channel(16);
            self.state.lock().unwrap().keep_alive_sender = Some(ka_tx);
            Ok(ConnectedSession {
                session: Arc::new(FakeOpcSession {
                    namespace_array: self.namespace_array.clone(),
                    min_sampling_ms: self.min_sampling_ms,
                    state: self.state.clone(),
                }),
                keep_alive_events: ka_rx,
            })
        }
    }

    struct FakeOpcSession {
        namespace_array: Vec<String>,
        min_sampling_ms: f64,
        state: Arc<Mutex<FakeState>>,
    }

    #[async_trait]
    impl OpcSession for FakeOpcSession {
        async fn create_subscription(
            &self,
            _publishing_interval_ms: f64,
            notify: NotificationSink,
        ) -> Result<(ServerSubscriptionHandle, f64), OpcFault> {
            let mut state = self.state.lock().unwrap();
            state.next_subscription += 1;
            let id = state.next_subscription;
            state.subscriptions.insert(id, notify);
            Ok((id, _publishing_interval_ms))
        }

        async fn set_publishing_mode(&self, _subscription: ServerSubscriptionHandle, _enabled: bool) -> Result<(), OpcFault> {
            Ok(())
        }

        async fn add_monitored_item(
            &self,
            _subscription: ServerSubscriptionHandle,
            node_id: &str,
            sampling_interval_ms: f64,
            _client_handle: ClientHandle,
        ) -> Result<(ServerItemHandle, f64), OpcFault> {
            let mut state = self.state.lock().unwrap();
            if node_id.is_empty() {
                return Err(OpcFault::BadNodeIdInvalid);
            }
            if state.unknown_nodes.contains(node_id) {
                return Err(OpcFault::BadNodeIdUnknown);
            }
            state.next_item += 1;
            Ok((state.next_item, sampling_interval_ms))
        }

        async fn apply_changes(&self, _subscription: ServerSubscriptionHandle) -> Result<(), OpcFault> {
            Ok(())
        }

        async fn remove_monitored_items(&self, _subscription: ServerSubscriptionHandle, _items: &[ServerItemHandle]) -> Result<(), OpcFault> {
            Ok(())
        }

        async fn delete_subscription(&self, subscription: ServerSubscriptionHandle) -> Result<(), OpcFault> {
            self.state.lock().unwrap().subscriptions.remove(&subscription);
            Ok(())
        }

        async fn read_display_name(&self, node_id: &str) -> Result<String, OpcFault> {
            Ok(format!("Display({node_id})"))
        }

        fn namespace_array(&self) -> Vec<String> {
            self.namespace_array.clone()
        }

        fn min_supported_sampling_interval_ms(&self) -> f64 {
            self.min_sampling_ms
        }

        async fn close(&self) {}
    }
}
