//! The leaf entity: a single observed node plus its lifecycle state and
//! notification encoding.

use serde::Serialize;

use crate::opcua::client::{RawDataValue, ServerItemHandle};
use crate::opcua::identity::{NodeIdentity, NodeQuery};
use crate::opcua::namespace::NamespaceTable;

/// Lifecycle state of one `MonitoredItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Unmonitored,
    UnmonitoredNamespaceUpdateRequested,
    Monitored,
    RemovalRequested,
    /// Not in the source. Stops indefinite retry/log-spam on
    /// `BadNodeIdInvalid` / `BadNodeIdUnknown`.
    PermanentlyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitoringMode {
    #[default]
    Reporting,
    Sampling,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeId {
    #[default]
    Value,
}

/// How many consecutive reconciliation ticks must observe a permanent
/// node fault before the item is parked in `PermanentlyFailed`.
pub const PERMANENT_FAULT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct MonitoredItem {
    pub identity: NodeIdentity,
    pub state: ItemState,
    pub display_name: String,
    pub requested_sampling_interval_ms: f64,
    pub revised_sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub monitoring_mode: MonitoringMode,
    pub attribute_id: AttributeId,
    pub endpoint_uri: String,
    pub server_handle: Option<ServerItemHandle>,
    /// Consecutive ticks a permanent node fault (`BadNodeIdInvalid` /
    /// `BadNodeIdUnknown`) has been observed for this item.
    pub consecutive_node_faults: u32,
}

impl MonitoredItem {
    pub fn new(
        identity: NodeIdentity,
        endpoint_uri: String,
        requested_sampling_interval_ms: f64,
    ) -> Self {
        let needs_namespace_update = identity.is_expanded();
        Self {
            identity,
            state: if needs_namespace_update {
                ItemState::UnmonitoredNamespaceUpdateRequested
            } else {
                ItemState::Unmonitored
            },
            display_name: String::new(),
            requested_sampling_interval_ms,
            revised_sampling_interval_ms: requested_sampling_interval_ms,
            queue_size: 0,
            discard_oldest: true,
            monitoring_mode: MonitoringMode::default(),
            attribute_id: AttributeId::default(),
            endpoint_uri,
            server_handle: None,
            consecutive_node_faults: 0,
        }
    }

    /// Resolves the stored identity and the query through
    /// `namespace_table` so the two forms compare equal when they name
    /// the same `(uri, identifier)`.
    pub fn is_monitoring_this_node(&self, query: &NodeQuery<'_>, ns: &NamespaceTable) -> bool {
        if self.state == ItemState::RemovalRequested {
            return false;
        }

        match (&self.identity, query) {
            (
                NodeIdentity::NodeId {
                    namespace_index,
                    identifier,
                },
                NodeQuery::NodeId {
                    namespace_index: q_idx,
                    identifier: q_id,
                },
            ) => namespace_index == q_idx && identifier.eq_ignore_ascii_case(q_id),

            (
                NodeIdentity::NodeId {
                    namespace_index,
                    identifier,
                },
                NodeQuery::ExpandedNodeId {
                    namespace_uri: q_uri,
                    identifier: q_id,
                },
            ) => match ns.uri_at(*namespace_index) {
                Some(uri) => uri.eq_ignore_ascii_case(q_uri) && identifier.eq_ignore_ascii_case(q_id),
                None => false,
            },

            (
                NodeIdentity::ExpandedNodeId {
                    namespace_uri,
                    identifier,
                    ..
                },
                NodeQuery::NodeId {
                    namespace_index: q_idx,
                    identifier: q_id,
                },
            ) => match ns.index_of(namespace_uri) {
                Some(idx) => idx == *q_idx && identifier.eq_ignore_ascii_case(q_id),
                None => false,
            },

            (
                NodeIdentity::ExpandedNodeId {
                    namespace_uri,
                    identifier,
                    ..
                },
                NodeQuery::ExpandedNodeId {
                    namespace_uri: q_uri,
                    identifier: q_id,
                },
            ) => namespace_uri.eq_ignore_ascii_case(q_uri) && identifier.eq_ignore_ascii_case(q_id),
        }
    }

    /// Effective NodeId string sent to the server, built from whichever
    /// form is currently held (resolved: `ns=<idx>;<identifier>`).
    pub fn effective_node_id(&self) -> Option<String> {
        match &self.identity {
            NodeIdentity::NodeId {
                namespace_index,
                identifier,
            } => Some(format!("ns={};{}", namespace_index, identifier)),
            NodeIdentity::ExpandedNodeId {
                namespace_index: Some(idx),
                identifier,
                ..
            } => Some(format!("ns={};{}", idx, identifier)),
            NodeIdentity::ExpandedNodeId {
                namespace_index: None,
                ..
            } => None,
        }
    }

    /// Encode a value-change notification into the wire envelope.
    /// Errors during encoding are the caller's
    /// responsibility to swallow (this function is infallible by
    /// construction: malformed inputs simply produce a best-effort
    /// envelope).
    pub fn on_notification(&self, value: RawDataValue, ctx: &NotificationContext) -> NotificationEnvelope {
        let application_uri = match &ctx.shopfloor_domain {
            Some(domain) if !domain.is_empty() => format!("{}:{}", ctx.application_uri, domain),
            _ => ctx.application_uri.clone(),
        };

        NotificationEnvelope {
            application_uri,
            display_name: self.display_name.clone(),
            node_id: self.identity.to_string(),
            value: EncodedDataValue {
                value: value.value,
                status_code: value.status_code,
                source_timestamp: value.source_timestamp,
                server_timestamp: EPOCH_SENTINEL.to_string(),
            },
        }
    }
}

/// RFC3339 "epoch-zero" sentinel, used to blank `ServerTimestamp` so
/// the envelope is deterministic regardless of what the server sent.
pub const EPOCH_SENTINEL: &str = "1970-01-01T00:00:00Z";

/// Per-session context `on_notification` needs but the item doesn't own.
pub struct NotificationContext {
    pub application_uri: String,
    pub shopfloor_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodedDataValue {
    #[serde(rename = "Value")]
    pub value: serde_json::Value,
    #[serde(rename = "StatusCode")]
    pub status_code: String,
    #[serde(rename = "SourceTimestamp", skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<String>,
    #[serde(rename = "ServerTimestamp")]
    pub server_timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEnvelope {
    #[serde(rename = "ApplicationUri")]
    pub application_uri: String,
    #[serde(rename = "DisplayName")]
    pub display_name: String,
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "Value")]
    pub value: EncodedDataValue,
}

impl NotificationEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("failed to encode notification envelope: {}", e);
            String::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> NamespaceTable {
        NamespaceTable::from_array(vec!["http://opcfoundation.org/UA/".to_string(), "urn:x".to_string()])
    }

    #[test]
    fn node_id_item_matches_equivalent_expanded_query() {
        let item = MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 1,
                identifier: "i=7".to_string(),
            },
            "opc.tcp://a".to_string(),
            1000.0,
        );

        let query = NodeQuery::ExpandedNodeId {
            namespace_uri: "URN:X",
            identifier: "I=7",
        };

        assert!(item.is_monitoring_this_node(&query, &table()));
    }

    #[test]
    fn expanded_item_matches_equivalent_node_id_query() {
        let item = MonitoredItem::new(
            NodeIdentity::ExpandedNodeId {
                namespace_uri: "urn:x".to_string(),
                identifier: "i=7".to_string(),
                namespace_index: None,
            },
            "opc.tcp://a".to_string(),
            1000.0,
        );

        let query = NodeQuery::NodeId {
            namespace_index: 1,
            identifier: "i=7",
        };

        assert!(item.is_monitoring_this_node(&query, &table()));
    }

    #[test]
    fn removal_requested_never_matches() {
        let mut item = MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 1,
                identifier: "i=7".to_string(),
            },
            "opc.tcp://a".to_string(),
            1000.0,
        );
        item.state = ItemState::RemovalRequested;

        let query = NodeQuery::NodeId {
            namespace_index: 1,
            identifier: "i=7",
        };
        assert!(!item.is_monitoring_this_node(&query, &table()));
    }

    #[test]
    fn notification_clears_server_timestamp() {
        let item = MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 1,
                identifier: "i=7".to_string(),
            },
            "opc.tcp://a".to_string(),
            1000.0,
        );
        let ctx = NotificationContext {
            application_uri: "urn:gateway".to_string(),
            shopfloor_domain: Some("line3".to_string()),
        };
        let raw = RawDataValue {
            value: serde_json::json!(42.0),
            status_code: "Good".to_string(),
            source_timestamp: Some("2024-01-01T00:00:00Z".to_string()),
            server_timestamp: Some("2024-01-01T00:00:05Z".to_string()),
        };

        let envelope = item.on_notification(raw, &ctx);
        assert_eq!(envelope.value.server_timestamp, EPOCH_SENTINEL);
        assert_eq!(envelope.application_uri, "urn:gateway:line3");
    }

    #[test]
    fn shopfloor_domain_omitted_when_empty() {
        let item = MonitoredItem::new(
            NodeIdentity::NodeId {
                namespace_index: 0,
                identifier: "i=1".to_string(),
            },
            "opc.tcp://a".to_string(),
            500.0,
        );
        let ctx = NotificationContext {
            application_uri: "urn:gateway".to_string(),
            shopfloor_domain: None,
        };
        let raw = RawDataValue {
            value: serde_json::json!(1),
            status_code: "Good".to_string(),
            source_timestamp: None,
            server_timestamp: None,
        };
        let envelope = item.on_notification(raw, &ctx);
        assert_eq!(envelope.application_uri, "urn:gateway");
    }
}
