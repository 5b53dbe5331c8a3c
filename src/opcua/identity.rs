//! Node identity: the tagged variant replacing the source's nullable
//! `NodeId` / `ExpandedNodeId` pair, so a namespace-resolved identity
//! and a namespace-pending one can't be represented at the same time.

use std::fmt;

/// A node's configured identity, in whichever of the two OPC UA forms
/// the operator supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentity {
    /// `(namespaceIndex, identifier)`, only meaningful within one server.
    NodeId { namespace_index: u16, identifier: String },
    /// `(namespaceUri, identifier[, namespaceIndex])`, portable across
    /// servers. `namespace_index` is `None` until reconciliation resolves
    /// it for the owning session.
    ExpandedNodeId {
        namespace_uri: String,
        identifier: String,
        namespace_index: Option<u16>,
    },
}

impl NodeIdentity {
    pub fn is_expanded(&self) -> bool {
        matches!(self, NodeIdentity::ExpandedNodeId { .. })
    }

    /// The identifier fragment, e.g. `"i=42"` or `"s=Temperature"`.
    pub fn identifier(&self) -> &str {
        match self {
            NodeIdentity::NodeId { identifier, .. } => identifier,
            NodeIdentity::ExpandedNodeId { identifier, .. } => identifier,
        }
    }

    /// Downgrades an `ExpandedNodeId` to the bare `NodeId` form by
    /// resolving its namespace URI through `index`, if it can be
    /// resolved. A `NodeId` is returned unchanged; an unresolvable
    /// `ExpandedNodeId` (index not found) is also returned unchanged.
    pub fn to_node_id_form(&self, index: Option<u16>) -> NodeIdentity {
        match self {
            NodeIdentity::NodeId { .. } => self.clone(),
            NodeIdentity::ExpandedNodeId { identifier, namespace_index, .. } => {
                match index.or(*namespace_index) {
                    Some(namespace_index) => NodeIdentity::NodeId {
                        namespace_index,
                        identifier: identifier.clone(),
                    },
                    None => self.clone(),
                }
            }
        }
    }

    /// Parse the config-file string form: `"ns=2;i=42"` or
    /// `"nsu=urn:x;i=7"`. A bare identifier with no `ns=`/`nsu=` prefix
    /// is treated as namespace index 0, matching the OPC UA convention.
    pub fn parse(s: &str) -> Option<NodeIdentity> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("nsu=") {
            let (uri, identifier) = rest.split_once(';')?;
            return Some(NodeIdentity::ExpandedNodeId {
                namespace_uri: uri.to_string(),
                identifier: identifier.to_string(),
                namespace_index: None,
            });
        }
        if let Some(rest) = s.strip_prefix("ns=") {
            let (ns, identifier) = rest.split_once(';')?;
            let namespace_index: u16 = ns.parse().ok()?;
            return Some(NodeIdentity::NodeId {
                namespace_index,
                identifier: identifier.to_string(),
            });
        }
        if s.is_empty() {
            return None;
        }
        Some(NodeIdentity::NodeId {
            namespace_index: 0,
            identifier: s.to_string(),
        })
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeIdentity::NodeId {
                namespace_index,
                identifier,
            } => write!(f, "ns={};{}", namespace_index, identifier),
            NodeIdentity::ExpandedNodeId {
                namespace_uri,
                identifier,
                ..
            } => write!(f, "nsu={};{}", namespace_uri, identifier),
        }
    }
}

/// A lookup query used by `MonitoredItem::is_monitoring_this_node` and by
/// `Session::request_monitor_item_removal` / `is_node_published`. Mirrors
/// `NodeIdentity`'s two forms but borrows rather than owns.
#[derive(Debug, Clone, Copy)]
pub enum NodeQuery<'a> {
    NodeId {
        namespace_index: u16,
        identifier: &'a str,
    },
    ExpandedNodeId {
        namespace_uri: &'a str,
        identifier: &'a str,
    },
}

impl<'a> NodeQuery<'a> {
    pub fn from_identity(identity: &'a NodeIdentity) -> Self {
        match identity {
            NodeIdentity::NodeId {
                namespace_index,
                identifier,
            } => NodeQuery::NodeId {
                namespace_index: *namespace_index,
                identifier,
            },
            NodeIdentity::ExpandedNodeId {
                namespace_uri,
                identifier,
                ..
            } => NodeQuery::ExpandedNodeId {
                namespace_uri,
                identifier,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_id_form() {
        let id = NodeIdentity::parse("ns=2;s=Temperature").unwrap();
        assert_eq!(
            id,
            NodeIdentity::NodeId {
                namespace_index: 2,
                identifier: "s=Temperature".to_string()
            }
        );
    }

    #[test]
    fn parses_expanded_node_id_form() {
        let id = NodeIdentity::parse("nsu=urn:x;i=7").unwrap();
        assert_eq!(
            id,
            NodeIdentity::ExpandedNodeId {
                namespace_uri: "urn:x".to_string(),
                identifier: "i=7".to_string(),
                namespace_index: None,
            }
        );
    }

    #[test]
    fn bare_identifier_defaults_to_namespace_zero() {
        let id = NodeIdentity::parse("i=42").unwrap();
        assert_eq!(
            id,
            NodeIdentity::NodeId {
                namespace_index: 0,
                identifier: "i=42".to_string()
            }
        );
    }

    #[test]
    fn to_node_id_form_downgrades_resolved_expanded_id() {
        let id = NodeIdentity::ExpandedNodeId {
            namespace_uri: "urn:x".to_string(),
            identifier: "i=7".to_string(),
            namespace_index: None,
        };
        assert_eq!(
            id.to_node_id_form(Some(3)),
            NodeIdentity::NodeId {
                namespace_index: 3,
                identifier: "i=7".to_string(),
            }
        );
    }

    #[test]
    fn to_node_id_form_leaves_unresolvable_expanded_id_unchanged() {
        let id = NodeIdentity::ExpandedNodeId {
            namespace_uri: "urn:x".to_string(),
            identifier: "i=7".to_string(),
            namespace_index: None,
        };
        assert_eq!(id.to_node_id_form(None), id);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let id = NodeIdentity::parse("ns=3;s=Foo").unwrap();
        assert_eq!(NodeIdentity::parse(&id.to_string()).unwrap(), id);
    }
}
