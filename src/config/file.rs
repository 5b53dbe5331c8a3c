//! The persisted node configuration file.
//!
//! Entries use the PascalCase field names of the original publisher
//! config format so the file can be hand-edited or produced by the
//! same tooling that wrote the source's `publishednodes.json`.
//! `serde_json` preserves struct declaration order on serialization,
//! so round-tripping an entry through `write_config` doesn't reshuffle
//! its fields.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::opcua::error::ConfigError;
use crate::opcua::identity::NodeIdentity;
use crate::opcua::session::SessionSnapshot;

const DEFAULT_CONFIG_FILE_NAME: &str = "publishednodes.json";
const CONFIG_PATH_ENV_OVERRIDE: &str = "_GW_PNFP";

pub const DEFAULT_PUBLISHING_INTERVAL_MS: f64 = 1000.0;
pub const DEFAULT_SAMPLING_INTERVAL_MS: f64 = 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcNodeEntry {
    #[serde(rename = "ExpandedNodeId")]
    pub id: String,
    #[serde(rename = "OpcSamplingInterval", skip_serializing_if = "Option::is_none")]
    pub opc_sampling_interval: Option<f64>,
    #[serde(rename = "OpcPublishingInterval", skip_serializing_if = "Option::is_none")]
    pub opc_publishing_interval: Option<f64>,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointEntry {
    #[serde(rename = "EndpointUrl")]
    pub endpoint_url: String,
    /// Deprecated single-node shorthand. An entry naming both this and
    /// `OpcNodes` is a config error.
    #[serde(rename = "NodeId", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(rename = "OpcNodes", skip_serializing_if = "Option::is_none")]
    pub opc_nodes: Option<Vec<OpcNodeEntry>>,
}

/// One (node, interval) tuple resolved out of either entry shape,
/// ready to hand to `Session::add_node_for_monitoring`.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub identity: NodeIdentity,
    pub publishing_interval_ms: f64,
    pub sampling_interval_ms: f64,
}

#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub endpoint_url: String,
    pub nodes: Vec<ResolvedNode>,
}

/// Resolves the config file path: `_GW_PNFP` if set, else the default
/// relative `publishednodes.json`, matching the source's environment
/// override.
pub fn config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV_OVERRIDE)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE_NAME))
}

pub fn read_config(path: &Path) -> Result<Vec<ResolvedEndpoint>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;

    let entries: Vec<EndpointEntry> = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;

    entries.into_iter().map(resolve_entry).collect()
}

fn resolve_entry(entry: EndpointEntry) -> Result<ResolvedEndpoint, ConfigError> {
    if entry.node_id.is_some() && entry.opc_nodes.is_some() {
        return Err(ConfigError::AmbiguousEntry {
            endpoint: entry.endpoint_url,
        });
    }

    let mut nodes = Vec::new();

    if let Some(node_id) = entry.node_id {
        match NodeIdentity::parse(&node_id) {
            Some(identity) => nodes.push(ResolvedNode {
                identity,
                publishing_interval_ms: DEFAULT_PUBLISHING_INTERVAL_MS,
                sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            }),
            None => tracing::warn!(endpoint = %entry.endpoint_url, node_id, "unparseable legacy NodeId, skipping"),
        }
    }

    for node in entry.opc_nodes.into_iter().flatten() {
        match NodeIdentity::parse(&node.id) {
            Some(identity) => nodes.push(ResolvedNode {
                identity,
                publishing_interval_ms: node.opc_publishing_interval.unwrap_or(DEFAULT_PUBLISHING_INTERVAL_MS),
                sampling_interval_ms: node.opc_sampling_interval.unwrap_or(DEFAULT_SAMPLING_INTERVAL_MS),
            }),
            None => tracing::warn!(endpoint = %entry.endpoint_url, id = %node.id, "unparseable node id, skipping"),
        }
    }

    Ok(ResolvedEndpoint {
        endpoint_url: entry.endpoint_url,
        nodes,
    })
}

/// Writing in place can leave a truncated file behind if the process
/// is killed mid-write. This writes to a sibling `.tmp` file and
/// renames it over the target, which is atomic on the same filesystem.
pub fn write_config(path: &Path, endpoints: &[SessionSnapshot]) -> Result<(), ConfigError> {
    let entries: Vec<EndpointEntry> = endpoints
        .iter()
        .filter(|session| !session.subscriptions.iter().all(|sub| sub.items.is_empty()))
        .map(|session| EndpointEntry {
            endpoint_url: session.endpoint_uri.clone(),
            node_id: None,
            opc_nodes: Some(
                session
                    .subscriptions
                    .iter()
                    .flat_map(|sub| {
                        sub.items.iter().map(move |item| OpcNodeEntry {
                            id: item.identity.to_string(),
                            opc_sampling_interval: Some(item.sampling_interval_ms),
                            opc_publishing_interval: Some(sub.publishing_interval_ms),
                            display_name: None,
                        })
                    })
                    .collect(),
            ),
        })
        .collect();

    let json = serde_json::to_string_pretty(&entries).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ConfigError::Write {
        path: tmp_path.display().to_string(),
        source: e,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_opc_nodes_with_defaults() {
        let entry = EndpointEntry {
            endpoint_url: "opc.tcp://a".to_string(),
            node_id: None,
            opc_nodes: Some(vec![OpcNodeEntry {
                id: "ns=2;s=Temperature".to_string(),
                opc_sampling_interval: None,
                opc_publishing_interval: Some(5000.0),
                display_name: None,
            }]),
        };

        let resolved = resolve_entry(entry).unwrap();
        assert_eq!(resolved.nodes.len(), 1);
        assert_eq!(resolved.nodes[0].publishing_interval_ms, 5000.0);
        assert_eq!(resolved.nodes[0].sampling_interval_ms, DEFAULT_SAMPLING_INTERVAL_MS);
    }

    #[test]
    fn both_node_id_and_opc_nodes_is_an_error() {
        let entry = EndpointEntry {
            endpoint_url: "opc.tcp://a".to_string(),
            node_id: Some("ns=2;i=1".to_string()),
            opc_nodes: Some(vec![]),
        };
        assert!(matches!(resolve_entry(entry), Err(ConfigError::AmbiguousEntry { .. })));
    }

    #[test]
    fn legacy_node_id_resolves_with_default_intervals() {
        let entry = EndpointEntry {
            endpoint_url: "opc.tcp://a".to_string(),
            node_id: Some("ns=2;i=1".to_string()),
            opc_nodes: None,
        };
        let resolved = resolve_entry(entry).unwrap();
        assert_eq!(resolved.nodes.len(), 1);
        assert_eq!(resolved.nodes[0].publishing_interval_ms, DEFAULT_PUBLISHING_INTERVAL_MS);
    }
}
