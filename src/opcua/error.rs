//! Typed error enums for the reconciliation core.
//!
//! IO and client-library boundary errors stay `anyhow`-flavored (as the
//! teacher's own `opcua/client.rs` and `config/bookmarks.rs` use them);
//! these typed variants exist for the fault classification the
//! reconciliation loop and the config loader must branch on.

use thiserror::Error;

/// A fault surfaced by the OPC UA client collaborator while servicing
/// a subscription or monitored-item request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpcFault {
    #[error("session id is no longer valid")]
    BadSessionIdInvalid,
    #[error("node id is malformed")]
    BadNodeIdInvalid,
    #[error("node id is not known to the server")]
    BadNodeIdUnknown,
    #[error("service call failed: {0}")]
    Other(String),
}

/// Errors raised by `Session` operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("session has already been shut down")]
    SessionShutDown,
    #[error("global shutdown requested")]
    ShuttingDown,
    #[error("client error: {0}")]
    Client(#[from] OpcFault),
}

/// Errors raised while loading or persisting the node configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write configuration file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration entry for {endpoint} specifies both NodeId and OpcNodes")]
    AmbiguousEntry { endpoint: String },
}
