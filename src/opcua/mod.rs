//! OPC-UA client module.
//!
//! Provides the connection/subscription collaborator boundary
//! (`client`), the reconciliation engine built on top of it
//! (`session`, `subscription`, `monitored_item`), the node identity and
//! namespace model (`identity`, `namespace`), and the PKI directory
//! setup the client needs before it can connect (`certificates`).

pub mod certificates;
pub mod client;
pub mod error;
pub mod identity;
pub mod monitored_item;
pub mod namespace;
pub mod registry;
pub mod session;
pub mod subscription;
