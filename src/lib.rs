//! Library surface for the OPC UA cloud gateway, split out from the
//! binary entrypoint so integration tests (`tests/`) can drive the
//! reconciliation engine against `opcua::client::testing::FakeOpcClient`
//! without a live OPC UA server.

pub mod cli;
pub mod config;
pub mod egress;
pub mod opcua;
