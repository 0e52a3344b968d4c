//! # feis-node: Results server: RocksDB, RPC, orchestration.
//!
//! Composes the Feis subsystems into a running results server:
//! - [`storage::RocksLedger`]: persistent score ledger backed by RocksDB
//! - [`node::Node`]: ingestion, tabulation, recall, and broadcast wiring
//! - [`rpc`]: JSON-RPC server for devices and displays
//! - [`config::NodeConfig`]: server configuration
//! - [`logging`]: tracing subscriber setup shared by the binaries

pub mod cache;
pub mod config;
pub mod logging;
pub mod node;
pub mod recall_store;
pub mod rpc;
pub mod storage;

pub use config::NodeConfig;
pub use node::Node;
pub use rpc::start_rpc_server;
pub use storage::RocksLedger;
