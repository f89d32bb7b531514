//! The paynet node daemon: configuration, logging, the JSON-RPC server and
//! client, and the bitcoind ledger.

#[cfg(feature = "main")]
pub mod config;
pub mod client;
pub mod ledger;
pub mod rpc_server;
pub mod util;
