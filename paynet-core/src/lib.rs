#![crate_name = "paynet"]

//! Micropayment channels between nodes sharing a ledger, with payments
//! forwarded hop by hop along flooded routes.
//! See [`node::Node`] for the entry point.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub use bitcoin;
pub use lightning;

/// The on-chain escrow
pub mod anchor;
/// Channel state machine
pub mod channel;
/// Commitment and settlement transactions
pub mod commitment;
/// Error kinds
pub mod error;
/// Multi-hop payment forwarding
pub mod forwarder;
/// The ledger and on-chain wallet
pub mod ledger;
/// Peer messages
#[allow(missing_docs)]
pub mod msgs;
/// Anchor negotiation
pub mod negotiator;
/// Node
pub mod node;
/// Peer identities and addresses
pub mod peer;
/// Persistence
pub mod persist;
/// Route announcements
pub mod propagator;
/// Routing table
pub mod routing;
/// Peer RPC surface
pub mod transport;
/// Various utilities
pub mod util;

pub use error::{Error, Result};
