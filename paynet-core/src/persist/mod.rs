use core::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelId};
use crate::node::NodeState;
use crate::peer::NodeId;
use crate::routing::RoutingEntry;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Error returned by persister
pub enum Error {
    /// Persister is temporarily unavailable, might work later
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    NotFound(String),
    /// Inconsistent state, resource already present
    AlreadyExists(String),
    /// A stored version is not the one expected
    VersionMismatch(String),
    /// Non-recoverable internal error
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which of the two latest commitment slots of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommitmentSide {
    /// Our own commitment, which we can broadcast
    Holder,
    /// The counterparty's commitment
    Counterparty,
}

impl CommitmentSide {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentSide::Holder => "holder",
            CommitmentSide::Counterparty => "counterparty",
        }
    }
}

/// Persister of node state, channels and routes
///
/// A Node calls the relevant methods here as it changes state, and before it
/// replies to a peer about the change.  Implementations should persist
/// durably before returning.
pub trait Persist: Send + Sync {
    /// Create the node state row.  Will error if exists.
    fn new_node(&self, node_id: &NodeId, state: &NodeState) -> Result<(), Error>;

    /// Update the node state row
    fn update_node(&self, node_id: &NodeId, state: &NodeState) -> Result<(), Error>;

    /// Get the node state, if the node was ever persisted
    fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeState>, Error>;

    /// Will error if exists
    fn new_channel(&self, node_id: &NodeId, channel: &Channel) -> Result<(), Error>;

    /// Replace a channel and both of its latest commitments.
    ///
    /// Must be atomic: after a crash either the old or the new channel row and
    /// commitment slots are visible, never a mix.  Will error if the channel
    /// doesn't exist.
    fn update_channel(&self, node_id: &NodeId, channel: &Channel) -> Result<(), Error>;

    /// Get a channel, with its commitments, from store
    fn get_channel(&self, node_id: &NodeId, channel_id: &ChannelId) -> Result<Channel, Error>;

    /// Get all channels for a node from store
    fn get_node_channels(&self, node_id: &NodeId) -> Result<Vec<Channel>, Error>;

    /// Upsert the routing entry for `entry.destination`
    fn update_route(&self, node_id: &NodeId, entry: &RoutingEntry) -> Result<(), Error>;

    /// Get all routing entries for a node
    fn get_routes(&self, node_id: &NodeId) -> Result<Vec<RoutingEntry>, Error>;

    /// Clears the database.  Not for production use.
    fn clear_database(&self) -> Result<(), Error>;
}

/// A null persister for testing
pub struct DummyPersister;

#[allow(unused_variables)]
impl Persist for DummyPersister {
    fn new_node(&self, node_id: &NodeId, state: &NodeState) -> Result<(), Error> {
        Ok(())
    }

    fn update_node(&self, node_id: &NodeId, state: &NodeState) -> Result<(), Error> {
        Ok(())
    }

    fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeState>, Error> {
        Ok(None)
    }

    fn new_channel(&self, node_id: &NodeId, channel: &Channel) -> Result<(), Error> {
        Ok(())
    }

    fn update_channel(&self, node_id: &NodeId, channel: &Channel) -> Result<(), Error> {
        Ok(())
    }

    fn get_channel(&self, node_id: &NodeId, channel_id: &ChannelId) -> Result<Channel, Error> {
        Err(Error::NotFound("get_channel unimplemented".into()))
    }

    fn get_node_channels(&self, node_id: &NodeId) -> Result<Vec<Channel>, Error> {
        Ok(Vec::new())
    }

    fn update_route(&self, node_id: &NodeId, entry: &RoutingEntry) -> Result<(), Error> {
        Ok(())
    }

    fn get_routes(&self, node_id: &NodeId) -> Result<Vec<RoutingEntry>, Error> {
        Ok(Vec::new())
    }

    fn clear_database(&self) -> Result<(), Error> {
        Ok(())
    }
}
