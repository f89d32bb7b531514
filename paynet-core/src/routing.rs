use std::collections::BTreeMap as OrderedMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::peer::NodeId;

/// Where a route came from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMetadata {
    /// The node whose channel open created the route
    pub origin: NodeId,
    /// The channel whose open created the route
    pub via_channel: ChannelId,
    /// Number of relays between the origin and us
    pub hops: u8,
}

/// A route to one destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    /// The node to reach
    pub destination: NodeId,
    /// The peer to hand payments for `destination` to
    pub next_hop: NodeId,
    /// Path metadata
    pub metadata: RouteMetadata,
}

/// Map from destination to next hop.
///
/// At most one entry per destination.  Recording overwrites unconditionally,
/// so the last announcement to arrive wins regardless of path length.
/// Entries are never removed, even when the channel behind them closes.
pub struct RoutingTable {
    entries: Mutex<OrderedMap<NodeId, RoutingEntry>>,
}

impl RoutingTable {
    /// An empty table
    pub fn new() -> Self {
        RoutingTable { entries: Mutex::new(OrderedMap::new()) }
    }

    /// A table holding previously persisted entries
    pub fn restore(entries: Vec<RoutingEntry>) -> Self {
        let map = entries.into_iter().map(|e| (e.destination, e)).collect();
        RoutingTable { entries: Mutex::new(map) }
    }

    fn entries(&self) -> MutexGuard<OrderedMap<NodeId, RoutingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert the route to `destination`, returning the entry it replaced
    pub fn record(
        &self,
        destination: NodeId,
        next_hop: NodeId,
        metadata: RouteMetadata,
    ) -> Option<RoutingEntry> {
        let entry = RoutingEntry { destination, next_hop, metadata };
        self.entries().insert(destination, entry)
    }

    /// The route to `destination`
    pub fn lookup(&self, destination: &NodeId) -> Result<RoutingEntry> {
        self.entries()
            .get(destination)
            .cloned()
            .ok_or_else(|| Error::UnknownRoute(format!("no route to {}", destination)))
    }

    /// All routes, ordered by destination
    pub fn list(&self) -> Vec<RoutingEntry> {
        self.entries().values().cloned().collect()
    }

    /// Number of destinations known
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no destinations are known
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
