use std::sync::Arc;

use tracing::*;

use crate::channel::ChannelId;
use crate::error::Result;
use crate::msgs::RouteAnnouncement;
use crate::node::Node;
use crate::peer::NodeId;
use crate::routing::{RouteMetadata, RoutingEntry};
use crate::transport::PeerApi;

/// Builds and relays route announcements.
///
/// Flooding has no duplicate suppression.  A relayed announcement is never
/// sent back to the peer it came from, and relaying stops once the hop count
/// reaches the flood horizon.
pub struct RoutePropagator {
    flood_horizon: u8,
}

impl RoutePropagator {
    /// Constructor
    pub fn new(flood_horizon: u8) -> Self {
        RoutePropagator { flood_horizon }
    }

    /// The announcement for a channel we just opened with `peer`
    pub fn announcement_for_open(
        &self,
        local: &NodeId,
        peer: &NodeId,
        channel_id: &ChannelId,
    ) -> RouteAnnouncement {
        RouteAnnouncement {
            origin: *local,
            destination: *peer,
            via_channel: *channel_id,
            sender: *local,
            hops: 0,
        }
    }

    /// Our known routes, as announcements for a newly connected peer.
    ///
    /// Routes that go through that peer are left out.
    pub fn replay(
        &self,
        local: &NodeId,
        new_peer: &NodeId,
        entries: &[RoutingEntry],
    ) -> Vec<RouteAnnouncement> {
        entries
            .iter()
            .filter(|e| e.next_hop != *new_peer && e.destination != *new_peer)
            .map(|e| RouteAnnouncement {
                origin: e.metadata.origin,
                destination: e.destination,
                via_channel: e.metadata.via_channel,
                sender: *local,
                hops: e.metadata.hops,
            })
            .collect()
    }

    /// Interpret a received announcement.
    ///
    /// Returns the entry to record, and the announcement to relay if the
    /// flood horizon allows it.  Announcements for ourselves are ignored.
    pub fn receive(
        &self,
        local: &NodeId,
        announcement: &RouteAnnouncement,
    ) -> Option<(RoutingEntry, Option<RouteAnnouncement>)> {
        if announcement.destination == *local || announcement.sender == *local {
            return None;
        }
        let hops = announcement.hops.saturating_add(1);
        let entry = RoutingEntry {
            destination: announcement.destination,
            next_hop: announcement.sender,
            metadata: RouteMetadata {
                origin: announcement.origin,
                via_channel: announcement.via_channel,
                hops,
            },
        };
        let relay = if hops < self.flood_horizon {
            Some(RouteAnnouncement { sender: *local, hops, ..announcement.clone() })
        } else {
            None
        };
        Some((entry, relay))
    }
}

impl Node {
    /// Persist a route, then make it visible in the routing table
    fn record_route(&self, entry: RoutingEntry) -> Result<()> {
        self.services.persister.update_route(&self.node_id, &entry)?;
        self.routing_table.record(entry.destination, entry.next_hop, entry.metadata);
        Ok(())
    }

    /// Record the direct route to a new channel peer, announce it to every
    /// peer, and teach the new peer the routes we already know.
    pub(crate) async fn on_channel_open(&self, peer: &NodeId, channel_id: &ChannelId) -> Result<()> {
        let metadata = RouteMetadata { origin: self.node_id, via_channel: *channel_id, hops: 0 };
        self.record_route(RoutingEntry { destination: *peer, next_hop: *peer, metadata })?;

        let announcement = self.propagator.announcement_for_open(&self.node_id, peer, channel_id);
        self.broadcast_announcement(announcement, None).await;

        let replay = self.propagator.replay(&self.node_id, peer, &self.routing_table.list());
        if !replay.is_empty() {
            match self.peer_api(peer).await {
                Ok(api) =>
                    for announcement in replay {
                        spawn_announce(*peer, Arc::clone(&api), announcement);
                    },
                Err(e) => warn!("cannot replay routes to {}: {}", peer, e),
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_announcement(&self, msg: RouteAnnouncement) -> Result<()> {
        let (entry, relay) = match self.propagator.receive(&self.node_id, &msg) {
            Some(r) => r,
            None => {
                debug!("ignoring announcement of {} from {}", msg.destination, msg.sender);
                return Ok(());
            }
        };
        debug!(
            "route to {} via {} ({} hops, origin {})",
            entry.destination, entry.next_hop, entry.metadata.hops, entry.metadata.origin
        );
        self.record_route(entry)?;
        if let Some(relay) = relay {
            self.broadcast_announcement(relay, Some(&msg.sender)).await;
        }
        Ok(())
    }

    /// Send an announcement to every peer except `except`, without waiting
    /// for delivery.
    async fn broadcast_announcement(&self, announcement: RouteAnnouncement, except: Option<&NodeId>) {
        for peer in self.peer_ids() {
            if Some(&peer) == except {
                continue;
            }
            match self.peer_api(&peer).await {
                Ok(api) => spawn_announce(peer, api, announcement.clone()),
                Err(e) => warn!("cannot announce to {}: {}", peer, e),
            }
        }
    }
}

fn spawn_announce(peer: NodeId, api: Arc<dyn PeerApi>, announcement: RouteAnnouncement) {
    tokio::spawn(async move {
        let destination = announcement.destination;
        if let Err(e) = api.announce(announcement).await {
            warn!("announcement of {} to {} failed: {}", destination, peer, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::*;
    use std::time::Duration;

    #[test_log::test]
    fn receive_builds_entry_and_relay_test() {
        let propagator = RoutePropagator::new(2);
        let (a, b, c, d) =
            (make_test_node_id(1), make_test_node_id(2), make_test_node_id(3), make_test_node_id(4));
        let via = ChannelId::new([1; 32]);

        let announcement = propagator.announcement_for_open(&a, &b, &via);
        let (entry, relay) = propagator.receive(&c, &announcement).unwrap();
        assert_eq!(entry.destination, b);
        assert_eq!(entry.next_hop, a);
        assert_eq!(entry.metadata.hops, 1);
        let relay = relay.unwrap();
        assert_eq!(relay.sender, c);
        assert_eq!(relay.hops, 1);

        let (entry, relay) = propagator.receive(&d, &relay).unwrap();
        assert_eq!(entry.next_hop, c);
        assert_eq!(entry.metadata.hops, 2);
        assert!(relay.is_none());

        // routes to ourselves are ignored
        assert!(propagator.receive(&b, &announcement).is_none());
    }

    #[test_log::test]
    fn replay_skips_routes_through_new_peer_test() {
        let propagator = RoutePropagator::new(8);
        let (a, b, c, d) =
            (make_test_node_id(1), make_test_node_id(2), make_test_node_id(3), make_test_node_id(4));
        let meta = |hops| RouteMetadata { origin: a, via_channel: ChannelId::new([hops; 32]), hops };
        let entries = vec![
            RoutingEntry { destination: b, next_hop: b, metadata: meta(0) },
            RoutingEntry { destination: c, next_hop: b, metadata: meta(1) },
            RoutingEntry { destination: d, next_hop: d, metadata: meta(0) },
        ];
        let replay = propagator.replay(&a, &b, &entries);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].destination, d);
        assert_eq!(replay[0].sender, a);
    }

    #[test_log::test(tokio::test)]
    async fn routes_flood_along_a_line_test() {
        let net = TestNetwork::new();
        let alice = net.add_node("alice", 0);
        let bob = net.add_node("bob", 0);
        let carol = net.add_node("carol", 0);
        let dave = net.add_node("dave", 0);
        alice.open(&bob.config().listen_addr, 1_000).await.unwrap();
        bob.open(&carol.config().listen_addr, 1_000).await.unwrap();
        carol.open(&dave.config().listen_addr, 1_000).await.unwrap();

        let (a, b, c, d) = (alice.get_id(), bob.get_id(), carol.get_id(), dave.get_id());
        let expected = [
            (&alice, d, b),
            (&alice, c, b),
            (&bob, d, c),
            (&dave, a, c),
            (&dave, b, c),
            (&carol, a, b),
        ];
        for (node, destination, next_hop) in expected {
            let found = wait_until(Duration::from_secs(2), || {
                node.routing_table().lookup(&destination).map(|e| e.next_hop == next_hop).unwrap_or(false)
            })
            .await;
            assert!(found, "{:?} has no route to {:?} via {:?}", node.get_id(), destination, next_hop);
        }
        assert!(alice.routing_table().lookup(&a).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn unpersisted_route_is_not_recorded_test() {
        let net = TestNetwork::new();
        let persister = Arc::new(FailingPersister::new());
        let carol = net.add_node_with_persister("carol", persister.clone(), |_| {});
        let (a, b) = (make_test_node_id(1), make_test_node_id(2));
        let announcement = RouteAnnouncement {
            origin: a,
            destination: b,
            via_channel: ChannelId::new([1; 32]),
            sender: a,
            hops: 0,
        };

        persister.set_failing(true);
        let res = carol.handle_announcement(announcement.clone()).await;
        assert!(matches!(res, Err(crate::Error::Persist(_))));
        assert!(carol.routing_table().lookup(&b).is_err());

        persister.set_failing(false);
        carol.handle_announcement(announcement).await.unwrap();
        assert_eq!(carol.routing_table().lookup(&b).unwrap().next_hop, a);
    }

    #[test_log::test(tokio::test)]
    async fn flood_horizon_bounds_relays_test() {
        let net = TestNetwork::new();
        let nodes: Vec<_> = (0..4)
            .map(|i| net.add_node_with(&format!("n{}", i), |config| {
                config.commitment_fee_sat = 0;
                config.flood_horizon = 1;
            }))
            .collect();
        nodes[0].open(&nodes[1].config().listen_addr, 1_000).await.unwrap();
        nodes[1].open(&nodes[2].config().listen_addr, 1_000).await.unwrap();
        nodes[2].open(&nodes[3].config().listen_addr, 1_000).await.unwrap();

        // one relay reaches neighbours of neighbours, but no further
        let found = wait_until(Duration::from_secs(2), || {
            nodes[0].routing_table().lookup(&nodes[2].get_id()).is_ok()
        })
        .await;
        assert!(found);
        settle().await;
        assert!(nodes[0].routing_table().lookup(&nodes[3].get_id()).is_err());
    }
}
