use core::fmt;
use core::future::Future;
use std::collections::BTreeMap as OrderedMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Network, Transaction, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::*;

use crate::channel::{BalanceSplit, Channel, ChannelId, ChannelStatus};
use crate::error::{protocol_violation, Error, Result};
use crate::ledger::{BroadcastStatus, Ledger};
use crate::msgs::*;
use crate::negotiator::PendingOpen;
use crate::peer::{NodeId, PeerAddr};
use crate::persist::Persist;
use crate::propagator::RoutePropagator;
use crate::routing::RoutingTable;
use crate::transport::{PeerApi, PeerConnector};
use crate::util::crypto_utils::{derive_funding_key, node_keys};

/// Default fee left to the ledger by commitments and settlements
pub const DEFAULT_COMMITMENT_FEE_SAT: u64 = 1_000;
/// Default deadline for one peer RPC
pub const DEFAULT_HOP_TIMEOUT_MS: u64 = 5_000;
/// Default maximum payment path length
pub const DEFAULT_MAX_HOPS: u8 = 20;
/// Default number of relays an announcement may travel
pub const DEFAULT_FLOOD_HORIZON: u8 = 8;
/// Default smallest channel accepted from a remote funder
pub const DEFAULT_MIN_CAPACITY_SAT: u64 = 1;
/// Default largest channel accepted from a remote funder
pub const DEFAULT_MAX_CAPACITY_SAT: u64 = (1 << 24) - 1;

/// Node configuration parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The network type
    pub network: Network,
    /// The address advertised to peers
    pub listen_addr: PeerAddr,
    /// Fee left to the ledger by every commitment and settlement we fund
    pub commitment_fee_sat: u64,
    /// Deadline for a single peer RPC, scaled by remaining hops when forwarding
    pub hop_timeout_ms: u64,
    /// Maximum payment path length
    pub max_hops: u8,
    /// Announcements are relayed while their hop count is below this
    pub flood_horizon: u8,
    /// Smallest channel accepted from a remote funder
    pub min_capacity_sat: u64,
    /// Largest channel accepted from a remote funder
    pub max_capacity_sat: u64,
}

impl NodeConfig {
    /// Default parameters for a node advertised at `listen_addr`
    pub fn new(network: Network, listen_addr: PeerAddr) -> Self {
        NodeConfig {
            network,
            listen_addr,
            commitment_fee_sat: DEFAULT_COMMITMENT_FEE_SAT,
            hop_timeout_ms: DEFAULT_HOP_TIMEOUT_MS,
            max_hops: DEFAULT_MAX_HOPS,
            flood_horizon: DEFAULT_FLOOD_HORIZON,
            min_capacity_sat: DEFAULT_MIN_CAPACITY_SAT,
            max_capacity_sat: DEFAULT_MAX_CAPACITY_SAT,
        }
    }

    /// Deadline for a single peer RPC
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }
}

/// Persisted node state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// The funding key index for the next channel
    pub next_key_index: u64,
}

/// Collaborators a node depends on
#[derive(Clone)]
pub struct NodeServices {
    /// Opens connections to peers
    pub connector: Arc<dyn PeerConnector>,
    /// The ledger and on-chain wallet
    pub ledger: Arc<dyn Ledger>,
    /// Durable storage
    pub persister: Arc<dyn Persist>,
}

/// A local view of one channel, for callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// The permanent channel id
    pub channel_id: ChannelId,
    /// The counterparty node
    pub peer: NodeId,
    /// Lifecycle status
    pub status: ChannelStatus,
    /// Whether we funded the anchor
    pub is_funder: bool,
    /// The escrowed amount
    pub capacity_sat: u64,
    /// Our balance
    pub local_sat: u64,
    /// The counterparty's balance
    pub remote_sat: u64,
    /// Number of the latest commitment
    pub commitment_number: u64,
}

impl From<&Channel> for ChannelSummary {
    fn from(chan: &Channel) -> Self {
        ChannelSummary {
            channel_id: chan.id,
            peer: chan.setup.peer,
            status: chan.status,
            is_funder: chan.setup.is_funder,
            capacity_sat: chan.setup.capacity_sat(),
            local_sat: chan.balance.local_sat,
            remote_sat: chan.balance.remote_sat,
            commitment_number: chan.commitment_number(),
        }
    }
}

pub(crate) struct PeerSlot {
    pub(crate) addr: PeerAddr,
    pub(crate) api: Option<Arc<dyn PeerApi>>,
}

/// A payment network node.
///
/// Owns a set of channels, each behind its own lock so that updates to one
/// channel are serialized while different channels proceed in parallel.
/// Talks to other nodes only through [`PeerApi`].
pub struct Node {
    pub(crate) secp_ctx: Secp256k1<All>,
    pub(crate) config: NodeConfig,
    node_secret: [u8; 32],
    pub(crate) node_id: NodeId,
    channels: Mutex<OrderedMap<ChannelId, Arc<AsyncMutex<Channel>>>>,
    pub(crate) pending_opens: Mutex<OrderedMap<ChannelId, PendingOpen>>,
    peers: Mutex<OrderedMap<NodeId, PeerSlot>>,
    pub(crate) routing_table: RoutingTable,
    pub(crate) propagator: RoutePropagator,
    state: Mutex<NodeState>,
    pub(crate) services: NodeServices,
}

impl Node {
    /// Create a node, restoring whatever the persister holds for its identity.
    pub fn new(
        config: NodeConfig,
        node_secret: [u8; 32],
        services: NodeServices,
    ) -> Result<Arc<Node>> {
        let secp_ctx = Secp256k1::new();
        let (_, node_pubkey) = node_keys(&secp_ctx, &node_secret)?;
        let node_id = NodeId(node_pubkey);
        let persister = &services.persister;

        let state = match persister.get_node(&node_id)? {
            Some(state) => state,
            None => {
                let state = NodeState::default();
                persister.new_node(&node_id, &state)?;
                state
            }
        };

        let mut channels = OrderedMap::new();
        let mut peers = OrderedMap::new();
        for channel in persister.get_node_channels(&node_id)? {
            peers.insert(
                channel.setup.peer,
                PeerSlot { addr: channel.setup.peer_addr.clone(), api: None },
            );
            channels.insert(channel.id, Arc::new(AsyncMutex::new(channel)));
        }
        let routes = persister.get_routes(&node_id)?;
        info!(
            "node {} at {}: restored {} channels, {} routes, key index {}",
            node_id,
            config.listen_addr,
            channels.len(),
            routes.len(),
            state.next_key_index
        );

        Ok(Arc::new(Node {
            secp_ctx,
            propagator: RoutePropagator::new(config.flood_horizon),
            config,
            node_secret,
            node_id,
            channels: Mutex::new(channels),
            pending_opens: Mutex::new(OrderedMap::new()),
            peers: Mutex::new(peers),
            routing_table: RoutingTable::restore(routes),
            state: Mutex::new(state),
            services,
        }))
    }

    /// The node's identity
    pub fn get_id(&self) -> NodeId {
        self.node_id
    }

    /// The node's configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The routing table
    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Handshake info
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id,
            addr: self.config.listen_addr.clone(),
            channels: self.channels().len() as u32,
        }
    }

    fn channels(&self) -> MutexGuard<OrderedMap<ChannelId, Arc<AsyncMutex<Channel>>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers(&self) -> MutexGuard<OrderedMap<NodeId, PeerSlot>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a channel given its id
    pub fn get_channel(&self, channel_id: &ChannelId) -> Result<Arc<AsyncMutex<Channel>>> {
        self.channels()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| Error::UnknownChannel(format!("no such channel: {}", channel_id)))
    }

    /// Ids of all known channels
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels().keys().cloned().collect()
    }

    /// A copy of a channel's current state
    pub async fn channel(&self, channel_id: &ChannelId) -> Result<Channel> {
        let slot = self.get_channel(channel_id)?;
        let chan = slot.lock().await;
        Ok(chan.clone())
    }

    /// Summaries of all known channels
    pub async fn list_channels(&self) -> Vec<ChannelSummary> {
        let slots: Vec<_> = self.channels().values().cloned().collect();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            summaries.push(ChannelSummary::from(&*slot.lock().await));
        }
        summaries
    }

    /// Current balances of a channel, from our perspective
    pub async fn balance(&self, channel_id: &ChannelId) -> Result<BalanceSplit> {
        Ok(self.channel(channel_id).await?.balance)
    }

    /// Our latest commitment with both signatures attached
    pub async fn commitment(&self, channel_id: &ChannelId) -> Result<Transaction> {
        self.channel(channel_id).await?.signed_holder_commitment(&self.secp_ctx)
    }

    pub(crate) fn insert_channel(&self, channel: Channel) -> Result<()> {
        let mut channels = self.channels();
        if channels.contains_key(&channel.id) {
            return Err(Error::InvalidState(format!("channel {} already exists", channel.id)));
        }
        self.services.persister.new_channel(&self.node_id, &channel)?;
        channels.insert(channel.id, Arc::new(AsyncMutex::new(channel)));
        Ok(())
    }

    pub(crate) fn persist_channel(&self, channel: &Channel) -> Result<()> {
        Ok(self.services.persister.update_channel(&self.node_id, channel)?)
    }

    pub(crate) fn funding_secret(&self, key_index: u64) -> Result<SecretKey> {
        Ok(derive_funding_key(&self.secp_ctx, &self.node_secret, key_index)?.0)
    }

    pub(crate) fn node_secret(&self) -> &[u8; 32] {
        &self.node_secret
    }

    /// Reserve a fresh funding key index, persisting the counter
    pub(crate) fn next_key_index(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let index = state.next_key_index;
        let next = NodeState { next_key_index: index + 1 };
        self.services.persister.update_node(&self.node_id, &next)?;
        *state = next;
        Ok(index)
    }

    /// Remember how to reach a peer
    pub(crate) fn register_peer(
        &self,
        peer: NodeId,
        addr: PeerAddr,
        api: Option<Arc<dyn PeerApi>>,
    ) {
        let mut peers = self.peers();
        let slot = peers.entry(peer).or_insert(PeerSlot { addr: addr.clone(), api: None });
        if slot.addr != addr {
            slot.addr = addr;
            slot.api = None;
        }
        if api.is_some() {
            slot.api = api;
        }
    }

    /// Ids of all peers we have negotiated with
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers().keys().cloned().collect()
    }

    /// A connection to a known peer, connecting if needed
    pub(crate) async fn peer_api(&self, peer: &NodeId) -> Result<Arc<dyn PeerApi>> {
        let addr = {
            let peers = self.peers();
            let slot = peers
                .get(peer)
                .ok_or_else(|| Error::NetworkFailure(format!("unknown peer {}", peer)))?;
            if let Some(api) = &slot.api {
                return Ok(Arc::clone(api));
            }
            slot.addr.clone()
        };
        let api = self.services.connector.connect(&addr).await?;
        if let Some(slot) = self.peers().get_mut(peer) {
            slot.api = Some(Arc::clone(&api));
        }
        Ok(api)
    }

    /// Await a peer call, failing with [`Error::ProtocolTimeout`] after `timeout`
    pub(crate) async fn timed<T>(
        &self,
        timeout: Duration,
        what: &str,
        peer: impl fmt::Display,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, call).await {
            Ok(res) => res,
            Err(_) => {
                warn!("{} to {} timed out after {:?}", what, peer, timeout);
                Err(Error::ProtocolTimeout(format!("{} to {} after {:?}", what, peer, timeout)))
            }
        }
    }

    /// Propose a new split, from our perspective, to the channel peer.
    #[instrument(skip(self))]
    pub async fn update(&self, channel_id: &ChannelId, split: BalanceSplit) -> Result<()> {
        let slot = self.get_channel(channel_id)?;
        let mut chan = slot.lock().await;
        self.update_locked(&mut chan, split).await
    }

    /// Pay `amount_sat` to the channel peer.  Returns the new balances.
    #[instrument(skip(self))]
    pub async fn pay(&self, channel_id: &ChannelId, amount_sat: u64) -> Result<BalanceSplit> {
        let slot = self.get_channel(channel_id)?;
        let mut chan = slot.lock().await;
        let split = chan.balance.pay(amount_sat)?;
        self.update_locked(&mut chan, split).await?;
        Ok(chan.balance)
    }

    async fn update_locked(&self, chan: &mut Channel, split: BalanceSplit) -> Result<()> {
        let secret = self.funding_secret(chan.setup.key_index)?;
        let pending = chan.propose_update(&self.secp_ctx, &secret, &split)?;
        let msg = UpdateBalance {
            channel_id: chan.id,
            from: self.node_id,
            commitment_number: pending.number,
            split,
            signature: pending.signature()?,
        };
        let peer = *chan.peer();
        let api = self.peer_api(&peer).await?;
        let ack =
            self.timed(self.config.hop_timeout(), "update_balance", &peer, api.update_balance(msg))
                .await?;
        if ack.channel_id != chan.id {
            return Err(protocol_violation(format!(
                "ack for channel {} while updating {}",
                ack.channel_id, chan.id
            )));
        }
        let mut updated = chan.clone();
        updated.complete_update(&self.secp_ctx, pending, ack.commitment_number, &ack.signature)?;
        self.persist_channel(&updated)?;
        *chan = updated;
        info!("channel {} updated to {:?} at {}", chan.id, chan.balance, chan.commitment_number());
        Ok(())
    }

    pub(crate) async fn handle_update_balance(&self, msg: UpdateBalance) -> Result<UpdateAck> {
        let slot = self.get_channel(&msg.channel_id)?;
        let mut chan = slot.lock().await;
        if *chan.peer() != msg.from {
            return Err(protocol_violation(format!(
                "update for channel {} from {}, not its peer",
                msg.channel_id, msg.from
            )));
        }
        let secret = self.funding_secret(chan.setup.key_index)?;
        let mut updated = chan.clone();
        let signature = updated.accept_update(
            &self.secp_ctx,
            &secret,
            msg.commitment_number,
            &msg.split,
            &msg.signature,
        )?;
        self.persist_channel(&updated)?;
        *chan = updated;
        info!(
            "channel {} accepted update to {:?} at {}",
            chan.id,
            chan.balance,
            chan.commitment_number()
        );
        Ok(UpdateAck { channel_id: chan.id, commitment_number: msg.commitment_number, signature })
    }

    /// Close a channel and return the id of the transaction spending its anchor.
    ///
    /// A cooperative close that fails because the peer is unreachable, slow,
    /// misbehaving or no longer has the channel open falls back to a
    /// unilateral close.
    #[instrument(skip(self))]
    pub async fn close(&self, channel_id: &ChannelId, mode: CloseMode) -> Result<Txid> {
        let slot = self.get_channel(channel_id)?;
        let mut chan = slot.lock().await;
        match mode {
            CloseMode::Cooperative => self.close_cooperative(&mut chan).await,
            CloseMode::Unilateral => self.close_unilateral(&mut chan).await,
        }
    }

    async fn close_cooperative(&self, chan: &mut Channel) -> Result<Txid> {
        let secret = self.funding_secret(chan.setup.key_index)?;
        let (tx, signature) = chan.propose_settlement(&self.secp_ctx, &secret)?;
        let was = chan.status;
        let mut closing = chan.clone();
        closing.mark_closing()?;
        self.persist_channel(&closing)?;
        *chan = closing;

        let peer = *chan.peer();
        let msg = CloseChannel { channel_id: chan.id, from: self.node_id, split: chan.balance, signature };
        let settled = match self.peer_api(&peer).await {
            Ok(api) =>
                self.timed(self.config.hop_timeout(), "close_channel", &peer, api.close_channel(msg))
                    .await
                    .and_then(|reply| {
                        chan.finalize_settlement(&self.secp_ctx, &tx, &signature, &reply.signature)
                    }),
            Err(e) => Err(e),
        };
        match settled {
            Ok(signed) => self.broadcast_close(chan, &signed).await,
            Err(e) if e.is_close_fallback() => {
                warn!("cooperative close of {} failed, closing unilaterally: {}", chan.id, e);
                self.close_unilateral(chan).await
            }
            Err(e) => {
                // nothing was countersigned, so the channel can go on
                warn!("cooperative close of {} failed, staying {}: {}", chan.id, was, e);
                let mut reopened = chan.clone();
                reopened.status = was;
                self.persist_channel(&reopened)?;
                *chan = reopened;
                Err(e)
            }
        }
    }

    async fn close_unilateral(&self, chan: &mut Channel) -> Result<Txid> {
        let tx = chan.signed_holder_commitment(&self.secp_ctx)?;
        let mut closing = chan.clone();
        closing.mark_closing()?;
        self.persist_channel(&closing)?;
        *chan = closing;
        info!(
            "channel {} closing unilaterally with commitment {} {:?}",
            chan.id,
            chan.commitment_number(),
            chan.holder_commitment.split
        );
        self.broadcast_close(chan, &tx).await
    }

    async fn broadcast_close(&self, chan: &mut Channel, tx: &Transaction) -> Result<Txid> {
        match self.services.ledger.broadcast(tx).await? {
            BroadcastStatus::Confirmed(txid) => {
                let mut closed = chan.clone();
                closed.mark_closed(Some(txid));
                self.persist_channel(&closed)?;
                *chan = closed;
                info!("channel {} closed by {}", chan.id, txid);
                Ok(txid)
            }
            BroadcastStatus::Rejected(reason) => {
                warn!("ledger rejected close of {}: {}", chan.id, reason);
                Err(Error::LedgerRejected(reason))
            }
        }
    }

    pub(crate) async fn handle_close_channel(&self, msg: CloseChannel) -> Result<ClosingSigned> {
        let slot = self.get_channel(&msg.channel_id)?;
        let mut chan = slot.lock().await;
        if *chan.peer() != msg.from {
            return Err(protocol_violation(format!(
                "close of channel {} from {}, not its peer",
                msg.channel_id, msg.from
            )));
        }
        let secret = self.funding_secret(chan.setup.key_index)?;
        let mut updated = chan.clone();
        let signature = updated.accept_settlement(&self.secp_ctx, &secret, &msg.split, &msg.signature)?;
        self.persist_channel(&updated)?;
        *chan = updated;
        info!("channel {} closed cooperatively by peer", chan.id);
        Ok(ClosingSigned { channel_id: chan.id, signature })
    }
}

#[async_trait]
impl PeerApi for Node {
    async fn get_info(&self) -> Result<NodeInfo> {
        Ok(self.info())
    }

    async fn open_channel(&self, msg: OpenChannel) -> Result<AcceptChannel> {
        self.handle_open_channel(msg).await
    }

    async fn funding_created(&self, msg: FundingCreated) -> Result<FundingSigned> {
        self.handle_funding_created(msg).await
    }

    async fn funding_locked(&self, msg: FundingLocked) -> Result<()> {
        self.handle_funding_locked(msg).await
    }

    async fn update_balance(&self, msg: UpdateBalance) -> Result<UpdateAck> {
        self.handle_update_balance(msg).await
    }

    async fn close_channel(&self, msg: CloseChannel) -> Result<ClosingSigned> {
        self.handle_close_channel(msg).await
    }

    async fn announce(&self, msg: RouteAnnouncement) -> Result<()> {
        self.handle_announcement(msg).await
    }

    async fn forward(&self, msg: ForwardPayment) -> Result<PaymentOutcome> {
        self.handle_forward(msg).await
    }
}
