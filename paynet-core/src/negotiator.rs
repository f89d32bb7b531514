use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;
use std::collections::BTreeMap as OrderedMap;
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::*;

use crate::anchor::{build_funding_transaction, find_anchor, Anchor};
use crate::channel::{Channel, ChannelId, ChannelSetup};
use crate::error::{internal_error, protocol_violation, Error, Result};
use crate::ledger::BroadcastStatus;
use crate::msgs::*;
use crate::node::Node;
use crate::peer::{NodeId, PeerAddr};
use crate::util::crypto_utils::{derive_funding_key, temporary_channel_id_bytes};

/// Negotiations one peer may have waiting for `funding_created`
pub const MAX_PENDING_OPENS_PER_PEER: usize = 8;
/// A waiting negotiation expires after this many hop timeouts
pub const PENDING_OPEN_TIMEOUT_FACTOR: u32 = 4;

/// A fundee's half of an anchor negotiation, waiting for `funding_created`
pub(crate) struct PendingOpen {
    created: Instant,
    peer: NodeId,
    peer_addr: PeerAddr,
    capacity_sat: u64,
    fee_sat: u64,
    key_index: u64,
    funding_pubkey: PublicKey,
    payout_script: ScriptBuf,
    counterparty_funding_pubkey: PublicKey,
    counterparty_payout_script: ScriptBuf,
}

fn rejected(stage: &str, e: Error) -> Error {
    match e {
        Error::NegotiationRejected(_) | Error::NetworkFailure(_) | Error::ProtocolTimeout(_) => e,
        e => Error::NegotiationRejected(format!("{}: {}", stage, e)),
    }
}

impl Node {
    fn pending_opens(&self) -> MutexGuard<OrderedMap<ChannelId, PendingOpen>> {
        self.pending_opens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_open_timeout(&self) -> Duration {
        self.config.hop_timeout() * PENDING_OPEN_TIMEOUT_FACTOR
    }

    /// Drop expired negotiations, then check that `msg` may start a new one
    fn admit_open(
        &self,
        pending_opens: &mut OrderedMap<ChannelId, PendingOpen>,
        msg: &OpenChannel,
    ) -> Result<()> {
        let timeout = self.pending_open_timeout();
        pending_opens.retain(|id, p| {
            let live = p.created.elapsed() < timeout;
            if !live {
                debug!("negotiation {} with {} expired", id, p.peer);
            }
            live
        });
        if pending_opens.contains_key(&msg.temporary_channel_id) {
            return Err(Error::NegotiationRejected(format!(
                "negotiation {} already in flight",
                msg.temporary_channel_id
            )));
        }
        let from_peer = pending_opens.values().filter(|p| p.peer == msg.from).count();
        if from_peer >= MAX_PENDING_OPENS_PER_PEER {
            return Err(Error::NegotiationRejected(format!(
                "{} already has {} negotiations in flight",
                msg.from, from_peer
            )));
        }
        Ok(())
    }

    /// Fund a channel of `capacity_sat` with the node at `peer_addr`.
    ///
    /// Negotiates the 2-of-2 anchor, exchanges signatures on both initial
    /// commitments, then broadcasts the funding transaction.  The channel is
    /// Open when this returns.  Negotiations with the same peer must be
    /// serialized by the caller.
    #[instrument(skip(self))]
    pub async fn open(&self, peer_addr: &PeerAddr, capacity_sat: u64) -> Result<ChannelId> {
        let fee_sat = self.config.commitment_fee_sat;
        if capacity_sat <= fee_sat {
            return Err(Error::NegotiationRejected(format!(
                "capacity {} does not cover the commitment fee {}",
                capacity_sat, fee_sat
            )));
        }
        let timeout = self.config.hop_timeout();
        let api = self.services.connector.connect(peer_addr).await?;
        let info = self.timed(timeout, "get_info", peer_addr, api.get_info()).await?;
        if info.node_id == self.node_id {
            return Err(Error::NegotiationRejected("cannot open a channel to ourselves".into()));
        }
        self.register_peer(info.node_id, peer_addr.clone(), Some(api.clone()));

        let key_index = self.next_key_index()?;
        let (funding_secret, funding_pubkey) =
            derive_funding_key(&self.secp_ctx, self.node_secret(), key_index)?;
        let payout_script = self.services.ledger.new_payout_script().await?;
        let temporary_channel_id =
            ChannelId::new(temporary_channel_id_bytes(self.node_secret(), key_index));
        debug!("opening {} with {} at {}", temporary_channel_id, info.node_id, peer_addr);

        let open = OpenChannel {
            temporary_channel_id,
            from: self.node_id,
            from_addr: self.config.listen_addr.clone(),
            capacity_sat,
            fee_sat,
            funding_pubkey,
            payout_script: payout_script.clone(),
        };
        let accept = self.timed(timeout, "open_channel", &info.node_id, api.open_channel(open)).await?;
        if accept.temporary_channel_id != temporary_channel_id {
            return Err(protocol_violation(format!(
                "accept for {} while opening {}",
                accept.temporary_channel_id, temporary_channel_id
            )));
        }

        let funding = self.services.ledger.fund(capacity_sat).await?;
        let res: Result<ChannelId> = async {
            let mut funding_tx =
                build_funding_transaction(&funding, capacity_sat, &funding_pubkey, &accept.funding_pubkey)?;
            self.services.ledger.sign_funding(&mut funding_tx).await?;
            let anchor = find_anchor(&funding_tx, capacity_sat, &funding_pubkey, &accept.funding_pubkey)?;

            let setup = ChannelSetup {
                peer: info.node_id,
                peer_addr: peer_addr.clone(),
                is_funder: true,
                anchor,
                fee_sat,
                key_index,
                funding_pubkey,
                counterparty_funding_pubkey: accept.funding_pubkey,
                payout_script,
                counterparty_payout_script: accept.payout_script,
            };
            let their_commitment = setup.builder(&self.secp_ctx).build_counterparty(
                0,
                &setup.initial_split(),
                &setup.keys(&funding_secret),
            )?;
            let signature = their_commitment
                .counterparty_sig
                .ok_or_else(|| internal_error("initial counterparty commitment unsigned"))?;
            let created = FundingCreated {
                temporary_channel_id,
                from: self.node_id,
                funding_outpoint: setup.anchor.outpoint,
                signature,
            };
            let signed =
                self.timed(timeout, "funding_created", &info.node_id, api.funding_created(created)).await?;
            if signed.channel_id != setup.anchor.channel_id() {
                return Err(protocol_violation(format!(
                    "funding_signed for {}, expected {}",
                    signed.channel_id,
                    setup.anchor.channel_id()
                )));
            }
            let (holder, counterparty) = setup
                .initial_commitments(&self.secp_ctx, &funding_secret, &signed.signature)
                .map_err(|e| rejected("funding_signed", e))?;
            let channel = Channel::new(setup, holder, counterparty);
            let channel_id = channel.id;
            self.insert_channel(channel)?;

            match self.services.ledger.broadcast(&funding_tx).await {
                Ok(BroadcastStatus::Confirmed(txid)) => {
                    info!("channel {} anchored by {}", channel_id, txid);
                    self.anchor_confirmed(&channel_id).await?;
                    Ok(channel_id)
                }
                Ok(BroadcastStatus::Rejected(reason)) => {
                    self.abandon(&channel_id).await?;
                    Err(Error::NegotiationRejected(format!("funding tx rejected: {}", reason)))
                }
                Err(e) => {
                    self.abandon(&channel_id).await?;
                    Err(rejected("broadcast", e))
                }
            }
        }
        .await;
        if res.is_err() {
            self.services.ledger.release(&funding);
        }
        res
    }

    async fn abandon(&self, channel_id: &ChannelId) -> Result<()> {
        let slot = self.get_channel(channel_id)?;
        let mut chan = slot.lock().await;
        let mut closed = chan.clone();
        closed.mark_closed(None);
        self.persist_channel(&closed)?;
        *chan = closed;
        warn!("channel {} abandoned before its anchor confirmed", channel_id);
        Ok(())
    }

    /// The anchor of a channel is confirmed on the ledger.
    ///
    /// Opens the channel and publishes the new route.  The funder also tells
    /// the peer with `funding_locked`, and calling this again on an Open
    /// channel repeats that notice.
    #[instrument(skip(self))]
    pub async fn anchor_confirmed(&self, channel_id: &ChannelId) -> Result<()> {
        let slot = self.get_channel(channel_id)?;
        let (peer, is_funder, opened) = {
            let mut chan = slot.lock().await;
            let mut updated = chan.clone();
            let opened = updated.mark_open()?;
            if opened {
                self.persist_channel(&updated)?;
                *chan = updated;
            }
            (*chan.peer(), chan.setup.is_funder, opened)
        };
        if is_funder {
            let locked = FundingLocked { channel_id: *channel_id, from: self.node_id };
            let res = match self.peer_api(&peer).await {
                Ok(api) =>
                    self.timed(self.config.hop_timeout(), "funding_locked", &peer, api.funding_locked(locked))
                        .await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!("peer {} did not take funding_locked for {}: {}", peer, channel_id, e);
            }
        }
        if opened {
            info!("channel {} with {} is open", channel_id, peer);
            self.on_channel_open(&peer, channel_id).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_open_channel(&self, msg: OpenChannel) -> Result<AcceptChannel> {
        if msg.from == self.node_id {
            return Err(Error::NegotiationRejected("cannot open a channel to ourselves".into()));
        }
        if msg.capacity_sat < self.config.min_capacity_sat
            || msg.capacity_sat > self.config.max_capacity_sat
        {
            return Err(Error::NegotiationRejected(format!(
                "capacity {} outside [{}, {}]",
                msg.capacity_sat, self.config.min_capacity_sat, self.config.max_capacity_sat
            )));
        }
        if msg.fee_sat >= msg.capacity_sat {
            return Err(Error::NegotiationRejected(format!(
                "fee {} leaves nothing of capacity {}",
                msg.fee_sat, msg.capacity_sat
            )));
        }
        self.admit_open(&mut self.pending_opens(), &msg)?;

        let key_index = self.next_key_index()?;
        let (_, funding_pubkey) = derive_funding_key(&self.secp_ctx, self.node_secret(), key_index)?;
        let payout_script = self.services.ledger.new_payout_script().await?;
        self.register_peer(msg.from, msg.from_addr.clone(), None);

        let accept = AcceptChannel {
            temporary_channel_id: msg.temporary_channel_id,
            funding_pubkey,
            payout_script: payout_script.clone(),
        };
        let mut pending_opens = self.pending_opens();
        self.admit_open(&mut pending_opens, &msg)?;
        let pending = PendingOpen {
            created: Instant::now(),
            peer: msg.from,
            peer_addr: msg.from_addr,
            capacity_sat: msg.capacity_sat,
            fee_sat: msg.fee_sat,
            key_index,
            funding_pubkey,
            payout_script,
            counterparty_funding_pubkey: msg.funding_pubkey,
            counterparty_payout_script: msg.payout_script,
        };
        pending_opens.insert(msg.temporary_channel_id, pending);
        debug!("accepted {} from {}", msg.temporary_channel_id, msg.from);
        Ok(accept)
    }

    pub(crate) async fn handle_funding_created(&self, msg: FundingCreated) -> Result<FundingSigned> {
        let pending = self.pending_opens().remove(&msg.temporary_channel_id).ok_or_else(|| {
            Error::NegotiationRejected(format!("unknown negotiation {}", msg.temporary_channel_id))
        })?;
        if pending.peer != msg.from {
            return Err(Error::NegotiationRejected(format!(
                "negotiation {} belongs to {}, not {}",
                msg.temporary_channel_id, pending.peer, msg.from
            )));
        }
        let anchor = Anchor::new(
            msg.funding_outpoint,
            pending.capacity_sat,
            &pending.funding_pubkey,
            &pending.counterparty_funding_pubkey,
        );
        let setup = ChannelSetup {
            peer: pending.peer,
            peer_addr: pending.peer_addr,
            is_funder: false,
            anchor,
            fee_sat: pending.fee_sat,
            key_index: pending.key_index,
            funding_pubkey: pending.funding_pubkey,
            counterparty_funding_pubkey: pending.counterparty_funding_pubkey,
            payout_script: pending.payout_script,
            counterparty_payout_script: pending.counterparty_payout_script,
        };
        let secret = self.funding_secret(setup.key_index)?;
        let (holder, counterparty) = setup
            .initial_commitments(&self.secp_ctx, &secret, &msg.signature)
            .map_err(|e| rejected("funding_created", e))?;
        let signature = counterparty
            .counterparty_sig
            .ok_or_else(|| internal_error("initial counterparty commitment unsigned"))?;
        let channel = Channel::new(setup, holder, counterparty);
        let channel_id = channel.id;
        self.insert_channel(channel)?;
        info!("channel {} with {} negotiated, waiting for anchor", channel_id, msg.from);
        Ok(FundingSigned { channel_id, signature })
    }

    pub(crate) async fn handle_funding_locked(&self, msg: FundingLocked) -> Result<()> {
        let slot = self.get_channel(&msg.channel_id)?;
        let opened = {
            let mut chan = slot.lock().await;
            if *chan.peer() != msg.from {
                return Err(protocol_violation(format!(
                    "funding_locked for {} from {}, not its peer",
                    msg.channel_id, msg.from
                )));
            }
            let mut updated = chan.clone();
            let opened = updated.mark_open()?;
            if opened {
                self.persist_channel(&updated)?;
                *chan = updated;
            }
            opened
        };
        if opened {
            info!("channel {} with {} is open", msg.channel_id, msg.from);
            self.on_channel_open(&msg.from, &msg.channel_id).await?;
        }
        Ok(())
    }
}
