//! Messages exchanged between peers.
//!
//! Every request names its sender. Splits are always expressed from the
//! sender's perspective and are flipped by the receiver.

use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use bitcoin::{OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::channel::{BalanceSplit, ChannelId};
use crate::peer::{NodeId, PeerAddr};

/// Answer to the `get_info` handshake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node's identity
    pub node_id: NodeId,
    /// Where the node can be reached
    pub addr: PeerAddr,
    /// Number of channels the node knows about
    pub channels: u32,
}

/// First step of anchor negotiation, sent by the funder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub temporary_channel_id: ChannelId,
    pub from: NodeId,
    pub from_addr: PeerAddr,
    pub capacity_sat: u64,
    pub fee_sat: u64,
    pub funding_pubkey: PublicKey,
    pub payout_script: ScriptBuf,
}

/// The fundee's half of the 2-of-2
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptChannel {
    pub temporary_channel_id: ChannelId,
    pub funding_pubkey: PublicKey,
    pub payout_script: ScriptBuf,
}

/// The anchor outpoint, and the funder's signature on the fundee's initial
/// commitment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingCreated {
    pub temporary_channel_id: ChannelId,
    pub from: NodeId,
    pub funding_outpoint: OutPoint,
    pub signature: Signature,
}

/// The fundee's signature on the funder's initial commitment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingSigned {
    pub channel_id: ChannelId,
    pub signature: Signature,
}

/// The anchor is confirmed, the channel can be opened
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingLocked {
    pub channel_id: ChannelId,
    pub from: NodeId,
}

/// A balance update proposal with the proposer's signature on the
/// receiver's new commitment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBalance {
    pub channel_id: ChannelId,
    pub from: NodeId,
    pub commitment_number: u64,
    pub split: BalanceSplit,
    pub signature: Signature,
}

/// The receiver's signature on the proposer's new commitment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub channel_id: ChannelId,
    pub commitment_number: u64,
    pub signature: Signature,
}

/// Cooperative close proposal with the initiator's signature on the settlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
    pub from: NodeId,
    pub split: BalanceSplit,
    pub signature: Signature,
}

/// The receiver's signature on the settlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingSigned {
    pub channel_id: ChannelId,
    pub signature: Signature,
}

/// `destination` can be reached through `sender`.
///
/// `origin` is the node whose channel open created the route and
/// `via_channel` is that channel. `hops` counts relays so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAnnouncement {
    pub origin: NodeId,
    pub destination: NodeId,
    pub via_channel: ChannelId,
    pub sender: NodeId,
    pub hops: u8,
}

/// Hop-to-hop payment forwarding request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPayment {
    pub destination: NodeId,
    pub amount_sat: u64,
    pub from: NodeId,
    pub hops_remaining: u8,
}

/// The outcome of a delivered payment, as observed by one hop
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub destination: NodeId,
    pub amount_sat: u64,
    /// Number of hops from the observing node to the destination
    pub hops: u8,
}

/// How to close a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseMode {
    /// Both parties sign a settlement
    Cooperative,
    /// Broadcast our latest commitment
    Unilateral,
}

impl core::str::FromStr for CloseMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cooperative" => Ok(CloseMode::Cooperative),
            "unilateral" => Ok(CloseMode::Unilateral),
            _ => Err(crate::Error::InvalidState(format!("unknown close mode {}", s))),
        }
    }
}
