use paynet::bitcoin::consensus::{deserialize, serialize};
use paynet::bitcoin::secp256k1::ecdsa::Signature;
use paynet::bitcoin::Txid;
use paynet::channel::{BalanceSplit, Channel, ChannelId, ChannelSetup, ChannelStatus};
use paynet::commitment::Commitment;
use paynet::node::NodeState;
use paynet::persist::Error;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::{hex::Hex, Bytes, IfIsHumanReadable};

#[derive(Serialize, Deserialize)]
pub struct NodeStateEntry {
    pub next_key_index: u64,
}

impl From<&NodeState> for NodeStateEntry {
    fn from(state: &NodeState) -> Self {
        NodeStateEntry { next_key_index: state.next_key_index }
    }
}

impl From<NodeStateEntry> for NodeState {
    fn from(entry: NodeStateEntry) -> Self {
        NodeState { next_key_index: entry.next_key_index }
    }
}

/// A channel row.  Its two latest commitments live in their own slots.
#[derive(Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: ChannelId,
    pub setup: ChannelSetup,
    pub status: ChannelStatus,
    pub balance: BalanceSplit,
    #[serde(default)]
    pub settlement_txid: Option<Txid>,
}

impl From<&Channel> for ChannelEntry {
    fn from(channel: &Channel) -> Self {
        ChannelEntry {
            id: channel.id,
            setup: channel.setup.clone(),
            status: channel.status,
            balance: channel.balance,
            settlement_txid: channel.settlement_txid,
        }
    }
}

impl ChannelEntry {
    pub fn into_channel(self, holder: Commitment, counterparty: Commitment) -> Channel {
        Channel {
            id: self.id,
            setup: self.setup,
            status: self.status,
            balance: self.balance,
            holder_commitment: holder,
            counterparty_commitment: counterparty,
            settlement_txid: self.settlement_txid,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct CommitmentEntry {
    pub number: u64,
    pub split: BalanceSplit,
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub tx: Vec<u8>,
    pub owner_sig: Option<Signature>,
    pub counterparty_sig: Option<Signature>,
}

impl From<&Commitment> for CommitmentEntry {
    fn from(commitment: &Commitment) -> Self {
        CommitmentEntry {
            number: commitment.number,
            split: commitment.split,
            tx: serialize(&commitment.tx),
            owner_sig: commitment.owner_sig,
            counterparty_sig: commitment.counterparty_sig,
        }
    }
}

impl TryFrom<CommitmentEntry> for Commitment {
    type Error = Error;

    fn try_from(entry: CommitmentEntry) -> Result<Self, Error> {
        let tx = deserialize(&entry.tx)
            .map_err(|e| Error::Internal(format!("bad commitment {} tx: {}", entry.number, e)))?;
        Ok(Commitment {
            number: entry.number,
            split: entry.split,
            tx,
            owner_sig: entry.owner_sig,
            counterparty_sig: entry.counterparty_sig,
        })
    }
}
