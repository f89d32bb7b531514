use jsonrpsee::core::traits::ToRpcParams;
use paynet::bitcoin::Txid;
use paynet::channel::ChannelId;
use paynet::msgs::CloseMode;
use paynet::peer::{NodeId, PeerAddr};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Send `T` as a by-name parameter object
pub struct Named<T>(pub T);

impl<T: Serialize> ToRpcParams for Named<T> {
    fn to_rpc_params(self) -> Result<Option<Box<RawValue>>, serde_json::Error> {
        serde_json::value::to_raw_value(&self.0).map(Some)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpenRequest {
    pub peer_addr: PeerAddr,
    pub capacity_sat: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenResponse {
    pub channel_id: ChannelId,
}

/// Amounts are signed so that a negative side is reported as a balance error
/// rather than a parse error
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateRequest {
    pub channel_id: ChannelId,
    pub local_sat: i64,
    pub remote_sat: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PayRequest {
    pub channel_id: ChannelId,
    pub amount_sat: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CloseRequest {
    pub channel_id: ChannelId,
    pub mode: CloseMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CloseResponse {
    pub settlement_txid: Txid,
}

/// A local payment when `from` is absent, a hop-to-hop forward otherwise
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ForwardRequest {
    pub destination: NodeId,
    pub amount_sat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops_remaining: Option<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChannelRequest {
    pub channel_id: ChannelId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitmentResponse {
    pub txid: Txid,
    /// consensus encoded, hex
    pub tx: String,
}
