use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::msgs::*;
use crate::peer::PeerAddr;

/// The peer-to-peer RPC surface of a node.
///
/// Implemented by [`crate::node::Node`] for incoming calls, and by transport
/// clients for outgoing calls.  Errors returned by the remote node arrive as
/// the same [`crate::Error`] variant that the remote raised.
#[async_trait]
pub trait PeerApi: Send + Sync {
    /// Handshake
    async fn get_info(&self) -> Result<NodeInfo>;

    /// Anchor negotiation, first round
    async fn open_channel(&self, msg: OpenChannel) -> Result<AcceptChannel>;

    /// Anchor negotiation, second round
    async fn funding_created(&self, msg: FundingCreated) -> Result<FundingSigned>;

    /// The anchor confirmed
    async fn funding_locked(&self, msg: FundingLocked) -> Result<()>;

    /// Balance update
    async fn update_balance(&self, msg: UpdateBalance) -> Result<UpdateAck>;

    /// Cooperative close
    async fn close_channel(&self, msg: CloseChannel) -> Result<ClosingSigned>;

    /// Route announcement.  The caller does not wait for relaying.
    async fn announce(&self, msg: RouteAnnouncement) -> Result<()>;

    /// Hop-to-hop payment forwarding
    async fn forward(&self, msg: ForwardPayment) -> Result<PaymentOutcome>;
}

/// Opens connections to peers by address
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Connect to the node listening at `addr`
    async fn connect(&self, addr: &PeerAddr) -> Result<Arc<dyn PeerApi>>;
}
