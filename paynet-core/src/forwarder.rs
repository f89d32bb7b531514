use tracing::*;

use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::msgs::{ForwardPayment, PaymentOutcome};
use crate::node::Node;
use crate::peer::NodeId;

impl Node {
    /// Send `amount_sat` to `destination` through the routing table.
    ///
    /// Each hop pays the next over their shared channel and then asks it to
    /// continue.  A hop that fails downstream leaves every upstream payment
    /// in place, so a failed payment may still have moved funds.
    #[instrument(skip(self))]
    pub async fn forward(&self, destination: &NodeId, amount_sat: u64) -> Result<PaymentOutcome> {
        self.forward_payment(*destination, amount_sat, self.config.max_hops).await
    }

    pub(crate) async fn handle_forward(&self, msg: ForwardPayment) -> Result<PaymentOutcome> {
        debug!(
            "forward of {} to {} from {}, {} hops left",
            msg.amount_sat, msg.destination, msg.from, msg.hops_remaining
        );
        self.forward_payment(msg.destination, msg.amount_sat, msg.hops_remaining).await
    }

    async fn forward_payment(
        &self,
        destination: NodeId,
        amount_sat: u64,
        hops_remaining: u8,
    ) -> Result<PaymentOutcome> {
        if destination == self.node_id {
            info!("payment of {} delivered", amount_sat);
            return Ok(PaymentOutcome { destination, amount_sat, hops: 0 });
        }
        if amount_sat == 0 {
            return Err(Error::InvalidSplit("payment amount must be positive".into()));
        }
        if hops_remaining == 0 {
            return Err(Error::HopLimitExceeded(format!(
                "payment of {} to {} ran out of hops",
                amount_sat, destination
            )));
        }

        let route = self.routing_table.lookup(&destination)?;
        let next_hop = route.next_hop;
        let channel_id = self.channel_toward(&next_hop, amount_sat).await?;
        self.pay(&channel_id, amount_sat).await.map_err(|e| match e {
            Error::BalanceExceeded(m) => Error::InsufficientBalance(m),
            e => e,
        })?;

        let msg = ForwardPayment {
            destination,
            amount_sat,
            from: self.node_id,
            hops_remaining: hops_remaining - 1,
        };
        let timeout = self.config.hop_timeout() * u32::from(hops_remaining);
        let api = self.peer_api(&next_hop).await?;
        match self.timed(timeout, "forward", &next_hop, api.forward(msg)).await {
            Ok(outcome) => Ok(PaymentOutcome { hops: outcome.hops.saturating_add(1), ..outcome }),
            Err(e) => {
                warn!(
                    "payment of {} to {} failed beyond {}, {} already paid on {}: {}",
                    amount_sat, destination, next_hop, amount_sat, channel_id, e
                );
                Err(e)
            }
        }
    }

    /// An open channel with `peer` that can pay `amount_sat`
    async fn channel_toward(&self, peer: &NodeId, amount_sat: u64) -> Result<ChannelId> {
        let mut best_local_sat = None;
        for channel_id in self.channel_ids() {
            let chan = self.channel(&channel_id).await?;
            if chan.peer() != peer || !chan.is_open() {
                continue;
            }
            if chan.balance.local_sat >= amount_sat {
                return Ok(channel_id);
            }
            best_local_sat = best_local_sat.max(Some(chan.balance.local_sat));
        }
        Err(Error::InsufficientBalance(match best_local_sat {
            Some(local_sat) => format!(
                "best channel toward {} holds {}, payment needs {}",
                peer, local_sat, amount_sat
            ),
            None => format!("no open channel toward {}", peer),
        }))
    }
}
