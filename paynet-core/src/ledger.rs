use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::anchor::FundingInputs;
use crate::error::Result;

/// Outcome of submitting a transaction to the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastStatus {
    /// The ledger accepted the transaction
    Confirmed(Txid),
    /// The ledger refused the transaction
    Rejected(String),
}

/// The underlying ledger and the node's on-chain wallet
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Select wallet coins covering `amount_sat`.
    ///
    /// The coins stay reserved until a transaction spending them is
    /// broadcast, or until they are handed back with [`Ledger::release`].
    async fn fund(&self, amount_sat: u64) -> Result<FundingInputs>;

    /// Return coins from an abandoned funding to the wallet
    fn release(&self, funding: &FundingInputs);

    /// Sign the wallet inputs of a funding transaction
    async fn sign_funding(&self, tx: &mut Transaction) -> Result<()>;

    /// A fresh script to receive channel payouts
    async fn new_payout_script(&self) -> Result<ScriptBuf>;

    /// Submit a fully signed transaction
    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastStatus>;
}
