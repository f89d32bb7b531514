use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxIn, TxOut};
use lightning::ln::chan_utils::make_funding_redeemscript;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::{Error, Result};

/// The on-chain 2-of-2 escrow output funding a channel.
///
/// Fixed once the funding transaction is built; immutable until the channel
/// closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// The funding outpoint
    pub outpoint: OutPoint,
    /// The escrowed amount, which is the channel capacity
    pub value_sat: u64,
    /// The 2-of-2 multisig witness script
    pub redeem_script: ScriptBuf,
}

impl Anchor {
    /// Construct from the outpoint and both funding keys
    pub fn new(outpoint: OutPoint, value_sat: u64, pk_a: &PublicKey, pk_b: &PublicKey) -> Self {
        Anchor { outpoint, value_sat, redeem_script: make_funding_redeemscript(pk_a, pk_b) }
    }

    /// The P2WSH script pubkey of the escrow output
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.redeem_script.to_p2wsh()
    }

    /// The permanent channel id derived from the outpoint
    pub fn channel_id(&self) -> ChannelId {
        ChannelId::from_funding_outpoint(&self.outpoint)
    }

    /// Whether the funding key set of this anchor is exactly `{pk_a, pk_b}`
    pub fn is_for_keys(&self, pk_a: &PublicKey, pk_b: &PublicKey) -> bool {
        self.redeem_script == make_funding_redeemscript(pk_a, pk_b)
    }
}

/// Wallet inputs and change offered by the ledger for a funding transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInputs {
    /// Unsigned inputs spending wallet coins
    pub inputs: Vec<TxIn>,
    /// Change back to the wallet, if any
    pub change: Option<TxOut>,
}

/// Build the unsigned funding transaction, with the anchor at output 0.
pub fn build_funding_transaction(
    funding: &FundingInputs,
    value_sat: u64,
    pk_a: &PublicKey,
    pk_b: &PublicKey,
) -> Result<Transaction> {
    if funding.inputs.is_empty() {
        return Err(Error::LedgerRejected("ledger supplied no funding inputs".into()));
    }
    let redeem_script = make_funding_redeemscript(pk_a, pk_b);
    let mut output =
        vec![TxOut { value: Amount::from_sat(value_sat), script_pubkey: redeem_script.to_p2wsh() }];
    if let Some(change) = &funding.change {
        output.push(change.clone());
    }
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: funding.inputs.clone(),
        output,
    })
}

/// Locate the anchor in a funding transaction.
///
/// The output must pay exactly `value_sat` to the 2-of-2 of the given keys.
pub fn find_anchor(
    funding_tx: &Transaction,
    value_sat: u64,
    pk_a: &PublicKey,
    pk_b: &PublicKey,
) -> Result<Anchor> {
    let redeem_script = make_funding_redeemscript(pk_a, pk_b);
    let script_pubkey = redeem_script.to_p2wsh();
    let vout = funding_tx
        .output
        .iter()
        .position(|o| o.script_pubkey == script_pubkey && o.value.to_sat() == value_sat)
        .ok_or_else(|| {
            Error::NegotiationRejected(format!(
                "funding tx {} has no {} sat anchor output",
                funding_tx.compute_txid(),
                value_sat
            ))
        })?;
    let outpoint = OutPoint { txid: funding_tx.compute_txid(), vout: vout as u32 };
    Ok(Anchor { outpoint, value_sat, redeem_script })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_test_funding_inputs, make_test_pubkey};
    use test_log::test;

    #[test]
    fn funding_transaction_places_anchor_first_test() {
        let (pk_a, pk_b) = (make_test_pubkey(1), make_test_pubkey(2));
        let funding = make_test_funding_inputs(1, 150_000, Some(40_000));
        let tx = build_funding_transaction(&funding, 100_000, &pk_a, &pk_b).unwrap();
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value.to_sat(), 100_000);

        let anchor = find_anchor(&tx, 100_000, &pk_b, &pk_a).unwrap();
        assert_eq!(anchor.outpoint.vout, 0);
        assert_eq!(anchor.script_pubkey(), tx.output[0].script_pubkey);
        assert!(anchor.is_for_keys(&pk_a, &pk_b));
        assert!(anchor.is_for_keys(&pk_b, &pk_a));
        assert!(!anchor.is_for_keys(&pk_a, &make_test_pubkey(3)));
    }

    #[test]
    fn missing_anchor_is_rejected_test() {
        let (pk_a, pk_b) = (make_test_pubkey(1), make_test_pubkey(2));
        let funding = make_test_funding_inputs(1, 150_000, None);
        let tx = build_funding_transaction(&funding, 100_000, &pk_a, &pk_b).unwrap();
        assert!(matches!(
            find_anchor(&tx, 99_000, &pk_a, &pk_b),
            Err(Error::NegotiationRejected(_))
        ));
        let empty = FundingInputs { inputs: vec![], change: None };
        assert!(matches!(
            build_funding_transaction(&empty, 100_000, &pk_a, &pk_b),
            Err(Error::LedgerRejected(_))
        ));
    }
}
