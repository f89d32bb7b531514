use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, All, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};

use crate::anchor::Anchor;
use crate::channel::BalanceSplit;
use crate::error::{internal_error, signature_mismatch, Error, Result};
use crate::util::crypto_utils::{sign_digest, verify_digest};

const SEQUENCE_TAG: u32 = 0x80 << 24;
const LOCKTIME_TAG: u32 = 0x20 << 24;
const LOWER_24: u64 = 0xFF_FFFF;

/// A signed candidate transaction paying out one balance split.
///
/// `split` is from the point of view of the commitment's owner. A node keeps
/// one for itself (owned by the holder, carrying both signatures) and one for
/// its counterparty (owned by the counterparty, carrying only the holder's
/// signature).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// The commitment number, starting at zero for the initial split
    pub number: u64,
    /// The split paid out, from the owner's perspective
    pub split: BalanceSplit,
    /// The unsigned transaction
    pub tx: Transaction,
    /// The owner's signature, if known
    pub owner_sig: Option<Signature>,
    /// The non-owner's signature, if known
    pub counterparty_sig: Option<Signature>,
}

impl Commitment {
    /// The txid of the commitment transaction
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// Sum of the output values
    pub fn output_sum_sat(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }

    /// Whether both signatures are present
    pub fn is_fully_signed(&self) -> bool {
        self.owner_sig.is_some() && self.counterparty_sig.is_some()
    }
}

/// Keys and payout scripts of both parties, from the holder's point of view
pub struct CommitmentKeys<'a> {
    /// The holder's funding secret
    pub funding_secret: &'a SecretKey,
    /// The holder's funding pubkey
    pub funding_pubkey: PublicKey,
    /// The counterparty's funding pubkey
    pub counterparty_funding_pubkey: PublicKey,
    /// Where the holder's balance is paid
    pub payout_script: &'a Script,
    /// Where the counterparty's balance is paid
    pub counterparty_payout_script: &'a Script,
}

/// Builds, signs and verifies the transactions spending an anchor.
///
/// The same split always yields the same transaction, so both parties can build
/// the other's commitment locally and only signatures need to be exchanged.
pub struct CommitmentBuilder<'a> {
    secp_ctx: &'a Secp256k1<All>,
    anchor: &'a Anchor,
    fee_sat: u64,
}

impl<'a> CommitmentBuilder<'a> {
    /// Constructor
    pub fn new(secp_ctx: &'a Secp256k1<All>, anchor: &'a Anchor, fee_sat: u64) -> Self {
        CommitmentBuilder { secp_ctx, anchor, fee_sat }
    }

    /// The amount the two balances must add up to
    pub fn spendable_sat(&self) -> Result<u64> {
        self.anchor.value_sat.checked_sub(self.fee_sat).ok_or_else(|| {
            Error::InvalidSplit(format!(
                "fee {} exceeds anchor value {}",
                self.fee_sat, self.anchor.value_sat
            ))
        })
    }

    /// Enforce that the split adds up to capacity minus fee
    pub fn check_split(&self, split: &BalanceSplit) -> Result<()> {
        let spendable = self.spendable_sat()?;
        match split.total_sat() {
            Some(total) if total == spendable => Ok(()),
            _ => Err(Error::InvalidSplit(format!(
                "{} + {} != {} (capacity {} - fee {})",
                split.local_sat,
                split.remote_sat,
                spendable,
                self.anchor.value_sat,
                self.fee_sat
            ))),
        }
    }

    /// The unsigned commitment transaction with the given number
    pub fn commitment_tx(
        &self,
        number: u64,
        split: &BalanceSplit,
        owner_script: &Script,
        other_script: &Script,
    ) -> Result<Transaction> {
        let sequence = Sequence(SEQUENCE_TAG | ((number >> 24) & LOWER_24) as u32);
        let lock_time = LockTime::from_consensus(LOCKTIME_TAG | (number & LOWER_24) as u32);
        self.payout_tx(split, owner_script, other_script, sequence, lock_time)
    }

    /// The unsigned cooperative close transaction
    pub fn settlement_tx(
        &self,
        split: &BalanceSplit,
        owner_script: &Script,
        other_script: &Script,
    ) -> Result<Transaction> {
        self.payout_tx(split, owner_script, other_script, Sequence::MAX, LockTime::ZERO)
    }

    fn payout_tx(
        &self,
        split: &BalanceSplit,
        owner_script: &Script,
        other_script: &Script,
        sequence: Sequence,
        lock_time: LockTime,
    ) -> Result<Transaction> {
        self.check_split(split)?;
        let mut output: Vec<TxOut> = [(split.local_sat, owner_script), (split.remote_sat, other_script)]
            .into_iter()
            .filter(|(value, _)| *value > 0)
            .map(|(value, script)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script.to_owned(),
            })
            .collect();
        output.sort_by(|a, b| {
            a.value.cmp(&b.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
        });
        Ok(Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: self.anchor.outpoint,
                script_sig: Default::default(),
                sequence,
                witness: Witness::new(),
            }],
            output,
        })
    }

    fn sighash(&self, tx: &Transaction) -> Result<[u8; 32]> {
        if tx.input.len() != 1 || tx.input[0].previous_output != self.anchor.outpoint {
            return Err(Error::InvalidSplit(format!(
                "tx {} does not spend anchor {}",
                tx.compute_txid(),
                self.anchor.outpoint
            )));
        }
        let sighash = SighashCache::new(tx)
            .p2wsh_signature_hash(
                0,
                &self.anchor.redeem_script,
                Amount::from_sat(self.anchor.value_sat),
                EcdsaSighashType::All,
            )
            .map_err(|e| internal_error(format!("sighash: {}", e)))?;
        Ok(sighash.to_byte_array())
    }

    /// Sign a transaction spending the anchor
    pub fn sign(&self, tx: &Transaction, secret: &SecretKey) -> Result<Signature> {
        Ok(sign_digest(self.secp_ctx, self.sighash(tx)?, secret))
    }

    /// Verify a signature on a transaction spending the anchor
    pub fn verify(&self, tx: &Transaction, sig: &Signature, pubkey: &PublicKey) -> Result<()> {
        if verify_digest(self.secp_ctx, self.sighash(tx)?, sig, pubkey) {
            Ok(())
        } else {
            Err(signature_mismatch(format!(
                "signature on {} does not verify for {}",
                tx.compute_txid(),
                pubkey
            )))
        }
    }

    /// Build the holder's commitment for `split`, signed by the holder
    pub fn build(
        &self,
        number: u64,
        split: &BalanceSplit,
        keys: &CommitmentKeys,
    ) -> Result<Commitment> {
        let tx =
            self.commitment_tx(number, split, keys.payout_script, keys.counterparty_payout_script)?;
        let sig = self.sign(&tx, keys.funding_secret)?;
        Ok(Commitment { number, split: *split, tx, owner_sig: Some(sig), counterparty_sig: None })
    }

    /// Build the counterparty's commitment for `split`, which is from the
    /// holder's perspective, and sign it as the non-owner
    pub fn build_counterparty(
        &self,
        number: u64,
        split: &BalanceSplit,
        keys: &CommitmentKeys,
    ) -> Result<Commitment> {
        let their_split = split.flipped();
        let tx = self.commitment_tx(
            number,
            &their_split,
            keys.counterparty_payout_script,
            keys.payout_script,
        )?;
        let sig = self.sign(&tx, keys.funding_secret)?;
        Ok(Commitment {
            number,
            split: their_split,
            tx,
            owner_sig: None,
            counterparty_sig: Some(sig),
        })
    }

    /// Attach the 2-of-2 witness, with signatures in redeem script key order
    pub fn finalize(
        &self,
        tx: &Transaction,
        first: (&PublicKey, &Signature),
        second: (&PublicKey, &Signature),
    ) -> Result<Transaction> {
        if !self.anchor.is_for_keys(first.0, second.0) {
            return Err(internal_error("finalize: keys do not match the anchor"));
        }
        let (a, b) =
            if first.0.serialize()[..] < second.0.serialize()[..] { (first, second) } else { (second, first) };
        let mut signed = tx.clone();
        let mut witness = Witness::new();
        witness.push(Vec::<u8>::new());
        witness.push(bitcoin::ecdsa::Signature::sighash_all(*a.1).to_vec());
        witness.push(bitcoin::ecdsa::Signature::sighash_all(*b.1).to_vec());
        witness.push(self.anchor.redeem_script.as_bytes());
        signed.input[0].witness = witness;
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_test_anchor, make_test_funding_key, make_test_payout_script};
    use test_log::test;

    struct Fixture {
        secp_ctx: Secp256k1<All>,
        anchor: Anchor,
        sk_a: SecretKey,
        pk_a: PublicKey,
        sk_b: SecretKey,
        pk_b: PublicKey,
    }

    fn fixture(capacity: u64) -> Fixture {
        let secp_ctx = Secp256k1::new();
        let (sk_a, pk_a) = make_test_funding_key(&secp_ctx, 1);
        let (sk_b, pk_b) = make_test_funding_key(&secp_ctx, 2);
        let anchor = make_test_anchor(capacity, &pk_a, &pk_b);
        Fixture { secp_ctx, anchor, sk_a, pk_a, sk_b, pk_b }
    }

    #[test]
    fn outputs_sum_to_capacity_minus_fee_test() {
        let f = fixture(100_000);
        let (script_a, script_b) = (make_test_payout_script(1), make_test_payout_script(2));
        let builder = CommitmentBuilder::new(&f.secp_ctx, &f.anchor, 1_000);
        let keys = CommitmentKeys {
            funding_secret: &f.sk_a,
            funding_pubkey: f.pk_a,
            counterparty_funding_pubkey: f.pk_b,
            payout_script: &script_a,
            counterparty_payout_script: &script_b,
        };
        for local in [0u64, 1, 500, 49_500, 98_999, 99_000] {
            let split = BalanceSplit::new(local, 99_000 - local);
            let commitment = builder.build(3, &split, &keys).unwrap();
            assert_eq!(commitment.output_sum_sat(), 99_000);
            assert!(commitment.tx.output.iter().all(|o| o.value.to_sat() > 0));
        }
    }

    #[test]
    fn bad_split_is_rejected_test() {
        let f = fixture(100_000);
        let (script_a, script_b) = (make_test_payout_script(1), make_test_payout_script(2));
        let builder = CommitmentBuilder::new(&f.secp_ctx, &f.anchor, 0);
        let res = builder.commitment_tx(1, &BalanceSplit::new(60_000, 40_001), &script_a, &script_b);
        assert!(matches!(res, Err(Error::InvalidSplit(_))));
        let res = builder.commitment_tx(1, &BalanceSplit::new(u64::MAX, 1), &script_a, &script_b);
        assert!(matches!(res, Err(Error::InvalidSplit(_))));

        let greedy = CommitmentBuilder::new(&f.secp_ctx, &f.anchor, 100_001);
        assert!(matches!(greedy.spendable_sat(), Err(Error::InvalidSplit(_))));
    }

    #[test]
    fn both_perspectives_build_the_same_tx_test() {
        let f = fixture(100_000);
        let (script_a, script_b) = (make_test_payout_script(1), make_test_payout_script(2));
        let builder = CommitmentBuilder::new(&f.secp_ctx, &f.anchor, 0);
        let keys_a = CommitmentKeys {
            funding_secret: &f.sk_a,
            funding_pubkey: f.pk_a,
            counterparty_funding_pubkey: f.pk_b,
            payout_script: &script_a,
            counterparty_payout_script: &script_b,
        };
        let keys_b = CommitmentKeys {
            funding_secret: &f.sk_b,
            funding_pubkey: f.pk_b,
            counterparty_funding_pubkey: f.pk_a,
            payout_script: &script_b,
            counterparty_payout_script: &script_a,
        };
        let split_a = BalanceSplit::new(70_000, 30_000);
        let holder_a = builder.build(1, &split_a, &keys_a).unwrap();
        let counterparty_b = builder.build_counterparty(1, &split_a.flipped(), &keys_b).unwrap();
        assert_eq!(holder_a.tx, counterparty_b.tx);
        assert_eq!(holder_a.split, counterparty_b.split);

        // B's signature, made while building A's commitment, verifies under B's key
        let sig_b = counterparty_b.counterparty_sig.unwrap();
        builder.verify(&holder_a.tx, &sig_b, &f.pk_b).unwrap();
        assert!(matches!(
            builder.verify(&holder_a.tx, &sig_b, &f.pk_a),
            Err(Error::SignatureMismatch(_))
        ));

        let signed = builder
            .finalize(&holder_a.tx, (&f.pk_a, &holder_a.owner_sig.unwrap()), (&f.pk_b, &sig_b))
            .unwrap();
        assert_eq!(signed.input[0].witness.len(), 4);
        assert_eq!(signed.compute_txid(), holder_a.txid());
    }

    #[test]
    fn commitment_number_is_encoded_test() {
        let f = fixture(10_000);
        let (script_a, script_b) = (make_test_payout_script(1), make_test_payout_script(2));
        let builder = CommitmentBuilder::new(&f.secp_ctx, &f.anchor, 0);
        let split = BalanceSplit::new(10_000, 0);
        let number = (5u64 << 24) | 7;
        let tx = builder.commitment_tx(number, &split, &script_a, &script_b).unwrap();
        assert_eq!(tx.input[0].sequence.0, 0x8000_0005);
        assert_eq!(tx.lock_time.to_consensus_u32(), 0x2000_0007);
        // zero-value outputs are omitted
        assert_eq!(tx.output.len(), 1);

        let settlement = builder.settlement_tx(&split, &script_a, &script_b).unwrap();
        assert_eq!(settlement.input[0].sequence, Sequence::MAX);
        assert_ne!(settlement.compute_txid(), tx.compute_txid());
    }
}
