use core::fmt::{self, Debug, Formatter};
use core::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes, IfIsHumanReadable};
use serde_with::hex::Hex;
use tracing::*;

use crate::anchor::Anchor;
use crate::commitment::{Commitment, CommitmentBuilder, CommitmentKeys};
use crate::error::{protocol_violation, Error, Result};
use crate::peer::{NodeId, PeerAddr};

/// Channel identifier
///
/// Before the anchor exists a channel is known by a temporary id. Once the
/// funding outpoint is fixed the id is the outpoint's txid with the output
/// index XORed into the last two bytes.
#[serde_as]
#[derive(PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] [u8; 32]);

impl ChannelId {
    /// Create an ID
    pub fn new(inner: [u8; 32]) -> Self {
        Self(inner)
    }

    /// The permanent id of the channel funded by `outpoint`
    pub fn from_funding_outpoint(outpoint: &OutPoint) -> Self {
        let mut bytes = outpoint.txid.to_byte_array();
        bytes[30] ^= (outpoint.vout >> 8) as u8;
        bytes[31] ^= outpoint.vout as u8;
        Self(bytes)
    }

    /// Convert to a byte slice
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::UnknownChannel(format!("{}: {}", s, e)))?;
        let inner: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::UnknownChannel(format!("{}: expected 32 bytes", s)))?;
        Ok(Self(inner))
    }
}

/// Amounts owned by each side of a channel.
///
/// Always expressed from one party's point of view. [`BalanceSplit::flipped`]
/// gives the other party's view of the same split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSplit {
    /// Owned by the party whose perspective this is
    pub local_sat: u64,
    /// Owned by the other party
    pub remote_sat: u64,
}

impl BalanceSplit {
    /// Constructor
    pub fn new(local_sat: u64, remote_sat: u64) -> Self {
        BalanceSplit { local_sat, remote_sat }
    }

    /// Build a split from signed amounts, as supplied by a caller
    pub fn from_signed(local_sat: i64, remote_sat: i64) -> Result<Self> {
        if local_sat < 0 || remote_sat < 0 {
            return Err(Error::BalanceExceeded(format!(
                "split {} / {} has a negative side",
                local_sat, remote_sat
            )));
        }
        Ok(BalanceSplit::new(local_sat as u64, remote_sat as u64))
    }

    /// The same split from the other party's point of view
    pub fn flipped(&self) -> Self {
        BalanceSplit { local_sat: self.remote_sat, remote_sat: self.local_sat }
    }

    /// Sum of both sides, unless it overflows
    pub fn total_sat(&self) -> Option<u64> {
        self.local_sat.checked_add(self.remote_sat)
    }

    /// Move `amount_sat` from the local side to the remote side
    pub fn pay(&self, amount_sat: u64) -> Result<Self> {
        let local_sat = self.local_sat.checked_sub(amount_sat).ok_or_else(|| {
            Error::BalanceExceeded(format!(
                "cannot pay {} with a local balance of {}",
                amount_sat, self.local_sat
            ))
        })?;
        let remote_sat = self
            .remote_sat
            .checked_add(amount_sat)
            .ok_or_else(|| Error::BalanceExceeded("remote balance overflow".into()))?;
        Ok(BalanceSplit { local_sat, remote_sat })
    }
}

/// Channel lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Anchor built, waiting for confirmation
    Negotiating,
    /// Accepting balance updates
    Open,
    /// A close is in progress
    Closing,
    /// The anchor has been spent, or is about to be
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Channel parameters agreed during anchor negotiation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSetup {
    /// The counterparty node
    pub peer: NodeId,
    /// The counterparty's RPC endpoint
    pub peer_addr: PeerAddr,
    /// Whether this node funded the anchor
    pub is_funder: bool,
    /// The escrow output
    pub anchor: Anchor,
    /// The fee left to the ledger by every commitment and settlement
    pub fee_sat: u64,
    /// The index our funding key was derived with
    pub key_index: u64,
    /// Our funding key
    pub funding_pubkey: PublicKey,
    /// The counterparty's funding key
    pub counterparty_funding_pubkey: PublicKey,
    /// Where our balance is paid out
    pub payout_script: ScriptBuf,
    /// Where the counterparty's balance is paid out
    pub counterparty_payout_script: ScriptBuf,
}

impl ChannelSetup {
    /// The channel capacity, fixed at funding
    pub fn capacity_sat(&self) -> u64 {
        self.anchor.value_sat
    }

    /// Capacity minus fee, what the balances add up to
    pub fn spendable_sat(&self) -> u64 {
        self.anchor.value_sat.saturating_sub(self.fee_sat)
    }

    /// The split right after funding, from our perspective
    pub fn initial_split(&self) -> BalanceSplit {
        if self.is_funder {
            BalanceSplit::new(self.spendable_sat(), 0)
        } else {
            BalanceSplit::new(0, self.spendable_sat())
        }
    }

    /// Commitment builder over this channel's anchor
    pub fn builder<'a>(&'a self, secp_ctx: &'a Secp256k1<All>) -> CommitmentBuilder<'a> {
        CommitmentBuilder::new(secp_ctx, &self.anchor, self.fee_sat)
    }

    /// Our keys and both payout scripts
    pub fn keys<'a>(&'a self, funding_secret: &'a SecretKey) -> CommitmentKeys<'a> {
        CommitmentKeys {
            funding_secret,
            funding_pubkey: self.funding_pubkey,
            counterparty_funding_pubkey: self.counterparty_funding_pubkey,
            payout_script: &self.payout_script,
            counterparty_payout_script: &self.counterparty_payout_script,
        }
    }

    /// Build both initial commitments.
    ///
    /// `counterparty_sig` is the counterparty's signature on our commitment.
    /// It is verified before anything is returned.
    pub fn initial_commitments(
        &self,
        secp_ctx: &Secp256k1<All>,
        funding_secret: &SecretKey,
        counterparty_sig: &Signature,
    ) -> Result<(Commitment, Commitment)> {
        let builder = self.builder(secp_ctx);
        let keys = self.keys(funding_secret);
        let split = self.initial_split();
        let mut holder = builder.build(0, &split, &keys)?;
        builder.verify(&holder.tx, counterparty_sig, &self.counterparty_funding_pubkey)?;
        holder.counterparty_sig = Some(*counterparty_sig);
        let counterparty = builder.build_counterparty(0, &split, &keys)?;
        Ok((holder, counterparty))
    }
}

/// Both sides of a balance update proposed by this node, not yet countersigned
#[derive(Clone, Debug)]
pub struct PendingUpdate {
    /// The new commitment number
    pub number: u64,
    /// The proposed split, from our perspective
    pub split: BalanceSplit,
    /// Our new commitment, signed by us
    pub holder_commitment: Commitment,
    /// The counterparty's new commitment, signed by us
    pub counterparty_commitment: Commitment,
}

impl PendingUpdate {
    /// Our signature on the counterparty's new commitment
    pub fn signature(&self) -> Result<Signature> {
        self.counterparty_commitment
            .counterparty_sig
            .ok_or_else(|| Error::Internal("pending update is unsigned".into()))
    }
}

/// A channel with one peer, backed by one anchor.
///
/// Keeps only the latest commitment per side. Nothing here performs I/O.
/// The node sequences the message exchange and persists each transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// The permanent channel id
    pub id: ChannelId,
    /// Negotiated parameters
    pub setup: ChannelSetup,
    /// Lifecycle status
    pub status: ChannelStatus,
    /// Current balances, from our perspective
    pub balance: BalanceSplit,
    /// Our latest commitment, signed by both parties
    pub holder_commitment: Commitment,
    /// The counterparty's latest commitment, signed by us
    pub counterparty_commitment: Commitment,
    /// The transaction that closed the channel, once known
    pub settlement_txid: Option<Txid>,
}

impl Channel {
    /// A freshly negotiated channel
    pub fn new(
        setup: ChannelSetup,
        holder_commitment: Commitment,
        counterparty_commitment: Commitment,
    ) -> Self {
        Channel {
            id: setup.anchor.channel_id(),
            balance: holder_commitment.split,
            status: ChannelStatus::Negotiating,
            setup,
            holder_commitment,
            counterparty_commitment,
            settlement_txid: None,
        }
    }

    /// The number of the latest commitment
    pub fn commitment_number(&self) -> u64 {
        self.holder_commitment.number
    }

    /// The counterparty node
    pub fn peer(&self) -> &NodeId {
        &self.setup.peer
    }

    /// Whether the channel accepts updates
    pub fn is_open(&self) -> bool {
        self.status == ChannelStatus::Open
    }

    fn require_open(&self, op: &str) -> Result<()> {
        if self.status != ChannelStatus::Open {
            return Err(Error::InvalidState(format!(
                "{}: channel {} is {}",
                op, self.id, self.status
            )));
        }
        Ok(())
    }

    /// Move from Negotiating to Open.  Returns whether the status changed.
    pub fn mark_open(&mut self) -> Result<bool> {
        match self.status {
            ChannelStatus::Negotiating => {
                self.status = ChannelStatus::Open;
                Ok(true)
            }
            ChannelStatus::Open => Ok(false),
            s => Err(Error::InvalidState(format!("cannot open channel {} in {}", self.id, s))),
        }
    }

    /// Enter Closing
    pub fn mark_closing(&mut self) -> Result<()> {
        match self.status {
            ChannelStatus::Negotiating | ChannelStatus::Open | ChannelStatus::Closing => {
                self.status = ChannelStatus::Closing;
                Ok(())
            }
            ChannelStatus::Closed =>
                Err(Error::InvalidState(format!("channel {} is already closed", self.id))),
        }
    }

    /// Enter the terminal Closed status
    pub fn mark_closed(&mut self, settlement_txid: Option<Txid>) {
        self.status = ChannelStatus::Closed;
        if settlement_txid.is_some() {
            self.settlement_txid = settlement_txid;
        }
    }

    /// Build and sign both commitments for `split`, which is from our
    /// perspective.
    pub fn propose_update(
        &self,
        secp_ctx: &Secp256k1<All>,
        funding_secret: &SecretKey,
        split: &BalanceSplit,
    ) -> Result<PendingUpdate> {
        self.require_open("update")?;
        let builder = self.setup.builder(secp_ctx);
        builder.check_split(split)?;
        let keys = self.setup.keys(funding_secret);
        let number = self.commitment_number() + 1;
        let holder_commitment = builder.build(number, split, &keys)?;
        let counterparty_commitment = builder.build_counterparty(number, split, &keys)?;
        Ok(PendingUpdate { number, split: *split, holder_commitment, counterparty_commitment })
    }

    /// Apply our own proposal once the counterparty has signed our commitment.
    pub fn complete_update(
        &mut self,
        secp_ctx: &Secp256k1<All>,
        pending: PendingUpdate,
        number: u64,
        counterparty_sig: &Signature,
    ) -> Result<()> {
        self.require_open("complete update")?;
        if number != pending.number {
            return Err(protocol_violation(format!(
                "channel {}: ack for commitment {}, proposed {}",
                self.id, number, pending.number
            )));
        }
        let mut holder_commitment = pending.holder_commitment;
        self.setup.builder(secp_ctx).verify(
            &holder_commitment.tx,
            counterparty_sig,
            &self.setup.counterparty_funding_pubkey,
        )?;
        holder_commitment.counterparty_sig = Some(*counterparty_sig);
        self.balance = pending.split;
        self.holder_commitment = holder_commitment;
        self.counterparty_commitment = pending.counterparty_commitment;
        debug!("channel {} now at commitment {} with {:?}", self.id, number, self.balance);
        Ok(())
    }

    /// Validate and apply an update proposed by the counterparty.
    ///
    /// `their_split` is from the proposer's perspective. The counterparty may
    /// pay us but may not take from us. Returns our signature on their new
    /// commitment.
    pub fn accept_update(
        &mut self,
        secp_ctx: &Secp256k1<All>,
        funding_secret: &SecretKey,
        number: u64,
        their_split: &BalanceSplit,
        counterparty_sig: &Signature,
    ) -> Result<Signature> {
        self.require_open("accept update")?;
        if number != self.commitment_number() + 1 {
            return Err(protocol_violation(format!(
                "channel {}: got commitment {}, expected {}",
                self.id,
                number,
                self.commitment_number() + 1
            )));
        }
        let split = their_split.flipped();
        let builder = self.setup.builder(secp_ctx);
        builder.check_split(&split)?;
        if split.local_sat < self.balance.local_sat {
            return Err(protocol_violation(format!(
                "channel {}: update would reduce our balance from {} to {}",
                self.id, self.balance.local_sat, split.local_sat
            )));
        }
        let keys = self.setup.keys(funding_secret);
        let mut holder_commitment = builder.build(number, &split, &keys)?;
        builder.verify(
            &holder_commitment.tx,
            counterparty_sig,
            &self.setup.counterparty_funding_pubkey,
        )?;
        holder_commitment.counterparty_sig = Some(*counterparty_sig);
        let counterparty_commitment = builder.build_counterparty(number, &split, &keys)?;
        let our_sig = counterparty_commitment
            .counterparty_sig
            .ok_or_else(|| Error::Internal("counterparty commitment unsigned".into()))?;
        self.balance = split;
        self.holder_commitment = holder_commitment;
        self.counterparty_commitment = counterparty_commitment;
        debug!("channel {} accepted commitment {} with {:?}", self.id, number, self.balance);
        Ok(our_sig)
    }

    /// Build and sign the settlement for the current balances
    pub fn propose_settlement(
        &self,
        secp_ctx: &Secp256k1<All>,
        funding_secret: &SecretKey,
    ) -> Result<(Transaction, Signature)> {
        if !matches!(self.status, ChannelStatus::Open | ChannelStatus::Closing) {
            return Err(Error::InvalidState(format!(
                "cannot settle channel {} in {}",
                self.id, self.status
            )));
        }
        let builder = self.setup.builder(secp_ctx);
        let tx = builder.settlement_tx(
            &self.balance,
            &self.setup.payout_script,
            &self.setup.counterparty_payout_script,
        )?;
        let sig = builder.sign(&tx, funding_secret)?;
        Ok((tx, sig))
    }

    /// Countersign a settlement proposed by the counterparty and mark the
    /// channel Closed.
    ///
    /// `their_split` is from the proposer's perspective and must match our
    /// current balances exactly.
    pub fn accept_settlement(
        &mut self,
        secp_ctx: &Secp256k1<All>,
        funding_secret: &SecretKey,
        their_split: &BalanceSplit,
        counterparty_sig: &Signature,
    ) -> Result<Signature> {
        self.require_open("accept settlement")?;
        if their_split.flipped() != self.balance {
            return Err(protocol_violation(format!(
                "channel {}: settlement split {:?} does not match balances {:?}",
                self.id,
                their_split.flipped(),
                self.balance
            )));
        }
        let builder = self.setup.builder(secp_ctx);
        let tx = builder.settlement_tx(
            &self.balance,
            &self.setup.payout_script,
            &self.setup.counterparty_payout_script,
        )?;
        builder.verify(&tx, counterparty_sig, &self.setup.counterparty_funding_pubkey)?;
        let sig = builder.sign(&tx, funding_secret)?;
        self.mark_closed(Some(tx.compute_txid()));
        Ok(sig)
    }

    /// Attach both signatures to our settlement proposal
    pub fn finalize_settlement(
        &self,
        secp_ctx: &Secp256k1<All>,
        tx: &Transaction,
        our_sig: &Signature,
        counterparty_sig: &Signature,
    ) -> Result<Transaction> {
        let builder = self.setup.builder(secp_ctx);
        builder.verify(tx, counterparty_sig, &self.setup.counterparty_funding_pubkey)?;
        builder.finalize(
            tx,
            (&self.setup.funding_pubkey, our_sig),
            (&self.setup.counterparty_funding_pubkey, counterparty_sig),
        )
    }

    /// Our latest commitment with the full 2-of-2 witness.
    ///
    /// This is what a unilateral close broadcasts, whether or not it matches
    /// what the counterparty holds.
    pub fn signed_holder_commitment(&self, secp_ctx: &Secp256k1<All>) -> Result<Transaction> {
        let commitment = &self.holder_commitment;
        match (commitment.owner_sig, commitment.counterparty_sig) {
            (Some(our_sig), Some(their_sig)) => self.setup.builder(secp_ctx).finalize(
                &commitment.tx,
                (&self.setup.funding_pubkey, &our_sig),
                (&self.setup.counterparty_funding_pubkey, &their_sig),
            ),
            _ => Err(Error::InvalidState(format!(
                "channel {}: commitment {} is not fully signed",
                self.id, commitment.number
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_test_channel_pair, make_test_funding_key, TestChannelPair};
    use test_log::test;

    fn update(pair: &mut TestChannelPair, split_a: BalanceSplit) -> Result<()> {
        let pending = pair.a.propose_update(&pair.secp_ctx, &pair.sk_a, &split_a)?;
        let sig = pending.signature()?;
        let ack = pair.b.accept_update(&pair.secp_ctx, &pair.sk_b, pending.number, &split_a, &sig)?;
        let number = pending.number;
        pair.a.complete_update(&pair.secp_ctx, pending, number, &ack)
    }

    #[test]
    fn channel_id_test() {
        let outpoint = OutPoint { txid: Txid::all_zeros(), vout: 0x0102 };
        let id = ChannelId::from_funding_outpoint(&outpoint);
        assert_eq!(id.as_slice()[30], 0x01);
        assert_eq!(id.as_slice()[31], 0x02);
        let parsed: ChannelId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("abcd".parse::<ChannelId>().is_err());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn balance_split_test() {
        let split = BalanceSplit::new(70, 30);
        assert_eq!(split.flipped(), BalanceSplit::new(30, 70));
        assert_eq!(split.pay(70).unwrap(), BalanceSplit::new(0, 100));
        assert!(matches!(split.pay(71), Err(Error::BalanceExceeded(_))));
        assert!(matches!(BalanceSplit::from_signed(-1, 101), Err(Error::BalanceExceeded(_))));
        assert_eq!(BalanceSplit::from_signed(1, 99).unwrap(), BalanceSplit::new(1, 99));
    }

    #[test]
    fn payments_are_associative_test() {
        let start = BalanceSplit::new(100, 0);
        for (d1, d2) in [(0u64, 0u64), (1, 2), (30, 40), (50, 50), (99, 1)] {
            let stepwise = start.pay(d1).and_then(|s| s.pay(d2)).unwrap();
            let combined = start.pay(d1 + d2).unwrap();
            assert_eq!(stepwise, combined);
        }
    }

    #[test]
    fn update_exchange_test() {
        let mut pair = make_test_channel_pair(100_000, 0);
        assert_eq!(pair.a.balance, BalanceSplit::new(100_000, 0));
        assert_eq!(pair.b.balance, BalanceSplit::new(0, 100_000));

        update(&mut pair, BalanceSplit::new(70_000, 30_000)).unwrap();
        assert_eq!(pair.a.balance, BalanceSplit::new(70_000, 30_000));
        assert_eq!(pair.b.balance, BalanceSplit::new(30_000, 70_000));
        assert_eq!(pair.a.commitment_number(), 1);
        assert_eq!(pair.b.commitment_number(), 1);
        assert!(pair.a.holder_commitment.is_fully_signed());
        assert!(pair.b.holder_commitment.is_fully_signed());
        assert_eq!(pair.a.holder_commitment.split, pair.b.counterparty_commitment.split);
        assert_eq!(pair.a.holder_commitment.tx, pair.b.counterparty_commitment.tx);

        let tx = pair.a.signed_holder_commitment(&pair.secp_ctx).unwrap();
        assert_eq!(tx.input[0].witness.len(), 4);
        assert_eq!(tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>(), 100_000);
    }

    #[test]
    fn receiver_rejects_theft_and_bad_splits_test() {
        let mut pair = make_test_channel_pair(100_000, 0);
        update(&mut pair, BalanceSplit::new(70_000, 30_000)).unwrap();

        // B may pay A, but may not take from A
        let greedy = BalanceSplit::new(40_000, 60_000);
        let greedy_pending = pair.b.propose_update(&pair.secp_ctx, &pair.sk_b, &greedy).unwrap();
        let res = pair.a.accept_update(
            &pair.secp_ctx,
            &pair.sk_a,
            2,
            &greedy,
            &greedy_pending.signature().unwrap(),
        );
        assert!(matches!(res, Err(Error::ProtocolViolation(_))));
        assert_eq!(pair.a.balance, BalanceSplit::new(70_000, 30_000));

        let honest = BalanceSplit::new(20_000, 80_000);
        let pending = pair.b.propose_update(&pair.secp_ctx, &pair.sk_b, &honest).unwrap();
        let sig = pending.signature().unwrap();
        pair.a.accept_update(&pair.secp_ctx, &pair.sk_a, 2, &honest, &sig).unwrap();
        assert_eq!(pair.a.balance, BalanceSplit::new(80_000, 20_000));

        let bad = BalanceSplit::new(1, 1);
        assert!(matches!(
            pair.a.propose_update(&pair.secp_ctx, &pair.sk_a, &bad),
            Err(Error::InvalidSplit(_))
        ));
    }

    #[test]
    fn receiver_rejects_bad_signature_and_number_test() {
        let mut pair = make_test_channel_pair(100_000, 0);
        let split = BalanceSplit::new(90_000, 10_000);
        let pending = pair.a.propose_update(&pair.secp_ctx, &pair.sk_a, &split).unwrap();
        // a signature over a different split
        let other_split = BalanceSplit::new(80_000, 20_000);
        let other = pair.a.propose_update(&pair.secp_ctx, &pair.sk_a, &other_split).unwrap();
        let wrong_sig = other.signature().unwrap();
        let res = pair.b.accept_update(&pair.secp_ctx, &pair.sk_b, 1, &split, &wrong_sig);
        assert!(matches!(res, Err(Error::SignatureMismatch(_))));

        // the right commitment, signed by a key outside the channel
        let (sk_x, _) = make_test_funding_key(&pair.secp_ctx, 3);
        let forged = pair.a.propose_update(&pair.secp_ctx, &sk_x, &split).unwrap();
        let forged_sig = forged.signature().unwrap();
        let res = pair.b.accept_update(&pair.secp_ctx, &pair.sk_b, 1, &split, &forged_sig);
        assert!(matches!(res, Err(Error::SignatureMismatch(_))));
        assert_eq!(pair.b.commitment_number(), 0);

        let sig = pending.signature().unwrap();
        let res = pair.b.accept_update(&pair.secp_ctx, &pair.sk_b, 5, &split, &sig);
        assert!(matches!(res, Err(Error::ProtocolViolation(_))));
        assert_eq!(pair.b.commitment_number(), 0);
        assert_eq!(pair.b.balance, BalanceSplit::new(0, 100_000));
    }

    #[test]
    fn proposer_rejects_bad_ack_signature_test() {
        let mut pair = make_test_channel_pair(100_000, 0);
        let split = BalanceSplit::new(90_000, 10_000);
        let pending = pair.a.propose_update(&pair.secp_ctx, &pair.sk_a, &split).unwrap();
        let sig = pending.signature().unwrap();
        pair.b.accept_update(&pair.secp_ctx, &pair.sk_b, 1, &split, &sig).unwrap();

        // A's own signature is not B's
        let own_sig = pending.holder_commitment.owner_sig.unwrap();
        let res = pair.a.complete_update(&pair.secp_ctx, pending, 1, &own_sig);
        assert!(matches!(res, Err(Error::SignatureMismatch(_))));
        assert_eq!(pair.a.commitment_number(), 0);
        assert_eq!(pair.a.balance, BalanceSplit::new(100_000, 0));
    }

    #[test]
    fn settlement_test() {
        let mut pair = make_test_channel_pair(100, 0);
        update(&mut pair, BalanceSplit::new(70, 30)).unwrap();

        let (tx, sig_a) = pair.a.propose_settlement(&pair.secp_ctx, &pair.sk_a).unwrap();
        let split_a = pair.a.balance;
        let sig_b = pair.b.accept_settlement(&pair.secp_ctx, &pair.sk_b, &split_a, &sig_a).unwrap();
        assert_eq!(pair.b.status, ChannelStatus::Closed);
        assert_eq!(pair.b.settlement_txid, Some(tx.compute_txid()));

        let signed = pair.a.finalize_settlement(&pair.secp_ctx, &tx, &sig_a, &sig_b).unwrap();
        let mut values: Vec<u64> = signed.output.iter().map(|o| o.value.to_sat()).collect();
        values.sort();
        assert_eq!(values, vec![30, 70]);
    }

    #[test]
    fn settlement_split_must_match_test() {
        let mut pair = make_test_channel_pair(100, 0);
        let (_, sig_a) = pair.a.propose_settlement(&pair.secp_ctx, &pair.sk_a).unwrap();
        let res = pair.b.accept_settlement(
            &pair.secp_ctx,
            &pair.sk_b,
            &BalanceSplit::new(50, 50),
            &sig_a,
        );
        assert!(matches!(res, Err(Error::ProtocolViolation(_))));
        assert_eq!(pair.b.status, ChannelStatus::Open);
    }

    #[test]
    fn status_transitions_test() {
        let mut pair = make_test_channel_pair(100, 0);
        assert!(!pair.a.mark_open().unwrap());
        pair.a.mark_closing().unwrap();
        assert!(matches!(
            pair.a.propose_update(&pair.secp_ctx, &pair.sk_a, &BalanceSplit::new(50, 50)),
            Err(Error::InvalidState(_))
        ));
        pair.a.mark_closed(None);
        assert!(pair.a.mark_closing().is_err());
        assert!(pair.a.mark_open().is_err());
    }
}
