use std::collections::{BTreeMap as OrderedMap, BTreeSet as OrderedSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::sha256::Hash as Sha256Hash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{
    Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, WPubkeyHash,
    Witness,
};

use crate::anchor::{Anchor, FundingInputs};
use crate::channel::{Channel, ChannelId, ChannelSetup};
use crate::error::Result;
use crate::ledger::{BroadcastStatus, Ledger};
use crate::node::{Node, NodeConfig, NodeServices, NodeState};
use crate::peer::{NodeId, PeerAddr};
use crate::persist::{self, DummyPersister, Persist};
use crate::routing::RoutingEntry;
use crate::util::loopback::LoopbackNetwork;

/// Make a secp256k1 test key
pub fn make_test_key(i: u8) -> (PublicKey, SecretKey) {
    let secp_ctx = Secp256k1::signing_only();
    let secret_key = SecretKey::from_slice(&[i; 32]).unwrap();
    (PublicKey::from_secret_key(&secp_ctx, &secret_key), secret_key)
}

/// Make a secp256k1 test pubkey
pub fn make_test_pubkey(i: u8) -> PublicKey {
    make_test_key(i).0
}

/// Make a test node id
pub fn make_test_node_id(i: u8) -> NodeId {
    NodeId(make_test_pubkey(i))
}

/// Make a funding key pair
pub fn make_test_funding_key(secp_ctx: &Secp256k1<All>, i: u8) -> (SecretKey, PublicKey) {
    let secret_key = SecretKey::from_slice(&[i; 32]).unwrap();
    (secret_key, PublicKey::from_secret_key(secp_ctx, &secret_key))
}

/// An anchor at a fixed fake outpoint
pub fn make_test_anchor(capacity_sat: u64, pk_a: &PublicKey, pk_b: &PublicKey) -> Anchor {
    let outpoint = OutPoint { txid: Txid::from_byte_array([9; 32]), vout: 0 };
    Anchor::new(outpoint, capacity_sat, pk_a, pk_b)
}

/// A distinct P2WPKH script per index
pub fn make_test_payout_script(i: u64) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&i.to_be_bytes()))
}

/// `n` fake wallet inputs worth `total_sat`, with optional change
pub fn make_test_funding_inputs(n: usize, total_sat: u64, change_sat: Option<u64>) -> FundingInputs {
    assert!(change_sat.unwrap_or(0) < total_sat);
    let inputs = (0..n)
        .map(|i| TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([i as u8 + 1; 32]),
                vout: i as u32,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();
    let change = change_sat.map(|value| TxOut {
        value: Amount::from_sat(value),
        script_pubkey: make_test_payout_script(999),
    });
    FundingInputs { inputs, change }
}

/// Two ends of the same open channel, without nodes around them
pub struct TestChannelPair {
    pub secp_ctx: Secp256k1<All>,
    /// The funder's end
    pub a: Channel,
    pub sk_a: SecretKey,
    pub b: Channel,
    pub sk_b: SecretKey,
}

/// Negotiate a channel funded by `a` directly between two channel objects
pub fn make_test_channel_pair(capacity_sat: u64, fee_sat: u64) -> TestChannelPair {
    let secp_ctx = Secp256k1::new();
    let (sk_a, pk_a) = make_test_funding_key(&secp_ctx, 1);
    let (sk_b, pk_b) = make_test_funding_key(&secp_ctx, 2);
    let anchor = make_test_anchor(capacity_sat, &pk_a, &pk_b);
    let (script_a, script_b) = (make_test_payout_script(1), make_test_payout_script(2));

    let setup_a = ChannelSetup {
        peer: make_test_node_id(12),
        peer_addr: PeerAddr::new("b"),
        is_funder: true,
        anchor: anchor.clone(),
        fee_sat,
        key_index: 0,
        funding_pubkey: pk_a,
        counterparty_funding_pubkey: pk_b,
        payout_script: script_a.clone(),
        counterparty_payout_script: script_b.clone(),
    };
    let setup_b = ChannelSetup {
        peer: make_test_node_id(11),
        peer_addr: PeerAddr::new("a"),
        is_funder: false,
        anchor,
        fee_sat,
        key_index: 0,
        funding_pubkey: pk_b,
        counterparty_funding_pubkey: pk_a,
        payout_script: script_b,
        counterparty_payout_script: script_a,
    };

    let sig_for_a = setup_b
        .builder(&secp_ctx)
        .build_counterparty(0, &setup_b.initial_split(), &setup_b.keys(&sk_b))
        .unwrap()
        .counterparty_sig
        .unwrap();
    let sig_for_b = setup_a
        .builder(&secp_ctx)
        .build_counterparty(0, &setup_a.initial_split(), &setup_a.keys(&sk_a))
        .unwrap()
        .counterparty_sig
        .unwrap();
    let (holder_a, counterparty_a) =
        setup_a.initial_commitments(&secp_ctx, &sk_a, &sig_for_a).unwrap();
    let (holder_b, counterparty_b) =
        setup_b.initial_commitments(&secp_ctx, &sk_b, &sig_for_b).unwrap();
    let mut a = Channel::new(setup_a, holder_a, counterparty_a);
    let mut b = Channel::new(setup_b, holder_b, counterparty_b);
    a.mark_open().unwrap();
    b.mark_open().unwrap();
    TestChannelPair { secp_ctx, a, sk_a, b, sk_b }
}

#[derive(Default)]
struct LedgerState {
    next_coin: u64,
    next_script: u64,
    reject: bool,
    reserved: OrderedSet<OutPoint>,
    spent: OrderedSet<OutPoint>,
    txs: OrderedMap<Txid, Transaction>,
}

/// A ledger that confirms everything it is given, unless told to reject,
/// and refuses double spends.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject every broadcast from now on
    pub fn set_reject(&self, reject: bool) {
        self.state().reject = reject;
    }

    /// A transaction that was confirmed
    pub fn broadcast_tx(&self, txid: &Txid) -> Option<Transaction> {
        self.state().txs.get(txid).cloned()
    }

    /// Coins handed out by `fund` that were neither spent nor released
    pub fn reserved_coins(&self) -> usize {
        self.state().reserved.len()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn fund(&self, amount_sat: u64) -> Result<FundingInputs> {
        let mut state = self.state();
        state.next_coin += 1;
        let txid = Sha256Hash::hash(&state.next_coin.to_be_bytes()).to_byte_array();
        let input = TxIn {
            previous_output: OutPoint { txid: Txid::from_byte_array(txid), vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        };
        let change = TxOut {
            value: Amount::from_sat(amount_sat / 10 + 1),
            script_pubkey: make_test_payout_script(1_000_000 + state.next_coin),
        };
        state.reserved.insert(input.previous_output);
        Ok(FundingInputs { inputs: vec![input], change: Some(change) })
    }

    async fn sign_funding(&self, tx: &mut Transaction) -> Result<()> {
        for input in tx.input.iter_mut() {
            input.witness = Witness::from_slice(&[vec![1u8; 71], vec![2u8; 33]]);
        }
        Ok(())
    }

    fn release(&self, funding: &FundingInputs) {
        let mut state = self.state();
        for input in funding.inputs.iter() {
            state.reserved.remove(&input.previous_output);
        }
    }

    async fn new_payout_script(&self) -> Result<ScriptBuf> {
        let mut state = self.state();
        state.next_script += 1;
        Ok(make_test_payout_script(state.next_script))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastStatus> {
        let mut state = self.state();
        if state.reject {
            return Ok(BroadcastStatus::Rejected("ledger is rejecting".into()));
        }
        if let Some(input) = tx.input.iter().find(|i| state.spent.contains(&i.previous_output)) {
            return Ok(BroadcastStatus::Rejected(format!(
                "{} already spent",
                input.previous_output
            )));
        }
        for input in tx.input.iter() {
            state.reserved.remove(&input.previous_output);
            state.spent.insert(input.previous_output);
        }
        let txid = tx.compute_txid();
        state.txs.insert(txid, tx.clone());
        Ok(BroadcastStatus::Confirmed(txid))
    }
}

/// A persister that stores nothing and can be told to fail every write
/// after node creation
#[derive(Default)]
pub struct FailingPersister {
    failing: AtomicBool,
}

impl FailingPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail channel, node and route writes from now on
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> core::result::Result<(), persist::Error> {
        if self.failing.load(Ordering::SeqCst) {
            Err(persist::Error::Unavailable(format!("{} refused", what)))
        } else {
            Ok(())
        }
    }
}

impl Persist for FailingPersister {
    fn new_node(&self, node_id: &NodeId, state: &NodeState) -> core::result::Result<(), persist::Error> {
        DummyPersister.new_node(node_id, state)
    }

    fn update_node(&self, node_id: &NodeId, state: &NodeState) -> core::result::Result<(), persist::Error> {
        self.check("update_node")?;
        DummyPersister.update_node(node_id, state)
    }

    fn get_node(&self, node_id: &NodeId) -> core::result::Result<Option<NodeState>, persist::Error> {
        DummyPersister.get_node(node_id)
    }

    fn new_channel(&self, node_id: &NodeId, channel: &Channel) -> core::result::Result<(), persist::Error> {
        self.check("new_channel")?;
        DummyPersister.new_channel(node_id, channel)
    }

    fn update_channel(&self, node_id: &NodeId, channel: &Channel) -> core::result::Result<(), persist::Error> {
        self.check("update_channel")?;
        DummyPersister.update_channel(node_id, channel)
    }

    fn get_channel(
        &self,
        node_id: &NodeId,
        channel_id: &ChannelId,
    ) -> core::result::Result<Channel, persist::Error> {
        DummyPersister.get_channel(node_id, channel_id)
    }

    fn get_node_channels(&self, node_id: &NodeId) -> core::result::Result<Vec<Channel>, persist::Error> {
        DummyPersister.get_node_channels(node_id)
    }

    fn update_route(&self, node_id: &NodeId, entry: &RoutingEntry) -> core::result::Result<(), persist::Error> {
        self.check("update_route")?;
        DummyPersister.update_route(node_id, entry)
    }

    fn get_routes(&self, node_id: &NodeId) -> core::result::Result<Vec<RoutingEntry>, persist::Error> {
        DummyPersister.get_routes(node_id)
    }

    fn clear_database(&self) -> core::result::Result<(), persist::Error> {
        DummyPersister.clear_database()
    }
}

/// In-process nodes sharing one loopback network and one ledger
pub struct TestNetwork {
    pub network: Arc<LoopbackNetwork>,
    pub ledger: Arc<MemoryLedger>,
}

impl TestNetwork {
    pub fn new() -> Self {
        TestNetwork { network: Arc::new(LoopbackNetwork::new()), ledger: Arc::new(MemoryLedger::new()) }
    }

    /// The configuration `add_node` starts from
    pub fn config(name: &str) -> NodeConfig {
        let mut config = NodeConfig::new(Network::Regtest, PeerAddr::new(format!("loopback://{}", name)));
        config.hop_timeout_ms = 500;
        config
    }

    /// The node secret used for `name`
    pub fn node_secret(name: &str) -> [u8; 32] {
        Sha256Hash::hash(name.as_bytes()).to_byte_array()
    }

    /// Add a node with the given commitment fee
    pub fn add_node(&self, name: &str, fee_sat: u64) -> Arc<Node> {
        self.add_node_with(name, |config| config.commitment_fee_sat = fee_sat)
    }

    /// Add a node, adjusting its configuration first
    pub fn add_node_with(&self, name: &str, configure: impl FnOnce(&mut NodeConfig)) -> Arc<Node> {
        self.add_node_with_persister(name, Arc::new(DummyPersister), configure)
    }

    /// Add a node backed by `persister`.  Adding the same name again with the
    /// same persister restarts that node.
    pub fn add_node_with_persister(
        &self,
        name: &str,
        persister: Arc<dyn Persist>,
        configure: impl FnOnce(&mut NodeConfig),
    ) -> Arc<Node> {
        let mut config = Self::config(name);
        configure(&mut config);
        let services = NodeServices {
            connector: self.network.clone(),
            ledger: self.ledger.clone(),
            persister,
        };
        let addr = config.listen_addr.clone();
        let node = Node::new(config, Self::node_secret(name), services).unwrap();
        self.network.register(&addr, &node);
        node
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give spawned announcement tasks time to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
