//! An in-process transport that delivers peer calls directly to registered
//! nodes, with injectable faults.

use core::future::Future;
use std::collections::BTreeMap as OrderedMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{constants, Message, Secp256k1, SecretKey};
use tracing::*;

use crate::error::{Error, Result};
use crate::msgs::*;
use crate::node::Node;
use crate::peer::PeerAddr;
use crate::transport::{PeerApi, PeerConnector};

/// A failure injected into calls to one address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Calls fail without reaching the node
    Unreachable,
    /// Calls reach the node after a delay
    Delay(Duration),
    /// Calls reach the node, but the caller never sees the reply
    DropResponse,
    /// Signatures in funding, update and close replies are replaced with
    /// ones that do not verify
    CorruptSignature,
}

// A valid signature by an unrelated key over an unrelated digest
fn corrupt_signature() -> Signature {
    let secp_ctx = Secp256k1::signing_only();
    let one_key = SecretKey::from_slice(&constants::ONE).expect("one is a valid key");
    secp_ctx.sign_ecdsa(&Message::from_digest([0x24; 32]), &one_key)
}

#[derive(Default)]
struct Registry {
    nodes: Mutex<OrderedMap<PeerAddr, Weak<Node>>>,
    faults: Mutex<OrderedMap<PeerAddr, Fault>>,
}

impl Registry {
    fn nodes(&self) -> MutexGuard<OrderedMap<PeerAddr, Weak<Node>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<OrderedMap<PeerAddr, Fault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn node(&self, addr: &PeerAddr) -> Result<Arc<Node>> {
        self.nodes()
            .get(addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::NetworkFailure(format!("nothing listening at {}", addr)))
    }
}

/// Connects nodes living in the same process.
///
/// Nodes are held weakly, so dropping a node makes its address unreachable.
/// Every call runs on its own task, so a caller that gives up does not
/// cancel the work on the receiving side.
#[derive(Default)]
pub struct LoopbackNetwork {
    registry: Arc<Registry>,
}

impl LoopbackNetwork {
    /// An empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable at `addr`, replacing any previous node there
    pub fn register(&self, addr: &PeerAddr, node: &Arc<Node>) {
        self.registry.nodes().insert(addr.clone(), Arc::downgrade(node));
    }

    /// Inject a fault into calls to `addr`
    pub fn set_fault(&self, addr: &PeerAddr, fault: Fault) {
        info!("injecting {:?} at {}", fault, addr);
        self.registry.faults().insert(addr.clone(), fault);
    }

    /// Remove any fault at `addr`
    pub fn clear_fault(&self, addr: &PeerAddr) {
        self.registry.faults().remove(addr);
    }
}

#[async_trait]
impl PeerConnector for LoopbackNetwork {
    async fn connect(&self, addr: &PeerAddr) -> Result<Arc<dyn PeerApi>> {
        if self.registry.faults().get(addr) == Some(&Fault::Unreachable) {
            return Err(Error::NetworkFailure(format!("{} is unreachable", addr)));
        }
        self.registry.node(addr)?;
        Ok(Arc::new(LoopbackPeer { registry: Arc::clone(&self.registry), addr: addr.clone() }))
    }
}

struct LoopbackPeer {
    registry: Arc<Registry>,
    addr: PeerAddr,
}

impl LoopbackPeer {
    fn fault(&self) -> Option<Fault> {
        self.registry.faults().get(&self.addr).copied()
    }

    async fn call<T, F, Fut>(&self, method: &'static str, dispatch: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Node>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fault = self.fault();
        if fault == Some(Fault::Unreachable) {
            return Err(Error::NetworkFailure(format!("{} to {}: unreachable", method, self.addr)));
        }
        let node = self.registry.node(&self.addr)?;
        let handle = tokio::spawn(async move {
            if let Some(Fault::Delay(delay)) = fault {
                tokio::time::sleep(delay).await;
            }
            dispatch(node).await
        });
        let res = handle
            .await
            .map_err(|e| Error::NetworkFailure(format!("{} to {} aborted: {}", method, self.addr, e)))?;
        if fault == Some(Fault::DropResponse) {
            debug!("dropping {} response from {}", method, self.addr);
            return Err(Error::NetworkFailure(format!("{} to {}: response lost", method, self.addr)));
        }
        res
    }
}

#[async_trait]
impl PeerApi for LoopbackPeer {
    async fn get_info(&self) -> Result<NodeInfo> {
        self.call("get_info", |node| async move { PeerApi::get_info(&*node).await }).await
    }

    async fn open_channel(&self, msg: OpenChannel) -> Result<AcceptChannel> {
        self.call("open_channel", |node| async move { PeerApi::open_channel(&*node, msg).await })
            .await
    }

    async fn funding_created(&self, msg: FundingCreated) -> Result<FundingSigned> {
        let mut signed = self
            .call("funding_created", |node| async move {
                PeerApi::funding_created(&*node, msg).await
            })
            .await?;
        if self.fault() == Some(Fault::CorruptSignature) {
            signed.signature = corrupt_signature();
        }
        Ok(signed)
    }

    async fn funding_locked(&self, msg: FundingLocked) -> Result<()> {
        self.call("funding_locked", |node| async move { PeerApi::funding_locked(&*node, msg).await })
            .await
    }

    async fn update_balance(&self, msg: UpdateBalance) -> Result<UpdateAck> {
        let mut ack = self
            .call("update_balance", |node| async move { PeerApi::update_balance(&*node, msg).await })
            .await?;
        if self.fault() == Some(Fault::CorruptSignature) {
            ack.signature = corrupt_signature();
        }
        Ok(ack)
    }

    async fn close_channel(&self, msg: CloseChannel) -> Result<ClosingSigned> {
        let mut reply = self
            .call("close_channel", |node| async move { PeerApi::close_channel(&*node, msg).await })
            .await?;
        if self.fault() == Some(Fault::CorruptSignature) {
            reply.signature = corrupt_signature();
        }
        Ok(reply)
    }

    async fn announce(&self, msg: RouteAnnouncement) -> Result<()> {
        self.call("announce", |node| async move { PeerApi::announce(&*node, msg).await }).await
    }

    async fn forward(&self, msg: ForwardPayment) -> Result<PaymentOutcome> {
        self.call("forward", |node| async move { PeerApi::forward(&*node, msg).await }).await
    }
}
