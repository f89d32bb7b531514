use anyhow::Result;
use jsonrpsee::{
    server::{RpcModule, Server},
    types::{error::ErrorCode, ErrorObject, ErrorObjectOwned, Params},
};
use log::{error, info};
use paynet::bitcoin::consensus::encode::serialize_hex;
use paynet::channel::BalanceSplit;
use paynet::msgs::*;
use paynet::node::{ChannelSummary, Node};
use paynet::routing::RoutingEntry;
use paynet::transport::PeerApi;
use serde::de::DeserializeOwned;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::model::{
    ChannelRequest, CloseRequest, CloseResponse, CommitmentResponse, ForwardRequest, OpenRequest,
    OpenResponse, PayRequest, UpdateRequest,
};

/// The `RpcServer` handles incoming RPC requests, from peers and from local
/// callers alike, and dispatches them to the `Node`.
pub struct RpcServer {
    pub node: Arc<Node>,
}

impl RpcServer {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub async fn handle_open(&self, request: OpenRequest) -> paynet::Result<OpenResponse> {
        let channel_id = self.node.open(&request.peer_addr, request.capacity_sat).await?;
        Ok(OpenResponse { channel_id })
    }

    pub async fn handle_update(&self, request: UpdateRequest) -> paynet::Result<BalanceSplit> {
        let split = BalanceSplit::from_signed(request.local_sat, request.remote_sat)?;
        self.node.update(&request.channel_id, split).await?;
        Ok(split)
    }

    pub async fn handle_pay(&self, request: PayRequest) -> paynet::Result<BalanceSplit> {
        self.node.pay(&request.channel_id, request.amount_sat).await
    }

    pub async fn handle_close(&self, request: CloseRequest) -> paynet::Result<CloseResponse> {
        let settlement_txid = self.node.close(&request.channel_id, request.mode).await?;
        Ok(CloseResponse { settlement_txid })
    }

    /// Handles `forward`, which is both the local payment entry point and the
    /// hop-to-hop call.  Peers name themselves in `from`.
    pub async fn handle_forward(&self, request: ForwardRequest) -> paynet::Result<PaymentOutcome> {
        match request.from {
            Some(from) => {
                let msg = ForwardPayment {
                    destination: request.destination,
                    amount_sat: request.amount_sat,
                    from,
                    hops_remaining: request
                        .hops_remaining
                        .unwrap_or(self.node.config().max_hops),
                };
                PeerApi::forward(&*self.node, msg).await
            }
            None => Node::forward(&self.node, &request.destination, request.amount_sat).await,
        }
    }

    pub async fn handle_balance(&self, request: ChannelRequest) -> paynet::Result<BalanceSplit> {
        self.node.balance(&request.channel_id).await
    }

    pub async fn handle_channels(&self) -> Vec<ChannelSummary> {
        self.node.list_channels().await
    }

    pub fn handle_routes(&self) -> Vec<RoutingEntry> {
        self.node.routing_table().list()
    }

    pub async fn handle_commitment(
        &self,
        request: ChannelRequest,
    ) -> paynet::Result<CommitmentResponse> {
        let tx = self.node.commitment(&request.channel_id).await?;
        Ok(CommitmentResponse { txid: tx.compute_txid(), tx: serialize_hex(&tx) })
    }

    pub async fn handle_anchor_confirmed(&self, request: ChannelRequest) -> paynet::Result<()> {
        self.node.anchor_confirmed(&request.channel_id).await
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RpcMethods {
    // peer to peer
    GetInfo,
    OpenChannel,
    FundingCreated,
    FundingLocked,
    UpdateBalance,
    CloseChannel,
    Announce,
    // both
    Forward,
    // local
    Open,
    Update,
    Pay,
    Close,
    Balance,
    Channels,
    Routes,
    Commitment,
    AnchorConfirmed,
}

impl RpcMethods {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetInfo => "get_info",
            Self::OpenChannel => "open_channel",
            Self::FundingCreated => "funding_created",
            Self::FundingLocked => "funding_locked",
            Self::UpdateBalance => "update_balance",
            Self::CloseChannel => "close_channel",
            Self::Announce => "announce",
            Self::Forward => "forward",
            Self::Open => "open",
            Self::Update => "update",
            Self::Pay => "pay",
            Self::Close => "close",
            Self::Balance => "balance",
            Self::Channels => "channels",
            Self::Routes => "routes",
            Self::Commitment => "commitment",
            Self::AnchorConfirmed => "anchor_confirmed",
        }
    }
}

pub(crate) fn to_rpc_error(e: paynet::Error) -> ErrorObjectOwned {
    ErrorObject::owned(e.code(), e.message(), None::<bool>)
}

fn parse<T: DeserializeOwned>(method: RpcMethods, params: &Params) -> Result<T, ErrorObjectOwned> {
    params.parse().map_err(|e| {
        error!("rpc_server: bad {} params: {}", method.as_str(), e);
        ErrorObjectOwned::from(ErrorCode::InvalidParams)
    })
}

/// Register an async handler taking a by-name parameter object
macro_rules! register {
    ($module:ident, $method:expr, $handler:ident) => {
        $module.register_async_method($method.as_str(), |params, context, _| async move {
            let request = parse($method, &params)?;
            context.$handler(request).await.map_err(to_rpc_error)
        })?;
    };
}

/// Register an async peer message handler
macro_rules! register_peer {
    ($module:ident, $method:expr, $handler:ident) => {
        $module.register_async_method($method.as_str(), |params, context, _| async move {
            let msg = parse($method, &params)?;
            PeerApi::$handler(&*context.node, msg).await.map_err(to_rpc_error)
        })?;
    };
}

pub fn build_rpc_module(node: Arc<Node>) -> Result<RpcModule<RpcServer>> {
    let mut module = RpcModule::new(RpcServer::new(node));

    module.register_async_method(RpcMethods::GetInfo.as_str(), |_, context, _| async move {
        PeerApi::get_info(&*context.node).await.map_err(to_rpc_error)
    })?;
    register_peer!(module, RpcMethods::OpenChannel, open_channel);
    register_peer!(module, RpcMethods::FundingCreated, funding_created);
    register_peer!(module, RpcMethods::FundingLocked, funding_locked);
    register_peer!(module, RpcMethods::UpdateBalance, update_balance);
    register_peer!(module, RpcMethods::CloseChannel, close_channel);
    register_peer!(module, RpcMethods::Announce, announce);

    register!(module, RpcMethods::Forward, handle_forward);

    register!(module, RpcMethods::Open, handle_open);
    register!(module, RpcMethods::Update, handle_update);
    register!(module, RpcMethods::Pay, handle_pay);
    register!(module, RpcMethods::Close, handle_close);
    register!(module, RpcMethods::Balance, handle_balance);
    register!(module, RpcMethods::Commitment, handle_commitment);
    register!(module, RpcMethods::AnchorConfirmed, handle_anchor_confirmed);

    module.register_async_method(RpcMethods::Channels.as_str(), |_, context, _| async move {
        Ok::<_, ErrorObjectOwned>(context.handle_channels().await)
    })?;

    module.register_method(RpcMethods::Routes.as_str(), |_, context, _| {
        Ok::<_, ErrorObjectOwned>(context.handle_routes())
    })?;

    Ok(module)
}

pub async fn start_rpc_server(
    node: Arc<Node>,
    ip: IpAddr,
    port: u16,
    shutdown_signal: triggered::Listener,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let node_id = node.get_id();
    let module = build_rpc_module(node)?;

    let server = Server::builder().http_only().build(SocketAddr::new(ip, port)).await?;

    let addr = server.local_addr()?;
    let handle = server.start(module);
    info!("rpc_server: node {} listening on {}", node_id, addr);

    let join_handle = tokio::spawn(async move {
        shutdown_signal.await;
        if handle.stop().is_err() {
            info!("rpc_server: already stopped");
        }
        handle.stopped().await;
    });

    Ok((addr, join_handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{from_client_error, JsonRpcConnector};
    use crate::rpc_server::model::Named;
    use jsonrpsee::core::client::{ClientT, Error as ClientError};
    use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
    use jsonrpsee::rpc_params;
    use paynet::bitcoin::Network;
    use paynet::channel::ChannelId;
    use paynet::node::{NodeConfig, NodeServices};
    use paynet::peer::{NodeId, PeerAddr};
    use paynet::persist::DummyPersister;
    use paynet::util::test_utils::{wait_until, MemoryLedger, TestNetwork};
    use paynet::Error;
    use serde_json::json;
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::Duration;

    struct TestDaemon {
        node: Arc<Node>,
        addr: PeerAddr,
        client: HttpClient,
        _shutdown: triggered::Trigger,
    }

    impl TestDaemon {
        async fn request<R: serde::de::DeserializeOwned>(
            &self,
            method: RpcMethods,
            params: impl serde::Serialize + Send,
        ) -> paynet::Result<R> {
            self.client
                .request(method.as_str(), Named(params))
                .await
                .map_err(|e| from_client_error(method, &self.addr, e))
        }

        async fn query<R: serde::de::DeserializeOwned>(&self, method: RpcMethods) -> R {
            self.client.request(method.as_str(), rpc_params![]).await.unwrap()
        }
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn start_daemon(name: &str, ledger: &Arc<MemoryLedger>) -> TestDaemon {
        let port = free_port();
        let addr = PeerAddr::new(format!("http://127.0.0.1:{}", port));
        let mut config = NodeConfig::new(Network::Regtest, addr.clone());
        config.commitment_fee_sat = 0;
        config.hop_timeout_ms = 2_000;
        let services = NodeServices {
            connector: Arc::new(JsonRpcConnector::new(Duration::from_secs(30))),
            ledger: ledger.clone(),
            persister: Arc::new(DummyPersister),
        };
        let node = Node::new(config, TestNetwork::node_secret(name), services).unwrap();
        let (trigger, listener) = triggered::trigger();
        start_rpc_server(node.clone(), Ipv4Addr::LOCALHOST.into(), port, listener).await.unwrap();
        let client = HttpClientBuilder::default().build(addr.as_str()).unwrap();
        TestDaemon { node, addr, client, _shutdown: trigger }
    }

    async fn open(from: &TestDaemon, to: &TestDaemon, capacity_sat: u64) -> ChannelId {
        let request = OpenRequest { peer_addr: to.addr.clone(), capacity_sat };
        let response: OpenResponse = from.request(RpcMethods::Open, request).await.unwrap();
        response.channel_id
    }

    async fn await_route(daemon: &TestDaemon, destination: &NodeId) {
        let found = wait_until(Duration::from_secs(5), || {
            daemon.node.routing_table().lookup(destination).is_ok()
        })
        .await;
        assert!(found, "no route to {:?}", destination);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn rpc_multi_hop_test() {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = start_daemon("alice", &ledger).await;
        let bob = start_daemon("bob", &ledger).await;
        let carol = start_daemon("carol", &ledger).await;

        let info: NodeInfo = alice.query(RpcMethods::GetInfo).await;
        assert_eq!(info.node_id, alice.node.get_id());
        assert_eq!(info.addr, alice.addr);

        let ab = open(&alice, &bob, 100_000).await;
        let bc = open(&bob, &carol, 100_000).await;
        await_route(&alice, &carol.node.get_id()).await;

        let request = PayRequest { channel_id: ab, amount_sat: 10_000 };
        let split: BalanceSplit = alice.request(RpcMethods::Pay, request).await.unwrap();
        assert_eq!(split, BalanceSplit::new(90_000, 10_000));

        let request = ForwardRequest {
            destination: carol.node.get_id(),
            amount_sat: 5_000,
            from: None,
            hops_remaining: None,
        };
        let outcome: PaymentOutcome = alice.request(RpcMethods::Forward, request).await.unwrap();
        assert_eq!(outcome.hops, 2);
        assert_eq!(outcome.amount_sat, 5_000);

        let balance: BalanceSplit =
            bob.request(RpcMethods::Balance, ChannelRequest { channel_id: ab }).await.unwrap();
        assert_eq!(balance, BalanceSplit::new(15_000, 85_000));
        let channels: Vec<ChannelSummary> = carol.query(RpcMethods::Channels).await;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_id, bc);
        assert_eq!(channels[0].local_sat, 5_000);

        let routes: Vec<RoutingEntry> = alice.query(RpcMethods::Routes).await;
        assert!(routes.iter().any(|r| r.destination == carol.node.get_id()
            && r.next_hop == bob.node.get_id()));

        let commitment: CommitmentResponse =
            alice.request(RpcMethods::Commitment, ChannelRequest { channel_id: ab }).await.unwrap();
        assert_eq!(commitment.txid, alice.node.commitment(&ab).await.unwrap().compute_txid());

        let request = CloseRequest { channel_id: ab, mode: CloseMode::Cooperative };
        let closed: CloseResponse = alice.request(RpcMethods::Close, request).await.unwrap();
        assert!(ledger.broadcast_tx(&closed.settlement_txid).is_some());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn rpc_errors_test() {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = start_daemon("alice", &ledger).await;
        let bob = start_daemon("bob", &ledger).await;
        let ab = open(&alice, &bob, 1_000).await;

        // typed errors survive the trip
        let request = PayRequest { channel_id: ab, amount_sat: 5_000 };
        let res: paynet::Result<BalanceSplit> = alice.request(RpcMethods::Pay, request).await;
        assert!(matches!(res, Err(Error::BalanceExceeded(_))), "{:?}", res);

        let request = UpdateRequest { channel_id: ab, local_sat: 1_001, remote_sat: -1 };
        let res: paynet::Result<BalanceSplit> = alice.request(RpcMethods::Update, request).await;
        assert!(matches!(res, Err(Error::BalanceExceeded(_))), "{:?}", res);

        let request = UpdateRequest { channel_id: ab, local_sat: 600, remote_sat: 400 };
        let split: BalanceSplit = alice.request(RpcMethods::Update, request).await.unwrap();
        assert_eq!(bob.node.balance(&ab).await.unwrap(), split.flipped());

        let request = ForwardRequest {
            destination: alice.node.get_id(),
            amount_sat: 1,
            from: None,
            hops_remaining: None,
        };
        let res: paynet::Result<PaymentOutcome> = bob.request(RpcMethods::Forward, request).await;
        assert_eq!(res.unwrap().hops, 1);
        let res: paynet::Result<BalanceSplit> =
            bob.request(RpcMethods::Balance, ChannelRequest { channel_id: ChannelId::new([3; 32]) })
                .await;
        assert!(matches!(res, Err(Error::UnknownChannel(_))), "{:?}", res);

        let request = OpenRequest { peer_addr: PeerAddr::new("http://127.0.0.1:1"), capacity_sat: 100 };
        let res: paynet::Result<OpenResponse> = alice.request(RpcMethods::Open, request).await;
        assert!(matches!(res, Err(Error::NetworkFailure(_))), "{:?}", res);

        let res: Result<BalanceSplit, ClientError> =
            alice.client.request(RpcMethods::Pay.as_str(), Named(json!({ "amount": 1 }))).await;
        match res {
            Err(ClientError::Call(obj)) => assert_eq!(obj.code(), ErrorCode::InvalidParams.code()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
