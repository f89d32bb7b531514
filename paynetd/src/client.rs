//! The peer transport over JSON-RPC/HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::core::traits::ToRpcParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use paynet::msgs::*;
use paynet::peer::PeerAddr;
use paynet::transport::{PeerApi, PeerConnector};
use paynet::{Error, Result};
use serde::de::DeserializeOwned;
use tracing::*;

use crate::rpc_server::{ForwardRequest, Named, RpcMethods};

/// Map a client failure back onto the error the remote node raised
pub fn from_client_error(method: RpcMethods, addr: &PeerAddr, e: ClientError) -> Error {
    match e {
        ClientError::Call(obj) => Error::from_code(obj.code(), obj.message()),
        ClientError::RequestTimeout =>
            Error::ProtocolTimeout(format!("{} to {} timed out", method.as_str(), addr)),
        other => Error::NetworkFailure(format!("{} to {}: {}", method.as_str(), addr, other)),
    }
}

/// Connects to peers by URL
pub struct JsonRpcConnector {
    request_timeout: Duration,
}

impl JsonRpcConnector {
    /// `request_timeout` bounds the HTTP exchange itself; the node applies its
    /// own per-hop deadlines on top.
    pub fn new(request_timeout: Duration) -> Self {
        JsonRpcConnector { request_timeout }
    }
}

#[async_trait]
impl PeerConnector for JsonRpcConnector {
    async fn connect(&self, addr: &PeerAddr) -> Result<Arc<dyn PeerApi>> {
        let client = HttpClientBuilder::default()
            .request_timeout(self.request_timeout)
            .build(addr.as_str())
            .map_err(|e| Error::NetworkFailure(format!("bad peer address {}: {}", addr, e)))?;
        debug!("connected to {}", addr);
        Ok(Arc::new(JsonRpcPeer { addr: addr.clone(), client }))
    }
}

/// A remote node
pub struct JsonRpcPeer {
    addr: PeerAddr,
    client: HttpClient,
}

impl JsonRpcPeer {
    async fn call<R, P>(&self, method: RpcMethods, params: P) -> Result<R>
    where
        R: DeserializeOwned,
        P: ToRpcParams + Send,
    {
        trace!("-> {} {}", self.addr, method.as_str());
        self.client
            .request(method.as_str(), params)
            .await
            .map_err(|e| from_client_error(method, &self.addr, e))
    }
}

#[async_trait]
impl PeerApi for JsonRpcPeer {
    async fn get_info(&self) -> Result<NodeInfo> {
        self.call(RpcMethods::GetInfo, rpc_params![]).await
    }

    async fn open_channel(&self, msg: OpenChannel) -> Result<AcceptChannel> {
        self.call(RpcMethods::OpenChannel, Named(msg)).await
    }

    async fn funding_created(&self, msg: FundingCreated) -> Result<FundingSigned> {
        self.call(RpcMethods::FundingCreated, Named(msg)).await
    }

    async fn funding_locked(&self, msg: FundingLocked) -> Result<()> {
        self.call(RpcMethods::FundingLocked, Named(msg)).await
    }

    async fn update_balance(&self, msg: UpdateBalance) -> Result<UpdateAck> {
        self.call(RpcMethods::UpdateBalance, Named(msg)).await
    }

    async fn close_channel(&self, msg: CloseChannel) -> Result<ClosingSigned> {
        self.call(RpcMethods::CloseChannel, Named(msg)).await
    }

    async fn announce(&self, msg: RouteAnnouncement) -> Result<()> {
        self.call(RpcMethods::Announce, Named(msg)).await
    }

    async fn forward(&self, msg: ForwardPayment) -> Result<PaymentOutcome> {
        let request = ForwardRequest {
            destination: msg.destination,
            amount_sat: msg.amount_sat,
            from: Some(msg.from),
            hops_remaining: Some(msg.hops_remaining),
        };
        self.call(RpcMethods::Forward, Named(request)).await
    }
}
