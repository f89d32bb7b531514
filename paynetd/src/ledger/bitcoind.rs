use std::collections::BTreeSet as OrderedSet;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderMap, HeaderValue};
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::core::traits::ToRpcParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use paynet::anchor::FundingInputs;
use paynet::bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use paynet::bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use paynet::ledger::{BroadcastStatus, Ledger};
use paynet::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::*;
use url::Url;

/// Fee paid by funding transactions
pub const FUNDING_FEE_SAT: u64 = 1_000;
/// Change below this is left to the fee
pub const DUST_LIMIT_SAT: u64 = 546;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Debug)]
struct Unspent {
    txid: Txid,
    vout: u32,
    amount: f64,
    #[serde(default = "default_true")]
    spendable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
struct SignedTx {
    hex: String,
    complete: bool,
}

/// A [`Ledger`] backed by a bitcoind wallet.
///
/// Coins handed out by [`Ledger::fund`] are reserved in memory so that
/// concurrent opens do not select the same outputs.  A reservation ends when
/// a broadcast spending the coin is accepted, or when the funding is released.
pub struct BitcoindLedger {
    client: HttpClient,
    url: String,
    network: Network,
    reserved: Mutex<OrderedSet<OutPoint>>,
}

impl BitcoindLedger {
    /// Connect to bitcoind at `url`, taking basic auth credentials from the URL
    pub fn new(url: &Url, network: Network) -> anyhow::Result<Self> {
        let mut endpoint = url.clone();
        let mut builder = HttpClientBuilder::default().request_timeout(REQUEST_TIMEOUT);
        if !url.username().is_empty() {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            let mut headers = HeaderMap::new();
            let value = HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(credentials)))?;
            headers.insert("Authorization", value);
            builder = builder.set_headers(headers);
            let _ = endpoint.set_username("");
            let _ = endpoint.set_password(None);
        }
        let client = builder.build(endpoint.as_str())?;
        Ok(BitcoindLedger {
            client,
            url: endpoint.to_string(),
            network,
            reserved: Mutex::new(OrderedSet::new()),
        })
    }

    fn reserved(&self) -> MutexGuard<OrderedSet<OutPoint>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unreserve<'a>(&self, outpoints: impl Iterator<Item = &'a OutPoint>) {
        let mut reserved = self.reserved();
        for outpoint in outpoints {
            reserved.remove(outpoint);
        }
    }

    async fn call<R, P>(&self, cmd: &str, params: P) -> Result<R>
    where
        R: DeserializeOwned,
        P: ToRpcParams + Send,
    {
        self.client.request(cmd, params).await.map_err(|e| {
            error!("{}: {}: {}", cmd, self.url, e);
            match e {
                ClientError::Call(obj) =>
                    Error::LedgerRejected(format!("{}: {}", cmd, obj.message())),
                other => Error::NetworkFailure(format!("{}: {}", cmd, other)),
            }
        })
    }

    async fn address_script(&self, cmd: &str) -> Result<ScriptBuf> {
        let addr: String = self.call(cmd, rpc_params![]).await?;
        let address = Address::from_str(&addr)
            .map_err(|e| Error::LedgerRejected(format!("{}: bad address {}: {}", cmd, addr, e)))?
            .require_network(self.network)
            .map_err(|e| Error::LedgerRejected(format!("{}: {}", cmd, e)))?;
        Ok(address.script_pubkey())
    }
}

/// Pick coins covering `target_sat`, largest first
fn select_coins(mut coins: Vec<(OutPoint, u64)>, target_sat: u64) -> Option<(Vec<OutPoint>, u64)> {
    coins.sort_by(|a, b| b.1.cmp(&a.1));
    let mut selected = Vec::new();
    let mut total = 0u64;
    for (outpoint, value) in coins {
        if total >= target_sat {
            break;
        }
        selected.push(outpoint);
        total += value;
    }
    if total >= target_sat {
        Some((selected, total))
    } else {
        None
    }
}

#[async_trait]
impl Ledger for BitcoindLedger {
    #[instrument(skip(self))]
    async fn fund(&self, amount_sat: u64) -> Result<FundingInputs> {
        let unspent: Vec<Unspent> = self.call("listunspent", rpc_params![1]).await?;
        let target_sat = amount_sat + FUNDING_FEE_SAT;
        let selection = {
            let mut reserved = self.reserved();
            let coins: Vec<(OutPoint, u64)> = unspent
                .iter()
                .filter(|u| u.spendable)
                .map(|u| (OutPoint { txid: u.txid, vout: u.vout }, u.amount))
                .filter(|(outpoint, _)| !reserved.contains(outpoint))
                .filter_map(|(outpoint, btc)| {
                    Amount::from_btc(btc).ok().map(|amount| (outpoint, amount.to_sat()))
                })
                .collect();
            let selection = select_coins(coins, target_sat).ok_or_else(|| {
                Error::LedgerRejected(format!("wallet cannot cover {} sat", target_sat))
            })?;
            reserved.extend(selection.0.iter().cloned());
            selection
        };
        let (outpoints, total_sat) = selection;

        let change_sat = total_sat - target_sat;
        let change = if change_sat >= DUST_LIMIT_SAT {
            let script_pubkey = match self.address_script("getrawchangeaddress").await {
                Ok(script) => script,
                Err(e) => {
                    self.unreserve(outpoints.iter());
                    return Err(e);
                }
            };
            Some(TxOut { value: Amount::from_sat(change_sat), script_pubkey })
        } else {
            None
        };
        debug!("funding {} sat from {} coins, change {}", amount_sat, outpoints.len(), change_sat);

        let inputs = outpoints
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();
        Ok(FundingInputs { inputs, change })
    }

    fn release(&self, funding: &FundingInputs) {
        debug!("releasing {} coins", funding.inputs.len());
        self.unreserve(funding.inputs.iter().map(|i| &i.previous_output));
    }

    async fn sign_funding(&self, tx: &mut Transaction) -> Result<()> {
        let signed: SignedTx =
            self.call("signrawtransactionwithwallet", rpc_params![serialize_hex(&*tx)]).await?;
        if !signed.complete {
            return Err(Error::LedgerRejected(format!(
                "wallet could not sign all inputs of {}",
                tx.compute_txid()
            )));
        }
        *tx = deserialize_hex(&signed.hex)
            .map_err(|e| Error::LedgerRejected(format!("bad signed transaction: {}", e)))?;
        Ok(())
    }

    async fn new_payout_script(&self) -> Result<ScriptBuf> {
        self.address_script("getnewaddress").await
    }

    #[instrument(skip(self, tx), fields(txid = %tx.compute_txid()))]
    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastStatus> {
        let result: Result<Txid> =
            self.call("sendrawtransaction", rpc_params![serialize_hex(tx)]).await;
        match result {
            Ok(txid) => {
                info!("broadcast {}", txid);
                self.unreserve(tx.input.iter().map(|i| &i.previous_output));
                Ok(BroadcastStatus::Confirmed(txid))
            }
            Err(Error::LedgerRejected(reason)) => {
                warn!("broadcast rejected: {}", reason);
                Ok(BroadcastStatus::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::server::{RpcModule, Server};
    use jsonrpsee::types::{ErrorObject, ErrorObjectOwned};
    use paynet::bitcoin::hashes::Hash;
    use paynet::bitcoin::CompressedPublicKey;
    use paynet::util::test_utils::make_test_pubkey;
    use serde_json::json;
    use std::net::SocketAddr;
    use test_log::test;

    fn coin(i: u8) -> Txid {
        Txid::from_byte_array([i; 32])
    }

    fn address(i: u8) -> String {
        Address::p2wpkh(&CompressedPublicKey(make_test_pubkey(i)), Network::Regtest).to_string()
    }

    async fn start_fake_bitcoind() -> SocketAddr {
        let mut module = RpcModule::new(());
        module
            .register_method("listunspent", |_, _, _| {
                Ok::<_, ErrorObjectOwned>(json!([
                    { "txid": coin(1).to_string(), "vout": 0, "amount": 0.0005, "spendable": true },
                    { "txid": coin(2).to_string(), "vout": 1, "amount": 0.001, "spendable": true },
                    { "txid": coin(3).to_string(), "vout": 0, "amount": 0.5, "spendable": false },
                ]))
            })
            .unwrap();
        module
            .register_method("getrawchangeaddress", |_, _, _| {
                Ok::<_, ErrorObjectOwned>(address(7))
            })
            .unwrap();
        module
            .register_method("getnewaddress", |_, _, _| Ok::<_, ErrorObjectOwned>(address(8)))
            .unwrap();
        module
            .register_method("signrawtransactionwithwallet", |params, _, _| {
                let hex: String = params.one()?;
                Ok::<_, ErrorObjectOwned>(json!({ "hex": hex, "complete": true }))
            })
            .unwrap();
        module
            .register_method("sendrawtransaction", |params, _, _| {
                let hex: String = params.one()?;
                let tx: Transaction = deserialize_hex(&hex).unwrap();
                if tx.input.is_empty() {
                    return Err(ErrorObject::owned(-26, "bad-txns-vin-empty", None::<bool>));
                }
                Ok(tx.compute_txid())
            })
            .unwrap();
        let server = Server::builder().http_only().build("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.start(module);
        tokio::spawn(handle.stopped());
        addr
    }

    #[test]
    fn select_coins_test() {
        let coins = vec![
            (OutPoint { txid: coin(1), vout: 0 }, 10),
            (OutPoint { txid: coin(2), vout: 0 }, 30),
            (OutPoint { txid: coin(3), vout: 0 }, 20),
        ];
        let (selected, total) = select_coins(coins.clone(), 40).unwrap();
        assert_eq!(selected, vec![coins[1].0, coins[2].0]);
        assert_eq!(total, 50);
        assert!(select_coins(coins, 61).is_none());
    }

    #[test(tokio::test)]
    async fn bitcoind_ledger_test() {
        let addr = start_fake_bitcoind().await;
        let url = Url::parse(&format!("http://user:pass@{}", addr)).unwrap();
        let ledger = BitcoindLedger::new(&url, Network::Regtest).unwrap();

        let funding = ledger.fund(50_000).await.unwrap();
        // the larger coin covers it, leaving change above dust
        assert_eq!(funding.inputs.len(), 1);
        assert_eq!(funding.inputs[0].previous_output.txid, coin(2));
        let change = funding.change.as_ref().unwrap();
        assert_eq!(change.value, Amount::from_sat(100_000 - 50_000 - FUNDING_FEE_SAT));

        // reserved coins are not handed out twice
        let funding2 = ledger.fund(10_000).await.unwrap();
        assert_eq!(funding2.inputs[0].previous_output.txid, coin(1));
        assert!(ledger.fund(10_000).await.is_err());

        // an abandoned funding gives its coins back
        ledger.release(&funding2);
        let funding3 = ledger.fund(10_000).await.unwrap();
        assert_eq!(funding3.inputs[0].previous_output.txid, coin(1));
        ledger.release(&funding3);

        let script = ledger.new_payout_script().await.unwrap();
        assert!(script.is_p2wpkh());

        let mut tx = Transaction {
            version: paynet::bitcoin::transaction::Version::TWO,
            lock_time: paynet::bitcoin::absolute::LockTime::ZERO,
            input: funding.inputs.clone(),
            output: vec![TxOut { value: Amount::from_sat(50_000), script_pubkey: script }],
        };
        ledger.sign_funding(&mut tx).await.unwrap();
        assert_eq!(
            ledger.broadcast(&tx).await.unwrap(),
            BroadcastStatus::Confirmed(tx.compute_txid())
        );
        assert!(ledger.reserved().is_empty());

        tx.input.clear();
        match ledger.broadcast(&tx).await.unwrap() {
            BroadcastStatus::Rejected(reason) => assert!(reason.contains("bad-txns-vin-empty")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
