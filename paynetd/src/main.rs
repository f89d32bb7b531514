use std::fs;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::*;
use paynet::node::{Node, NodeServices};
use paynet_persist::kvv::redb::RedbKVVStore;

use paynetd::client::JsonRpcConnector;
use paynetd::config::parse_args_and_config;
use paynetd::ledger::BitcoindLedger;
use paynetd::rpc_server::start_rpc_server;
use paynetd::util::observability::init_tracing_subscriber;
use paynetd::util::read_or_create_node_secret;

const APP_NAME: &str = "paynetd";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args_and_config();

    let datapath = args.datapath();
    fs::create_dir_all(&datapath).with_context(|| format!("mkdir {}", datapath.display()))?;
    let _log_guard = init_tracing_subscriber(&datapath, APP_NAME, &args.log_level)?;
    info!("{} {} starting in {}", APP_NAME, env!("CARGO_PKG_VERSION"), datapath.display());

    let bitcoind_rpc = match &args.bitcoind_rpc {
        Some(url) => url,
        None => bail!("--bitcoind-rpc is required"),
    };
    let ledger = Arc::new(BitcoindLedger::new(bitcoind_rpc, args.network)?);

    let secret_path = args.secret_file.clone().unwrap_or_else(|| datapath.join("node_secret"));
    let node_secret = read_or_create_node_secret(&secret_path)?;

    let persister = RedbKVVStore::new(datapath.join("store"))
        .map_err(|e| anyhow!("cannot open store: {}", e))?;

    let config = args.node_config();
    // a forward waits for every downstream hop, so the transport must outlast that
    let request_timeout =
        Duration::from_millis(config.hop_timeout_ms.saturating_mul(config.max_hops as u64 + 1));
    let services = NodeServices {
        connector: Arc::new(JsonRpcConnector::new(request_timeout)),
        ledger,
        persister: Arc::new(persister),
    };
    let node = Node::new(config, node_secret, services)?;

    let (shutdown_trigger, shutdown_signal) = triggered::trigger();
    ctrlc::set_handler(move || {
        shutdown_trigger.trigger();
    })
    .context("setting Ctrl-C handler")?;

    let (addr, join_handle) =
        start_rpc_server(node, args.rpc_server_address, args.rpc_server_port, shutdown_signal)
            .await?;
    info!("{} {} ready on {}", APP_NAME, process::id(), addr);
    join_handle.await?;
    info!("{} {} finished", APP_NAME, process::id());
    Ok(())
}
