use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use pod_chain::memory::{MemoryChain, MemoryTxPool};
use pod_chain::{Chain, TxPool};
use pod_consensus::params::{chain_params, ChainParams, Network};
use pod_consensus::ZERO_HASH;
use pod_node::addr_book::{persist_peers_loop, AddrBook};
use pod_node::config::{load_config, save_config, CONFIG_FILE_NAME};
use pod_node::connmgr::{ConnManager, ConnManagerConfig, ConnReq, TcpDialer};
use pod_node::control::{
    ChainTemplateSource, Controller, ControllerConfig, TcpWalletRpc,
};
use pod_node::fee_estimator::{
    FeeEstimator, DEFAULT_FEE_MAX_ROLLBACK, DEFAULT_FEE_MAX_SAMPLES,
};
use pod_node::netsync::{SyncManager, SyncManagerConfig};
use pod_node::server::{PeerHub, Server};
use pod_primitives::block::BlockHeader;
use pod_primitives::{Block, OutPoint, Transaction, TxIn, TxOut};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_TARGET_OUTBOUND: u32 = 8;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRY_DURATION_SECS: u64 = 5;
const STATUS_INTERVAL_SECS: u64 = 30;
const PEERS_FILE_NAME: &str = "peers.dat";
const FEE_ESTIMATES_FILE_NAME: &str = "fee_estimates.dat";
const FEE_ESTIMATES_PERSIST_INTERVAL_SECS: u64 = 300;
const GENESIS_TIMESTAMP: u32 = 1_402_754_664;

struct Config {
    network: Network,
    data_dir: PathBuf,
    listen_addrs: Vec<SocketAddr>,
    connect_addrs: Vec<SocketAddr>,
    target_outbound: u32,
    no_checkpoints: bool,
    enable_controller: bool,
    wallet_server: Option<SocketAddr>,
    auto_listen: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen_addrs: Vec::new(),
            connect_addrs: Vec::new(),
            target_outbound: DEFAULT_TARGET_OUTBOUND,
            no_checkpoints: false,
            enable_controller: false,
            wallet_server: None,
            auto_listen: false,
        }
    }
}

fn usage() -> &'static str {
    "pod [options]\n\
     --network=<mainnet|testnet|regtest>\n\
     --datadir=<path>\n\
     --listen=<addr:port>           (repeatable)\n\
     --connect=<addr:port>          persistent peer (repeatable)\n\
     --target-outbound=<n>\n\
     --no-checkpoints\n\
     --controller                   enable the mining controller\n\
     --wallet-server=<addr:port>\n\
     --auto-listen"
}

fn parse_args(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    for arg in args {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (arg.as_str(), None),
        };
        match key {
            "--network" => {
                let value = value.ok_or("--network requires a value")?;
                config.network =
                    Network::parse(value).ok_or_else(|| format!("unknown network {value}"))?;
            }
            "--datadir" => {
                config.data_dir = PathBuf::from(value.ok_or("--datadir requires a value")?);
            }
            "--listen" => {
                let value = value.ok_or("--listen requires a value")?;
                config
                    .listen_addrs
                    .push(value.parse().map_err(|_| format!("bad listen addr {value}"))?);
            }
            "--connect" => {
                let value = value.ok_or("--connect requires a value")?;
                config
                    .connect_addrs
                    .push(value.parse().map_err(|_| format!("bad connect addr {value}"))?);
            }
            "--target-outbound" => {
                let value = value.ok_or("--target-outbound requires a value")?;
                config.target_outbound = value
                    .parse()
                    .map_err(|_| format!("bad target outbound {value}"))?;
            }
            "--no-checkpoints" => config.no_checkpoints = true,
            "--controller" => config.enable_controller = true,
            "--wallet-server" => {
                let value = value.ok_or("--wallet-server requires a value")?;
                config.wallet_server = Some(
                    value
                        .parse()
                        .map_err(|_| format!("bad wallet server addr {value}"))?,
                );
            }
            "--auto-listen" => config.auto_listen = true,
            "--help" | "-h" => return Err(usage().to_string()),
            other => return Err(format!("unknown option {other}\n{}", usage())),
        }
    }
    Ok(config)
}

/// The in-memory backend needs a concrete genesis block to anchor heights.
fn build_genesis_block(params: &ChainParams) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: ZERO_HASH,
            merkle_root: [0x4a; 32],
            timestamp: GENESIS_TIMESTAMP,
            bits: 0x1d00ffff,
            nonce: u32::from(params.message_start[0]),
        },
        transactions: vec![Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: ZERO_HASH,
                    index: u32::MAX,
                },
                script_sig: params.message_start.to_vec(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }],
    }
}

async fn resolve_seed_addresses(params: &ChainParams) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for seed in &params.dns_seeds {
        match tokio::net::lookup_host((*seed, params.default_port)).await {
            Ok(addrs) => out.extend(addrs),
            Err(err) => warn!(seed, %err, "dns seed lookup failed"),
        }
    }
    out
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;
    let params = Arc::new(chain_params(config.network));
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create data dir: {err}"))?;

    let config_path = config.data_dir.join(CONFIG_FILE_NAME);
    let node_config = Arc::new(Mutex::new({
        let mut loaded = load_config(&config_path)?;
        loaded.network = config.network.as_str().to_string();
        loaded.auto_listen = config.auto_listen;
        loaded.p2p_listeners = config
            .listen_addrs
            .iter()
            .map(|addr| addr.to_string())
            .collect();
        if let Some(wallet) = config.wallet_server {
            loaded.wallet_server = wallet.to_string();
        }
        loaded
    }));

    info!(network = params.network.as_str(), "starting pod node");

    let chain: Arc<dyn Chain> = Arc::new(MemoryChain::new(
        build_genesis_block(&params),
        params.checkpoints.clone(),
    ));
    let tx_pool: Arc<dyn TxPool> = Arc::new(MemoryTxPool::new());

    let addr_book = Arc::new(AddrBook::new());
    let peers_path = config.data_dir.join(PEERS_FILE_NAME);
    match addr_book.load_file(&peers_path) {
        Ok(count) if count > 0 => info!(count, "loaded peers file"),
        Ok(_) => {}
        Err(err) => warn!(%err, "failed to load peers file"),
    }
    let seeds = resolve_seed_addresses(&params).await;
    if !seeds.is_empty() {
        info!(count = seeds.len(), "seeded address book from dns");
        addr_book.insert_many(seeds);
    }
    // Previously learned cluster endpoints count as candidates too.
    {
        let connect: Vec<SocketAddr> = node_config
            .lock()
            .map(|config| {
                config
                    .p2p_connect
                    .iter()
                    .filter_map(|value| value.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        addr_book.insert_many(connect);
    }

    let fee_path = config.data_dir.join(FEE_ESTIMATES_FILE_NAME);
    let fee_estimator = Arc::new(Mutex::new(
        FeeEstimator::load(&fee_path, DEFAULT_FEE_MAX_SAMPLES, DEFAULT_FEE_MAX_ROLLBACK)
            .unwrap_or_else(|err| {
                warn!(%err, "failed to load fee estimates, starting fresh");
                FeeEstimator::new(DEFAULT_FEE_MAX_SAMPLES, DEFAULT_FEE_MAX_ROLLBACK)
            }),
    ));

    let hub = Arc::new(PeerHub::new());
    let sync_manager = SyncManager::new(SyncManagerConfig {
        peer_notifier: hub.clone(),
        chain: Arc::clone(&chain),
        tx_pool: Arc::clone(&tx_pool),
        chain_params: Arc::clone(&params),
        fee_estimator: Some(Arc::clone(&fee_estimator)),
        disable_checkpoints: config.no_checkpoints,
    });
    sync_manager.start();

    let server = Server::new(
        Arc::clone(&params),
        Arc::clone(&chain),
        Arc::clone(&tx_pool),
        Arc::clone(&addr_book),
        Arc::clone(&hub),
        sync_manager.clone(),
    );

    let mut listeners = Vec::new();
    for addr in &config.listen_addrs {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| format!("failed to bind p2p listener {addr}: {err}"))?;
        listeners.push(listener);
    }

    // The connection callbacks need the manager that is being constructed,
    // so the handle goes through a cell set right after creation.
    let manager_cell: Arc<OnceLock<ConnManager<TcpDialer>>> = Arc::new(OnceLock::new());

    let get_new_address = {
        let addr_book = Arc::clone(&addr_book);
        let hub = Arc::clone(&hub);
        move || -> Result<SocketAddr, String> {
            let connected: Vec<SocketAddr> =
                hub.peers().iter().map(|peer| peer.addr()).collect();
            addr_book
                .sample(8)
                .into_iter()
                .find(|candidate| !connected.contains(candidate))
                .ok_or_else(|| "no unconnected address available".to_string())
        }
    };

    let on_connection = {
        let server = Arc::clone(&server);
        let manager_cell = Arc::clone(&manager_cell);
        let addr_book = Arc::clone(&addr_book);
        move |req: Arc<ConnReq>, stream: tokio::net::TcpStream| {
            let Some(addr) = req.addr() else { return };
            addr_book.record_attempt(addr);
            let server = Arc::clone(&server);
            let manager_cell = Arc::clone(&manager_cell);
            let req_id = req.id();
            tokio::spawn(async move {
                let on_done: Box<dyn FnOnce() + Send> = Box::new(move || {
                    if let Some(manager) = manager_cell.get() {
                        manager.disconnect(req_id);
                    }
                });
                server
                    .handle_connection(stream, addr, false, Some(on_done))
                    .await;
            });
        }
    };

    let on_accept = {
        let server = Arc::clone(&server);
        move |stream: tokio::net::TcpStream, addr: SocketAddr| {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server.handle_connection(stream, addr, true, None).await;
            });
        }
    };

    let conn_manager = ConnManager::new(ConnManagerConfig {
        listeners,
        on_accept: Some(Arc::new(on_accept)),
        target_outbound: config.target_outbound,
        retry_duration: Duration::from_secs(DEFAULT_RETRY_DURATION_SECS),
        on_connection: Some(Arc::new(on_connection)),
        on_disconnection: None,
        get_new_address: Some(Arc::new(get_new_address)),
        dialer: TcpDialer {
            timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        },
    });
    manager_cell
        .set(conn_manager.clone())
        .map_err(|_| "connection manager cell already set".to_string())?;
    conn_manager.start();

    // Persistent peers bypass the address source and retry forever.
    for addr in &config.connect_addrs {
        let req = Arc::new(ConnReq::new(Some(*addr), true));
        conn_manager.connect(req);
    }

    let controller = if config.enable_controller {
        match config.wallet_server {
            None => {
                warn!("not running controller without a wallet server");
                None
            }
            Some(wallet_server) => {
                let controller = Controller::new(ControllerConfig {
                    chain: Arc::clone(&chain),
                    tx_pool: Arc::clone(&tx_pool),
                    template_source: Arc::new(ChainTemplateSource {
                        chain: Arc::clone(&chain),
                        tx_pool: Arc::clone(&tx_pool),
                    }),
                    wallet: Arc::new(TcpWalletRpc {
                        server: wallet_server,
                    }),
                    p2p_port: config
                        .listen_addrs
                        .first()
                        .map(|addr| addr.port())
                        .unwrap_or(params.default_port),
                    config: Arc::clone(&node_config),
                    config_path: config_path.clone(),
                })
                .await?;
                controller.run();
                Some(controller)
            }
        }
    } else {
        None
    };

    tokio::spawn(persist_peers_loop(Arc::clone(&addr_book), peers_path.clone()));
    tokio::spawn(persist_fee_estimates_loop(
        Arc::clone(&fee_estimator),
        fee_path.clone(),
    ));
    tokio::spawn(status_logger(
        Arc::clone(&chain),
        Arc::clone(&tx_pool),
        Arc::clone(&hub),
        sync_manager.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("failed to wait for interrupt: {err}"))?;
    info!("interrupt received, shutting down");

    if let Some(controller) = &controller {
        controller.shutdown().await;
    }
    conn_manager.stop();
    sync_manager.stop().await;
    if let Err(err) = addr_book.save_file(&peers_path) {
        warn!(%err, "failed to save peers file");
    }
    if let Ok(estimator) = fee_estimator.lock() {
        if let Err(err) = estimator.save(&fee_path) {
            warn!(%err, "failed to save fee estimates");
        }
    }
    let snapshot = node_config
        .lock()
        .map(|config| config.clone())
        .map_err(|_| "node config lock poisoned".to_string())?;
    if let Err(err) = save_config(&config_path, &snapshot) {
        warn!(%err, "failed to save config");
    }
    info!("shutdown complete");
    Ok(())
}

async fn persist_fee_estimates_loop(
    estimator: Arc<Mutex<FeeEstimator>>,
    path: PathBuf,
) {
    let mut last_revision = 0u64;
    let mut interval =
        tokio::time::interval(Duration::from_secs(FEE_ESTIMATES_PERSIST_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let (revision, result) = {
            let Ok(estimator) = estimator.lock() else { continue };
            if estimator.revision() == last_revision {
                continue;
            }
            (estimator.revision(), estimator.save(&path))
        };
        match result {
            Ok(bytes) => {
                last_revision = revision;
                tracing::debug!(bytes, "persisted fee estimates");
            }
            Err(err) => error!(%err, "failed to persist fee estimates"),
        }
    }
}

async fn status_logger(
    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    hub: Arc<PeerHub>,
    sync_manager: SyncManager,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let best = chain.best_snapshot();
        let (bytes_recv, bytes_sent, _) = hub.net_totals().snapshot();
        let current = sync_manager.is_current().await;
        info!(
            height = best.height,
            peers = hub.peer_count(),
            mempool = tx_pool.count(),
            current,
            bytes_recv,
            bytes_sent,
            "status"
        );
    }
}
