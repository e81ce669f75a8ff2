//! Mining controller.
//!
//! Broadcasts work templates to external solvers over UDP multicast at about
//! 1 Hz, watches the wallet RPC endpoint so mining pauses while no wallet is
//! reachable, and advertises this node's endpoints to the cluster. Large
//! payloads are split into shards, each datagram carrying a four-byte magic
//! so stateless solvers can reassemble them.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pod_chain::{Chain, TxPool};
use pod_consensus::Hash256;
use pod_primitives::encoding::{DecodeError, Decoder, Encoder};
use pod_primitives::sha256d;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{save_config, NodeConfig};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 17, 71, 19);
pub const CONTROLLER_PORT: u16 = 11_049;
pub const MAX_DATAGRAM_SIZE: usize = 8_192;

pub const JOB_MAGIC: [u8; 4] = *b"work";
pub const ADVT_MAGIC: [u8; 4] = *b"advt";
pub const PAUSE_MAGIC: [u8; 4] = *b"paus";

const MAGIC_SIZE: usize = 4;
const SHARD_HEADER_SIZE: usize = 4 + 2 + 2;
const SHARD_CHUNK_SIZE: usize = MAX_DATAGRAM_SIZE - MAGIC_SIZE - SHARD_HEADER_SIZE;

/// Ticks between endpoint re-publishes on the advertiser loop.
const COUNT_TICK: u64 = 10;

/// Templates older than this are regenerated once the tx set moves.
const TEMPLATE_STALE_AFTER: Duration = Duration::from_secs(60);

const WALLET_BACKOFF_START: Duration = Duration::from_secs(1);
const WALLET_BACKOFF_MAX: Duration = Duration::from_secs(5);
const WALLET_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Split a payload into datagram-sized shards. Pure: the same payload always
/// produces the same shards. Each shard carries the payload digest prefix,
/// its index, and the shard count, so receivers can reassemble out of order.
pub fn get_shards(payload: &[u8]) -> Vec<Vec<u8>> {
    let digest = sha256d(payload);
    let msg_id = &digest[..4];
    let total = payload.len().div_ceil(SHARD_CHUNK_SIZE).max(1);
    let mut shards = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * SHARD_CHUNK_SIZE;
        let end = (start + SHARD_CHUNK_SIZE).min(payload.len());
        let chunk = &payload[start.min(payload.len())..end];
        let mut shard = Vec::with_capacity(SHARD_HEADER_SIZE + chunk.len());
        shard.extend_from_slice(msg_id);
        shard.extend_from_slice(&(index as u16).to_le_bytes());
        shard.extend_from_slice(&(total as u16).to_le_bytes());
        shard.extend_from_slice(chunk);
        shards.push(shard);
    }
    shards
}

/// Reassemble shards produced by [`get_shards`]. Order does not matter;
/// shards from a different payload are rejected.
pub fn join_shards(shards: &[Vec<u8>]) -> Result<Vec<u8>, String> {
    if shards.is_empty() {
        return Err("no shards".to_string());
    }
    let mut msg_id: Option<[u8; 4]> = None;
    let mut total: Option<usize> = None;
    let mut chunks: HashMap<usize, &[u8]> = HashMap::new();
    for shard in shards {
        if shard.len() < SHARD_HEADER_SIZE {
            return Err("short shard".to_string());
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&shard[..4]);
        let index = u16::from_le_bytes([shard[4], shard[5]]) as usize;
        let count = u16::from_le_bytes([shard[6], shard[7]]) as usize;
        if *msg_id.get_or_insert(id) != id {
            return Err("mixed shard message ids".to_string());
        }
        if *total.get_or_insert(count) != count {
            return Err("inconsistent shard counts".to_string());
        }
        chunks.insert(index, &shard[SHARD_HEADER_SIZE..]);
    }
    let total = total.unwrap_or(0);
    let mut payload = Vec::new();
    for index in 0..total {
        let chunk = chunks
            .get(&index)
            .ok_or_else(|| format!("missing shard {index} of {total}"))?;
        payload.extend_from_slice(chunk);
    }
    let digest = sha256d(&payload);
    if msg_id != Some([digest[0], digest[1], digest[2], digest[3]]) {
        return Err("reassembled payload does not match shard message id".to_string());
    }
    Ok(payload)
}

/// An endpoint advertisement multicast by each controller in the cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeAdvt {
    pub uuid: u64,
    pub p2p_port: u16,
    pub addresses: Vec<String>,
}

impl NodeAdvt {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.uuid);
        encoder.write_u16_le(self.p2p_port);
        encoder.write_varint(self.addresses.len() as u64);
        for address in &self.addresses {
            encoder.write_var_str(address);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let uuid = decoder.read_u64_le()?;
        let p2p_port = decoder.read_u16_le()?;
        let count = decoder.read_varint()?;
        let count =
            usize::try_from(count).map_err(|_| DecodeError::Oversized("address count".to_string()))?;
        if count > 64 {
            return Err(DecodeError::Oversized("address count".to_string()));
        }
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            addresses.push(decoder.read_var_str(64)?);
        }
        Ok(Self {
            uuid,
            p2p_port,
            addresses,
        })
    }
}

/// A prepared unit of work for external solvers.
#[derive(Clone, Debug)]
pub struct WorkTemplate {
    pub height: i32,
    pub prev_block: Hash256,
    pub bits: u32,
    pub timestamp: u32,
    pub tx_count: u64,
}

impl WorkTemplate {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.height);
        encoder.write_hash(&self.prev_block);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u64_le(self.tx_count);
        encoder.into_inner()
    }
}

/// Where work templates come from. The chain and pool supply the contents;
/// assembling a full block is the generator's business, not the controller's.
pub trait TemplateSource: Send + Sync {
    fn build_template(&self) -> Result<WorkTemplate, String>;
}

pub struct ChainTemplateSource {
    pub chain: Arc<dyn Chain>,
    pub tx_pool: Arc<dyn TxPool>,
}

impl TemplateSource for ChainTemplateSource {
    fn build_template(&self) -> Result<WorkTemplate, String> {
        let best = self.chain.best_snapshot();
        Ok(WorkTemplate {
            height: best.height + 1,
            prev_block: best.hash,
            bits: 0x1d00ffff,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|duration| duration.as_secs() as u32)
                .unwrap_or(0),
            tx_count: self.tx_pool.count() as u64,
        })
    }
}

/// Wallet RPC liveness contract the watcher polls.
pub trait WalletClient: Send + Sync {
    fn disconnected(&self) -> bool;
}

pub trait WalletRpc: Send + Sync + 'static {
    type Client: WalletClient + Send + Sync + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Client, String>> + Send;
}

/// Probes the wallet server with a plain TCP connection; the stream doubles
/// as the liveness handle.
pub struct TcpWalletRpc {
    pub server: SocketAddr,
}

pub struct TcpWalletClient {
    stream: TcpStream,
}

impl WalletClient for TcpWalletClient {
    fn disconnected(&self) -> bool {
        self.stream.peer_addr().is_err()
    }
}

impl WalletRpc for TcpWalletRpc {
    type Client = TcpWalletClient;

    async fn connect(&self) -> Result<TcpWalletClient, String> {
        match tokio::time::timeout(Duration::from_secs(3), TcpStream::connect(self.server)).await {
            Ok(Ok(stream)) => Ok(TcpWalletClient { stream }),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("wallet server {} timed out", self.server)),
        }
    }
}

/// The outbound half of the multicast channel.
pub struct MulticastChannel {
    socket: UdpSocket,
    target: SocketAddr,
}

impl MulticastChannel {
    pub async fn open() -> Result<Self, String> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|err| format!("failed to bind multicast sender: {err}"))?;
        Ok(Self {
            socket,
            target: SocketAddr::from((MULTICAST_GROUP, CONTROLLER_PORT)),
        })
    }

    /// Atomically multicast a pre-sharded message: every shard goes out with
    /// the one magic, back to back.
    pub async fn send_many(&self, magic: [u8; 4], shards: &[Vec<u8>]) -> Result<(), String> {
        for shard in shards {
            let mut datagram = Vec::with_capacity(MAGIC_SIZE + shard.len());
            datagram.extend_from_slice(&magic);
            datagram.extend_from_slice(shard);
            self.socket
                .send_to(&datagram, self.target)
                .await
                .map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

/// Open the listening side: bound to the controller port and joined to the
/// multicast group.
pub async fn open_multicast_receiver() -> Result<UdpSocket, String> {
    let socket = UdpSocket::bind(("0.0.0.0", CONTROLLER_PORT))
        .await
        .map_err(|err| format!("failed to bind multicast receiver: {err}"))?;
    socket
        .join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)
        .map_err(|err| format!("failed to join multicast group: {err}"))?;
    Ok(socket)
}

pub struct Controller<W: WalletRpc> {
    channel: MulticastChannel,
    active: AtomicBool,
    is_mining: Arc<AtomicBool>,
    height: AtomicI32,
    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    template_source: Arc<dyn TemplateSource>,
    wallet: Arc<W>,
    msg_block_template: Mutex<Option<WorkTemplate>>,
    old_blocks: Mutex<Vec<Vec<u8>>>,
    last_tx_update: Mutex<u64>,
    last_generated: Mutex<Instant>,
    pause_shards: Vec<Vec<u8>>,
    other_nodes: Mutex<HashMap<u64, NodeAdvt>>,
    uuid: u64,
    config: Arc<Mutex<NodeConfig>>,
    config_path: PathBuf,
    quit_tx: watch::Sender<bool>,
}

pub struct ControllerConfig<W: WalletRpc> {
    pub chain: Arc<dyn Chain>,
    pub tx_pool: Arc<dyn TxPool>,
    pub template_source: Arc<dyn TemplateSource>,
    pub wallet: Arc<W>,
    pub p2p_port: u16,
    pub config: Arc<Mutex<NodeConfig>>,
    pub config_path: PathBuf,
}

impl<W: WalletRpc> Controller<W> {
    pub async fn new(config: ControllerConfig<W>) -> Result<Arc<Self>, String> {
        let channel = MulticastChannel::open().await?;
        let uuid: u64 = rand::random();
        let advert = NodeAdvt {
            uuid,
            p2p_port: config.p2p_port,
            addresses: Vec::new(),
        };
        // Prepared up front so the interrupt path allocates nothing.
        let pause_shards = get_shards(&advert.encode());
        let (quit_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            channel,
            active: AtomicBool::new(false),
            is_mining: Arc::new(AtomicBool::new(false)),
            height: AtomicI32::new(0),
            chain: config.chain,
            tx_pool: config.tx_pool,
            template_source: config.template_source,
            wallet: config.wallet,
            msg_block_template: Mutex::new(None),
            old_blocks: Mutex::new(Vec::new()),
            last_tx_update: Mutex::new(0),
            last_generated: Mutex::new(Instant::now()),
            pause_shards,
            other_nodes: Mutex::new(HashMap::new()),
            uuid,
            config: config.config,
            config_path: config.config_path,
            quit_tx,
        }))
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn is_mining(&self) -> bool {
        self.is_mining.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> i32 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn other_nodes(&self) -> usize {
        self.other_nodes.lock().map(|nodes| nodes.len()).unwrap_or(0)
    }

    /// Spawn the wallet watcher and the advertise/rebroadcast ticker.
    /// Idempotent.
    pub fn run(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(group = %MULTICAST_GROUP, port = CONTROLLER_PORT, "sending broadcasts");
        let watcher = {
            let wallet = Arc::clone(&self.wallet);
            let is_mining = Arc::clone(&self.is_mining);
            let quit_rx = self.quit_tx.subscribe();
            wallet_watcher_loop(wallet, is_mining, quit_rx)
        };
        tokio::spawn(watcher);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.advertiser_and_rebroadcaster().await;
        });
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.advert_listener().await;
        });
    }

    /// Announce the pause, stop the loops. Called from the interrupt path.
    pub async fn shutdown(&self) {
        debug!("miner controller shutting down");
        self.active.store(false, Ordering::SeqCst);
        if let Err(err) = self.channel.send_many(PAUSE_MAGIC, &self.pause_shards).await {
            warn!(%err, "failed to send pause announcement");
        }
        self.quit_tx.send_replace(true);
    }

    pub async fn send_shards(&self, magic: [u8; 4], shards: &[Vec<u8>]) -> Result<(), String> {
        self.channel.send_many(magic, shards).await
    }

    fn advert(&self) -> NodeAdvt {
        let (p2p_port, addresses) = {
            let config = self.config.lock();
            match config {
                Ok(config) => {
                    let port = config
                        .p2p_listeners
                        .first()
                        .and_then(|listener| listener.rsplit(':').next())
                        .and_then(|port| port.parse().ok())
                        .unwrap_or(0);
                    (port, own_endpoints(&config))
                }
                Err(_) => (0, Vec::new()),
            }
        };
        NodeAdvt {
            uuid: self.uuid,
            p2p_port,
            addresses,
        }
    }

    async fn advertiser_and_rebroadcaster(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut counter = COUNT_TICK / 2;
        let mut quit_rx = self.quit_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = quit_rx.changed() => {
                    debug!("controller quitting on close quit channel");
                    break;
                }
            }
            self.height
                .store(self.chain.best_snapshot().height, Ordering::Relaxed);
            if counter % COUNT_TICK == 0 {
                self.republish_endpoints();
            }
            counter += 1;
            let advert_shards = get_shards(&self.advert().encode());
            if let Err(err) = self.send_shards(ADVT_MAGIC, &advert_shards).await {
                trace!(%err, "advertisement send failed");
            }
            if self.is_mining.load(Ordering::Relaxed) {
                trace!("updating and sending out new work");
                if let Err(err) = self.update_and_send_work().await {
                    warn!(%err, "failed to update and send work");
                }
            }
        }
        self.active.store(false, Ordering::SeqCst);
        debug!("controller exiting");
    }

    /// Rewrite the auto-listen connect list with this node's own reachable
    /// endpoints and persist the configuration, so cluster members sharing a
    /// config find each other through each node's self-published addresses.
    fn republish_endpoints(&self) {
        let snapshot = {
            let Ok(mut config) = self.config.lock() else {
                return;
            };
            if !config.auto_listen {
                return;
            }
            config.p2p_connect = own_endpoints(&config);
            config.clone()
        };
        if let Err(err) = save_config(&self.config_path, &snapshot) {
            warn!(%err, "failed to persist config");
        }
    }

    /// Re-send cached work, regenerating it first when stale.
    async fn update_and_send_work(&self) -> Result<(), String> {
        let have_template = self
            .msg_block_template
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        let old = self
            .old_blocks
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let tx_source_moved = {
            let last_seen = self.last_tx_update.lock().map(|guard| *guard).unwrap_or(0);
            self.tx_pool.last_updated() != last_seen
        };
        let since_generated = self
            .last_generated
            .lock()
            .map(|guard| guard.elapsed())
            .unwrap_or(Duration::ZERO);

        let shards = if template_is_stale(have_template, !old.is_empty(), tx_source_moved, since_generated)
        {
            trace!("regenerating block template");
            let template = self.template_source.build_template()?;
            if let Ok(mut guard) = self.last_tx_update.lock() {
                *guard = self.tx_pool.last_updated();
            }
            if let Ok(mut guard) = self.last_generated.lock() {
                *guard = Instant::now();
            }
            let shards = get_shards(&template.encode());
            if let Ok(mut guard) = self.msg_block_template.lock() {
                *guard = Some(template);
            }
            shards
        } else {
            old
        };
        self.send_shards(JOB_MAGIC, &shards).await?;
        if let Ok(mut guard) = self.old_blocks.lock() {
            *guard = shards;
        }
        Ok(())
    }

    /// Collect advertisements from the other controllers in the cluster.
    async fn advert_listener(self: Arc<Self>) {
        let socket = match open_multicast_receiver().await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%err, "multicast receiver unavailable, cluster adverts disabled");
                return;
            }
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut partial: HashMap<[u8; 4], Vec<Vec<u8>>> = HashMap::new();
        let mut quit_rx = self.quit_tx.subscribe();
        loop {
            let received = tokio::select! {
                _ = quit_rx.changed() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let Ok((len, _from)) = received else { continue };
            if len < MAGIC_SIZE + SHARD_HEADER_SIZE {
                continue;
            }
            if buf[..MAGIC_SIZE] != ADVT_MAGIC {
                continue;
            }
            let shard = buf[MAGIC_SIZE..len].to_vec();
            let mut msg_id = [0u8; 4];
            msg_id.copy_from_slice(&shard[..4]);
            let total = u16::from_le_bytes([shard[6], shard[7]]) as usize;
            let shards = partial.entry(msg_id).or_default();
            shards.push(shard);
            if shards.len() < total {
                continue;
            }
            let shards = partial.remove(&msg_id).unwrap_or_default();
            let Ok(payload) = join_shards(&shards) else { continue };
            let Ok(advert) = NodeAdvt::decode(&payload) else { continue };
            if advert.uuid == self.uuid {
                continue;
            }
            trace!(uuid = advert.uuid, "learned cluster node");
            if let Ok(mut nodes) = self.other_nodes.lock() {
                nodes.insert(advert.uuid, advert);
            }
        }
    }
}

/// This node's reachable P2P endpoints: explicit listener addresses as
/// configured, with wildcard binds rewritten to the interface the default
/// route would leave through.
fn own_endpoints(config: &NodeConfig) -> Vec<String> {
    let mut endpoints = Vec::new();
    for listener in &config.p2p_listeners {
        let Ok(addr) = listener.parse::<SocketAddr>() else {
            continue;
        };
        if addr.ip().is_unspecified() {
            if let Some(ip) = default_route_ip() {
                endpoints.push(SocketAddr::new(ip, addr.port()).to_string());
            }
        } else {
            endpoints.push(addr.to_string());
        }
    }
    endpoints.sort();
    endpoints.dedup();
    endpoints
}

/// The local address the kernel would source multicast traffic from. The
/// connect sends nothing; it only binds the socket to an interface.
fn default_route_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((MULTICAST_GROUP, CONTROLLER_PORT)).ok()?;
    let local = socket.local_addr().ok()?;
    if local.ip().is_unspecified() {
        return None;
    }
    Some(local.ip())
}

/// The template regeneration rule: always regenerate when there is nothing
/// cached; otherwise only once the tx set has moved and the cached template
/// has aged past the one-minute ceiling. Solvers are stateless and need a
/// continuous feed, but template assembly is expensive enough to batch.
fn template_is_stale(
    have_template: bool,
    have_shards: bool,
    tx_source_moved: bool,
    since_generated: Duration,
) -> bool {
    if !have_template || !have_shards {
        return true;
    }
    tx_source_moved && since_generated > TEMPLATE_STALE_AFTER
}

/// Maintain the wallet connection, flipping `is_mining` with its health.
pub(crate) async fn wallet_watcher_loop<W: WalletRpc>(
    wallet: Arc<W>,
    is_mining: Arc<AtomicBool>,
    mut quit_rx: watch::Receiver<bool>,
) {
    debug!("starting wallet rpc connection watcher for mining addresses");
    let mut backoff = WALLET_BACKOFF_START;
    'watcher: loop {
        let client = loop {
            if *quit_rx.borrow() {
                break 'watcher;
            }
            debug!("trying to connect to wallet for mining addresses");
            match wallet.connect().await {
                Ok(client) => {
                    debug!("controller has wallet connection");
                    is_mining.store(true, Ordering::Relaxed);
                    backoff = WALLET_BACKOFF_START;
                    break client;
                }
                Err(err) => {
                    trace!(%err, "wallet connect failed, will try again");
                    is_mining.store(false, Ordering::Relaxed);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = quit_rx.changed() => {
                            is_mining.store(false, Ordering::Relaxed);
                            break 'watcher;
                        }
                    }
                    if backoff < WALLET_BACKOFF_MAX {
                        backoff += WALLET_BACKOFF_STEP;
                    }
                }
            }
        };
        let mut retry_ticker = tokio::time::interval(Duration::from_secs(1));
        retry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = retry_ticker.tick() => {
                    if client.disconnected() {
                        is_mining.store(false, Ordering::Relaxed);
                        break;
                    }
                }
                _ = quit_rx.changed() => {
                    is_mining.store(false, Ordering::Relaxed);
                    break 'watcher;
                }
            }
        }
        debug!("disconnected from wallet");
    }
}
