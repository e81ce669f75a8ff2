//! Peer lifecycle driving and relay.
//!
//! The server owns the handshake, the per-peer reader and writer tasks, and
//! the peer registry. It feeds decoded protocol messages into the sync
//! manager's queues and implements the announcement fan-out the sync manager
//! calls back into.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pod_chain::{Chain, TxPool};
use pod_consensus::constants::{SENDHEADERS_VERSION, SF_NODE_NETWORK};
use pod_consensus::{ChainParams, Hash256};
use pod_primitives::block::BlockHeader;
use pod_primitives::Transaction;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::addr_book::AddrBook;
use crate::netsync::{PeerNotifier, SyncManager};
use crate::peer::Peer;
use crate::wire::{self, InvVect, NetAddress, NetMessage, VersionMessage, MSG_BLOCK, MSG_TX};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const PING_INTERVAL: Duration = Duration::from_secs(120);
const OUTBOUND_QUEUE: usize = 128;
const MAX_GETDATA_SERVED: usize = 256;
const MAX_ADDR_SERVED: usize = 1_000;

/// Aggregate transfer counters across all peers.
#[derive(Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, usize) {
        (
            self.bytes_recv.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.connections.load(Ordering::Relaxed),
        )
    }

    fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_connections(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }
}

/// Registry of live peers plus the announcement fan-out. This is the
/// `PeerNotifier` the sync manager talks to.
pub struct PeerHub {
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    next_peer_id: AtomicU64,
    net_totals: NetTotals,
    confirmed_tx: broadcast::Sender<Hash256>,
}

impl Default for PeerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerHub {
    pub fn new() -> Self {
        let (confirmed_tx, _) = broadcast::channel(1_024);
        Self {
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(0),
            net_totals: NetTotals::default(),
            confirmed_tx,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_peer_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register(&self, peer: Arc<Peer>) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer.id(), peer);
        }
        self.net_totals.inc_connections();
    }

    pub fn unregister(&self, id: u64) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
        self.net_totals.dec_connections();
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn net_totals(&self) -> &NetTotals {
        &self.net_totals
    }

    /// Wallet-facing stream of confirmed transaction ids.
    pub fn subscribe_confirmed(&self) -> broadcast::Receiver<Hash256> {
        self.confirmed_tx.subscribe()
    }
}

impl PeerNotifier for PeerHub {
    fn relay_inventory(&self, inv: InvVect, header: Option<BlockHeader>) {
        for peer in self.peers() {
            if peer.knows_inventory(&inv) {
                continue;
            }
            peer.add_known_inventory(inv);
            // Peers that asked for sendheaders get the header itself, the
            // rest get a classic inv.
            let message = match (&header, peer.wants_headers()) {
                (Some(header), true) => NetMessage::Headers(vec![*header]),
                _ => NetMessage::Inv(vec![inv]),
            };
            peer.queue_message(message);
        }
    }

    fn announce_new_transactions(&self, txs: &[Arc<Transaction>]) {
        for tx in txs {
            let inv = InvVect::tx(tx.txid());
            for peer in self.peers() {
                if peer.knows_inventory(&inv) {
                    continue;
                }
                peer.add_known_inventory(inv);
                peer.queue_message(NetMessage::Inv(vec![inv]));
            }
        }
    }

    fn transaction_confirmed(&self, tx: &Transaction) {
        let _ = self.confirmed_tx.send(tx.txid());
    }

    fn update_peer_heights(&self, hash: &Hash256, height: i32, origin_peer: u64) {
        for peer in self.peers() {
            if peer.id() == origin_peer {
                continue;
            }
            if peer.last_announced_block() == Some(*hash) {
                peer.update_last_block_height(height);
                peer.clear_last_announced_block();
            }
        }
    }
}

pub struct Server {
    params: Arc<ChainParams>,
    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    addr_book: Arc<AddrBook>,
    hub: Arc<PeerHub>,
    sync_manager: SyncManager,
}

impl Server {
    pub fn new(
        params: Arc<ChainParams>,
        chain: Arc<dyn Chain>,
        tx_pool: Arc<dyn TxPool>,
        addr_book: Arc<AddrBook>,
        hub: Arc<PeerHub>,
        sync_manager: SyncManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            chain,
            tx_pool,
            addr_book,
            hub,
            sync_manager,
        })
    }

    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    /// Drive one connection from handshake to teardown. `on_done` fires when
    /// the peer is gone, so the connection manager can schedule a
    /// replacement.
    pub async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        inbound: bool,
        on_done: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let magic = self.params.message_start;
        let remote = match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.handshake(&mut stream),
        )
        .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(err)) => {
                debug!(%addr, %err, "handshake failed");
                if !inbound {
                    self.addr_book.record_failure(addr);
                }
                if let Some(on_done) = on_done {
                    on_done();
                }
                return;
            }
            Err(_) => {
                debug!(%addr, "handshake timed out");
                if !inbound {
                    self.addr_book.record_failure(addr);
                }
                if let Some(on_done) = on_done {
                    on_done();
                }
                return;
            }
        };
        // Inbound peers connect from ephemeral ports; only outbound targets
        // belong in the address book.
        if !inbound {
            self.addr_book.record_success(addr, remote.start_height);
        }

        let id = self.hub.next_id();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer::new(
            id,
            addr,
            inbound,
            remote.services,
            remote.protocol_version,
            remote.user_agent.clone(),
            remote.start_height,
            out_tx,
        ));
        debug!(peer = %peer, agent = %remote.user_agent, height = remote.start_height, "peer connected");
        self.hub.register(Arc::clone(&peer));

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(writer_loop(
            write_half,
            magic,
            out_rx,
            Arc::clone(&self.hub),
            Arc::clone(&peer),
        ));

        // Keep the link warm; a silent peer is dropped by the read timeout.
        let pinger = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move {
                loop {
                    tokio::time::sleep(PING_INTERVAL).await;
                    if peer.disconnect_requested() {
                        break;
                    }
                    peer.queue_message(NetMessage::Ping(rand::random()));
                }
            }
        });

        // Prefer header announcements from peers that understand them.
        if remote.protocol_version >= SENDHEADERS_VERSION {
            peer.queue_message(NetMessage::SendHeaders);
        }
        self.sync_manager.new_peer(Arc::clone(&peer));

        self.read_loop(read_half, magic, &peer).await;

        peer.request_disconnect();
        self.hub.unregister(id);
        self.sync_manager.done_peer(Arc::clone(&peer));
        writer.abort();
        pinger.abort();
        debug!(peer = %peer, "peer done");
        if let Some(on_done) = on_done {
            on_done();
        }
    }

    /// Exchange version/verack. Both sides push their version immediately;
    /// the handshake completes when ours is acknowledged and theirs arrived.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<VersionMessage, String> {
        let magic = self.params.message_start;
        let best = self.chain.best_snapshot();
        let nonce: u64 = rand::random();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        let our_version = VersionMessage::new(SF_NODE_NETWORK, nonce, best.height, timestamp);
        wire::write_message(stream, magic, &NetMessage::Version(our_version)).await?;

        let mut remote: Option<VersionMessage> = None;
        let mut got_verack = false;
        while remote.is_none() || !got_verack {
            let (command, payload, _) = wire::read_message(stream, magic).await?;
            match NetMessage::decode(&command, &payload).map_err(|err| err.to_string())? {
                NetMessage::Version(version) => {
                    if version.nonce == nonce {
                        return Err("connected to self".to_string());
                    }
                    wire::write_message(stream, magic, &NetMessage::Verack).await?;
                    remote = Some(version);
                }
                NetMessage::Verack => got_verack = true,
                NetMessage::Ping(ping_nonce) => {
                    wire::write_message(stream, magic, &NetMessage::Pong(ping_nonce)).await?;
                }
                other => {
                    trace!(command = other.command(), "ignoring message during handshake");
                }
            }
        }
        Ok(remote.expect("loop exits only with a version"))
    }

    async fn read_loop(
        &self,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        magic: [u8; 4],
        peer: &Arc<Peer>,
    ) {
        loop {
            // The read future is only ever cancelled by the disconnect
            // branch, after which the stream is torn down; a partial frame
            // cannot leak into the next read.
            let message = tokio::select! {
                _ = peer.wait_disconnect() => break,
                result = tokio::time::timeout(READ_TIMEOUT, wire::read_message(&mut read_half, magic)) => {
                    match result {
                        Ok(Ok((command, payload, bytes))) => {
                            self.hub.net_totals().add_recv(bytes);
                            match NetMessage::decode(&command, &payload) {
                                Ok(message) => message,
                                Err(err) => {
                                    debug!(peer = %peer, %command, %err, "undecodable message");
                                    continue;
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            trace!(peer = %peer, %err, "peer read failed");
                            break;
                        }
                        Err(_) => {
                            debug!(peer = %peer, "peer read timed out");
                            break;
                        }
                    }
                }
            };
            if !self.dispatch(peer, message).await {
                break;
            }
        }
    }

    /// Route one decoded message. Returns false to drop the peer.
    async fn dispatch(&self, peer: &Arc<Peer>, message: NetMessage) -> bool {
        match message {
            NetMessage::Ping(nonce) => {
                peer.queue_message(NetMessage::Pong(nonce));
            }
            NetMessage::Pong(_) => {}
            NetMessage::Inv(invs) => {
                self.sync_manager.queue_inv(invs, Arc::clone(peer));
            }
            NetMessage::Headers(headers) => {
                self.sync_manager.queue_headers(headers, Arc::clone(peer));
            }
            NetMessage::Block(block) => {
                // Wait for the sync manager to consume the block before
                // reading more, so one peer cannot flood the pipeline.
                let done = self.sync_manager.queue_block(block, Arc::clone(peer));
                let _ = done.await;
            }
            NetMessage::Tx(tx) => {
                let done = self.sync_manager.queue_tx(tx, Arc::clone(peer));
                let _ = done.await;
            }
            NetMessage::Addr(entries) => {
                let addrs: Vec<SocketAddr> = entries.iter().map(|entry| entry.addr).collect();
                let learned = self.addr_book.insert_many(addrs);
                if learned > 0 {
                    debug!(peer = %peer, learned, "learned addresses");
                }
            }
            NetMessage::GetAddr => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|duration| duration.as_secs() as u32)
                    .unwrap_or(0);
                let sample = self.addr_book.sample(MAX_ADDR_SERVED);
                let entries: Vec<NetAddress> = sample
                    .into_iter()
                    .map(|addr| NetAddress {
                        timestamp: now,
                        services: SF_NODE_NETWORK,
                        addr,
                    })
                    .collect();
                peer.queue_message(NetMessage::Addr(entries));
            }
            NetMessage::GetData(invs) => {
                self.serve_getdata(peer, invs);
            }
            NetMessage::Mempool => {
                // Answer with an announcement of everything the pool holds.
                let invs: Vec<InvVect> = self
                    .tx_pool
                    .txids()
                    .into_iter()
                    .map(InvVect::tx)
                    .collect();
                if !invs.is_empty() {
                    for inv in &invs {
                        peer.add_known_inventory(*inv);
                    }
                    peer.queue_message(NetMessage::Inv(invs));
                }
            }
            NetMessage::SendHeaders => {
                peer.set_wants_headers();
            }
            NetMessage::Reject(reject) => {
                debug!(
                    peer = %peer,
                    command = %reject.message,
                    reason = %reject.reason,
                    "peer rejected our message"
                );
            }
            NetMessage::GetBlocks { .. } | NetMessage::GetHeaders { .. } => {
                trace!(peer = %peer, "ignoring chain-serving request");
            }
            NetMessage::NotFound(invs) => {
                trace!(peer = %peer, count = invs.len(), "peer reported notfound");
            }
            NetMessage::Version(_) | NetMessage::Verack => {
                // Duplicate handshake traffic after negotiation is a
                // protocol violation.
                warn!(peer = %peer, "duplicate version handshake, disconnecting");
                return false;
            }
            NetMessage::Unknown { command } => {
                trace!(peer = %peer, %command, "ignoring unknown message");
            }
        }
        true
    }

    fn serve_getdata(&self, peer: &Arc<Peer>, invs: Vec<InvVect>) {
        let mut notfound = Vec::new();
        let mut served = 0usize;
        for inv in invs {
            if served >= MAX_GETDATA_SERVED {
                break;
            }
            match inv.inv_type {
                MSG_BLOCK => match self.chain.fetch_block(&inv.hash) {
                    Some(block) => {
                        peer.add_known_inventory(inv);
                        peer.queue_message(NetMessage::Block(block));
                        served += 1;
                    }
                    None => notfound.push(inv),
                },
                MSG_TX => match self.tx_pool.fetch_transaction(&inv.hash) {
                    Some(tx) => {
                        peer.add_known_inventory(inv);
                        peer.queue_message(NetMessage::Tx(tx));
                        served += 1;
                    }
                    None => notfound.push(inv),
                },
                _ => notfound.push(inv),
            }
        }
        if !notfound.is_empty() {
            peer.queue_message(NetMessage::NotFound(notfound));
        }
    }
}

async fn writer_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    magic: [u8; 4],
    mut out_rx: mpsc::Receiver<NetMessage>,
    hub: Arc<PeerHub>,
    peer: Arc<Peer>,
) {
    while let Some(message) = out_rx.recv().await {
        match wire::write_message(&mut write_half, magic, &message).await {
            Ok(bytes) => hub.net_totals().add_sent(bytes),
            Err(err) => {
                trace!(peer = %peer, %err, "peer write failed");
                peer.request_disconnect();
                break;
            }
        }
    }
}
