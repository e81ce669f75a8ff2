//! The handle the rest of the node holds for one connected remote peer.
//!
//! A `Peer` is created after the version handshake completes. The reader and
//! writer tasks live in the server; everything here is the shared, lock-light
//! bookkeeping plus the outbound queue. Owners never touch the socket: they
//! queue typed messages or request a disconnect and wait for the reader to
//! notice.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use pod_consensus::Hash256;
use tokio::sync::mpsc;

use crate::wire::{InvVect, NetMessage, Reject, RejectCode};

/// How many inventory vectors a peer is remembered to know about.
const MAX_KNOWN_INVENTORY: usize = 1_000;

/// Bounded memory of inventory a peer has advertised or been sent, so we do
/// not echo announcements back at it.
struct KnownInventory {
    order: VecDeque<InvVect>,
    set: HashSet<InvVect>,
}

impl KnownInventory {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(MAX_KNOWN_INVENTORY),
            set: HashSet::with_capacity(MAX_KNOWN_INVENTORY),
        }
    }

    fn insert(&mut self, inv: InvVect) {
        if !self.set.insert(inv) {
            return;
        }
        self.order.push_back(inv);
        while self.order.len() > MAX_KNOWN_INVENTORY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    fn contains(&self, inv: &InvVect) -> bool {
        self.set.contains(inv)
    }
}

pub struct Peer {
    id: u64,
    addr: SocketAddr,
    inbound: bool,
    services: u64,
    protocol_version: i32,
    user_agent: String,
    last_block: AtomicI32,
    last_announced_block: Mutex<Option<Hash256>>,
    known_inventory: Mutex<KnownInventory>,
    wants_headers: AtomicBool,
    disconnect: AtomicBool,
    disconnect_notify: tokio::sync::Notify,
    prev_get_blocks: Mutex<Option<(Hash256, Hash256)>>,
    prev_get_headers: Mutex<Option<(Hash256, Hash256)>>,
    out_tx: mpsc::Sender<NetMessage>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        addr: SocketAddr,
        inbound: bool,
        services: u64,
        protocol_version: i32,
        user_agent: String,
        start_height: i32,
        out_tx: mpsc::Sender<NetMessage>,
    ) -> Self {
        Self {
            id,
            addr,
            inbound,
            services,
            protocol_version,
            user_agent,
            last_block: AtomicI32::new(start_height),
            last_announced_block: Mutex::new(None),
            known_inventory: Mutex::new(KnownInventory::new()),
            wants_headers: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            disconnect_notify: tokio::sync::Notify::new(),
            prev_get_blocks: Mutex::new(None),
            prev_get_headers: Mutex::new(None),
            out_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn inbound(&self) -> bool {
        self.inbound
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn last_block(&self) -> i32 {
        self.last_block.load(Ordering::Relaxed)
    }

    pub fn update_last_block_height(&self, height: i32) {
        self.last_block.fetch_max(height, Ordering::Relaxed);
    }

    pub fn last_announced_block(&self) -> Option<Hash256> {
        self.last_announced_block.lock().ok().and_then(|guard| *guard)
    }

    pub fn update_last_announced_block(&self, hash: Hash256) {
        if let Ok(mut guard) = self.last_announced_block.lock() {
            *guard = Some(hash);
        }
    }

    pub fn clear_last_announced_block(&self) {
        if let Ok(mut guard) = self.last_announced_block.lock() {
            *guard = None;
        }
    }

    pub fn add_known_inventory(&self, inv: InvVect) {
        if let Ok(mut guard) = self.known_inventory.lock() {
            guard.insert(inv);
        }
    }

    pub fn knows_inventory(&self, inv: &InvVect) -> bool {
        self.known_inventory
            .lock()
            .map(|guard| guard.contains(inv))
            .unwrap_or(false)
    }

    pub fn wants_headers(&self) -> bool {
        self.wants_headers.load(Ordering::Relaxed)
    }

    pub fn set_wants_headers(&self) {
        self.wants_headers.store(true, Ordering::Relaxed);
    }

    /// Ask the reader task to drop this peer. Idempotent.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::Relaxed);
        self.disconnect_notify.notify_one();
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Relaxed)
    }

    /// Resolve once a disconnect has been requested. The notify permit is
    /// stored, so a request racing this call is never missed.
    pub async fn wait_disconnect(&self) {
        if self.disconnect_requested() {
            return;
        }
        self.disconnect_notify.notified().await;
    }

    /// Hand a message to the writer task without blocking. A full queue means
    /// the peer is too slow to keep; it gets disconnected instead of stalling
    /// the caller.
    pub fn queue_message(&self, message: NetMessage) -> bool {
        match self.out_tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(peer = %self.addr, "outbound queue full, disconnecting");
                self.request_disconnect();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send a getblocks request, suppressing an exact repeat of the previous
    /// one so stalled peers are not spammed.
    pub fn push_get_blocks(&self, locator: Vec<Hash256>, stop: Hash256) -> Result<(), String> {
        let begin = locator.first().copied().unwrap_or([0u8; 32]);
        if let Ok(mut prev) = self.prev_get_blocks.lock() {
            if *prev == Some((begin, stop)) {
                return Ok(());
            }
            *prev = Some((begin, stop));
        }
        if self.queue_message(NetMessage::GetBlocks { locator, stop }) {
            Ok(())
        } else {
            Err("peer outbound queue closed".to_string())
        }
    }

    pub fn push_get_headers(&self, locator: Vec<Hash256>, stop: Hash256) -> Result<(), String> {
        let begin = locator.first().copied().unwrap_or([0u8; 32]);
        if let Ok(mut prev) = self.prev_get_headers.lock() {
            if *prev == Some((begin, stop)) {
                return Ok(());
            }
            *prev = Some((begin, stop));
        }
        if self.queue_message(NetMessage::GetHeaders { locator, stop }) {
            Ok(())
        } else {
            Err("peer outbound queue closed".to_string())
        }
    }

    pub fn push_reject(
        &self,
        command: &str,
        code: RejectCode,
        reason: String,
        hash: Option<Hash256>,
    ) {
        self.queue_message(NetMessage::Reject(Reject {
            message: command.to_string(),
            code,
            reason,
            hash,
        }));
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.inbound { "inbound" } else { "outbound" };
        write!(f, "{} ({direction}, id {})", self.addr, self.id)
    }
}
