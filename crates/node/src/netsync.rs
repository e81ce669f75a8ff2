//! Block synchronization manager.
//!
//! One dispatch task processes every protocol event, so the request maps and
//! headers-first state need no locks. Peers hand their decoded messages to
//! the queue methods; the chain reports accepted, connected, and disconnected
//! blocks over a notification channel that is drained by the same task,
//! keeping the bookkeeping linearized with chain calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use pod_chain::{
    extract_coinbase_height, should_have_serialized_height, BehaviorFlags, Chain, ChainError,
    ChainErrorKind, ChainNotification, TxPool,
};
use pod_consensus::constants::{MAX_INV_PER_MSG, SF_NODE_NETWORK};
use pod_consensus::{Checkpoint, ChainParams, Hash256, ZERO_HASH};
use pod_primitives::block::BlockHeader;
use pod_primitives::{Block, Transaction};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::fee_estimator::{FeeEstimator, DEFAULT_FEE_MAX_ROLLBACK, DEFAULT_FEE_MAX_SAMPLES};
use crate::peer::Peer;
use crate::progress::BlockProgressLogger;
use crate::wire::{err_to_reject, InvVect, NetMessage, CMD_BLOCK, CMD_TX, MSG_BLOCK, MSG_TX};

/// Minimum number of blocks in flight during headers-first mode before
/// another getdata batch is issued.
const MIN_IN_FLIGHT_BLOCKS: usize = 10;

/// Maximum number of rejected transaction hashes kept in memory.
const MAX_REJECTED_TXNS: usize = 1_000;

/// Maximum number of requested block hashes kept in memory.
const MAX_REQUESTED_BLOCKS: usize = MAX_INV_PER_MSG;

/// Maximum number of requested transaction hashes kept in memory.
const MAX_REQUESTED_TXNS: usize = MAX_INV_PER_MSG;

/// Outbound announcements the sync manager hands back to the peer layer.
pub trait PeerNotifier: Send + Sync {
    /// Broadcast availability of a freshly accepted block.
    fn relay_inventory(&self, inv: InvVect, header: Option<BlockHeader>);

    /// Broadcast transactions newly accepted into the pool.
    fn announce_new_transactions(&self, txs: &[Arc<Transaction>]);

    /// A transaction from the pool was confirmed by a connected block.
    fn transaction_confirmed(&self, tx: &Transaction);

    /// Refresh the height estimate of peers that announced this block.
    fn update_peer_heights(&self, hash: &Hash256, height: i32, origin_peer: u64);
}

pub struct SyncManagerConfig {
    pub peer_notifier: Arc<dyn PeerNotifier>,
    pub chain: Arc<dyn Chain>,
    pub tx_pool: Arc<dyn TxPool>,
    pub chain_params: Arc<ChainParams>,
    pub fee_estimator: Option<Arc<Mutex<FeeEstimator>>>,
    pub disable_checkpoints: bool,
}

enum SyncMessage {
    NewPeer(Arc<Peer>),
    DonePeer(Arc<Peer>),
    Block {
        block: Arc<Block>,
        peer: Arc<Peer>,
        done: oneshot::Sender<()>,
    },
    Tx {
        tx: Arc<Transaction>,
        peer: Arc<Peer>,
        done: oneshot::Sender<()>,
    },
    Inv {
        inv: Vec<InvVect>,
        peer: Arc<Peer>,
    },
    Headers {
        headers: Vec<BlockHeader>,
        peer: Arc<Peer>,
    },
    ProcessBlock {
        block: Arc<Block>,
        flags: BehaviorFlags,
        reply: oneshot::Sender<Result<bool, ChainError>>,
    },
    GetSyncPeer {
        reply: oneshot::Sender<u64>,
    },
    IsCurrent {
        reply: oneshot::Sender<bool>,
    },
    Pause {
        resume: oneshot::Receiver<()>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeaderNode {
    height: i32,
    hash: Hash256,
}

/// Per-peer bookkeeping owned by the dispatch task.
struct PeerSyncState {
    peer: Arc<Peer>,
    sync_candidate: bool,
    request_queue: VecDeque<InvVect>,
    requested_txns: HashSet<Hash256>,
    requested_blocks: HashSet<Hash256>,
}

struct SyncInner {
    started: AtomicBool,
    shutdown: AtomicBool,
    msg_tx: mpsc::UnboundedSender<SyncMessage>,
    msg_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncMessage>>>,
    notification_rx: Mutex<Option<mpsc::UnboundedReceiver<ChainNotification>>>,
    state: Mutex<Option<SyncState>>,
    quit_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncInner>,
}

impl SyncManager {
    pub fn new(config: SyncManagerConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        config.chain.subscribe(notification_tx);
        let (quit_tx, _) = watch::channel(false);

        let best = config.chain.best_snapshot();
        let mut state = SyncState {
            notifier: config.peer_notifier,
            chain: config.chain,
            tx_pool: config.tx_pool,
            params: config.chain_params,
            fee_estimator: config.fee_estimator,
            rejected_txns: HashSet::new(),
            requested_txns: HashSet::new(),
            requested_blocks: HashSet::new(),
            sync_peer: None,
            peer_states: HashMap::new(),
            headers_first_mode: false,
            header_list: VecDeque::new(),
            start_header: None,
            next_checkpoint: None,
            progress: BlockProgressLogger::new("processed"),
        };
        if !config.disable_checkpoints {
            state.next_checkpoint = find_next_header_checkpoint(
                &state.chain.checkpoints(),
                best.height,
            );
            if state.next_checkpoint.is_some() {
                state.reset_header_state(best.hash, best.height);
            }
        } else {
            info!("checkpoints are disabled");
        }

        Self {
            inner: Arc::new(SyncInner {
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                msg_tx,
                msg_rx: Mutex::new(Some(msg_rx)),
                notification_rx: Mutex::new(Some(notification_rx)),
                state: Mutex::new(Some(state)),
                quit_tx,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Launch the block handler task. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("starting sync manager");
        let msg_rx = self
            .inner
            .msg_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let notification_rx = self
            .inner
            .notification_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let state = self
            .inner
            .state
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let (Some(msg_rx), Some(notification_rx), Some(state)) = (msg_rx, notification_rx, state)
        else {
            return;
        };
        let quit_rx = self.inner.quit_tx.subscribe();
        let handle = tokio::spawn(block_handler(state, msg_rx, notification_rx, quit_rx));
        if let Ok(mut guard) = self.inner.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Shut the block handler down and wait for it. Idempotent.
    pub async fn stop(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            debug!("sync manager is already in the process of shutting down");
            return;
        }
        self.inner.quit_tx.send_replace(true);
        let handle = self
            .inner
            .handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Inform the manager of a newly negotiated peer.
    pub fn new_peer(&self, peer: Arc<Peer>) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.msg_tx.send(SyncMessage::NewPeer(peer));
    }

    /// Inform the manager that a peer has departed.
    pub fn done_peer(&self, peer: Arc<Peer>) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.msg_tx.send(SyncMessage::DonePeer(peer));
    }

    /// Queue a block from a peer. The returned receiver completes once the
    /// message has been consumed, including when the manager is shutting
    /// down, so the peer reader can throttle on it safely.
    pub fn queue_block(&self, block: Arc<Block>, peer: Arc<Peer>) -> oneshot::Receiver<()> {
        let (done, done_rx) = oneshot::channel();
        if self.inner.shutdown.load(Ordering::SeqCst) {
            let _ = done.send(());
            return done_rx;
        }
        if let Err(mpsc::error::SendError(message)) =
            self.inner.msg_tx.send(SyncMessage::Block { block, peer, done })
        {
            if let SyncMessage::Block { done, .. } = message {
                let _ = done.send(());
            }
        }
        done_rx
    }

    /// Queue a transaction from a peer, with the same acknowledgement
    /// contract as [`SyncManager::queue_block`].
    pub fn queue_tx(&self, tx: Arc<Transaction>, peer: Arc<Peer>) -> oneshot::Receiver<()> {
        let (done, done_rx) = oneshot::channel();
        if self.inner.shutdown.load(Ordering::SeqCst) {
            let _ = done.send(());
            return done_rx;
        }
        if let Err(mpsc::error::SendError(message)) =
            self.inner.msg_tx.send(SyncMessage::Tx { tx, peer, done })
        {
            if let SyncMessage::Tx { done, .. } = message {
                let _ = done.send(());
            }
        }
        done_rx
    }

    /// Peers never block on inventory announcements.
    pub fn queue_inv(&self, inv: Vec<InvVect>, peer: Arc<Peer>) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.msg_tx.send(SyncMessage::Inv { inv, peer });
    }

    /// Peers never block on header deliveries.
    pub fn queue_headers(&self, headers: Vec<BlockHeader>, peer: Arc<Peer>) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.msg_tx.send(SyncMessage::Headers { headers, peer });
    }

    /// Run a block through the chain, serialized with the sync bookkeeping.
    /// Returns whether the block is an orphan.
    pub async fn process_block(
        &self,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let (reply, reply_rx) = oneshot::channel();
        self.inner
            .msg_tx
            .send(SyncMessage::ProcessBlock { block, flags, reply })
            .map_err(|_| ChainError::internal("sync manager is shut down"))?;
        reply_rx
            .await
            .map_err(|_| ChainError::internal("sync manager dropped the request"))?
    }

    /// Whether the manager believes it is synced with its peers.
    pub async fn is_current(&self) -> bool {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .inner
            .msg_tx
            .send(SyncMessage::IsCurrent { reply })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// The id of the current sync peer, or zero when there is none.
    pub async fn sync_peer_id(&self) -> u64 {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .inner
            .msg_tx
            .send(SyncMessage::GetSyncPeer { reply })
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Halt message processing until the returned sender is used or dropped.
    /// Callers get exclusive access to the manager's collaborators while the
    /// pause holds, and should keep it short.
    pub fn pause(&self) -> oneshot::Sender<()> {
        let (resume_tx, resume) = oneshot::channel();
        let _ = self.inner.msg_tx.send(SyncMessage::Pause { resume });
        resume_tx
    }
}

/// State owned exclusively by the block handler task.
struct SyncState {
    notifier: Arc<dyn PeerNotifier>,
    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    params: Arc<ChainParams>,
    fee_estimator: Option<Arc<Mutex<FeeEstimator>>>,
    rejected_txns: HashSet<Hash256>,
    requested_txns: HashSet<Hash256>,
    requested_blocks: HashSet<Hash256>,
    sync_peer: Option<u64>,
    peer_states: HashMap<u64, PeerSyncState>,
    headers_first_mode: bool,
    header_list: VecDeque<HeaderNode>,
    start_header: Option<usize>,
    next_checkpoint: Option<Checkpoint>,
    progress: BlockProgressLogger,
}

async fn block_handler(
    mut state: SyncState,
    mut msg_rx: mpsc::UnboundedReceiver<SyncMessage>,
    mut notification_rx: mpsc::UnboundedReceiver<ChainNotification>,
    mut quit_rx: watch::Receiver<bool>,
) {
    let mut notifications_open = true;
    loop {
        tokio::select! {
            _ = quit_rx.changed() => break,
            maybe = msg_rx.recv() => {
                let Some(message) = maybe else { break };
                state.handle_message(message).await;
            }
            maybe = notification_rx.recv(), if notifications_open => {
                match maybe {
                    Some(notification) => state.handle_notification(notification),
                    None => notifications_open = false,
                }
            }
        }
    }
    trace!("sync manager block handler done");
}

impl SyncState {
    async fn handle_message(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::NewPeer(peer) => self.handle_new_peer(peer),
            SyncMessage::DonePeer(peer) => self.handle_done_peer(&peer),
            SyncMessage::Block { block, peer, done } => {
                self.handle_block_msg(block, &peer);
                let _ = done.send(());
            }
            SyncMessage::Tx { tx, peer, done } => {
                self.handle_tx_msg(tx, &peer);
                let _ = done.send(());
            }
            SyncMessage::Inv { inv, peer } => self.handle_inv_msg(inv, &peer),
            SyncMessage::Headers { headers, peer } => self.handle_headers_msg(&headers, &peer),
            SyncMessage::ProcessBlock { block, flags, reply } => {
                let result = self
                    .chain
                    .process_block(block, flags)
                    .map(|outcome| outcome.is_orphan);
                let _ = reply.send(result);
            }
            SyncMessage::GetSyncPeer { reply } => {
                let _ = reply.send(self.sync_peer.unwrap_or(0));
            }
            SyncMessage::IsCurrent { reply } => {
                let _ = reply.send(self.current());
            }
            SyncMessage::Pause { resume } => {
                // Hold the loop until the sender resumes or goes away.
                let _ = resume.await;
            }
        }
    }

    /// True when we believe we are synced with our peers.
    fn current(&self) -> bool {
        if !self.chain.is_current() {
            return false;
        }
        // If the chain thinks it is current and we have no sync peer it is
        // probably right.
        let Some(sync_peer) = self.sync_peer_handle() else {
            return true;
        };
        // No matter what the chain says, we are not current while below the
        // height we are syncing to.
        self.chain.best_snapshot().height >= sync_peer.last_block()
    }

    fn sync_peer_handle(&self) -> Option<Arc<Peer>> {
        let id = self.sync_peer?;
        self.peer_states.get(&id).map(|state| Arc::clone(&state.peer))
    }

    fn handle_new_peer(&mut self, peer: Arc<Peer>) {
        trace!(peer = %peer, agent = peer.user_agent(), "new valid peer");
        let sync_candidate = self.is_sync_candidate(&peer);
        if sync_candidate {
            info!(peer = %peer, "peer is a sync candidate");
        }
        let id = peer.id();
        self.peer_states.insert(
            id,
            PeerSyncState {
                peer,
                sync_candidate,
                request_queue: VecDeque::new(),
                requested_txns: HashSet::new(),
                requested_blocks: HashSet::new(),
            },
        );
        if sync_candidate && self.sync_peer.is_none() {
            self.start_sync();
        }
    }

    /// Whether the peer may serve as an initial block download source.
    fn is_sync_candidate(&self, peer: &Peer) -> bool {
        if self.params.regression_test {
            // The regression tool is not a full node but must still be chosen.
            peer.addr().ip().is_loopback()
        } else {
            peer.services() & SF_NODE_NETWORK != 0
        }
    }

    fn handle_done_peer(&mut self, peer: &Arc<Peer>) {
        let Some(state) = self.peer_states.remove(&peer.id()) else {
            trace!(peer = %peer, "received done peer message for unknown peer");
            return;
        };
        trace!(peer = %peer, "lost peer");
        // Release this peer's outstanding requests so the hashes are fetched
        // from elsewhere on the next inv.
        for tx_hash in &state.requested_txns {
            self.requested_txns.remove(tx_hash);
        }
        for block_hash in &state.requested_blocks {
            self.requested_blocks.remove(block_hash);
        }
        if self.sync_peer == Some(peer.id()) {
            self.sync_peer = None;
            if self.headers_first_mode {
                let best = self.chain.best_snapshot();
                self.reset_header_state(best.hash, best.height);
            }
            self.start_sync();
        }
    }

    /// Choose a candidate peer and kick off the download, headers-first when
    /// a checkpoint lies ahead of the local tip.
    fn start_sync(&mut self) {
        if self.sync_peer.is_some() {
            return;
        }
        let best = self.chain.best_snapshot();
        let mut best_peer: Option<Arc<Peer>> = None;
        for state in self.peer_states.values() {
            if !state.sync_candidate {
                continue;
            }
            // The < is intentional rather than <=: a peer at the same height
            // will likely have a later block soon, and it keeps the both-at-
            // zero regression case working.
            if state.peer.last_block() < best.height {
                continue;
            }
            // Deterministic given the candidate set: lowest peer id wins.
            let replace = match &best_peer {
                Some(current) => state.peer.id() < current.id(),
                None => true,
            };
            if replace {
                best_peer = Some(Arc::clone(&state.peer));
            }
        }
        let Some(peer) = best_peer else {
            trace!("no sync peer candidates available");
            return;
        };
        // Clear the requested blocks when the sync peer changes, otherwise
        // blocks the previous peer failed to send would never be retried.
        self.requested_blocks.clear();
        let locator = match self.chain.latest_block_locator() {
            Ok(locator) => locator,
            Err(err) => {
                error!(%err, "failed to get block locator for the latest block");
                return;
            }
        };
        info!(height = peer.last_block(), peer = %peer, "syncing to block height");
        match self.next_checkpoint {
            Some(checkpoint)
                if best.height < checkpoint.height && !self.params.regression_test =>
            {
                // Headers below the next checkpoint can be verified by their
                // links alone, so fetch them first and the blocks after.
                let _ = peer.push_get_headers(locator, checkpoint.hash);
                self.headers_first_mode = true;
                info!(
                    from = best.height + 1,
                    to = checkpoint.height,
                    peer = %peer,
                    "downloading headers for blocks"
                );
            }
            _ => {
                let _ = peer.push_get_blocks(locator, ZERO_HASH);
            }
        }
        self.sync_peer = Some(peer.id());
    }

    /// Reset the headers-first state for syncing from a fresh tip. Seeds the
    /// header list with the newest stored block so the next downloaded header
    /// can prove it links to the chain.
    fn reset_header_state(&mut self, newest_hash: Hash256, newest_height: i32) {
        self.headers_first_mode = false;
        self.header_list.clear();
        self.start_header = None;
        if self.next_checkpoint.is_some() {
            self.header_list.push_back(HeaderNode {
                height: newest_height,
                hash: newest_hash,
            });
        }
    }

    /// Whether the inventory is already known, wherever it may live.
    fn have_inventory(&self, inv: &InvVect) -> Result<bool, ChainError> {
        match inv.inv_type {
            MSG_BLOCK => self.chain.have_block(&inv.hash),
            MSG_TX => Ok(self.tx_pool.have_transaction(&inv.hash)),
            // Claim unsupported types are known so they are never requested.
            _ => Ok(true),
        }
    }

    /// Issue getdata for the next blocks described by the header list.
    fn fetch_header_blocks(&mut self) {
        let Some(mut index) = self.start_header else {
            warn!("fetch_header_blocks called with no start header");
            return;
        };
        let Some(sync_peer) = self.sync_peer_handle() else {
            return;
        };
        let mut getdata = Vec::with_capacity(self.header_list.len().min(MAX_INV_PER_MSG));
        let mut num_requested = 0usize;
        while index < self.header_list.len() {
            let node = self.header_list[index];
            let inv = InvVect::block(node.hash);
            let have = match self.have_inventory(&inv) {
                Ok(have) => have,
                Err(err) => {
                    trace!(%err, "failure checking existing inventory during header block fetch");
                    false
                }
            };
            if !have {
                if let Some(evicted) = limit_hash_set(&mut self.requested_blocks, MAX_REQUESTED_BLOCKS)
                {
                    self.forget_requested_block(&evicted);
                }
                self.requested_blocks.insert(node.hash);
                if let Some(peer_state) = self.peer_states.get_mut(&sync_peer.id()) {
                    peer_state.requested_blocks.insert(node.hash);
                }
                getdata.push(inv);
                num_requested += 1;
            }
            index += 1;
            self.start_header = Some(index);
            if num_requested >= MAX_INV_PER_MSG {
                break;
            }
        }
        if index >= self.header_list.len() {
            self.start_header = None;
        }
        if !getdata.is_empty() {
            sync_peer.queue_message(NetMessage::GetData(getdata));
        }
    }

    /// Drop an evicted hash from every per-peer request set so the per-peer
    /// sets stay subsets of the global one.
    fn forget_requested_block(&mut self, hash: &Hash256) {
        for peer_state in self.peer_states.values_mut() {
            peer_state.requested_blocks.remove(hash);
        }
    }

    fn forget_requested_tx(&mut self, hash: &Hash256) {
        for peer_state in self.peer_states.values_mut() {
            peer_state.requested_txns.remove(hash);
        }
    }

    fn handle_headers_msg(&mut self, headers: &[BlockHeader], peer: &Arc<Peer>) {
        if !self.peer_states.contains_key(&peer.id()) {
            trace!(peer = %peer, "received headers message from unknown peer");
            return;
        }
        // Headers outside headers-first mode were never requested.
        if !self.headers_first_mode {
            warn!(count = headers.len(), peer = %peer, "got unrequested headers, disconnecting");
            peer.request_disconnect();
            return;
        }
        if headers.is_empty() {
            return;
        }
        let Some(next_checkpoint) = self.next_checkpoint else {
            // Invariant: headers-first mode always has a next checkpoint.
            warn!("headers-first mode without a next checkpoint, disconnecting peer");
            peer.request_disconnect();
            return;
        };

        let mut received_checkpoint = false;
        let mut final_hash = ZERO_HASH;
        for header in headers {
            let hash = header.hash();
            final_hash = hash;
            let Some(prev_node) = self.header_list.back().copied() else {
                warn!("header list does not contain a previous element as expected, disconnecting peer");
                peer.request_disconnect();
                return;
            };
            if prev_node.hash != header.prev_block {
                warn!(peer = %peer, "received block header that does not properly connect to the chain, disconnecting");
                peer.request_disconnect();
                return;
            }
            let height = prev_node.height + 1;
            self.header_list.push_back(HeaderNode { height, hash });
            if self.start_header.is_none() {
                self.start_header = Some(self.header_list.len() - 1);
            }
            // Verify the header at the checkpoint height matches.
            if height == next_checkpoint.height {
                if hash == next_checkpoint.hash {
                    received_checkpoint = true;
                    info!(
                        height,
                        hash = %pod_consensus::hash256_to_hex(&hash),
                        "verified downloaded block header against checkpoint"
                    );
                } else {
                    warn!(
                        height,
                        peer = %peer,
                        "block header does not match expected checkpoint hash, disconnecting"
                    );
                    peer.request_disconnect();
                    return;
                }
                break;
            }
        }

        if received_checkpoint {
            // The first list entry is the final block already stored locally;
            // it only existed to prove the first new header links properly.
            self.header_list.pop_front();
            if let Some(index) = self.start_header {
                self.start_header = Some(index.saturating_sub(1));
            }
            info!(count = self.header_list.len(), "received block headers, fetching blocks");
            self.progress.set_last_log_time(Instant::now());
            self.fetch_header_blocks();
            return;
        }

        // Not at a checkpoint yet; ask for the next batch starting from the
        // latest known header.
        if let Err(err) = peer.push_get_headers(vec![final_hash], next_checkpoint.hash) {
            error!(peer = %peer, %err, "failed to send getheaders message");
        }
    }

    fn handle_inv_msg(&mut self, inv_vects: Vec<InvVect>, peer: &Arc<Peer>) {
        let peer_id = peer.id();
        if !self.peer_states.contains_key(&peer_id) {
            trace!(peer = %peer, "received inv message from unknown peer");
            return;
        }
        // Find the final block in the inventory list, if any.
        let last_block = inv_vects
            .iter()
            .rposition(|inv| inv.inv_type == MSG_BLOCK);

        let is_sync_peer = self.sync_peer == Some(peer_id);
        // Track the last announced block for later height refreshes, unless
        // it came from the sync peer mid-download.
        if let Some(index) = last_block {
            if !is_sync_peer || self.current() {
                peer.update_last_announced_block(inv_vects[index].hash);
            }
        }
        // Ignore invs from non-sync peers while behind; it avoids pulling in
        // a mass of orphans.
        if !is_sync_peer && !self.current() {
            return;
        }
        // A known block announcement from a current chain pins their height.
        if let Some(index) = last_block {
            if self.current() {
                if let Some(height) = self.chain.block_height_by_hash(&inv_vects[index].hash) {
                    peer.update_last_block_height(height);
                }
            }
        }

        for (index, inv) in inv_vects.iter().enumerate() {
            match inv.inv_type {
                MSG_BLOCK | MSG_TX => {}
                _ => continue,
            }
            peer.add_known_inventory(*inv);
            // Inventory is ignored while fetching by header list.
            if self.headers_first_mode {
                continue;
            }
            let have = match self.have_inventory(inv) {
                Ok(have) => have,
                Err(err) => {
                    error!(%err, "failure checking existing inventory during inv processing");
                    continue;
                }
            };
            if !have {
                if inv.inv_type == MSG_TX && self.rejected_txns.contains(&inv.hash) {
                    continue;
                }
                if let Some(state) = self.peer_states.get_mut(&peer_id) {
                    state.request_queue.push_back(*inv);
                }
                continue;
            }
            if inv.inv_type != MSG_BLOCK {
                continue;
            }
            if self.chain.is_known_orphan(&inv.hash) {
                // The peer re-announced an orphan we already have: it is
                // signalling there are more missing ancestors than fit in one
                // inventory message. Request from our best down to the root.
                let orphan_root = self.chain.orphan_root(&inv.hash);
                match self.chain.latest_block_locator() {
                    Ok(locator) => {
                        let _ = peer.push_get_blocks(locator, orphan_root);
                    }
                    Err(err) => {
                        error!(%err, "failed to get block locator for the latest block");
                    }
                }
                continue;
            }
            // We already have the final announced block; force a request for
            // more to surface a long side chain.
            if Some(index) == last_block {
                let locator = self.chain.block_locator_from_hash(&inv.hash);
                let _ = peer.push_get_blocks(locator, ZERO_HASH);
            }
        }

        // Request as much as fits in one message; the rest of the queue waits
        // for the next inv.
        let mut queue = match self.peer_states.get_mut(&peer_id) {
            Some(state) => std::mem::take(&mut state.request_queue),
            None => return,
        };
        let mut getdata = Vec::new();
        let mut num_requested = 0usize;
        while let Some(inv) = queue.pop_front() {
            match inv.inv_type {
                MSG_BLOCK => {
                    if !self.requested_blocks.contains(&inv.hash) {
                        if let Some(evicted) =
                            limit_hash_set(&mut self.requested_blocks, MAX_REQUESTED_BLOCKS)
                        {
                            self.forget_requested_block(&evicted);
                        }
                        self.requested_blocks.insert(inv.hash);
                        if let Some(state) = self.peer_states.get_mut(&peer_id) {
                            state.requested_blocks.insert(inv.hash);
                        }
                        getdata.push(inv);
                        num_requested += 1;
                    }
                }
                MSG_TX => {
                    if !self.requested_txns.contains(&inv.hash) {
                        if let Some(evicted) =
                            limit_hash_set(&mut self.requested_txns, MAX_REQUESTED_TXNS)
                        {
                            self.forget_requested_tx(&evicted);
                        }
                        self.requested_txns.insert(inv.hash);
                        if let Some(state) = self.peer_states.get_mut(&peer_id) {
                            state.requested_txns.insert(inv.hash);
                        }
                        getdata.push(inv);
                        num_requested += 1;
                    }
                }
                _ => {}
            }
            if num_requested >= MAX_INV_PER_MSG {
                break;
            }
        }
        if let Some(state) = self.peer_states.get_mut(&peer_id) {
            state.request_queue = queue;
        }
        if !getdata.is_empty() {
            peer.queue_message(NetMessage::GetData(getdata));
        }
    }

    fn handle_block_msg(&mut self, block: Arc<Block>, peer: &Arc<Peer>) {
        let peer_id = peer.id();
        let block_hash = block.hash();
        {
            let Some(state) = self.peer_states.get(&peer_id) else {
                trace!(peer = %peer, "received block message from unknown peer");
                return;
            };
            if !state.requested_blocks.contains(&block_hash) {
                // The regression test intentionally sends some blocks twice
                // to exercise duplicate insertion; everywhere else an
                // unrequested block is misbehavior.
                if !self.params.regression_test {
                    warn!(
                        hash = %pod_consensus::hash256_to_hex(&block_hash),
                        peer = %peer,
                        "got unrequested block, disconnecting"
                    );
                    peer.request_disconnect();
                    return;
                }
            }
        }

        // In headers-first mode a block matching the head of the header list
        // needs only minimal validation; the headers already verified up to
        // the next checkpoint. The entry is dropped for every block except
        // the checkpoint, which is still needed to link the next batch.
        let mut behavior_flags = BehaviorFlags::NONE;
        let mut is_checkpoint_block = false;
        if self.headers_first_mode {
            if let Some(first_node) = self.header_list.front().copied() {
                if first_node.hash == block_hash {
                    behavior_flags = BehaviorFlags::FAST_ADD;
                    if self.next_checkpoint.map(|checkpoint| checkpoint.hash)
                        == Some(first_node.hash)
                    {
                        is_checkpoint_block = true;
                    } else {
                        self.header_list.pop_front();
                        if let Some(index) = self.start_header {
                            self.start_header = Some(index.saturating_sub(1));
                        }
                    }
                }
            }
        }

        // Remove the block from the request maps. Either the chain will know
        // about it afterwards, or a failed insert is retried on the next inv.
        if let Some(state) = self.peer_states.get_mut(&peer_id) {
            state.requested_blocks.remove(&block_hash);
        }
        self.requested_blocks.remove(&block_hash);

        // Extract the coinbase height when the version carries it, for the
        // peer height updates below.
        let mut height_update = 0i32;
        let mut hash_update: Option<Hash256> = None;
        if should_have_serialized_height(&block.header) {
            if let Some(coinbase) = block.transactions.first() {
                match extract_coinbase_height(coinbase) {
                    Ok(height) => {
                        height_update = height;
                        hash_update = Some(block_hash);
                    }
                    Err(err) => trace!(%err, "unable to extract height from coinbase tx"),
                }
            }
        }

        let is_orphan = match self.chain.process_block(Arc::clone(&block), behavior_flags) {
            Err(err) => {
                if err.kind == ChainErrorKind::DatabaseCorruption {
                    panic!("database corruption while processing block: {err}");
                }
                if err.is_rule_error() {
                    info!(
                        hash = %pod_consensus::hash256_to_hex(&block_hash),
                        peer = %peer,
                        %err,
                        "rejected block"
                    );
                } else {
                    error!(
                        hash = %pod_consensus::hash256_to_hex(&block_hash),
                        %err,
                        "failed to process block"
                    );
                }
                let (code, reason) = err_to_reject(&err);
                peer.push_reject(CMD_BLOCK, code, reason, Some(block_hash));
                return;
            }
            Ok(outcome) => outcome.is_orphan,
        };

        if is_orphan {
            // Request the missing ancestors from the peer that sent the
            // orphan.
            let orphan_root = self.chain.orphan_root(&block_hash);
            match self.chain.latest_block_locator() {
                Ok(locator) => {
                    let _ = peer.push_get_blocks(locator, orphan_root);
                }
                Err(err) => {
                    error!(%err, "failed to get block locator for the latest block");
                }
            }
        } else {
            let best = self.chain.best_snapshot();
            self.progress.log_block(&block, best.height);
            // The block made progress; whatever was rejected before may be
            // acceptable now.
            height_update = best.height;
            hash_update = Some(best.hash);
            self.rejected_txns.clear();
        }

        // Update this peer's height and, when it matters for relay, the
        // heights of other peers that announced this block. While syncing
        // from scratch the update spam is skipped.
        if let Some(hash_update) = hash_update {
            if height_update != 0 {
                peer.update_last_block_height(height_update);
                if is_orphan || self.current() {
                    self.notifier
                        .update_peer_heights(&hash_update, height_update, peer_id);
                }
            }
        }

        if !self.headers_first_mode {
            return;
        }
        if !is_checkpoint_block {
            // Top the request pipeline back up when it runs low.
            let in_flight = self
                .peer_states
                .get(&peer_id)
                .map(|state| state.requested_blocks.len())
                .unwrap_or(0);
            if self.start_header.is_some() && in_flight < MIN_IN_FLIGHT_BLOCKS {
                self.fetch_header_blocks();
            }
            return;
        }

        // The checkpoint block itself arrived; move to the next checkpoint,
        // or switch to normal inv-based operation after the final one.
        let prev_checkpoint = self
            .next_checkpoint
            .expect("checkpoint block implies a next checkpoint");
        self.next_checkpoint =
            find_next_header_checkpoint(&self.chain.checkpoints(), prev_checkpoint.height);
        if let Some(next) = self.next_checkpoint {
            let locator = vec![prev_checkpoint.hash];
            if let Err(err) = peer.push_get_headers(locator, next.hash) {
                error!(peer = %peer, %err, "failed to send getheaders message");
                return;
            }
            info!(
                from = prev_checkpoint.height + 1,
                to = next.height,
                peer = %peer,
                "downloading headers for blocks"
            );
            return;
        }
        self.headers_first_mode = false;
        self.header_list.clear();
        self.start_header = None;
        info!("reached the final checkpoint, switching to normal mode");
        let _ = peer.push_get_blocks(vec![block_hash], ZERO_HASH);
    }

    fn handle_tx_msg(&mut self, tx: Arc<Transaction>, peer: &Arc<Peer>) {
        let peer_id = peer.id();
        if !self.peer_states.contains_key(&peer_id) {
            warn!(peer = %peer, "received tx message from unknown peer");
            return;
        }
        // NOTE: some wallets send transactions unsolicited instead of
        // announcing them first. The reference implementation tolerates it,
        // so no disconnect here.
        let tx_hash = tx.txid();
        // Already rejected: ignore without a reject message, since the
        // transaction was unsolicited.
        if self.rejected_txns.contains(&tx_hash) {
            debug!(
                hash = %pod_consensus::hash256_to_hex(&tx_hash),
                peer = %peer,
                "ignoring previously rejected transaction"
            );
            return;
        }
        let result = self.tx_pool.process_transaction(Arc::clone(&tx));
        // Remove from the request maps either way; a failed insert is
        // retried on the next inv.
        if let Some(state) = self.peer_states.get_mut(&peer_id) {
            state.requested_txns.remove(&tx_hash);
        }
        self.requested_txns.remove(&tx_hash);
        match result {
            Err(err) => {
                // Do not request this transaction again until a new block has
                // been processed.
                if let Some(evicted) = limit_hash_set(&mut self.rejected_txns, MAX_REJECTED_TXNS) {
                    trace!(
                        hash = %pod_consensus::hash256_to_hex(&evicted),
                        "evicted rejected transaction"
                    );
                }
                self.rejected_txns.insert(tx_hash);
                if err.is_rule_error() {
                    debug!(
                        hash = %pod_consensus::hash256_to_hex(&tx_hash),
                        peer = %peer,
                        %err,
                        "rejected transaction"
                    );
                } else {
                    error!(
                        hash = %pod_consensus::hash256_to_hex(&tx_hash),
                        %err,
                        "failed to process transaction"
                    );
                }
                let (code, reason) = err_to_reject(&err);
                peer.push_reject(CMD_TX, code, reason, Some(tx_hash));
            }
            Ok(accepted) => {
                self.notifier.announce_new_transactions(&accepted);
            }
        }
    }

    /// React to chain-side events: relay fresh blocks, keep the pool in step
    /// with connects and disconnects, and feed the fee estimator.
    fn handle_notification(&mut self, notification: ChainNotification) {
        match notification {
            ChainNotification::BlockAccepted(block) => {
                // Peers that are current already know about it otherwise.
                if !self.current() {
                    return;
                }
                let inv = InvVect::block(block.hash());
                self.notifier.relay_inventory(inv, Some(block.header));
            }
            ChainNotification::BlockConnected(block) => {
                // Drop the confirmed transactions from the pool, along with
                // anything they double spend or un-orphan. Dependants of a
                // confirmed transaction remain valid and stay.
                for tx in block.transactions.iter().skip(1) {
                    self.tx_pool.remove_transaction(tx, false);
                    self.tx_pool.remove_double_spends(tx);
                    self.tx_pool.remove_orphan(&tx.txid());
                    self.notifier.transaction_confirmed(tx);
                    let accepted = self.tx_pool.process_orphans(tx);
                    self.notifier.announce_new_transactions(&accepted);
                }
                if let Some(estimator) = &self.fee_estimator {
                    if let Ok(mut guard) = estimator.lock() {
                        if let Err(err) = guard.register_block(&block) {
                            // The estimator cannot recover from an invalid
                            // state; start a fresh one.
                            warn!(%err, "fee estimator rejected block, rebuilding");
                            *guard = FeeEstimator::new(
                                DEFAULT_FEE_MAX_SAMPLES,
                                DEFAULT_FEE_MAX_ROLLBACK,
                            );
                        }
                    }
                }
            }
            ChainNotification::BlockDisconnected(block) => {
                // Put the block's transactions back; anything no longer
                // acceptable goes, along with its dependants.
                for tx in block.transactions.iter().skip(1) {
                    let readmit = self
                        .tx_pool
                        .maybe_accept_transaction(Arc::new(tx.clone()));
                    if readmit.is_err() {
                        self.tx_pool.remove_transaction(tx, true);
                    }
                }
                if let Some(estimator) = &self.fee_estimator {
                    if let Ok(mut guard) = estimator.lock() {
                        if let Err(err) = guard.rollback(&block.hash()) {
                            trace!(%err, "fee estimator rollback failed");
                        }
                    }
                }
            }
        }
    }
}

/// The next checkpoint after the given height, or none past the final one.
fn find_next_header_checkpoint(checkpoints: &[Checkpoint], height: i32) -> Option<Checkpoint> {
    let final_checkpoint = checkpoints.last()?;
    if height >= final_checkpoint.height {
        return None;
    }
    let mut next = *final_checkpoint;
    for checkpoint in checkpoints.iter().rev().skip(1) {
        if height >= checkpoint.height {
            break;
        }
        next = *checkpoint;
    }
    Some(next)
}

/// Make room for one insertion into a capped set. Which entry goes is
/// arbitrary; an adversary would need hash preimages to target it.
fn limit_hash_set(set: &mut HashSet<Hash256>, limit: usize) -> Option<Hash256> {
    if set.len() + 1 > limit {
        let victim = set.iter().next().copied()?;
        set.remove(&victim);
        return Some(victim);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(height: i32, tag: u8) -> Checkpoint {
        Checkpoint {
            height,
            hash: [tag; 32],
        }
    }

    #[test]
    fn next_checkpoint_selection() {
        let table = vec![checkpoint(100, 1), checkpoint(500, 2), checkpoint(900, 3)];
        assert_eq!(find_next_header_checkpoint(&table, 0), Some(checkpoint(100, 1)));
        assert_eq!(find_next_header_checkpoint(&table, 100), Some(checkpoint(500, 2)));
        assert_eq!(find_next_header_checkpoint(&table, 499), Some(checkpoint(500, 2)));
        assert_eq!(find_next_header_checkpoint(&table, 500), Some(checkpoint(900, 3)));
        assert_eq!(find_next_header_checkpoint(&table, 900), None);
        assert_eq!(find_next_header_checkpoint(&[], 0), None);
    }

    #[test]
    fn capped_set_evicts_exactly_one() {
        let mut set: HashSet<Hash256> = HashSet::new();
        for index in 0..10u8 {
            let mut hash = [0u8; 32];
            hash[0] = index;
            assert!(limit_hash_set(&mut set, 10).is_none());
            set.insert(hash);
        }
        assert_eq!(set.len(), 10);
        let evicted = limit_hash_set(&mut set, 10).expect("one eviction");
        assert_eq!(set.len(), 9);
        assert!(!set.contains(&evicted));
    }
}
