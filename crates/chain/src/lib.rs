//! Contracts the synchronization core consumes from the block chain and the
//! transaction pool. The core never re-specifies validation; it calls these
//! interfaces and reacts to the outcomes.

use std::fmt;
use std::sync::Arc;

use pod_consensus::{Checkpoint, Hash256};
use pod_primitives::{Block, Transaction};
use tokio::sync::mpsc;

pub mod coinbase;
pub mod memory;

pub use coinbase::{extract_coinbase_height, should_have_serialized_height};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainErrorKind {
    /// The block or transaction broke a network rule. Expected during normal
    /// operation; maps to a P2P reject message.
    RuleViolation,
    /// Already known to the chain or pool.
    Duplicate,
    /// The backing store is corrupt. The only recovery is a process restart.
    DatabaseCorruption,
    Internal,
}

#[derive(Clone, Debug)]
pub struct ChainError {
    pub kind: ChainErrorKind,
    pub message: String,
}

impl ChainError {
    pub fn new(kind: ChainErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rule(message: impl Into<String>) -> Self {
        Self::new(ChainErrorKind::RuleViolation, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ChainErrorKind::Duplicate, message)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(ChainErrorKind::DatabaseCorruption, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ChainErrorKind::Internal, message)
    }

    pub fn is_rule_error(&self) -> bool {
        matches!(
            self.kind,
            ChainErrorKind::RuleViolation | ChainErrorKind::Duplicate
        )
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ChainError {}

/// Validation shortcuts the chain may take for a block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BehaviorFlags {
    /// Headers covering this block already verified against a checkpoint, so
    /// the expensive checks may be skipped.
    pub fast_add: bool,
}

impl BehaviorFlags {
    pub const NONE: Self = Self { fast_add: false };
    pub const FAST_ADD: Self = Self { fast_add: true };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessOutcome {
    pub is_main_chain: bool,
    pub is_orphan: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BestSnapshot {
    pub hash: Hash256,
    pub height: i32,
}

#[derive(Clone, Debug)]
pub enum ChainNotification {
    /// A block passed validation and joined the block index. Relayed to peers
    /// when the node is current.
    BlockAccepted(Arc<Block>),
    /// A block was connected to the main chain tip.
    BlockConnected(Arc<Block>),
    /// A block was disconnected from the main chain during a reorg.
    BlockDisconnected(Arc<Block>),
}

pub type NotificationSender = mpsc::UnboundedSender<ChainNotification>;

pub trait Chain: Send + Sync {
    fn process_block(
        &self,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<ProcessOutcome, ChainError>;

    /// Whether the block is known in any form: main chain, side chain, or
    /// orphan pool.
    fn have_block(&self, hash: &Hash256) -> Result<bool, ChainError>;

    fn is_known_orphan(&self, hash: &Hash256) -> bool;

    /// The root of the orphan chain containing the given hash, i.e. the
    /// earliest missing ancestor to request from a peer.
    fn orphan_root(&self, hash: &Hash256) -> Hash256;

    fn latest_block_locator(&self) -> Result<Vec<Hash256>, ChainError>;

    fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256>;

    fn best_snapshot(&self) -> BestSnapshot;

    fn block_height_by_hash(&self, hash: &Hash256) -> Option<i32>;

    fn fetch_block(&self, hash: &Hash256) -> Option<Arc<Block>>;

    fn checkpoints(&self) -> Vec<Checkpoint>;

    fn is_current(&self) -> bool;

    /// Register a notification stream. Every accepted/connected/disconnected
    /// block is delivered to all subscribers, in chain order.
    fn subscribe(&self, sender: NotificationSender);
}

pub trait TxPool: Send + Sync {
    /// Validate and admit a transaction, resolving any orphans it unlocks.
    /// Returns every transaction accepted as a result, the given one first.
    fn process_transaction(
        &self,
        tx: Arc<Transaction>,
    ) -> Result<Vec<Arc<Transaction>>, ChainError>;

    fn have_transaction(&self, txid: &Hash256) -> bool;

    /// Admission check without orphan processing, used when re-admitting
    /// transactions from a disconnected block.
    fn maybe_accept_transaction(&self, tx: Arc<Transaction>) -> Result<(), ChainError>;

    fn remove_transaction(&self, tx: &Transaction, remove_redeemers: bool);

    fn remove_double_spends(&self, tx: &Transaction);

    fn remove_orphan(&self, txid: &Hash256);

    fn process_orphans(&self, tx: &Transaction) -> Vec<Arc<Transaction>>;

    fn fetch_transaction(&self, txid: &Hash256) -> Option<Arc<Transaction>>;

    /// All pool transaction ids, for mempool requests from peers.
    fn txids(&self) -> Vec<Hash256>;

    /// Unix seconds of the last pool mutation. Drives mining template
    /// staleness.
    fn last_updated(&self) -> u64;

    fn count(&self) -> usize;
}
