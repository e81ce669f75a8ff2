//! In-memory chain and pool backends. These carry just enough behavior for
//! the synchronization core to run against: linkage, orphan tracking, best
//! tip accounting, and notification fan-out. Full validation belongs to a
//! real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use pod_consensus::{Checkpoint, Hash256};
use pod_primitives::{Block, OutPoint, Transaction};

use crate::{
    BehaviorFlags, BestSnapshot, Chain, ChainError, ChainNotification, NotificationSender,
    ProcessOutcome, TxPool,
};

const CURRENT_WINDOW_SECS: u64 = 24 * 60 * 60;

struct ChainInner {
    blocks: HashMap<Hash256, Arc<Block>>,
    heights: HashMap<Hash256, i32>,
    main_chain: Vec<Hash256>,
    orphans: HashMap<Hash256, Arc<Block>>,
}

pub struct MemoryChain {
    inner: Mutex<ChainInner>,
    subscribers: Mutex<Vec<NotificationSender>>,
    checkpoints: Vec<Checkpoint>,
}

impl MemoryChain {
    pub fn new(genesis: Block, checkpoints: Vec<Checkpoint>) -> Self {
        let genesis = Arc::new(genesis);
        let genesis_hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(genesis_hash, genesis);
        let mut heights = HashMap::new();
        heights.insert(genesis_hash, 0);
        Self {
            inner: Mutex::new(ChainInner {
                blocks,
                heights,
                main_chain: vec![genesis_hash],
                orphans: HashMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            checkpoints,
        }
    }

    fn notify(&self, notifications: Vec<ChainNotification>) {
        let subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };
        for notification in notifications {
            for subscriber in &subscribers {
                let _ = subscriber.send(notification.clone());
            }
        }
    }

    /// Disconnect the current tip, used when a better branch arrives.
    pub fn disconnect_tip(&self) -> Option<Arc<Block>> {
        let removed = {
            let mut inner = self.inner.lock().ok()?;
            if inner.main_chain.len() <= 1 {
                return None;
            }
            let hash = inner.main_chain.pop()?;
            inner.heights.remove(&hash);
            inner.blocks.remove(&hash)
        }?;
        self.notify(vec![ChainNotification::BlockDisconnected(Arc::clone(
            &removed,
        ))]);
        Some(removed)
    }
}

impl Chain for MemoryChain {
    fn process_block(
        &self,
        block: Arc<Block>,
        _flags: BehaviorFlags,
    ) -> Result<ProcessOutcome, ChainError> {
        let hash = block.hash();
        let mut notifications = Vec::new();
        let outcome = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| ChainError::corruption("chain lock poisoned"))?;
            if inner.blocks.contains_key(&hash) || inner.orphans.contains_key(&hash) {
                return Err(ChainError::duplicate("already have block"));
            }
            if block.transactions.is_empty() || !block.transactions[0].is_coinbase() {
                return Err(ChainError::rule("first transaction is not a coinbase"));
            }
            let prev = block.header.prev_block;
            if !inner.heights.contains_key(&prev) {
                inner.orphans.insert(hash, block);
                return Ok(ProcessOutcome {
                    is_main_chain: false,
                    is_orphan: true,
                });
            }
            let tip = *inner.main_chain.last().expect("chain never empty");
            let height = inner.heights[&prev] + 1;
            inner.heights.insert(hash, height);
            inner.blocks.insert(hash, Arc::clone(&block));
            notifications.push(ChainNotification::BlockAccepted(Arc::clone(&block)));
            let is_main_chain = prev == tip;
            if is_main_chain {
                inner.main_chain.push(hash);
                notifications.push(ChainNotification::BlockConnected(Arc::clone(&block)));
                // Connect any orphans this block just linked.
                let mut parent = hash;
                while let Some(child_hash) = inner
                    .orphans
                    .iter()
                    .find(|(_, orphan)| orphan.header.prev_block == parent)
                    .map(|(child_hash, _)| *child_hash)
                {
                    let child = inner.orphans.remove(&child_hash).expect("just found");
                    let child_height = inner.heights[&parent] + 1;
                    inner.heights.insert(child_hash, child_height);
                    inner.blocks.insert(child_hash, Arc::clone(&child));
                    inner.main_chain.push(child_hash);
                    notifications.push(ChainNotification::BlockAccepted(Arc::clone(&child)));
                    notifications.push(ChainNotification::BlockConnected(child));
                    parent = child_hash;
                }
            }
            ProcessOutcome {
                is_main_chain,
                is_orphan: false,
            }
        };
        self.notify(notifications);
        Ok(outcome)
    }

    fn have_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| ChainError::corruption("chain lock poisoned"))?;
        Ok(inner.blocks.contains_key(hash) || inner.orphans.contains_key(hash))
    }

    fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.orphans.contains_key(hash))
            .unwrap_or(false)
    }

    fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return *hash,
        };
        let mut cursor = *hash;
        while let Some(orphan) = inner.orphans.get(&cursor) {
            cursor = orphan.header.prev_block;
        }
        cursor
    }

    fn latest_block_locator(&self) -> Result<Vec<Hash256>, ChainError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| ChainError::corruption("chain lock poisoned"))?;
        Ok(locator_from_chain(&inner.main_chain, inner.main_chain.len() - 1))
    }

    fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256> {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return vec![*hash],
        };
        match inner.heights.get(hash) {
            Some(height) if inner.main_chain.get(*height as usize) == Some(hash) => {
                locator_from_chain(&inner.main_chain, *height as usize)
            }
            _ => vec![*hash],
        }
    }

    fn best_snapshot(&self) -> BestSnapshot {
        let inner = self.inner.lock().expect("chain lock poisoned");
        let hash = *inner.main_chain.last().expect("chain never empty");
        BestSnapshot {
            hash,
            height: (inner.main_chain.len() - 1) as i32,
        }
    }

    fn block_height_by_hash(&self, hash: &Hash256) -> Option<i32> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.heights.get(hash).copied())
    }

    fn fetch_block(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.blocks.get(hash).cloned())
    }

    fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.clone()
    }

    fn is_current(&self) -> bool {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let tip = inner.main_chain.last().expect("chain never empty");
        let tip_time = inner
            .blocks
            .get(tip)
            .map(|block| u64::from(block.header.timestamp))
            .unwrap_or(0);
        tip_time + CURRENT_WINDOW_SECS >= unix_now_secs()
    }

    fn subscribe(&self, sender: NotificationSender) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(sender);
        }
    }
}

fn locator_from_chain(main_chain: &[Hash256], from_height: usize) -> Vec<Hash256> {
    let mut locator = Vec::new();
    let mut height = from_height as i64;
    let mut step = 1i64;
    while height >= 0 {
        locator.push(main_chain[height as usize]);
        if locator.len() >= 10 {
            step *= 2;
        }
        height -= step;
    }
    let genesis = main_chain[0];
    if locator.last() != Some(&genesis) {
        locator.push(genesis);
    }
    locator
}

struct PoolInner {
    entries: HashMap<Hash256, Arc<Transaction>>,
    spent: HashMap<OutPoint, Hash256>,
    orphans: HashMap<Hash256, Arc<Transaction>>,
}

pub struct MemoryTxPool {
    inner: Mutex<PoolInner>,
    last_updated: AtomicU64,
}

impl Default for MemoryTxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTxPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                spent: HashMap::new(),
                orphans: HashMap::new(),
            }),
            last_updated: AtomicU64::new(unix_now_secs()),
        }
    }

    pub fn insert_orphan(&self, tx: Arc<Transaction>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.orphans.insert(tx.txid(), tx);
        }
        self.touch();
    }

    fn touch(&self) {
        self.last_updated.store(unix_now_secs(), Ordering::Relaxed);
    }

    fn admit(inner: &mut PoolInner, tx: Arc<Transaction>) -> Result<(), ChainError> {
        let txid = tx.txid();
        if inner.entries.contains_key(&txid) {
            return Err(ChainError::duplicate("transaction already in pool"));
        }
        for input in &tx.vin {
            if inner.spent.contains_key(&input.prevout) {
                return Err(ChainError::rule("transaction double spends pool input"));
            }
        }
        for input in &tx.vin {
            inner.spent.insert(input.prevout.clone(), txid);
        }
        inner.entries.insert(txid, tx);
        Ok(())
    }

    fn remove_entry(inner: &mut PoolInner, txid: &Hash256, remove_redeemers: bool) {
        let Some(tx) = inner.entries.remove(txid) else {
            return;
        };
        for input in &tx.vin {
            if inner.spent.get(&input.prevout) == Some(txid) {
                inner.spent.remove(&input.prevout);
            }
        }
        if remove_redeemers {
            for index in 0..tx.vout.len() as u32 {
                let outpoint = OutPoint {
                    hash: *txid,
                    index,
                };
                if let Some(spender) = inner.spent.get(&outpoint).copied() {
                    Self::remove_entry(inner, &spender, true);
                }
            }
        }
    }
}

impl TxPool for MemoryTxPool {
    fn process_transaction(
        &self,
        tx: Arc<Transaction>,
    ) -> Result<Vec<Arc<Transaction>>, ChainError> {
        let mut accepted = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| ChainError::internal("pool lock poisoned"))?;
            MemoryTxPool::admit(&mut inner, Arc::clone(&tx))?;
            vec![Arc::clone(&tx)]
        };
        accepted.extend(self.process_orphans(&tx));
        self.touch();
        Ok(accepted)
    }

    fn have_transaction(&self, txid: &Hash256) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.entries.contains_key(txid) || inner.orphans.contains_key(txid))
            .unwrap_or(false)
    }

    fn maybe_accept_transaction(&self, tx: Arc<Transaction>) -> Result<(), ChainError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChainError::internal("pool lock poisoned"))?;
        MemoryTxPool::admit(&mut inner, tx)?;
        drop(inner);
        self.touch();
        Ok(())
    }

    fn remove_transaction(&self, tx: &Transaction, remove_redeemers: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            Self::remove_entry(&mut inner, &tx.txid(), remove_redeemers);
        }
        self.touch();
    }

    fn remove_double_spends(&self, tx: &Transaction) {
        let txid = tx.txid();
        if let Ok(mut inner) = self.inner.lock() {
            let conflicting: Vec<Hash256> = tx
                .vin
                .iter()
                .filter_map(|input| inner.spent.get(&input.prevout).copied())
                .filter(|spender| *spender != txid)
                .collect();
            for spender in conflicting {
                Self::remove_entry(&mut inner, &spender, true);
            }
        }
        self.touch();
    }

    fn remove_orphan(&self, txid: &Hash256) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.orphans.remove(txid);
        }
    }

    fn process_orphans(&self, tx: &Transaction) -> Vec<Arc<Transaction>> {
        let mut promoted = Vec::new();
        let Ok(mut inner) = self.inner.lock() else {
            return promoted;
        };
        let txid = tx.txid();
        let ready: Vec<Hash256> = inner
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.vin.iter().any(|input| input.prevout.hash == txid))
            .map(|(orphan_id, _)| *orphan_id)
            .collect();
        for orphan_id in ready {
            let orphan = inner.orphans.remove(&orphan_id).expect("just found");
            if MemoryTxPool::admit(&mut inner, Arc::clone(&orphan)).is_ok() {
                promoted.push(orphan);
            }
        }
        promoted
    }

    fn fetch_transaction(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.entries.get(txid).cloned())
    }

    fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<Hash256> = self
            .inner
            .lock()
            .map(|inner| inner.entries.keys().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    fn last_updated(&self) -> u64 {
        self.last_updated.load(Ordering::Relaxed)
    }

    fn count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len())
            .unwrap_or(0)
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pod_consensus::ZERO_HASH;
    use pod_primitives::block::BlockHeader;
    use pod_primitives::{TxIn, TxOut};

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: ZERO_HASH,
                    index: u32::MAX,
                },
                script_sig: vec![0x01, tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block_on(prev: Hash256, tag: u8) -> Block {
        Block {
            header: BlockHeader {
                version: 2,
                prev_block: prev,
                merkle_root: [tag; 32],
                timestamp: unix_now_secs() as u32,
                bits: 0x207fffff,
                nonce: u32::from(tag),
            },
            transactions: vec![coinbase(tag)],
        }
    }

    fn genesis() -> Block {
        block_on([0x00; 32], 0xaa)
    }

    #[test]
    fn extends_tip_and_reports_main_chain() {
        let chain = MemoryChain::new(genesis(), Vec::new());
        let genesis_hash = chain.best_snapshot().hash;
        let block = Arc::new(block_on(genesis_hash, 1));
        let outcome = chain
            .process_block(Arc::clone(&block), BehaviorFlags::NONE)
            .expect("process");
        assert!(outcome.is_main_chain);
        assert!(!outcome.is_orphan);
        assert_eq!(chain.best_snapshot().height, 1);
        assert_eq!(chain.block_height_by_hash(&block.hash()), Some(1));
    }

    #[test]
    fn orphan_then_parent_connects_both() {
        let chain = MemoryChain::new(genesis(), Vec::new());
        let genesis_hash = chain.best_snapshot().hash;
        let parent = Arc::new(block_on(genesis_hash, 1));
        let child = Arc::new(block_on(parent.hash(), 2));

        let outcome = chain
            .process_block(Arc::clone(&child), BehaviorFlags::NONE)
            .expect("process child");
        assert!(outcome.is_orphan);
        assert!(chain.is_known_orphan(&child.hash()));
        assert_eq!(chain.orphan_root(&child.hash()), parent.hash());

        chain
            .process_block(parent, BehaviorFlags::NONE)
            .expect("process parent");
        assert_eq!(chain.best_snapshot().height, 2);
        assert!(!chain.is_known_orphan(&child.hash()));
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let chain = MemoryChain::new(genesis(), Vec::new());
        let genesis_hash = chain.best_snapshot().hash;
        let block = Arc::new(block_on(genesis_hash, 1));
        chain
            .process_block(Arc::clone(&block), BehaviorFlags::NONE)
            .expect("first");
        let err = chain
            .process_block(block, BehaviorFlags::NONE)
            .expect_err("second");
        assert!(err.is_rule_error());
    }

    #[test]
    fn locator_is_sparse_and_ends_at_genesis() {
        let chain = MemoryChain::new(genesis(), Vec::new());
        let mut prev = chain.best_snapshot().hash;
        for tag in 0..64u8 {
            let block = Arc::new(block_on(prev, tag));
            prev = block.hash();
            chain.process_block(block, BehaviorFlags::NONE).expect("process");
        }
        let locator = chain.latest_block_locator().expect("locator");
        assert_eq!(locator[0], chain.best_snapshot().hash);
        assert!(locator.len() < 64);
        let genesis_hash = chain.block_locator_from_hash(&locator[0])[0];
        assert_eq!(genesis_hash, chain.best_snapshot().hash);
        let inner_genesis = locator.last().copied().expect("non-empty");
        assert_eq!(chain.block_height_by_hash(&inner_genesis), Some(0));
    }

    #[test]
    fn pool_double_spend_rejected_and_removed() {
        let pool = MemoryTxPool::new();
        let funding = coinbase(9);
        let spend_a = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: funding.txid(),
                    index: 0,
                },
                script_sig: vec![0x01],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut spend_b = spend_a.clone();
        spend_b.vout[0].value = 20;

        pool.process_transaction(Arc::new(spend_a.clone()))
            .expect("first spend");
        let err = pool
            .process_transaction(Arc::new(spend_b.clone()))
            .expect_err("conflicting spend");
        assert!(err.is_rule_error());

        pool.remove_double_spends(&spend_b);
        assert!(!pool.have_transaction(&spend_a.txid()));
    }

    #[test]
    fn orphan_promotion_on_parent_arrival() {
        let pool = MemoryTxPool::new();
        let parent = coinbase(7);
        let child = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: parent.txid(),
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        pool.insert_orphan(Arc::new(child.clone()));
        let accepted = pool
            .process_transaction(Arc::new(parent))
            .expect("parent accepted");
        assert_eq!(accepted.len(), 2);
        assert!(pool.have_transaction(&child.txid()));
    }
}
