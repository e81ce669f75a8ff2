//! Periodic summary of block processing progress.

use std::time::{Duration, Instant};

use pod_primitives::Block;
use tracing::info;

const LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Accumulates processed block and transaction counts and emits one summary
/// line every ten seconds, so initial block download does not flood the log
/// with one line per block.
pub struct BlockProgressLogger {
    received_blocks: u64,
    received_txs: u64,
    last_log: Instant,
    action: &'static str,
}

impl BlockProgressLogger {
    pub fn new(action: &'static str) -> Self {
        Self {
            received_blocks: 0,
            received_txs: 0,
            last_log: Instant::now(),
            action,
        }
    }

    pub fn log_block(&mut self, block: &Block, height: i32) {
        self.received_blocks += 1;
        self.received_txs += block.transactions.len() as u64;

        let elapsed = self.last_log.elapsed();
        if elapsed < LOG_INTERVAL {
            return;
        }
        let block_word = if self.received_blocks == 1 {
            "block"
        } else {
            "blocks"
        };
        let tx_word = if self.received_txs == 1 {
            "transaction"
        } else {
            "transactions"
        };
        info!(
            "{} {} {} in the last {:.2}s ({} {}, height {})",
            self.action,
            self.received_blocks,
            block_word,
            elapsed.as_secs_f64(),
            self.received_txs,
            tx_word,
            height,
        );
        self.received_blocks = 0;
        self.received_txs = 0;
        self.last_log = Instant::now();
    }

    pub fn set_last_log_time(&mut self, when: Instant) {
        self.last_log = when;
    }
}
