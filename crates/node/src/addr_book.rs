//! Known-peer address manager.
//!
//! Every address carries a single reliability score: handshakes raise it,
//! failures dock it, and the score decides both how long an address sits out
//! after a dial attempt and whether it survives eviction when the book is
//! full. Dial candidates are drawn by shuffle from the top of the score
//! order. The book persists to `peers.dat` as JSON on a timer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::write_file_atomic;

const ADDR_BOOK_MAX: usize = 5_000;
const PEERS_FILE_VERSION: u32 = 1;
const PEERS_PERSIST_INTERVAL_SECS: u64 = 60;

const MAX_RELIABILITY: i32 = 20;
const MIN_RELIABILITY: i32 = -12;

/// Wait after an attempt before a proven address may be redialed.
const RETRY_WAIT_WARM_SECS: u64 = 10;
/// Base wait for unproven addresses; doubles per unanswered attempt.
const RETRY_WAIT_COLD_SECS: u64 = 30;
const RETRY_WAIT_MAX_SECS: u64 = 3_600;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct AddrBookEntry {
    pub last_seen: u64,
    pub last_attempt: u64,
    pub last_success: u64,
    /// Dial attempts since the last completed handshake.
    pub attempts: u32,
    /// Rises with handshakes, falls with failures; drives cooldown and
    /// eviction.
    pub reliability: i32,
    pub last_height: i32,
}

impl AddrBookEntry {
    fn retry_wait(&self) -> Duration {
        if self.reliability > 0 {
            return Duration::from_secs(RETRY_WAIT_WARM_SECS);
        }
        let shift = self.attempts.min(7);
        Duration::from_secs((RETRY_WAIT_COLD_SECS << shift).min(RETRY_WAIT_MAX_SECS))
    }

    fn ready(&self, now: u64) -> bool {
        self.last_attempt == 0
            || now.saturating_sub(self.last_attempt) >= self.retry_wait().as_secs()
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct PeersFile {
    version: u32,
    peers: Vec<(SocketAddr, AddrBookEntry)>,
}

#[derive(Default)]
pub struct AddrBook {
    entries: Mutex<HashMap<SocketAddr, AddrBookEntry>>,
    revision: AtomicU64,
}

impl AddrBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    /// Apply one mutation to an address record, creating it if needed.
    fn update(&self, addr: SocketAddr, apply: impl FnOnce(&mut AddrBookEntry, u64)) {
        let now = unix_now_secs();
        if let Ok(mut book) = self.entries.lock() {
            apply(book.entry(addr).or_default(), now);
        }
        self.revision.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self, addr: SocketAddr) {
        self.update(addr, |entry, now| {
            entry.last_attempt = now;
            entry.attempts = entry.attempts.saturating_add(1);
        });
    }

    pub fn record_success(&self, addr: SocketAddr, height: i32) {
        self.update(addr, |entry, now| {
            entry.last_seen = now;
            entry.last_success = now;
            entry.attempts = 0;
            entry.reliability = (entry.reliability + 2).min(MAX_RELIABILITY);
            entry.last_height = entry.last_height.max(height);
        });
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        self.update(addr, |entry, _now| {
            entry.reliability = (entry.reliability - 1).max(MIN_RELIABILITY);
        });
    }

    /// Record gossiped addresses; returns how many were new. When the book
    /// is full, each newcomer costs the least trusted unproven entry its
    /// slot, and proven entries are never displaced by gossip.
    pub fn insert_many(&self, addrs: Vec<SocketAddr>) -> usize {
        let now = unix_now_secs();
        let mut learned = 0;
        if let Ok(mut book) = self.entries.lock() {
            for addr in addrs {
                if addr.port() == 0 {
                    continue;
                }
                if let Some(entry) = book.get_mut(&addr) {
                    entry.last_seen = now;
                    continue;
                }
                if book.len() >= ADDR_BOOK_MAX && !evict_least_trusted(&mut book) {
                    break;
                }
                book.insert(
                    addr,
                    AddrBookEntry {
                        last_seen: now,
                        ..AddrBookEntry::default()
                    },
                );
                learned += 1;
            }
        }
        if learned > 0 {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        learned
    }

    /// Up to `limit` dial candidates. Drawn by shuffle from the best-scored
    /// ready addresses, with the draw pool kept at twice the request so the
    /// same few peers are not dialed on every pass.
    pub fn sample(&self, limit: usize) -> Vec<SocketAddr> {
        if limit == 0 {
            return Vec::new();
        }
        let now = unix_now_secs();
        let mut ready: Vec<(SocketAddr, i32, u64)> = match self.entries.lock() {
            Ok(book) => book
                .iter()
                .filter(|(_, entry)| entry.ready(now))
                .map(|(addr, entry)| (*addr, entry.reliability, entry.last_seen))
                .collect(),
            Err(_) => return Vec::new(),
        };
        ready.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));
        ready.truncate(limit.saturating_mul(2));
        let mut picked: Vec<SocketAddr> = ready.into_iter().map(|(addr, _, _)| addr).collect();
        picked.shuffle(&mut rand::thread_rng());
        picked.truncate(limit);
        picked
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(book) => book.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, most trustworthy first, so anything truncated downstream
    /// loses the expendable tail.
    pub fn snapshot(&self) -> Vec<(SocketAddr, AddrBookEntry)> {
        let Ok(book) = self.entries.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<(SocketAddr, AddrBookEntry)> =
            book.iter().map(|(addr, entry)| (*addr, *entry)).collect();
        entries.sort_by(|a, b| {
            (b.1.reliability, b.1.last_success).cmp(&(a.1.reliability, a.1.last_success))
        });
        entries.truncate(ADDR_BOOK_MAX);
        entries
    }

    pub fn load_file(&self, path: &Path) -> Result<usize, String> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: PeersFile = serde_json::from_slice(&bytes)
            .map_err(|err| format!("invalid peers file: {err}"))?;
        if file.version != PEERS_FILE_VERSION {
            return Err(format!("unsupported peers file version {}", file.version));
        }
        let mut inserted = 0;
        if let Ok(mut book) = self.entries.lock() {
            for (addr, mut entry) in file.peers {
                if addr.port() == 0 || book.len() >= ADDR_BOOK_MAX {
                    continue;
                }
                // Attempt state does not survive a restart.
                entry.last_attempt = 0;
                entry.attempts = 0;
                book.entry(addr).or_insert(entry);
                inserted += 1;
            }
        }
        self.revision.fetch_add(1, Ordering::Relaxed);
        Ok(inserted)
    }

    pub fn save_file(&self, path: &Path) -> Result<(), String> {
        let file = PeersFile {
            version: PEERS_FILE_VERSION,
            peers: self.snapshot(),
        };
        let bytes = serde_json::to_vec(&file).map_err(|err| err.to_string())?;
        write_file_atomic(path, &bytes)
    }
}

/// Drop the least trusted entry that has never completed a handshake.
/// Returns false when only proven entries remain.
fn evict_least_trusted(book: &mut HashMap<SocketAddr, AddrBookEntry>) -> bool {
    let victim = book
        .iter()
        .filter(|(_, entry)| entry.last_success == 0)
        .min_by_key(|(_, entry)| (entry.reliability, entry.last_seen))
        .map(|(addr, _)| *addr);
    match victim {
        Some(addr) => {
            book.remove(&addr);
            true
        }
        None => false,
    }
}

/// Persist the book periodically, skipping writes when nothing changed.
pub async fn persist_peers_loop(addr_book: Arc<AddrBook>, path: PathBuf) {
    let mut last_revision = 0u64;
    let mut interval = tokio::time::interval(Duration::from_secs(PEERS_PERSIST_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let revision = addr_book.revision();
        if revision == last_revision {
            continue;
        }
        match addr_book.save_file(&path) {
            Ok(()) => {
                last_revision = revision;
                debug!(peers = addr_book.len(), "persisted peers file");
            }
            Err(err) => warn!(%err, "failed to persist peers file"),
        }
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
