//! Anti-replay cache.
//!
//! A censor that records a live handshake can re-send it later to confirm
//! the host is a proxy.  The cache remembers a 16-byte SHA-256 fingerprint
//! of every handshake for the TTL window and rejects repeats, so a replayed
//! frame dies before any key derivation or upstream dial.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use mtveil_crypto::sha256;
use mtveil_proto::HANDSHAKE_LEN;

/// How long a fingerprint stays hot.
pub const TTL: Duration = Duration::from_secs(300);

/// Sweeper cadence for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Rough per-entry footprint (key + timestamp + map overhead), used to turn
/// the configured MiB cap into an entry count.
const ENTRY_FOOTPRINT: usize = 64;

/// Outcome of a [`ReplayCache::witness`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Witness {
    Fresh,
    Duplicate,
}

type Fingerprint = [u8; 16];

// ─── ReplayCache ──────────────────────────────────────────────────────────────

struct Inner {
    entries: HashMap<Fingerprint, Instant>,
    /// Insertion order for eviction; stale rows are skipped by comparing
    /// the stored timestamp against the live entry.
    order: VecDeque<(Fingerprint, Instant)>,
}

/// Shared-mutable fingerprint cache; `witness` is linearizable under the
/// internal lock.
pub struct ReplayCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl ReplayCache {
    /// Cache sized in MiB of entries, with the standard TTL.
    pub fn new(capacity_mib: usize) -> Self {
        Self::with_capacity(capacity_mib * 1024 * 1024 / ENTRY_FOOTPRINT, TTL)
    }

    fn with_capacity(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: HashMap::new(), order: VecDeque::new() }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record a handshake and report whether it was seen within the TTL.
    ///
    /// A `Fresh` verdict for a fingerprint cannot be followed by another
    /// `Fresh` for the same fingerprint until the TTL elapses.
    pub fn witness(&self, frame: &[u8; HANDSHAKE_LEN]) -> Witness {
        let digest = sha256!(frame);
        let mut fp = [0u8; 16];
        fp.copy_from_slice(&digest[..16]);

        let now = Instant::now();
        let mut inner = self.inner.lock().expect("replay cache lock poisoned");

        if let Some(&seen) = inner.entries.get(&fp) {
            if now.duration_since(seen) < self.ttl {
                return Witness::Duplicate;
            }
        }

        inner.entries.insert(fp, now);
        inner.order.push_back((fp, now));
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some((old_fp, stamp)) => {
                    if inner.entries.get(&old_fp) == Some(&stamp) {
                        inner.entries.remove(&old_fp);
                    }
                }
                None => break,
            }
        }
        Witness::Fresh
    }

    /// Drop entries older than the TTL.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("replay cache lock poisoned");
        while let Some(&(fp, stamp)) = inner.order.front() {
            if now.duration_since(stamp) < self.ttl {
                break;
            }
            inner.order.pop_front();
            if inner.entries.get(&fp) == Some(&stamp) {
                inner.entries.remove(&fp);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("replay cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) on a coarse schedule until shutdown.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        cache.sweep();
                        debug!("[replay] sweep done, {} entries live", cache.len());
                    }
                }
            }
        });
    }
}
