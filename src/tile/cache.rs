//! Decoded-tile cache with pinned entries.
//!
//! Decoded RGBA tiles are cached per slide under a byte budget with
//! approximate LRU eviction. Every tile handed to a caller is *pinned*: the
//! caller holds a [`PinnedTile`] whose drop releases the pin exactly once.
//! A pinned entry is never evicted, so the budget is soft; when every
//! resident entry is pinned, new insertions are admitted over budget.
//!
//! The cache key is purely positional — `(level, col, row, plane)` — and
//! each slide owns its own cache, so entries never reference their slide.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

/// Bound on resident entries, keeping LRU bookkeeping small even when the
/// byte budget would admit more.
const MAX_ENTRIES: usize = 16_384;

// =============================================================================
// Key and Entry
// =============================================================================

/// Cache key for one decoded tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Pyramid level (0 = highest resolution).
    pub level: u32,
    /// Tile column, 0-indexed from the left.
    pub col: u32,
    /// Tile row, 0-indexed from the top.
    pub row: u32,
    /// Logical plane (channel) index.
    pub plane: u32,
}

/// One decoded tile: an RGBA buffer plus its pin count.
#[derive(Debug)]
pub struct TileEntry {
    data: Bytes,
    width: u32,
    height: u32,
    pins: AtomicUsize,
}

impl TileEntry {
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            pins: AtomicUsize::new(0),
        }
    }

    /// Decoded RGBA bytes, `width * height * 4` of them.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

// =============================================================================
// Pin Ledger
// =============================================================================

/// Counts outstanding pins across one slide and signals when they drain.
///
/// `Slide::close` waits on this before releasing the slide's resources.
#[derive(Debug, Default)]
pub(crate) struct PinLedger {
    outstanding: AtomicUsize,
    drained: Notify,
}

impl PinLedger {
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Wait until every pin has been released.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Pin an entry, producing the caller-held handle.
pub(crate) fn pin(entry: Arc<TileEntry>, ledger: Arc<PinLedger>) -> PinnedTile {
    entry.pins.fetch_add(1, Ordering::AcqRel);
    ledger.outstanding.fetch_add(1, Ordering::AcqRel);
    PinnedTile { entry, ledger }
}

// =============================================================================
// Pinned Tile
// =============================================================================

/// A decoded tile held by a caller.
///
/// While any handle to an entry is alive, the entry cannot be evicted and
/// the owning slide's `close` will not complete. The pin is released
/// exactly once, when the handle drops; a double release is
/// unrepresentable.
#[derive(Debug)]
pub struct PinnedTile {
    entry: Arc<TileEntry>,
    ledger: Arc<PinLedger>,
}

impl PinnedTile {
    /// Decoded RGBA bytes.
    pub fn data(&self) -> &[u8] {
        &self.entry.data
    }

    /// Cheap owned copy of the underlying buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.entry.data.clone()
    }

    pub fn width(&self) -> u32 {
        self.entry.width
    }

    pub fn height(&self) -> u32 {
        self.entry.height
    }
}

impl std::ops::Deref for PinnedTile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for PinnedTile {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::AcqRel);
        let left = self.ledger.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        if left == 0 {
            self.ledger.drained.notify_waiters();
        }
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheState {
    lru: LruCache<TileKey, Arc<TileEntry>>,
    bytes_used: usize,
}

/// Byte-budgeted LRU over decoded tiles.
pub struct TileCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                lru: LruCache::new(std::num::NonZeroUsize::new(MAX_ENTRIES).unwrap()),
                bytes_used: 0,
            }),
            capacity,
        }
    }

    /// Look up a tile, marking it most recently used on a hit.
    pub async fn get(&self, key: &TileKey) -> Option<Arc<TileEntry>> {
        let mut state = self.state.lock().await;
        state.lru.get(key).cloned()
    }

    /// Insert a decoded tile, evicting approximately-LRU unpinned entries
    /// until the byte budget holds.
    ///
    /// Pinned entries survive eviction; when only pinned entries remain the
    /// insertion is admitted over budget.
    pub async fn insert(&self, key: TileKey, entry: Arc<TileEntry>) {
        let mut state = self.state.lock().await;

        if let Some(previous) = state.lru.put(key, entry.clone()) {
            state.bytes_used = state.bytes_used.saturating_sub(previous.data.len());
        }
        state.bytes_used += entry.data.len();

        if state.bytes_used <= self.capacity {
            return;
        }

        // Pop LRU-first; pinned entries are put back (becoming most
        // recently used, which keeps the scan bounded and the order
        // approximate).
        let mut retained = Vec::new();
        let mut examined = 0;
        let resident = state.lru.len();
        while state.bytes_used > self.capacity && examined < resident {
            let Some((victim_key, victim)) = state.lru.pop_lru() else {
                break;
            };
            examined += 1;
            if victim.is_pinned() {
                retained.push((victim_key, victim));
            } else {
                trace!(?victim_key, bytes = victim.data.len(), "evicted tile");
                state.bytes_used = state.bytes_used.saturating_sub(victim.data.len());
            }
        }
        for (retained_key, retained_entry) in retained {
            state.lru.put(retained_key, retained_entry);
        }
    }

    /// Current number of resident entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.lru.len()
    }

    /// True when nothing is resident.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current resident bytes.
    pub async fn bytes_used(&self) -> usize {
        self.state.lock().await.bytes_used
    }

    /// Configured byte budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every resident entry (pinned handles stay valid through their
    /// own `Arc`s).
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.lru.clear();
        state.bytes_used = 0;
    }
}

// =============================================================================
// Tests
// =============================================================================
