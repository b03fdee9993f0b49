//! Tile store: cache lookups, single-flight decodes, pinned handles.
//!
//! `read_tile` is the one public read path. Hits pin the cached entry and
//! return immediately. On a miss, at most one decode per key is in flight
//! across all readers: the first requester becomes the leader and runs the
//! fetch; everyone else parks on the in-flight record and observes the
//! leader's value or the leader's error. Nobody re-decodes a tile another
//! task is already decoding.
//!
//! A leader whose future is dropped mid-decode abandons the decode; its
//! guard wakes the waiters so one of them can take over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use tracing::trace;

use crate::error::SlideError;

use super::cache::{pin, PinLedger, PinnedTile, TileCache, TileEntry, TileKey};

// =============================================================================
// Tile Source
// =============================================================================

/// Fetches and decodes one tile on a cache miss.
///
/// Implemented by the slide's format backend: locate the payload, read it
/// through the handle pool, run the codec, hand back the decoded entry.
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn fetch_tile(&self, key: TileKey) -> Result<TileEntry, SlideError>;
}

// =============================================================================
// In-flight Bookkeeping
// =============================================================================

struct InFlight {
    notify: tokio::sync::Notify,
    result: SyncMutex<Option<Result<Arc<TileEntry>, SlideError>>>,
}

/// Removes the in-flight record and wakes waiters if the leader's future is
/// dropped before completing.
struct LeaderGuard<'a> {
    store: &'a TileStore,
    key: TileKey,
    flight: Arc<InFlight>,
    completed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.store
                .in_flight
                .lock()
                .expect("in-flight map poisoned")
                .remove(&self.key);
            self.flight.notify.notify_waiters();
        }
    }
}

// =============================================================================
// Tile Store
// =============================================================================

/// Per-slide decoded-tile store.
pub struct TileStore {
    cache: TileCache,
    in_flight: SyncMutex<HashMap<TileKey, Arc<InFlight>>>,
    ledger: Arc<PinLedger>,
}

impl TileStore {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: TileCache::new(cache_capacity),
            in_flight: SyncMutex::new(HashMap::new()),
            ledger: Arc::new(PinLedger::default()),
        }
    }

    /// The pin ledger shared with the owning slide's `close`.
    pub(crate) fn ledger(&self) -> &Arc<PinLedger> {
        &self.ledger
    }

    /// Number of pinned tiles currently held by callers.
    pub fn outstanding_pins(&self) -> usize {
        self.ledger.outstanding()
    }

    /// The underlying cache, for statistics.
    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Read one tile: cache hit, or single-flight decode via `source`.
    pub async fn read_tile(
        &self,
        key: TileKey,
        source: &(dyn TileSource + '_),
    ) -> Result<PinnedTile, SlideError> {
        loop {
            if let Some(entry) = self.cache.get(&key).await {
                trace!(?key, "tile cache hit");
                return Ok(pin(entry, self.ledger.clone()));
            }

            let (flight, is_leader) = {
                let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
                match in_flight.get(&key) {
                    Some(flight) => (flight.clone(), false),
                    None => {
                        let flight = Arc::new(InFlight {
                            notify: tokio::sync::Notify::new(),
                            result: SyncMutex::new(None),
                        });
                        in_flight.insert(key, flight.clone());
                        (flight, true)
                    }
                }
            };

            if is_leader {
                let mut guard = LeaderGuard {
                    store: self,
                    key,
                    flight: flight.clone(),
                    completed: false,
                };

                trace!(?key, "tile cache miss, decoding");
                let result = source.fetch_tile(key).await.map(Arc::new);
                if let Ok(entry) = &result {
                    self.cache.insert(key, entry.clone()).await;
                }

                *flight.result.lock().expect("in-flight result poisoned") = Some(result.clone());
                self.in_flight
                    .lock()
                    .expect("in-flight map poisoned")
                    .remove(&key);
                guard.completed = true;
                flight.notify.notify_waiters();

                return result.map(|entry| pin(entry, self.ledger.clone()));
            }

            // Waiter: register for the wakeup before checking the result so
            // a completion between the check and the await cannot be missed.
            let notified = flight.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let maybe_result = flight
                .result
                .lock()
                .expect("in-flight result poisoned")
                .clone();
            if let Some(result) = maybe_result {
                return result.map(|entry| pin(entry, self.ledger.clone()));
            }

            notified.await;

            let maybe_result = flight
                .result
                .lock()
                .expect("in-flight result poisoned")
                .clone();
            if let Some(result) = maybe_result {
                return result.map(|entry| pin(entry, self.ledger.clone()));
            }
            // The leader abandoned the decode; go around and take over.
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
