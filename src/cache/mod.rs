use crate::orderbook::{BookSnapshot, PriceSnapshot};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    price: Option<PriceSnapshot>,
    book: Option<BookSnapshot>,
}

/// Outcome of offering an update to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    Applied,
    /// Timestamp was not newer than the cached one; nothing changed.
    Stale { cached_ts: u64 },
}

impl CacheUpdate {
    pub fn is_applied(self) -> bool {
        matches!(self, CacheUpdate::Applied)
    }
}

/// Thread-safe latest-value cache keyed by asset_id.
///
/// Each entry is replaced under its shard lock, so readers see either the
/// previous snapshot or the new one, never a mix. Writes to one asset are
/// serialized while unrelated assets update independently.
#[derive(Debug, Clone, Default)]
pub struct MarketCache {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a price snapshot if its timestamp is strictly newer than the cached one.
    pub fn apply_price(&self, snapshot: &PriceSnapshot) -> CacheUpdate {
        let mut entry = self.entries.entry(snapshot.asset_id.clone()).or_default();
        if let Some(cached) = &entry.price {
            if snapshot.timestamp <= cached.timestamp {
                debug!(
                    asset_id = %snapshot.asset_id,
                    ts = snapshot.timestamp,
                    cached_ts = cached.timestamp,
                    "dropping stale price update"
                );
                return CacheUpdate::Stale {
                    cached_ts: cached.timestamp,
                };
            }
        }
        entry.price = Some(snapshot.clone());
        CacheUpdate::Applied
    }

    /// Apply a book snapshot if its timestamp is strictly newer than the cached one.
    pub fn apply_book(&self, snapshot: &BookSnapshot) -> CacheUpdate {
        let mut entry = self.entries.entry(snapshot.asset_id.clone()).or_default();
        if let Some(cached) = &entry.book {
            if snapshot.timestamp <= cached.timestamp {
                debug!(
                    asset_id = %snapshot.asset_id,
                    ts = snapshot.timestamp,
                    cached_ts = cached.timestamp,
                    "dropping stale book update"
                );
                return CacheUpdate::Stale {
                    cached_ts: cached.timestamp,
                };
            }
        }
        entry.book = Some(snapshot.clone());
        CacheUpdate::Applied
    }

    pub fn get_price(&self, asset_id: &str) -> Option<PriceSnapshot> {
        self.entries.get(asset_id).and_then(|e| e.price.clone())
    }

    pub fn get_book(&self, asset_id: &str) -> Option<BookSnapshot> {
        self.entries.get(asset_id).and_then(|e| e.book.clone())
    }

    pub fn get_all_prices(&self) -> HashMap<String, PriceSnapshot> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .price
                    .clone()
                    .map(|p| (entry.key().clone(), p))
            })
            .collect()
    }

    /// Number of assets holding any cached state.
    pub fn tracked_len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
