//! Bounded, frequency-evicted cache of block headers
//!
//! Used during congestion analysis to avoid re-fetching headers for
//! overlapping block ranges on every estimation call.

use ethers::types::{Block, H256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::trace;

struct CacheEntry {
    header: Block<H256>,
    // atomic so lookups can bump the count under the shared read lock
    hits: AtomicU64,
}

/// Least-frequently-used block header cache. Reads are concurrent, writes
/// are exclusive and evict the least used entry when over capacity.
pub struct LfuHeaderCache {
    capacity: u64,
    entries: RwLock<HashMap<u64, CacheEntry>>,
}

impl LfuHeaderCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get a header by block number, bumping its use count. Concurrent
    /// lookups proceed in parallel; only insertion takes the write lock.
    pub async fn get(&self, block_number: u64) -> Option<Block<H256>> {
        let entries = self.entries.read().await;
        let entry = entries.get(&block_number)?;
        entry.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.header.clone())
    }

    /// Insert a header, evicting the least frequently used entry if the
    /// cache is at capacity. Headers without a number are ignored.
    pub async fn set(&self, header: Block<H256>) {
        let number = match header.number {
            Some(n) => n.as_u64(),
            None => return,
        };

        let mut entries = self.entries.write().await;
        if entries.len() as u64 >= self.capacity && !entries.contains_key(&number) {
            if let Some(evict) = entries
                .iter()
                .min_by_key(|(_, e)| e.hits.load(Ordering::Relaxed))
                .map(|(n, _)| *n)
            {
                trace!(block = evict, "Evicting least used header from cache");
                entries.remove(&evict);
            }
        }
        entries.insert(
            number,
            CacheEntry {
                header,
                hits: AtomicU64::new(0),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    fn header(number: u64) -> Block<H256> {
        Block {
            number: Some(U64::from(number)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_returns_cached_header() {
        let cache = LfuHeaderCache::new(10);
        cache.set(header(1)).await;
        assert!(cache.get(1).await.is_some());
        assert!(cache.get(2).await.is_none());
    }

    #[tokio::test]
    async fn test_least_used_entry_is_evicted() {
        let cache = LfuHeaderCache::new(2);
        cache.set(header(1)).await;
        cache.set(header(2)).await;
        // block 1 is now more popular than block 2
        cache.get(1).await;

        cache.set(header(3)).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(1).await.is_some());
        assert!(cache.get(2).await.is_none());
        assert!(cache.get(3).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_lookups_still_count_toward_frequency() {
        let cache = LfuHeaderCache::new(2);
        cache.set(header(1)).await;
        cache.set(header(2)).await;

        let hits = futures::future::join_all((0..16).map(|_| cache.get(1))).await;
        assert!(hits.iter().all(|h| h.is_some()));

        // block 1 accumulated its hits under the shared lock, so block 2
        // is the one evicted
        cache.set(header(3)).await;
        assert!(cache.get(1).await.is_some());
        assert!(cache.get(2).await.is_none());
    }

    #[tokio::test]
    async fn test_headers_without_number_are_ignored() {
        let cache = LfuHeaderCache::new(2);
        cache.set(Block::default()).await;
        assert!(cache.is_empty().await);
    }
}
