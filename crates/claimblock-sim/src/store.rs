use std::time::Duration;

use bytes::Bytes;
use claimblock::{Entry, MemoryStore, OrderedStore, SliceQuery, StoreError};

/// A [`MemoryStore`] that takes `latency` to answer every call, so that
/// allocators actually overlap in time.
pub struct LatencyStore {
    inner: MemoryStore,
    latency: Duration,
}

impl LatencyStore {
    pub fn new(latency: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            latency,
        }
    }

    /// Number of claims left in `partition`'s row.
    pub fn claims(&self, partition: i32) -> usize {
        self.inner.row_len(&claimblock::codec::partition_key(partition))
    }
}

impl OrderedStore for LatencyStore {
    async fn get_slice(&self, key: &Bytes, query: &SliceQuery) -> Result<Vec<Entry>, StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.get_slice(key, query).await
    }

    async fn mutate(
        &self,
        key: &Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.mutate(key, additions, deletions).await
    }
}
