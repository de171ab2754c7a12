use core::ops::Bound;
use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{Entry, OrderedStore, SliceQuery, StoreError};

type Row = BTreeMap<Bytes, Bytes>;

/// An [`OrderedStore`] held entirely in memory.
///
/// Rows are `BTreeMap`s keyed by column, so iteration follows the unsigned
/// byte order the allocator relies on. A single write lock covers each
/// `mutate` call, which makes every batch atomic. Useful for tests and for
/// running several allocators inside one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<Bytes, Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every column currently stored in row `key`, in
    /// order.
    pub fn columns(&self, key: &Bytes) -> Vec<Bytes> {
        self.rows
            .read()
            .get(key)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of columns in row `key`.
    pub fn row_len(&self, key: &Bytes) -> usize {
        self.rows.read().get(key).map_or(0, BTreeMap::len)
    }

    fn slice(&self, key: &Bytes, query: &SliceQuery) -> Vec<Entry> {
        let rows = self.rows.read();
        let Some(row) = rows.get(key) else {
            return Vec::new();
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        let to_entry = |(column, value): (&Bytes, &Bytes)| Entry::new(column.clone(), value.clone());

        match &query.range {
            None => row.iter().take(limit).map(to_entry).collect(),
            // `BTreeMap::range` panics on inverted bounds.
            Some((start, end)) if start >= end => Vec::new(),
            Some((start, end)) => row
                .range::<[u8], _>((Bound::Included(&start[..]), Bound::Excluded(&end[..])))
                .take(limit)
                .map(to_entry)
                .collect(),
        }
    }
}

impl OrderedStore for MemoryStore {
    async fn get_slice(&self, key: &Bytes, query: &SliceQuery) -> Result<Vec<Entry>, StoreError> {
        Ok(self.slice(key, query))
    }

    async fn mutate(
        &self,
        key: &Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows.entry(key.clone()).or_default();
        for column in deletions {
            row.remove(&column);
        }
        for entry in additions {
            row.insert(entry.column, entry.value);
        }
        if row.is_empty() {
            rows.remove(key);
        }
        Ok(())
    }
}
