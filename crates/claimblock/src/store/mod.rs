//! Client contract for the ordered key-value store that allocators share.
//!
//! The store is addressed by a row key (the encoded partition) and, within a
//! row, by columns kept in ascending unsigned byte order. Allocators only
//! ever scan a row and apply per-row batches of additions and deletions.

mod memory;

use core::future::Future;
use std::sync::Arc;

use bytes::Bytes;

pub use memory::*;

/// One column of a row together with its value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    pub column: Bytes,
    pub value: Bytes,
}

impl Entry {
    pub fn new(column: Bytes, value: Bytes) -> Self {
        Self { column, value }
    }

    /// An entry with a zero-length value, as used for claims.
    pub fn empty(column: Bytes) -> Self {
        Self::new(column, Bytes::new())
    }
}

/// Failures reported by an [`OrderedStore`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The operation failed but may succeed if retried.
    #[error("transient: {0}")]
    Transient(String),

    /// The store could not be reached at all.
    #[error("store unreachable")]
    Unreachable,

    /// The operation failed and retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Whether the failed operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unreachable)
    }
}

/// Parameters of a column scan within one row.
///
/// The default query scans the whole row without a limit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceQuery {
    /// Inclusive start and exclusive end column. `None` is unbounded.
    pub range: Option<(Bytes, Bytes)>,
    /// Maximum number of entries returned. `None` is unlimited.
    pub limit: Option<usize>,
}

impl SliceQuery {
    /// Scans the entire row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Scans columns in `[start, end)`.
    pub fn between(start: Bytes, end: Bytes) -> Self {
        Self {
            range: Some((start, end)),
            limit: None,
        }
    }

    /// Caps the number of returned entries.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// An ordered key-column-value store, as seen by the allocator.
///
/// Implementations must return slices in ascending unsigned byte order of the
/// column and must apply each [`OrderedStore::mutate`] call atomically with
/// respect to its row.
pub trait OrderedStore: Send + Sync {
    /// Reads the columns of row `key` matching `query`.
    fn get_slice(
        &self,
        key: &Bytes,
        query: &SliceQuery,
    ) -> impl Future<Output = Result<Vec<Entry>, StoreError>> + Send;

    /// Adds `additions` to and removes `deletions` from row `key` as one
    /// batch.
    fn mutate(
        &self,
        key: &Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<S: OrderedStore> OrderedStore for Arc<S> {
    fn get_slice(
        &self,
        key: &Bytes,
        query: &SliceQuery,
    ) -> impl Future<Output = Result<Vec<Entry>, StoreError>> + Send {
        (**self).get_slice(key, query)
    }

    fn mutate(
        &self,
        key: &Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).mutate(key, additions, deletions)
    }
}
