use core::future::Future;
use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{BlockAllocator, IdBlock, OrderedStore, Result, SleepProvider, TimeSource};

/// Anything that can hand out whole [`IdBlock`]s for a partition.
pub trait BlockSource: Send + Sync {
    /// Returns a block no other caller will ever receive for `partition`.
    fn next_block(&self, partition: i32) -> impl Future<Output = Result<IdBlock>> + Send;
}

impl<S, Z, T> BlockSource for BlockAllocator<S, Z, T>
where
    S: OrderedStore,
    Z: SleepProvider,
    T: TimeSource<i64> + Send + Sync,
{
    fn next_block(&self, partition: i32) -> impl Future<Output = Result<IdBlock>> + Send {
        self.allocate(partition)
    }
}

impl<B: BlockSource> BlockSource for Arc<B> {
    fn next_block(&self, partition: i32) -> impl Future<Output = Result<IdBlock>> + Send {
        (**self).next_block(partition)
    }
}

/// Progress through the current block of one partition.
#[derive(Debug, Default)]
struct Cursor {
    block: Option<IdBlock>,
    next: i64,
}

impl Cursor {
    fn take(&mut self) -> Option<i64> {
        let block = self.block?;
        if self.next < block.end() {
            let id = self.next;
            self.next += 1;
            Some(id)
        } else {
            None
        }
    }

    fn refill(&mut self, block: IdBlock) {
        self.next = block.start();
        self.block = Some(block);
    }

    fn remaining(&self) -> u64 {
        self.block
            .map_or(0, |block| block.end().saturating_sub(self.next).max(0) as u64)
    }
}

/// Hands out single identifiers, fetching a fresh block per partition when
/// the current one runs dry.
///
/// Calls for the same partition are serialized, so one pool never asks its
/// source for two blocks of a partition at once. Identifiers left in a block
/// when the pool is dropped are lost.
pub struct IdPool<B> {
    source: B,
    cursors: Mutex<HashMap<i32, Arc<tokio::sync::Mutex<Cursor>>>>,
}

impl<B: BlockSource> IdPool<B> {
    pub fn new(source: B) -> Self {
        Self {
            source,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &B {
        &self.source
    }

    /// Returns the next identifier of `partition`.
    ///
    /// # Errors
    ///
    /// Propagates the source's error when a new block is needed and cannot
    /// be obtained. The pool stays usable afterwards.
    pub async fn next_id(&self, partition: i32) -> Result<i64> {
        let cursor = self.cursor(partition);
        let mut cursor = cursor.lock().await;
        if let Some(id) = cursor.take() {
            return Ok(id);
        }

        let block = self.source.next_block(partition).await?;
        debug!(partition, %block, "id pool refilled");
        cursor.refill(block);
        // A fresh block always holds at least one id.
        Ok(cursor.take().unwrap_or(block.start()))
    }

    /// Identifiers still available without another block, per partition.
    pub async fn remaining(&self, partition: i32) -> u64 {
        self.cursor(partition).lock().await.remaining()
    }

    fn cursor(&self, partition: i32) -> Arc<tokio::sync::Mutex<Cursor>> {
        Arc::clone(self.cursors.lock().entry(partition).or_default())
    }
}
