//! Block allocation through claims in a shared ordered store.
//!
//! Each attempt runs the same pipeline:
//!
//! 1. Scan the first few columns of the partition row. Because block starts
//!    are stored negated, these are the highest blocks claimed so far.
//! 2. Propose the block after the highest one seen and write a claim for it,
//!    stamped with the local wall clock and this allocator's requester id.
//! 3. Abandon the attempt if the write took longer than the safety window.
//!    Otherwise wait until the window has passed since the write.
//! 4. Re-read every claim on the proposed block. The lexicographically first
//!    claim (earliest timestamp, then smallest requester id) owns the block.
//!
//! Any attempt that does not win deletes its own claim before the next one
//! starts. Winning claims stay in the store for good and are what later
//! scans build on.

mod config;
#[cfg(all(test, feature = "async-tokio"))]
mod tests;

pub use config::*;

use core::{marker::PhantomData, pin::pin, time::Duration};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{Either, select};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::{
    BASE_ID, BlockSizePolicy, Entry, Error, FixedBlockSize, IdBlock, OrderedStore, RequesterId,
    Result, SleepProvider, SliceQuery, StoreError, TimeSource, WallClock, codec,
};

/// Number of columns read when looking for the latest claimed block.
///
/// More than one, so that several competing or abandoned claims on the top
/// block cannot hide the block below.
pub const READ_LIMIT: usize = 5;

/// Attempts made to delete a claim that did not win.
pub const ROLLBACK_ATTEMPTS: u32 = 5;

/// Pause between failed claim deletions.
pub const ROLLBACK_WAIT: Duration = Duration::from_millis(200);

/// How a single attempt ended.
#[derive(Debug)]
enum Attempt {
    /// Our claim was first. The block is ours.
    Won(IdBlock),
    /// Another claim on the same block came first.
    Lost,
    /// The claim write was too slow to trust the safety window.
    Aborted { elapsed_ms: i64 },
    /// The store failed in a way worth retrying.
    TransientFailure(Error),
}

/// Hands out disjoint [`IdBlock`]s per partition to processes that share
/// nothing but an [`OrderedStore`].
///
/// - `S`: the store client
/// - `Z`: the [`SleepProvider`] used for the safety window and backoffs
/// - `T`: the wall clock claims are stamped with
///
/// All processes sharing a store must keep their wall clocks roughly in
/// sync. The safety wait is measured on the local clock, so if it steps
/// backwards after a claim was written the wait lasts until the clock has
/// caught up again, however long that takes.
///
/// The block-size policy can be replaced until the first call to
/// [`allocate`](Self::allocate). From then on it is fixed.
///
/// Concurrent calls for the *same* partition on the *same* allocator are not
/// coordinated with each other. They compete like independent processes
/// would, except that they share a requester id and can therefore both
/// believe they won. Serialize them, e.g. through an [`IdPool`].
///
/// [`IdPool`]: crate::IdPool
pub struct BlockAllocator<S, Z, T = WallClock> {
    store: S,
    requester: RequesterId,
    clock: T,
    config: AllocatorConfig,
    policy: Mutex<Arc<dyn BlockSizePolicy>>,
    sealed: AtomicBool,
    cancel: CancellationToken,
    _sleep: PhantomData<fn() -> Z>,
}

impl<S, Z> BlockAllocator<S, Z, WallClock>
where
    S: OrderedStore,
    Z: SleepProvider,
{
    /// Creates an allocator that stamps claims with the system clock and
    /// uses [`FixedBlockSize::default`] until told otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(store: S, requester: RequesterId, config: AllocatorConfig) -> Result<Self> {
        Self::with_clock(store, requester, config, WallClock)
    }
}

impl<S, Z, T> BlockAllocator<S, Z, T>
where
    S: OrderedStore,
    Z: SleepProvider,
    T: TimeSource<i64> + Send + Sync,
{
    /// Creates an allocator with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn with_clock(
        store: S,
        requester: RequesterId,
        config: AllocatorConfig,
        clock: T,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            requester,
            clock,
            config,
            policy: Mutex::new(Arc::new(FixedBlockSize::default())),
            sealed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            _sleep: PhantomData,
        })
    }

    /// Builder form of [`set_policy`](Self::set_policy).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the allocator was already used.
    pub fn with_policy(self, policy: impl BlockSizePolicy + 'static) -> Result<Self> {
        self.set_policy(policy)?;
        Ok(self)
    }

    /// Uses `token` to interrupt the allocator's timed waits.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replaces the block-size policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] once [`allocate`](Self::allocate) has
    /// been called. The current policy stays in effect.
    pub fn set_policy(&self, policy: impl BlockSizePolicy + 'static) -> Result<()> {
        let mut current = self.policy.lock();
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::IllegalState {
                reason: "block size policy cannot change once the allocator is in use",
            });
        }
        *current = Arc::new(policy);
        Ok(())
    }

    /// Whether the policy has been fixed by a first allocation.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// A handle that interrupts this allocator's waits when cancelled.
    ///
    /// An interrupted wait fails the allocation with
    /// [`Error::LockingInterrupted`]. It is never retried.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn requester(&self) -> &RequesterId {
        &self.requester
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claims the next free block of `partition`.
    ///
    /// Attempts are retried until one wins or
    /// [`AllocatorConfig::retry_count`] attempts have been made. Lost
    /// attempts retry immediately. Slow writes and transient storage
    /// failures back off for the safety window first.
    ///
    /// # Errors
    ///
    /// - [`Error::LockingTimeout`] if no attempt won
    /// - [`Error::LockingInterrupted`] if a wait was cancelled
    /// - [`Error::PermanentStorage`] if a claim vanished before it could be
    ///   verified or the store failed permanently
    /// - [`Error::InvalidBlockSize`], [`Error::IdSpaceExhausted`] and
    ///   [`Error::MalformedClaim`] for unusable inputs or store contents
    #[instrument(level = "debug", skip(self), fields(requester = %self.requester))]
    pub async fn allocate(&self, partition: i32) -> Result<IdBlock> {
        let block_size = self.seal_policy().block_size(partition);
        if block_size <= 0 {
            return Err(Error::InvalidBlockSize {
                partition,
                size: block_size,
            });
        }

        let key = codec::partition_key(partition);
        let retry_count = self.config.retry_count;
        let lock_wait = self.config.lock_wait;

        for attempt in 1..=retry_count {
            match self.attempt(partition, &key, block_size).await? {
                Attempt::Won(block) => return Ok(block),
                Attempt::Lost => continue,
                Attempt::Aborted { elapsed_ms } => warn!(
                    attempt,
                    elapsed_ms,
                    threshold_ms = self.config.lock_wait_millis(),
                    "claim write too slow, retrying in {lock_wait:?}"
                ),
                Attempt::TransientFailure(err) => warn!(
                    attempt,
                    %err,
                    "storage failure while acquiring id block, retrying in {lock_wait:?}"
                ),
            }
            if attempt < retry_count {
                self.pause(lock_wait, "id block acquisition retry").await?;
            }
        }

        Err(Error::LockingTimeout {
            attempts: retry_count,
        })
    }

    /// Marks the policy as fixed and returns it.
    fn seal_policy(&self) -> Arc<dyn BlockSizePolicy> {
        if self
            .sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("block size policy sealed");
        }
        Arc::clone(&self.policy.lock())
    }

    async fn attempt(&self, partition: i32, key: &Bytes, block_size: i64) -> Result<Attempt> {
        let recent = match self
            .store
            .get_slice(key, &SliceQuery::all().with_limit(READ_LIMIT))
            .await
        {
            Ok(entries) => entries,
            Err(err) => return storage_failure(err),
        };

        let mut latest = BASE_ID - block_size;
        for entry in &recent {
            latest = latest.max(codec::decode_block_start(&entry.column)?);
        }

        let (next_start, next_end) = latest
            .checked_add(block_size)
            .and_then(|start| Some((start, start.checked_add(block_size)?)))
            .ok_or(Error::IdSpaceExhausted { partition })?;
        let block = IdBlock::new(next_start, next_end);
        let claim = codec::encode_claim(
            next_start,
            self.clock.current_millis(),
            self.requester.as_bytes(),
        );

        let outcome = self.claim(key, &claim, block).await;
        if !matches!(outcome, Ok(Attempt::Won(_))) {
            if let Err(err) = self.rollback(key, &claim, block).await {
                // Keep the error that ended the attempt if there was one.
                return outcome.and(Err(err));
            }
        }
        outcome
    }

    /// Writes `claim`, waits out the safety window and checks whether it came
    /// first.
    async fn claim(&self, key: &Bytes, claim: &Bytes, block: IdBlock) -> Result<Attempt> {
        let before = self.clock.current_millis();
        if let Err(err) = self
            .store
            .mutate(key, vec![Entry::empty(claim.clone())], Vec::new())
            .await
        {
            return storage_failure(err);
        }
        let written = self.clock.current_millis();

        let lock_wait_ms = self.config.lock_wait_millis();
        let elapsed_ms = written.saturating_sub(before);
        if elapsed_ms > lock_wait_ms {
            return Ok(Attempt::Aborted { elapsed_ms });
        }

        loop {
            let since = self.clock.current_millis().saturating_sub(written);
            if since >= lock_wait_ms {
                break;
            }
            // Bounded per pause. After a backwards step the loop keeps going
            // until the clock is past the window again.
            let remaining = lock_wait_ms.saturating_sub(since).min(lock_wait_ms);
            self.pause(
                Duration::from_millis(remaining as u64),
                "id block claim confirmation",
            )
            .await?;
        }

        let (lower, upper) = codec::claim_range_for(block.start());
        let contenders = match self
            .store
            .get_slice(key, &SliceQuery::between(lower, upper))
            .await
        {
            Ok(entries) => entries,
            Err(err) => return storage_failure(err),
        };

        let Some(first) = contenders.first() else {
            return Err(Error::PermanentStorage {
                reason: format!(
                    "claim on id block {block} vanished before verification; \
                     every instance sharing the store needs a unique requester id"
                ),
            });
        };

        if first.column == *claim {
            debug!(%block, contenders = contenders.len(), "acquired id block");
            Ok(Attempt::Won(block))
        } else {
            debug!(%block, contenders = contenders.len(), "lost id block to an earlier claim");
            Ok(Attempt::Lost)
        }
    }

    /// Deletes a claim that did not win.
    ///
    /// Only an interrupted backoff is an error. When every deletion fails the
    /// claim stays behind and its block is never handed out.
    async fn rollback(&self, key: &Bytes, claim: &Bytes, block: IdBlock) -> Result<()> {
        for attempt in 1..=ROLLBACK_ATTEMPTS {
            match self.store.mutate(key, Vec::new(), vec![claim.clone()]).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < ROLLBACK_ATTEMPTS => {
                    warn!(
                        attempt,
                        %err,
                        %block,
                        "failed to delete abandoned claim, retrying in {ROLLBACK_WAIT:?}"
                    );
                    self.pause(ROLLBACK_WAIT, "abandoned claim removal retry")
                        .await?;
                }
                Err(err) => error!(
                    %err,
                    %block,
                    "giving up on abandoned claim after {ROLLBACK_ATTEMPTS} attempts, its block stays reserved"
                ),
            }
        }
        Ok(())
    }

    /// Sleeps for `dur` unless the cancellation token fires first.
    async fn pause(&self, dur: Duration, context: &'static str) -> Result<()> {
        let cancelled = pin!(self.cancel.cancelled());
        let sleep = pin!(Z::sleep_for(dur));
        match select(cancelled, sleep).await {
            Either::Left(((), _)) => Err(Error::LockingInterrupted { context }),
            Either::Right(((), _)) => Ok(()),
        }
    }
}

fn storage_failure(err: StoreError) -> Result<Attempt> {
    if err.is_transient() {
        Ok(Attempt::TransientFailure(Error::TransientStorage(err)))
    } else {
        Err(Error::PermanentStorage {
            reason: err.to_string(),
        })
    }
}
