use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::Bytes;
use tokio::time::Instant;

use super::*;
use crate::{MemoryStore, TokioSleep, codec::Claim};

const PARTITION: i32 = 7;
const WAIT: Duration = Duration::from_millis(100);

/// Wall clock driven by Tokio's (paused) clock, offset to a chosen start.
#[derive(Clone)]
struct TestClock {
    origin: Instant,
    offset: i64,
}

impl TestClock {
    fn starting_at(offset: i64) -> Self {
        Self {
            origin: Instant::now(),
            offset,
        }
    }
}

impl TimeSource<i64> for TestClock {
    fn current_millis(&self) -> i64 {
        self.offset + self.origin.elapsed().as_millis() as i64
    }
}

/// A [`MemoryStore`] with injectable latency and faults.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    latency: Duration,
    /// Upcoming claim writes that take `slow_latency`.
    slow_writes: AtomicUsize,
    slow_latency: Duration,
    /// Upcoming reads that fail with `read_fault`.
    failing_reads: AtomicUsize,
    read_fault: Option<StoreError>,
    /// Upcoming deletions that fail.
    failing_deletes: AtomicUsize,
    /// Acknowledge claim writes without applying them.
    drop_additions: AtomicBool,
    /// Lands an earlier claim from this requester next to every claim.
    rival: Option<&'static [u8]>,
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FaultyStore {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    async fn seed(&self, partition: i32, block_start: i64, timestamp: i64, requester: &[u8]) {
        let claim = codec::encode_claim(block_start, timestamp, requester);
        self.inner
            .mutate(
                &codec::partition_key(partition),
                vec![Entry::empty(claim)],
                Vec::new(),
            )
            .await
            .unwrap();
    }

    fn claims(&self, partition: i32) -> Vec<Claim> {
        self.inner
            .columns(&codec::partition_key(partition))
            .iter()
            .map(|column| Claim::decode(column).unwrap())
            .collect()
    }
}

impl OrderedStore for FaultyStore {
    async fn get_slice(&self, key: &Bytes, query: &SliceQuery) -> Result<Vec<Entry>, StoreError> {
        tokio::time::sleep(self.latency).await;
        if take(&self.failing_reads) {
            return Err(self
                .read_fault
                .clone()
                .unwrap_or_else(|| StoreError::Transient("injected read failure".into())));
        }
        self.inner.get_slice(key, query).await
    }

    async fn mutate(
        &self,
        key: &Bytes,
        mut additions: Vec<Entry>,
        deletions: Vec<Bytes>,
    ) -> Result<(), StoreError> {
        let slow = !additions.is_empty() && take(&self.slow_writes);
        tokio::time::sleep(if slow { self.slow_latency } else { self.latency }).await;

        if !deletions.is_empty() && take(&self.failing_deletes) {
            return Err(StoreError::Transient("injected delete failure".into()));
        }
        if self.drop_additions.load(Ordering::SeqCst) {
            additions.clear();
        }
        if let Some(rival) = self.rival {
            let rivals: Vec<_> = additions
                .iter()
                .map(|entry| {
                    let ours = Claim::decode(&entry.column).unwrap();
                    Entry::empty(codec::encode_claim(
                        ours.block_start,
                        ours.timestamp_millis - 1,
                        rival,
                    ))
                })
                .collect();
            additions.extend(rivals);
        }
        self.inner.mutate(key, additions, deletions).await
    }
}

type TestAllocator = BlockAllocator<Arc<FaultyStore>, TokioSleep, TestClock>;

fn allocator(store: &Arc<FaultyStore>, requester: &'static [u8], clock: TestClock) -> TestAllocator {
    allocator_with(store, requester, clock, AllocatorConfig::default().with_lock_wait(WAIT))
}

fn allocator_with(
    store: &Arc<FaultyStore>,
    requester: &'static [u8],
    clock: TestClock,
    config: AllocatorConfig,
) -> TestAllocator {
    BlockAllocator::with_clock(
        Arc::clone(store),
        RequesterId::from_static(requester),
        config,
        clock,
    )
    .unwrap()
    .with_policy(FixedBlockSize::new(10))
    .unwrap()
}

fn starts(claims: &[Claim]) -> Vec<i64> {
    claims.iter().map(|c| c.block_start).collect()
}

#[tokio::test(start_paused = true)]
async fn cold_start_allocates_from_base() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 11));
}

#[tokio::test(start_paused = true)]
async fn sequential_allocations_advance() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 11));
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(11, 21));
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(21, 31));

    // Winning claims stay, newest first.
    assert_eq!(starts(&store.claims(PARTITION)), vec![21, 11, 1]);
}

#[tokio::test(start_paused = true)]
async fn partitions_are_independent() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(allocator.allocate(1).await.unwrap(), IdBlock::new(1, 11));
    assert_eq!(allocator.allocate(2).await.unwrap(), IdBlock::new(1, 11));
    assert_eq!(allocator.allocate(1).await.unwrap(), IdBlock::new(11, 21));
}

#[tokio::test(start_paused = true)]
async fn verification_waits_out_the_safety_window() {
    let store = Arc::new(FaultyStore::with_latency(Duration::from_millis(3)));
    let allocator = allocator(&store, b"A", TestClock::starting_at(0));

    let started = Instant::now();
    allocator.allocate(PARTITION).await.unwrap();
    // read + write + wait + verification read
    assert!(started.elapsed() >= WAIT + Duration::from_millis(9));
}

#[tokio::test(start_paused = true)]
async fn earlier_claim_wins_contention() {
    let store = Arc::new(FaultyStore::with_latency(Duration::from_millis(1)));
    let a = allocator(&store, b"A", TestClock::starting_at(100));
    let b = allocator(&store, b"B", TestClock::starting_at(105));

    let (block_a, block_b) = tokio::join!(a.allocate(PARTITION), b.allocate(PARTITION));
    assert_eq!(block_a.unwrap(), IdBlock::new(1, 11));
    assert_eq!(block_b.unwrap(), IdBlock::new(11, 21));

    // B's losing claim on block 1 was rolled back.
    let claims = store.claims(PARTITION);
    assert_eq!(starts(&claims), vec![11, 1]);
    assert_eq!(&claims[0].requester[..], b"B");
    assert_eq!(&claims[1].requester[..], b"A");
}

#[tokio::test(start_paused = true)]
async fn later_timestamp_loses_even_with_smaller_requester() {
    let store = Arc::new(FaultyStore::with_latency(Duration::from_millis(1)));
    let a = allocator(&store, b"A", TestClock::starting_at(200));
    let z = allocator(&store, b"Z", TestClock::starting_at(100));

    let (block_a, block_z) = tokio::join!(a.allocate(PARTITION), z.allocate(PARTITION));
    assert_eq!(block_z.unwrap(), IdBlock::new(1, 11));
    assert_eq!(block_a.unwrap(), IdBlock::new(11, 21));
}

#[tokio::test(start_paused = true)]
async fn equal_timestamps_fall_back_to_requester_order() {
    let store = Arc::new(FaultyStore::with_latency(Duration::from_millis(1)));
    let b = allocator(&store, b"B", TestClock::starting_at(100));
    let a = allocator(&store, b"A", TestClock::starting_at(100));

    let (block_b, block_a) = tokio::join!(b.allocate(PARTITION), a.allocate(PARTITION));
    assert_eq!(block_a.unwrap(), IdBlock::new(1, 11));
    assert_eq!(block_b.unwrap(), IdBlock::new(11, 21));
}

#[tokio::test(start_paused = true)]
async fn slow_write_is_abandoned_and_retried() {
    let store = Arc::new(FaultyStore {
        slow_writes: AtomicUsize::new(1),
        slow_latency: WAIT + Duration::from_millis(50),
        ..FaultyStore::default()
    });
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    let started = Instant::now();
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 11));
    // slow write, backoff, then a full safety window for the second attempt
    assert!(started.elapsed() >= WAIT + Duration::from_millis(50) + WAIT + WAIT);

    // The abandoned claim was deleted, only the winner remains.
    assert_eq!(store.claims(PARTITION).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_read_failures_are_retried() {
    let store = Arc::new(FaultyStore {
        failing_reads: AtomicUsize::new(2),
        ..FaultyStore::default()
    });
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    let started = Instant::now();
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 11));
    assert!(started.elapsed() >= WAIT * 3);
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_counts_as_transient() {
    let store = Arc::new(FaultyStore {
        failing_reads: AtomicUsize::new(1),
        read_fault: Some(StoreError::Unreachable),
        ..FaultyStore::default()
    });
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 11));
}

#[tokio::test(start_paused = true)]
async fn permanent_store_failure_is_fatal() {
    let store = Arc::new(FaultyStore {
        failing_reads: AtomicUsize::new(1),
        read_fault: Some(StoreError::Permanent("disk gone".into())),
        ..FaultyStore::default()
    });
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert!(matches!(
        allocator.allocate(PARTITION).await,
        Err(Error::PermanentStorage { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn constant_failures_exhaust_the_retry_budget() {
    let store = Arc::new(FaultyStore {
        failing_reads: AtomicUsize::new(usize::MAX),
        ..FaultyStore::default()
    });
    let config = AllocatorConfig::default()
        .with_lock_wait(WAIT)
        .with_retry_count(4);
    let allocator = allocator_with(&store, b"A", TestClock::starting_at(100), config);

    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::LockingTimeout { attempts: 4 })
    );
    assert!(store.claims(PARTITION).is_empty());
}

#[tokio::test(start_paused = true)]
async fn losing_every_race_exhausts_the_retry_budget() {
    let store = Arc::new(FaultyStore {
        rival: Some(&b"0"[..]),
        ..FaultyStore::default()
    });
    let config = AllocatorConfig::default()
        .with_lock_wait(WAIT)
        .with_retry_count(3);
    let allocator = allocator_with(&store, b"A", TestClock::starting_at(100), config);

    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::LockingTimeout { attempts: 3 })
    );

    // Each attempt moved past the rival's block and rolled its own claim back.
    let claims = store.claims(PARTITION);
    assert_eq!(starts(&claims), vec![21, 11, 1]);
    assert!(claims.iter().all(|c| &c.requester[..] == b"0"));
}

#[tokio::test(start_paused = true)]
async fn failed_rollbacks_are_retried() {
    let store = Arc::new(FaultyStore {
        slow_writes: AtomicUsize::new(1),
        slow_latency: WAIT * 2,
        failing_deletes: AtomicUsize::new(2),
        ..FaultyStore::default()
    });
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    let started = Instant::now();
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 11));
    assert!(started.elapsed() >= WAIT * 2 + ROLLBACK_WAIT * 2);
    assert_eq!(store.claims(PARTITION).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_rollback_leaves_an_orphan_but_does_not_fail() {
    let store = Arc::new(FaultyStore {
        rival: Some(&b"0"[..]),
        failing_deletes: AtomicUsize::new(usize::MAX),
        ..FaultyStore::default()
    });
    let config = AllocatorConfig::default()
        .with_lock_wait(WAIT)
        .with_retry_count(2);
    let allocator = allocator_with(&store, b"A", TestClock::starting_at(100), config);

    // The outcome is decided by the lost races, not the failed deletions.
    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::LockingTimeout { attempts: 2 })
    );
    let orphans = store
        .claims(PARTITION)
        .into_iter()
        .filter(|c| &c.requester[..] == b"A")
        .count();
    assert_eq!(orphans, 2);
}

#[tokio::test(start_paused = true)]
async fn orphaned_claim_burns_its_block() {
    let store = Arc::new(FaultyStore::default());
    // A claimant crashed after losing on block 1, before its rollback.
    store.seed(PARTITION, 1, 50, b"Z").await;
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(11, 21));
}

#[tokio::test(start_paused = true)]
async fn vanished_claim_is_fatal() {
    let store = Arc::new(FaultyStore::default());
    store.drop_additions.store(true, Ordering::SeqCst);
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert!(matches!(
        allocator.allocate(PARTITION).await,
        Err(Error::PermanentStorage { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_column_is_reported() {
    let store = Arc::new(FaultyStore::default());
    store
        .inner
        .mutate(
            &codec::partition_key(PARTITION),
            vec![Entry::empty(Bytes::from_static(b"abc"))],
            Vec::new(),
        )
        .await
        .unwrap();
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::MalformedClaim { len: 3 })
    );
}

#[tokio::test(start_paused = true)]
async fn overflowing_block_is_rejected() {
    let store = Arc::new(FaultyStore::default());
    store.seed(PARTITION, i64::MAX - 15, 50, b"Z").await;
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::IdSpaceExhausted {
            partition: PARTITION
        })
    );
}

#[tokio::test(start_paused = true)]
async fn non_positive_block_size_is_rejected() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));
    allocator.set_policy(|_partition: i32| 0_i64).unwrap();

    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::InvalidBlockSize {
            partition: PARTITION,
            size: 0
        })
    );
}

#[tokio::test(start_paused = true)]
async fn policy_can_change_before_first_use() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));
    assert!(!allocator.is_sealed());

    allocator.set_policy(FixedBlockSize::new(5)).unwrap();
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(1, 6));
}

#[tokio::test(start_paused = true)]
async fn policy_is_fixed_after_first_use() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));

    allocator.allocate(PARTITION).await.unwrap();
    assert!(allocator.is_sealed());
    assert!(matches!(
        allocator.set_policy(FixedBlockSize::new(99)),
        Err(Error::IllegalState { .. })
    ));
    assert_eq!(allocator.allocate(PARTITION).await.unwrap(), IdBlock::new(11, 21));
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_is_fatal_and_rolls_back() {
    let store = Arc::new(FaultyStore::default());
    let allocator = allocator(&store, b"A", TestClock::starting_at(100));
    allocator.cancellation_token().cancel();

    assert_eq!(
        allocator.allocate(PARTITION).await,
        Err(Error::LockingInterrupted {
            context: "id block claim confirmation"
        })
    );
    assert!(store.claims(PARTITION).is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_is_not_retried() {
    let store = Arc::new(FaultyStore {
        failing_reads: AtomicUsize::new(usize::MAX),
        ..FaultyStore::default()
    });
    let token = CancellationToken::new();
    let allocator = Arc::new(
        allocator(&store, b"A", TestClock::starting_at(100)).with_cancellation(token.clone()),
    );

    let task = tokio::spawn({
        let allocator = Arc::clone(&allocator);
        async move { allocator.allocate(PARTITION).await }
    });
    tokio::time::sleep(WAIT / 2).await;
    token.cancel();

    assert_eq!(
        task.await.unwrap(),
        Err(Error::LockingInterrupted {
            context: "id block acquisition retry"
        })
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_rollback_backoff_is_fatal() {
    let store = Arc::new(FaultyStore {
        rival: Some(&b"0"[..]),
        failing_deletes: AtomicUsize::new(usize::MAX),
        ..FaultyStore::default()
    });
    let allocator = Arc::new(allocator(&store, b"A", TestClock::starting_at(100)));
    let token = allocator.cancellation_token();

    let task = tokio::spawn({
        let allocator = Arc::clone(&allocator);
        async move { allocator.allocate(PARTITION).await }
    });
    // The attempt is lost after one window. Its first failed delete is
    // followed by a backoff of ROLLBACK_WAIT.
    tokio::time::sleep(WAIT + Duration::from_millis(50)).await;
    token.cancel();

    assert_eq!(
        task.await.unwrap(),
        Err(Error::LockingInterrupted {
            context: "abandoned claim removal retry"
        })
    );
    // The losing claim could not be removed.
    let claims = store.claims(PARTITION);
    assert_eq!(claims.len(), 2);
    assert!(claims.iter().any(|c| &c.requester[..] == b"A"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_allocators_never_overlap() {
    const ALLOCATORS: &[&[u8]] = &[b"A", b"B", b"C", b"D"];
    const BLOCKS_EACH: usize = 3;

    let store = Arc::new(FaultyStore::with_latency(Duration::from_millis(2)));
    let config = AllocatorConfig::default()
        .with_lock_wait(WAIT)
        .with_retry_count(64);

    let tasks: Vec<_> = ALLOCATORS
        .iter()
        .map(|&requester| {
            let allocator = allocator_with(&store, requester, TestClock::starting_at(0), config);
            tokio::spawn(async move {
                let mut blocks = Vec::with_capacity(BLOCKS_EACH);
                for _ in 0..BLOCKS_EACH {
                    blocks.push(allocator.allocate(PARTITION).await.unwrap());
                }
                blocks
            })
        })
        .collect();

    let mut all = Vec::new();
    for task in tasks {
        let blocks = task.await.unwrap();
        // Each allocator's own blocks move strictly upwards.
        assert!(blocks.windows(2).all(|w| w[0].end() <= w[1].start()));
        all.extend(blocks);
    }

    assert_eq!(all.len(), ALLOCATORS.len() * BLOCKS_EACH);
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert!(!a.overlaps(b), "{a} overlaps {b}");
        }
    }
}
