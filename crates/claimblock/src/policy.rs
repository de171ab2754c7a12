use std::collections::HashMap;

/// Block size used when nothing else is configured.
pub const DEFAULT_BLOCK_SIZE: i64 = 10_000;

/// Decides how many identifiers one block holds for a partition.
///
/// Implementations must be deterministic: the same partition must map to the
/// same positive size for as long as an allocator uses the policy. Blocks of
/// different sizes on one partition would misplace the next start.
///
/// Any `Fn(i32) -> i64` closure is a policy.
pub trait BlockSizePolicy: Send + Sync {
    fn block_size(&self, partition: i32) -> i64;
}

impl<F> BlockSizePolicy for F
where
    F: Fn(i32) -> i64 + Send + Sync,
{
    fn block_size(&self, partition: i32) -> i64 {
        self(partition)
    }
}

/// The same block size for every partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedBlockSize(i64);

impl FixedBlockSize {
    pub const fn new(size: i64) -> Self {
        Self(size)
    }
}

impl Default for FixedBlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockSizePolicy for FixedBlockSize {
    fn block_size(&self, _partition: i32) -> i64 {
        self.0
    }
}

/// Per-partition sizes with a fallback for partitions without an override.
#[derive(Clone, Debug, Default)]
pub struct PartitionedBlockSize {
    fallback: FixedBlockSize,
    overrides: HashMap<i32, i64>,
}

impl PartitionedBlockSize {
    pub fn new(fallback: i64) -> Self {
        Self {
            fallback: FixedBlockSize::new(fallback),
            overrides: HashMap::new(),
        }
    }

    pub fn with_partition(mut self, partition: i32, size: i64) -> Self {
        self.overrides.insert(partition, size);
        self
    }
}

impl BlockSizePolicy for PartitionedBlockSize {
    fn block_size(&self, partition: i32) -> i64 {
        self.overrides
            .get(&partition)
            .copied()
            .unwrap_or_else(|| self.fallback.block_size(partition))
    }
}
