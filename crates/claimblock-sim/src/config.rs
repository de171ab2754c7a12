use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use claimblock::AllocatorConfig;

/// Runtime configuration for the `claimblock-sim` binary.
///
/// Every allocator gets its own requester id and competes for the same
/// partitions of one shared in-memory store. All values are parsed from CLI
/// arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "claimblock-sim",
    version,
    about = "Races claimblock allocators against a shared store and checks the blocks they win"
)]
pub struct CliArgs {
    /// Number of competing allocators.
    ///
    /// Environment variable: `ALLOCATORS`
    #[arg(long, env = "ALLOCATORS", default_value_t = 4)]
    pub allocators: usize,

    /// Blocks each allocator requests per partition.
    ///
    /// Environment variable: `BLOCKS_PER_ALLOCATOR`
    #[arg(long, env = "BLOCKS_PER_ALLOCATOR", default_value_t = 8)]
    pub blocks_per_allocator: usize,

    /// Number of partitions, numbered from 0.
    ///
    /// Environment variable: `PARTITIONS`
    #[arg(long, env = "PARTITIONS", default_value_t = 2)]
    pub partitions: i32,

    /// Identifiers per block.
    ///
    /// Environment variable: `BLOCK_SIZE`
    #[arg(long, env = "BLOCK_SIZE", default_value_t = 1_000)]
    pub block_size: i64,

    /// Safety window between writing a claim and verifying it.
    ///
    /// Must exceed `WRITE_LATENCY_MS`, otherwise every claim is abandoned as
    /// too slow.
    ///
    /// Environment variable: `LOCK_WAIT_MS`
    #[arg(long, env = "LOCK_WAIT_MS", default_value_t = 50)]
    pub lock_wait_ms: u64,

    /// Attempts per allocation before giving up.
    ///
    /// Environment variable: `RETRY_COUNT`
    #[arg(long, env = "RETRY_COUNT", default_value_t = 64)]
    pub retry_count: u32,

    /// Simulated latency of every store operation.
    ///
    /// Environment variable: `WRITE_LATENCY_MS`
    #[arg(long, env = "WRITE_LATENCY_MS", default_value_t = 2)]
    pub write_latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub allocators: usize,
    pub blocks_per_allocator: usize,
    pub partitions: i32,
    pub block_size: i64,
    pub allocator: AllocatorConfig,
    pub store_latency: Duration,
}

impl TryFrom<CliArgs> for SimConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.allocators == 0 {
            bail!("ALLOCATORS must be greater than 0");
        }
        // Requester ids are rendered as fixed-width decimals.
        if args.allocators > 10_000 {
            bail!("ALLOCATORS ({}) exceeds the supported maximum of 10000", args.allocators);
        }
        if args.partitions <= 0 {
            bail!("PARTITIONS must be greater than 0");
        }
        if args.block_size <= 0 {
            bail!("BLOCK_SIZE must be greater than 0");
        }
        if args.write_latency_ms >= args.lock_wait_ms {
            bail!(
                "WRITE_LATENCY_MS ({}) must be below LOCK_WAIT_MS ({})",
                args.write_latency_ms,
                args.lock_wait_ms
            );
        }

        let allocator = AllocatorConfig::default()
            .with_lock_wait(Duration::from_millis(args.lock_wait_ms))
            .with_retry_count(args.retry_count);
        allocator.validate()?;

        Ok(Self {
            allocators: args.allocators,
            blocks_per_allocator: args.blocks_per_allocator,
            partitions: args.partitions,
            block_size: args.block_size,
            allocator,
            store_latency: Duration::from_millis(args.write_latency_ms),
        })
    }
}
