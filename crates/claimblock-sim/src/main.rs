#![doc = include_str!("../README.md")]

mod config;
mod store;
mod telemetry;

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, bail};
use clap::Parser;
use claimblock::{FixedBlockSize, IdBlock, RequesterId, TokioBlockAllocator};
use config::{CliArgs, SimConfig};
use futures::future::try_join_all;
use store::LatencyStore;
use telemetry::init_telemetry;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Many allocator tasks churn small key buffers concurrently.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type SimAllocator = TokioBlockAllocator<Arc<LatencyStore>>;

/// A block together with the allocator that won it.
#[derive(Debug, Clone)]
struct Won {
    requester: RequesterId,
    block: IdBlock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = SimConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let store = Arc::new(LatencyStore::new(config.store_latency));
    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    let mut handles = Vec::with_capacity(config.allocators);
    for index in 0..config.allocators {
        let requester = RequesterId::new(format!("sim-{index:04}").into_bytes());
        let allocator: SimAllocator =
            TokioBlockAllocator::new(Arc::clone(&store), requester, config.allocator)?
                .with_policy(FixedBlockSize::new(config.block_size))?
                .with_cancellation(token.clone());
        handles.push(tokio::spawn(run_allocator(
            allocator,
            config.partitions,
            config.blocks_per_allocator,
        )));
    }

    let mut by_partition: BTreeMap<i32, Vec<Won>> = BTreeMap::new();
    for result in try_join_all(handles).await.context("allocator task panicked")? {
        for (partition, won) in result? {
            by_partition.entry(partition).or_default().push(won);
        }
    }

    for (partition, blocks) in &mut by_partition {
        verify_partition(*partition, blocks, store.claims(*partition))?;
    }

    tracing::info!("All blocks disjoint");
    Ok(())
}

/// Requests `blocks` blocks on every partition, interleaving partitions.
async fn run_allocator(
    allocator: SimAllocator,
    partitions: i32,
    blocks: usize,
) -> anyhow::Result<Vec<(i32, Won)>> {
    let mut won = Vec::with_capacity(blocks * partitions as usize);
    for _ in 0..blocks {
        for partition in 0..partitions {
            let block = allocator.allocate(partition).await.with_context(|| {
                format!(
                    "allocator {} failed on partition {partition}",
                    allocator.requester()
                )
            })?;
            won.push((
                partition,
                Won {
                    requester: allocator.requester().clone(),
                    block,
                },
            ));
        }
    }
    Ok(won)
}

/// Fails if two won blocks of `partition` share an identifier.
fn verify_partition(partition: i32, blocks: &mut [Won], claims_left: usize) -> anyhow::Result<()> {
    blocks.sort_by_key(|won| won.block);

    for pair in blocks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.block.overlaps(&b.block) {
            bail!(
                "partition {partition}: {} won by {} overlaps {} won by {}",
                a.block,
                a.requester,
                b.block,
                b.requester
            );
        }
    }

    let handed_out: u64 = blocks.iter().map(|won| won.block.len()).sum();
    let highest = blocks.last().map_or(0, |won| won.block.end());
    tracing::info!(
        partition,
        blocks = blocks.len(),
        handed_out,
        highest,
        claims_left,
        "Partition verified"
    );
    Ok(())
}

fn log_startup_info(config: &SimConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting simulation with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting simulation with {} allocators on {} partitions",
            config.allocators,
            config.partitions
        );
    }
}

/// Interrupts every allocator on Ctrl+C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Interrupting allocators...");
    token.cancel();
}
