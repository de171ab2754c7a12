//! Log output for the simulator.
//!
//! Events go to stdout through `tracing-subscriber`'s fmt layer. Verbosity is
//! read from `RUST_LOG` and defaults to `info`; use
//! `RUST_LOG=claimblock=debug` to see every won and lost claim.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(())
}
