use crate::{BlockAllocator, SleepProvider, WallClock};

/// An implementation of [`SleepProvider`] using Tokio's timer.
///
/// This is the default provider for use in async applications built on Tokio.
pub struct TokioSleep;
impl SleepProvider for TokioSleep {
    type Sleep = tokio::time::Sleep;

    fn sleep_for(dur: core::time::Duration) -> Self::Sleep {
        tokio::time::sleep(dur)
    }
}

/// A [`BlockAllocator`] that suspends on Tokio's timer and stamps claims with
/// the system clock.
pub type TokioBlockAllocator<S, T = WallClock> = BlockAllocator<S, TokioSleep, T>;
