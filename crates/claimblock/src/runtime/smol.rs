use core::{future::Future, pin::Pin};

use smol::Timer;

use crate::{BlockAllocator, SleepProvider, WallClock};

/// An implementation of [`SleepProvider`] using Smol's timer.
///
/// This is the default provider for use in async applications built on Smol.
pub struct SmolSleep;
impl SleepProvider for SmolSleep {
    /// `Timer` resolves to an `Instant`, so it is mapped to `()` behind a box.
    type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn sleep_for(dur: core::time::Duration) -> Self::Sleep {
        Box::pin(async move {
            Timer::after(dur).await;
        })
    }
}

/// A [`BlockAllocator`] that suspends on Smol's timer and stamps claims with
/// the system clock.
pub type SmolBlockAllocator<S, T = WallClock> = BlockAllocator<S, SmolSleep, T>;
