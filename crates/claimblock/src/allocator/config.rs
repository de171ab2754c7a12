use core::time::Duration;

use crate::{Error, Result};

/// Default safety window between writing a claim and verifying it.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(300);

/// Default number of attempts before an allocation gives up.
pub const DEFAULT_RETRY_COUNT: u32 = 20;

/// Tunables of a [`BlockAllocator`].
///
/// `lock_wait` is both the slow-write threshold and the safety window: a
/// claim write slower than this is abandoned, and a written claim is only
/// verified once this much time has passed. It must comfortably exceed the
/// store's write latency plus the clock skew between processes.
///
/// [`BlockAllocator`]: crate::BlockAllocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "wire::Config", into = "wire::Config"))]
pub struct AllocatorConfig {
    pub lock_wait: Duration,
    pub retry_count: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            lock_wait: DEFAULT_LOCK_WAIT,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

impl AllocatorConfig {
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Safety window in whole milliseconds, the granularity claims are
    /// stamped with.
    pub(crate) fn lock_wait_millis(&self) -> i64 {
        i64::try_from(self.lock_wait.as_millis()).unwrap_or(i64::MAX)
    }

    /// Checks that the settings describe a usable allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the wait is shorter than one
    /// millisecond or no attempts are allowed.
    pub fn validate(&self) -> Result<()> {
        if self.lock_wait < Duration::from_millis(1) {
            return Err(Error::InvalidConfig {
                reason: "lock wait must be at least 1 ms",
            });
        }
        if self.retry_count == 0 {
            return Err(Error::InvalidConfig {
                reason: "retry count must be greater than 0",
            });
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod wire {
    use core::time::Duration;

    use super::{AllocatorConfig, DEFAULT_LOCK_WAIT, DEFAULT_RETRY_COUNT};

    #[derive(serde::Serialize, serde::Deserialize)]
    #[serde(default)]
    pub(super) struct Config {
        lock_wait_ms: u64,
        retry_count: u32,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                lock_wait_ms: DEFAULT_LOCK_WAIT.as_millis() as u64,
                retry_count: DEFAULT_RETRY_COUNT,
            }
        }
    }

    impl From<Config> for AllocatorConfig {
        fn from(config: Config) -> Self {
            Self {
                lock_wait: Duration::from_millis(config.lock_wait_ms),
                retry_count: config.retry_count,
            }
        }
    }

    impl From<AllocatorConfig> for Config {
        fn from(config: AllocatorConfig) -> Self {
            Self {
                lock_wait_ms: u64::try_from(config.lock_wait.as_millis()).unwrap_or(u64::MAX),
                retry_count: config.retry_count,
            }
        }
    }
}
