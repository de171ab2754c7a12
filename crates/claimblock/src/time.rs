use std::time::{SystemTime, UNIX_EPOCH};

/// A trait for time sources that return a wall-clock timestamp.
///
/// Claims are stamped with this clock and the safety window is measured
/// against it, so every cooperating process must run a reasonably
/// synchronized clock. Tests plug in a controlled source instead.
///
/// # Example
///
/// ```
/// use claimblock::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource<i64> for FixedTime {
///     fn current_millis(&self) -> i64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource<T> {
    /// Returns the current time in milliseconds.
    fn current_millis(&self) -> T;
}

/// Milliseconds since the Unix epoch, read from [`SystemTime`].
///
/// Unlike a monotonic clock this follows wall-clock adjustments. That is what
/// claim timestamps need: they are compared across machines.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl TimeSource<i64> for WallClock {
    fn current_millis(&self) -> i64 {
        // A clock set before 1970 reads as negative rather than failing.
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        }
    }
}
