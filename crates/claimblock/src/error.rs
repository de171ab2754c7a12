use crate::store::StoreError;

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors that block allocation can surface.
///
/// Only [`Error::TransientStorage`] is recovered internally (by backing off
/// and retrying the attempt). Every other variant reaches the caller
/// unmodified.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A read or write against the store failed in a way expected to
    /// self-resolve.
    #[error("transient storage failure: {0}")]
    TransientStorage(#[source] StoreError),

    /// The store is in a state the protocol cannot recover from, e.g. a claim
    /// that was just written is already gone.
    #[error("permanent storage failure: {reason}")]
    PermanentStorage { reason: String },

    /// No attempt won a block within the retry budget.
    #[error("exceeded retry budget of {attempts} attempts while allocating an id block")]
    LockingTimeout { attempts: u32 },

    /// A timed suspension was cancelled from outside.
    #[error("interrupted while waiting for {context}")]
    LockingInterrupted { context: &'static str },

    /// The operation is not allowed in the allocator's current state.
    #[error("illegal state: {reason}")]
    IllegalState { reason: &'static str },

    /// The block-size policy produced a non-positive size.
    #[error("block size {size} for partition {partition} must be positive")]
    InvalidBlockSize { partition: i32, size: i64 },

    /// The next block would not fit below `i64::MAX`.
    #[error("id space exhausted for partition {partition}")]
    IdSpaceExhausted { partition: i32 },

    /// A column in the partition's key space is too short to hold a claim.
    #[error("malformed claim column of {len} bytes")]
    MalformedClaim { len: usize },

    /// Allocator settings are out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: &'static str },
}

impl Error {
    /// Returns `true` for errors that a caller may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage(_) | Self::LockingTimeout { .. })
    }
}
