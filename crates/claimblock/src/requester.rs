use core::fmt;

use bytes::Bytes;
use rand::Rng;

/// Length of ids produced by [`RequesterId::random`].
pub const RANDOM_REQUESTER_LEN: usize = 16;

/// Bytes that uniquely identify one allocating process.
///
/// Claims carry this id without a length prefix, so every process sharing a
/// store must use ids of the same length. Two processes with the same id
/// cannot tell their claims apart.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequesterId(Bytes);

impl RequesterId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// A fresh id of [`RANDOM_REQUESTER_LEN`] random bytes.
    pub fn random() -> Self {
        let mut buf = [0u8; RANDOM_REQUESTER_LEN];
        rand::rng().fill(&mut buf);
        Self(Bytes::copy_from_slice(&buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for RequesterId {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// Lower-case hex, as shown in logs.
impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequesterId({self})")
    }
}
