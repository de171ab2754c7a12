//! Byte layout of partition keys and block claims.
//!
//! A claim column is `-block_start` (8 bytes, big-endian two's complement)
//! followed by the claim timestamp in milliseconds (8 bytes, big-endian) and
//! the raw requester id. The store iterates columns in ascending unsigned
//! byte order, so storing the negated start makes the *largest* positive
//! block start the *smallest* column. A forward scan with a small limit
//! therefore surfaces the most recent claims first.
//!
//! Within one block start, columns order by timestamp and then by requester
//! id, which is exactly the priority used to settle contention.
//!
//! Negation uses [`i64::wrapping_neg`] on both sides, so every `i64` round
//! trips (including `i64::MIN`, which maps to itself). The descending order
//! only holds for positive block starts, which is the only range the
//! allocator ever writes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Size of the encoded block start.
pub const BLOCK_START_LEN: usize = 8;

/// Size of the encoded block start plus timestamp.
pub const CLAIM_PREFIX_LEN: usize = BLOCK_START_LEN + 8;

/// Encodes a partition id as the 4-byte big-endian row key.
pub fn partition_key(partition: i32) -> Bytes {
    Bytes::copy_from_slice(&partition.to_be_bytes())
}

/// Encodes a claim on `block_start` made at `timestamp_millis` by
/// `requester`.
///
/// The requester id carries no length prefix. All cooperating processes must
/// use ids of the same length or claims stop comparing correctly.
pub fn encode_claim(block_start: i64, timestamp_millis: i64, requester: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CLAIM_PREFIX_LEN + requester.len());
    buf.put_i64(block_start.wrapping_neg());
    buf.put_i64(timestamp_millis);
    buf.put_slice(requester);
    buf.freeze()
}

/// Reads the block start back out of a claim column.
///
/// # Errors
///
/// Returns [`Error::MalformedClaim`] if the column is shorter than 8 bytes.
pub fn decode_block_start(column: &[u8]) -> Result<i64> {
    if column.len() < BLOCK_START_LEN {
        return Err(Error::MalformedClaim { len: column.len() });
    }
    let mut buf = column;
    Ok(buf.get_i64().wrapping_neg())
}

/// Column range `[lower, upper)` covering every claim on `block_start`,
/// whatever its timestamp or requester.
pub fn claim_range_for(block_start: i64) -> (Bytes, Bytes) {
    (
        encode_claim(block_start, 0, &[]),
        // -1 is all ones: the largest timestamp under unsigned byte order.
        encode_claim(block_start, -1, &[]),
    )
}

/// A fully decoded claim column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    pub block_start: i64,
    pub timestamp_millis: i64,
    pub requester: Bytes,
}

impl Claim {
    /// Decodes all three components of a claim column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedClaim`] if the column is shorter than the
    /// fixed 16-byte prefix.
    pub fn decode(column: &Bytes) -> Result<Self> {
        if column.len() < CLAIM_PREFIX_LEN {
            return Err(Error::MalformedClaim { len: column.len() });
        }
        let mut prefix = &column[..CLAIM_PREFIX_LEN];
        let block_start = prefix.get_i64().wrapping_neg();
        let timestamp_millis = prefix.get_i64();
        Ok(Self {
            block_start,
            timestamp_millis,
            requester: column.slice(CLAIM_PREFIX_LEN..),
        })
    }

    /// Re-encodes this claim as a column.
    pub fn encode(&self) -> Bytes {
        encode_claim(self.block_start, self.timestamp_millis, &self.requester)
    }
}
