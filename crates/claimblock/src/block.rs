use core::{fmt, ops::Range};

/// The first identifier any partition can hand out.
///
/// Existing claims are interpreted relative to this value. Changing it on a
/// populated store corrupts the allocation history.
pub const BASE_ID: i64 = 1;

/// A half-open range `[start, end)` of identifiers won by one claim.
///
/// Blocks returned for the same partition never overlap, barring crashed
/// claimants (which only ever leave gaps).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdBlock {
    start: i64,
    end: i64,
}

impl IdBlock {
    /// Creates the block `[start, end)`.
    ///
    /// `start` must be strictly less than `end`.
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "empty id block [{start}, {end})");
        Self { start, end }
    }

    /// First identifier in the block.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// One past the last identifier in the block.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of identifiers in the block.
    pub fn len(&self) -> u64 {
        self.end.abs_diff(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id < self.end
    }

    /// Whether the two blocks share at least one identifier.
    pub fn overlaps(&self, other: &IdBlock) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn range(&self) -> Range<i64> {
        self.start..self.end
    }
}

impl IntoIterator for IdBlock {
    type Item = i64;
    type IntoIter = Range<i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.range()
    }
}

impl fmt::Display for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
