//! Block availability bitfields.
//!
//! Cores are mostly written and downloaded in contiguous runs, so a
//! bitfield is a set of half-open ranges of set bits. Counting and
//! combining bitfields is linear in the number of runs, not in the number
//! of blocks.

use std::{fmt, ops::Range};

use range_collections::RangeSet2;

pub mod rle;

/// A bounded set of block indices.
#[derive(Clone)]
pub struct Bitfield {
    ranges: RangeSet2<u64>,
}

impl Bitfield {
    pub fn new() -> Self {
        Self {
            ranges: RangeSet2::empty(),
        }
    }

    /// A bitfield with every bit in `range` set.
    pub fn from_range(range: Range<u64>) -> Self {
        let mut bits = Self::new();
        bits.set_range(range, true);
        bits
    }

    pub fn get(&self, index: u64) -> bool {
        self.ranges.contains(&index)
    }

    pub fn set(&mut self, index: u64, value: bool) {
        self.set_range(index..index.saturating_add(1), value);
    }

    pub fn set_range(&mut self, range: Range<u64>, value: bool) {
        if range.is_empty() {
            return;
        }
        if value {
            self.ranges |= RangeSet2::from(range);
        } else {
            self.ranges = self.ranges.difference(&RangeSet2::from(range));
        }
    }

    /// Bits set in both.
    pub fn intersection(&self, other: &Bitfield) -> Bitfield {
        Self {
            ranges: self.ranges.intersection(&other.ranges),
        }
    }

    /// Bits set here but not in `other`.
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        Self {
            ranges: self.ranges.difference(&other.ranges),
        }
    }

    pub fn union_with(&mut self, other: &Bitfield) {
        self.ranges |= other.ranges.clone();
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.ranges().map(|r| r.end - r.start).sum()
    }

    /// Number of set bits within `range`.
    pub fn count_range(&self, range: Range<u64>) -> u64 {
        self.intersection(&Bitfield::from_range(range)).count()
    }

    /// One past the highest set bit, or 0 if no bit is set.
    pub fn len(&self) -> u64 {
        self.ranges.boundaries().last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Index of the first unset bit at or after `from`.
    pub fn first_unset(&self, from: u64) -> u64 {
        self.ranges()
            .find(|r| r.contains(&from))
            .map_or(from, |r| r.end)
    }

    /// The runs of set bits, in order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        // bits are only ever set in bounded ranges, so boundaries pair up
        self.ranges
            .boundaries()
            .chunks_exact(2)
            .map(|pair| pair[0]..pair[1])
    }

    /// Copies the window `[start, start + len)` into a new bitfield whose
    /// bit 0 corresponds to `start`.
    pub fn slice(&self, start: u64, len: u64) -> Bitfield {
        let window = self.window(start, len);
        let mut out = Bitfield::new();
        for r in window.ranges() {
            out.set_range(r.start - start..r.end - start, true);
        }
        out
    }

    /// Replaces the window `[start, start + len)` with the first `len` bits
    /// of `bits`.
    pub fn overwrite(&mut self, start: u64, len: u64, bits: &Bitfield) {
        let end = start.saturating_add(len);
        self.set_range(start..end, false);
        let mut shifted = Bitfield::new();
        for r in bits.slice(0, len).ranges() {
            shifted.set_range(start.saturating_add(r.start)..start.saturating_add(r.end), true);
        }
        self.union_with(&shifted);
    }

    fn window(&self, start: u64, len: u64) -> Bitfield {
        self.intersection(&Bitfield::from_range(start..start.saturating_add(len)))
    }
}

impl Default for Bitfield {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Bitfield {
    fn eq(&self, other: &Self) -> bool {
        self.ranges.boundaries() == other.ranges.boundaries()
    }
}

impl Eq for Bitfield {}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges()).finish()
    }
}

impl FromIterator<u64> for Bitfield {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut bits = Bitfield::new();
        for index in iter {
            bits.set(index, true);
        }
        bits
    }
}
