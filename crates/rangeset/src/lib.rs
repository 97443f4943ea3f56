//! # RangeSet
//!
//! An in-memory set of disjoint, half-open `[lo, hi)` intervals over `u64`,
//! the building block for a metaslab's unflushed change sets.
//!
//! Every metaslab carries two of these (`allocs` and `frees`) holding the
//! changes that have been logged but not yet applied to its own space map.
//! The sets are always disjoint from each other: applying a change of one
//! kind first cancels any overlap in the opposite set and only the remainder
//! lands in the target set (the [`remove_xor_add_segment`] primitive). An
//! allocation followed by a free of the same extent therefore composes to
//! the empty delta.
//!
//! ## Key properties
//! - **Disjoint segments**: overlapping inserts are a caller bug and are
//!   rejected in debug builds; adjacent segments coalesce.
//! - **Exact arithmetic**: overlap resolution never rounds.
//! - **Space tracking**: the total byte span is maintained incrementally for
//!   O(1) [`space`](RangeSet::space) queries.
//! - **Memory accounting**: [`memused`](RangeSet::memused) reports the
//!   approximate heap footprint used by the flush scheduler's memory
//!   heuristic.
//!
//! ## Example
//! ```rust
//! use rangeset::{remove_xor_add_segment, RangeSet};
//!
//! let mut allocs = RangeSet::new();
//! let mut frees = RangeSet::new();
//!
//! // Allocate [0, 8K), then free [4K, 8K): only [0, 4K) stays allocated.
//! remove_xor_add_segment(0, 8192, &mut frees, &mut allocs);
//! remove_xor_add_segment(4096, 8192, &mut allocs, &mut frees);
//! assert_eq!(allocs.space(), 4096);
//! assert!(frees.is_empty());
//! ```

use std::collections::BTreeMap;

/// Approximate heap bytes retained per segment (map node plus bookkeeping).
/// Used to account unflushed-change memory against the pool's budget.
pub const SEGMENT_FOOTPRINT: u64 = 64;

/// A set of disjoint half-open intervals, sorted by start offset.
///
/// Backed by a `BTreeMap<u64, u64>` mapping each segment's start to its
/// (exclusive) end, which gives logarithmic insert/remove and ordered
/// iteration for draining into a space map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    map: BTreeMap<u64, u64>,
    space: u64,
}

impl RangeSet {
    /// Creates a new, empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[lo, hi)` into the set.
    ///
    /// The span must not overlap any existing segment; adjacent segments are
    /// merged. Overlap indicates double-accounting in the caller and trips a
    /// debug assertion.
    pub fn add(&mut self, lo: u64, hi: u64) {
        assert!(lo < hi, "empty or inverted segment [{lo}, {hi})");

        let mut start = lo;
        let mut end = hi;

        // Merge with a predecessor that ends exactly at `lo`.
        if let Some((&s, &e)) = self.map.range(..=lo).next_back() {
            debug_assert!(e <= lo, "segment [{lo}, {hi}) overlaps [{s}, {e})");
            if e == lo {
                self.map.remove(&s);
                self.space -= e - s;
                start = s;
            }
        }

        // Merge with a successor that starts exactly at `hi`.
        if let Some((&s, &e)) = self.map.range(lo..).next() {
            debug_assert!(s >= hi, "segment [{lo}, {hi}) overlaps [{s}, {e})");
            if s == hi {
                self.map.remove(&s);
                self.space -= e - s;
                end = e;
            }
        }

        self.map.insert(start, end);
        self.space += end - start;
    }

    /// Removes `[lo, hi)` from the set, splitting the containing segment if
    /// needed.
    ///
    /// # Panics
    ///
    /// The span must be fully contained in a single existing segment;
    /// removing unset space is a caller bug.
    pub fn remove(&mut self, lo: u64, hi: u64) {
        assert!(lo < hi, "empty or inverted segment [{lo}, {hi})");

        let (&s, &e) = self
            .map
            .range(..=lo)
            .next_back()
            .unwrap_or_else(|| panic!("removing unset span [{lo}, {hi})"));
        assert!(
            s <= lo && hi <= e,
            "span [{lo}, {hi}) not contained in segment [{s}, {e})"
        );

        self.map.remove(&s);
        self.space -= e - s;
        if s < lo {
            self.map.insert(s, lo);
            self.space += lo - s;
        }
        if hi < e {
            self.map.insert(hi, e);
            self.space += e - hi;
        }
    }

    /// Returns `true` if `[lo, hi)` is fully contained in one segment.
    #[must_use]
    pub fn contains(&self, lo: u64, hi: u64) -> bool {
        match self.map.range(..=lo).next_back() {
            Some((&s, &e)) => s <= lo && hi <= e,
            None => false,
        }
    }

    /// Returns the portions of `[lo, hi)` covered by this set, clamped to
    /// the query span, in ascending order.
    #[must_use]
    pub fn overlaps(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        if lo >= hi {
            return out;
        }

        // A segment starting before `lo` may still reach into the span.
        let scan_from = match self.map.range(..=lo).next_back() {
            Some((&s, &e)) if e > lo => s,
            _ => lo,
        };
        for (&s, &e) in self.map.range(scan_from..hi) {
            if e > lo {
                out.push((s.max(lo), e.min(hi)));
            }
        }
        out
    }

    /// Total byte span covered by the set.
    #[must_use]
    pub fn space(&self) -> u64 {
        self.space
    }

    /// Number of disjoint segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.map.len()
    }

    /// Approximate heap footprint of the set in bytes.
    #[must_use]
    pub fn memused(&self) -> u64 {
        self.map.len() as u64 * SEGMENT_FOOTPRINT
    }

    /// Returns `true` if the set covers no space.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates segments as `(lo, hi)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&lo, &hi)| (lo, hi))
    }

    /// Removes all segments, keeping the allocation.
    pub fn clear(&mut self) {
        self.map.clear();
        self.space = 0;
    }
}

/// Applies `[lo, hi)` with XOR semantics across a pair of opposite sets.
///
/// Every sub-span already present in `remove_from` is deleted from it; the
/// remaining sub-spans are inserted into `add_to`. Calling this twice with
/// the sets swapped (an alloc then a free of the same extent) leaves both
/// sets as they started.
pub fn remove_xor_add_segment(lo: u64, hi: u64, remove_from: &mut RangeSet, add_to: &mut RangeSet) {
    let mut cursor = lo;
    for (s, e) in remove_from.overlaps(lo, hi) {
        if cursor < s {
            add_to.add(cursor, s);
        }
        remove_from.remove(s, e);
        cursor = e;
    }
    if cursor < hi {
        add_to.add(cursor, hi);
    }
}
