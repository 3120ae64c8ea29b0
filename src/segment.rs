//! Interval algebra on half-open index ranges.
//!
//! A [`Segment`] denotes the half-open range `[start, start + len)` of
//! vector or matrix indices. Sequences of segments describe scattered
//! selections (free variables, active constraint rows) and support the
//! usual set operations. All operations are total: a zero-length segment
//! is the empty set and is absorbed everywhere.
//!
//! The canonical form of a segment list is sorted by `start`, pairwise
//! disjoint and maximal (no two adjacent segments could be merged).
//! [`sort`] followed by [`shrink`] establishes it; [`difference`]
//! preserves it.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A half-open index range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Segment {
    /// First index of the range.
    pub start: usize,
    /// Number of indices covered. Zero denotes the empty set.
    pub len: usize,
}

impl Segment {
    /// Create a segment from its first index and length.
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// One-past-the-last index of the range.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    /// Whether the segment covers no index.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `index` lies inside the range.
    #[must_use]
    pub const fn contains(&self, index: usize) -> bool {
        self.start <= index && index < self.end()
    }
}

/// Sort segments by `start` ascending, tie-break by `len` ascending.
pub fn sort(segments: &mut [Segment]) {
    segments.sort_by_key(|s| (s.start, s.len));
}

/// Merge overlapping or adjacent segments of a sorted list in place.
///
/// Presumes the input is sorted by `start`. Two consecutive segments are
/// merged whenever `e1.end() >= e2.start`; empty segments disappear. The
/// result is canonical.
pub fn shrink(segments: &mut Vec<Segment>) {
    segments.retain(|s| !s.is_empty());
    if segments.len() < 2 {
        return;
    }
    let mut merged = 0;
    for i in 1..segments.len() {
        let next = segments[i];
        let cur = &mut segments[merged];
        if cur.end() >= next.start {
            cur.len = cur.len.max(next.end() - cur.start);
        } else {
            merged += 1;
            segments[merged] = next;
        }
    }
    segments.truncate(merged + 1);
}

/// Whether two segments intersect. Empty segments never overlap.
#[must_use]
pub fn overlap(a: Segment, b: Segment) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.start < b.end() && b.start < a.end()
}

/// Total number of indices covered by a segment list.
#[must_use]
pub fn cardinal(segments: &[Segment]) -> usize {
    segments.iter().map(|s| s.len).sum()
}

/// Canonical union of two segments: one segment when they touch, two
/// (ordered) otherwise.
#[must_use]
pub fn sum(a: Segment, b: Segment) -> Vec<Segment> {
    if a.is_empty() {
        return if b.is_empty() { Vec::new() } else { vec![b] };
    }
    if b.is_empty() {
        return vec![a];
    }
    if a.start > b.start {
        return sum(b, a);
    }
    // a.start <= b.start
    if a.end() >= b.start {
        vec![Segment::new(a.start, a.len.max(b.end() - a.start))]
    } else {
        vec![a, b]
    }
}

/// Relative complement `a \ b` of two segments: zero, one or two segments.
#[must_use]
pub fn difference(a: Segment, b: Segment) -> Vec<Segment> {
    if a.is_empty() {
        return Vec::new();
    }
    if b.is_empty() {
        return vec![a];
    }
    let mut out = Vec::with_capacity(2);
    if a.start < b.start {
        let end = a.end().min(b.start);
        out.push(Segment::new(a.start, end - a.start));
    }
    if b.end() < a.end() {
        let start = a.start.max(b.end());
        out.push(Segment::new(start, a.end() - start));
    }
    out
}

/// Relative complement `a \ b` of a sorted segment list and one segment.
///
/// Binary search locates the affected span: the prefix whose segments end
/// at or before `b.start` and the suffix whose segments start after
/// `b.end()` pass through unchanged; segments in between are expanded by
/// the single-segment [`difference`]. Canonical input yields canonical
/// output.
#[must_use]
pub fn difference_set_segment(a: &[Segment], b: Segment) -> Vec<Segment> {
    if b.is_empty() {
        return a.to_vec();
    }
    let first = a.partition_point(|s| s.end() <= b.start);
    let last = a.partition_point(|s| s.start <= b.end());
    debug_assert!(first <= last);

    let mut out = Vec::with_capacity(a.len() + 2);
    out.extend_from_slice(&a[..first]);
    for &s in &a[first..last] {
        out.extend(difference(s, b));
    }
    out.extend_from_slice(&a[last..]);
    out
}

/// Relative complement of one segment and a segment list.
#[must_use]
pub fn difference_segment_set(a: Segment, b: &[Segment]) -> Vec<Segment> {
    let mut out = vec![a];
    for &s in b {
        out = out.iter().flat_map(|&x| difference(x, s)).collect();
    }
    out
}

/// Relative complement of two segment lists.
#[must_use]
pub fn difference_sets(a: &[Segment], b: &[Segment]) -> Vec<Segment> {
    let mut out = Vec::with_capacity(a.len());
    for &s in a {
        out.extend(difference_segment_set(s, b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: usize, len: usize) -> Segment {
        Segment::new(start, len)
    }

    fn canonical(mut v: Vec<Segment>) -> Vec<Segment> {
        sort(&mut v);
        shrink(&mut v);
        v
    }

    #[test]
    fn segment_basics() {
        let s = seg(2, 3);
        assert_eq!(s.end(), 5);
        assert!(s.contains(2));
        assert!(s.contains(4));
        assert!(!s.contains(5));
        assert!(seg(7, 0).is_empty());
    }

    #[test]
    fn sort_orders_by_start_then_len() {
        let mut v = vec![seg(4, 2), seg(0, 5), seg(4, 1)];
        sort(&mut v);
        assert_eq!(v, vec![seg(0, 5), seg(4, 1), seg(4, 2)]);
    }

    #[test]
    fn shrink_merges_overlapping_and_adjacent() {
        let mut v = vec![seg(0, 3), seg(2, 2), seg(4, 1), seg(7, 2)];
        shrink(&mut v);
        assert_eq!(v, vec![seg(0, 5), seg(7, 2)]);
    }

    #[test]
    fn sort_shrink_is_idempotent() {
        let scrambled = vec![seg(8, 3), seg(0, 2), seg(1, 4), seg(5, 0), seg(9, 1)];
        let once = canonical(scrambled);
        let twice = canonical(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once, vec![seg(0, 5), seg(8, 3)]);
    }

    #[test]
    fn overlap_is_strict_on_half_open_ranges() {
        assert!(overlap(seg(0, 5), seg(4, 2)));
        assert!(!overlap(seg(0, 5), seg(5, 2)));
        assert!(!overlap(seg(0, 0), seg(0, 5)));
        assert!(overlap(seg(3, 1), seg(0, 10)));
    }

    #[test]
    fn sum_merges_touching_segments() {
        assert_eq!(sum(seg(0, 5), seg(3, 4)), vec![seg(0, 7)]);
        assert_eq!(sum(seg(0, 2), seg(5, 3)), vec![seg(0, 2), seg(5, 3)]);
        // Adjacency merges.
        assert_eq!(sum(seg(0, 2), seg(2, 3)), vec![seg(0, 5)]);
        // Containment keeps the larger one.
        assert_eq!(sum(seg(0, 10), seg(3, 2)), vec![seg(0, 10)]);
        // Order-independent.
        assert_eq!(sum(seg(5, 3), seg(0, 2)), vec![seg(0, 2), seg(5, 3)]);
    }

    #[test]
    fn difference_splits_around_hole() {
        assert_eq!(difference(seg(0, 10), seg(3, 4)), vec![seg(0, 3), seg(7, 3)]);
        assert_eq!(difference(seg(0, 10), seg(0, 10)), Vec::<Segment>::new());
        assert_eq!(difference(seg(0, 10), seg(20, 5)), vec![seg(0, 10)]);
        assert_eq!(difference(seg(5, 5), seg(0, 7)), vec![seg(7, 3)]);
        assert_eq!(difference(seg(5, 5), seg(0, 0)), vec![seg(5, 5)]);
    }

    #[test]
    fn difference_set_segment_uses_untouched_prefix_and_suffix() {
        let a = vec![seg(0, 3), seg(7, 3)];
        assert_eq!(difference_set_segment(&a, seg(2, 6)), vec![seg(0, 2), seg(8, 2)]);

        let a = vec![seg(0, 2), seg(4, 2), seg(8, 2), seg(12, 2)];
        assert_eq!(
            difference_set_segment(&a, seg(5, 4)),
            vec![seg(0, 2), seg(4, 1), seg(12, 2)]
        );
    }

    #[test]
    fn difference_sets_matches_elementwise_expansion() {
        let a = vec![seg(0, 4), seg(6, 4)];
        let b = vec![seg(2, 2), seg(7, 1)];
        assert_eq!(
            difference_sets(&a, &b),
            vec![seg(0, 2), seg(6, 1), seg(8, 2)]
        );
    }

    #[test]
    fn cardinal_partitions_under_difference() {
        // cardinal(A) == cardinal(A - B) + cardinal(A ∩ B), with
        // A ∩ B computed as A - (A - B).
        let cases = [
            (vec![seg(0, 5), seg(8, 4)], vec![seg(3, 7)]),
            (vec![seg(0, 10)], vec![seg(0, 10)]),
            (vec![seg(0, 3)], vec![seg(5, 2)]),
            (vec![seg(1, 6), seg(9, 1)], vec![seg(0, 2), seg(4, 1), seg(9, 5)]),
        ];
        for (a, b) in cases {
            let a_minus_b = difference_sets(&a, &b);
            let a_inter_b = difference_sets(&a, &a_minus_b);
            assert_eq!(cardinal(&a), cardinal(&a_minus_b) + cardinal(&a_inter_b));

            // (A - B) ∪ (A ∩ B) == A as sets.
            let mut union = a_minus_b;
            union.extend(a_inter_b);
            assert_eq!(canonical(union), canonical(a));
        }
    }
}
