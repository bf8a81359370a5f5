//! Interval-keyed ordered map with overlap queries.
//!
//! A classic way to answer "does any stored range overlap this query"
//! in `O(log n)` is an intrusive balanced tree keyed by a comparator that
//! declares two overlapping intervals equal. Rust's standard ordered map
//! doesn't let key comparison depend on the query value that way (it would
//! violate `Ord`'s transitivity once more than one stored interval could
//! overlap the same query), so this module keeps a `BTreeMap` ordered by
//! each stored interval's `base` and performs the stabbing query as a small
//! bounded scan anchored at the query's `base`: the in-order predecessor
//! (which may start before the query but still reach into it) plus an
//! ascending range scan. For `MemTypeCache`, which maintains pairwise
//! non-overlap on every mutation, this always touches at most one
//! candidate, so the practical complexity matches the tree-comparator
//! approach.

use std::collections::BTreeMap;

/// Half-open byte range `[base, base + len)`. `len` is always `> 0` for a
/// constructed interval (see [`Interval::new`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub base: u64,
    pub len: u64,
}

impl Interval {
    /// Builds an interval, or returns `None` for a zero-length range.
    pub fn new(base: u64, len: u64) -> Option<Interval> {
        if len == 0 {
            None
        } else {
            Some(Interval { base, len })
        }
    }

    pub fn end(&self) -> u64 {
        // Callers construct intervals from address ranges that already fit
        // in the address space; overflow here would indicate a caller bug.
        self.base + self.len
    }

    /// True iff `self` and `other` overlap: neither is strictly left nor
    /// strictly right of the other (spec section 3).
    pub fn overlaps(&self, other: &Interval) -> bool {
        !(self.end() <= other.base || other.end() <= self.base)
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.base <= other.base && other.end() <= self.end()
    }
}

struct Region<T> {
    interval: Interval,
    value: T,
}

/// An interval-keyed map. See the module docs for the overlap-query
/// strategy.
///
/// `insert` does not itself prevent overlapping keys (spec section 4.1:
/// "overlap is the caller's responsibility to handle"); when two
/// overlapping intervals are both inserted, the most recent insert whose
/// `base` collides with an existing key simply replaces it at that `base`
/// slot, while an overlapping-but-distinct-`base` interval coexists. Only
/// [`crate::memtype::MemTypeCache`] is required to maintain pairwise
/// non-overlap, via its split-then-reinsert update algorithm.
#[derive(Default)]
pub struct IntervalMap<T> {
    by_base: BTreeMap<u64, Region<T>>,
}

impl<T> IntervalMap<T> {
    pub fn new() -> Self {
        IntervalMap {
            by_base: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    /// Inserts `interval -> value`. The only failure mode in the original
    /// is allocator exhaustion (spec section 4.1); Rust's global allocator
    /// aborts the process on allocation failure rather than returning an
    /// error, so this always succeeds. The `Result` return is kept for
    /// contract fidelity with callers that propagate it with `?`.
    pub fn insert(&mut self, interval: Interval, value: T) -> Result<(), crate::Error> {
        self.by_base.insert(interval.base, Region { interval, value });
        Ok(())
    }

    /// Returns some region overlapping `query`, if any exists. When
    /// multiple stored regions overlap `query`, the one with the smallest
    /// `base` is returned (a strict superset of the "some region" contract
    /// in spec section 4.1).
    pub fn find(&self, query: Interval) -> Option<(Interval, &T)> {
        self.candidates(query).next()
    }

    /// Returns the smallest-`base` region overlapping `query`.
    pub fn find_leftmost(&self, query: Interval) -> Option<(Interval, &T)> {
        self.candidates(query).next()
    }

    /// Removes and returns the stored region whose `base` exactly matches
    /// `interval.base`, if its extent exactly matches `interval`.
    pub fn remove_exact(&mut self, interval: Interval) -> Option<T> {
        match self.by_base.get(&interval.base) {
            Some(region) if region.interval == interval => {
                self.by_base.remove(&interval.base).map(|r| r.value)
            }
            _ => None,
        }
    }

    /// Removes and returns any one region overlapping `query`.
    pub fn remove_overlapping(&mut self, query: Interval) -> Option<(Interval, T)> {
        let base = self.candidates(query).next().map(|(iv, _)| iv.base)?;
        self.by_base.remove(&base).map(|r| (r.interval, r.value))
    }

    /// Removes and returns the first-by-`base` stored region, or `None` if
    /// empty. Used to drain the map without holding a live iterator across
    /// mutation (spec section 9, "Open question").
    pub fn pop_first(&mut self) -> Option<(Interval, T)> {
        let base = *self.by_base.keys().next()?;
        self.by_base.remove(&base).map(|r| (r.interval, r.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Interval, &T)> {
        self.by_base.values().map(|r| (r.interval, &r.value))
    }

    fn candidates(&self, query: Interval) -> impl Iterator<Item = (Interval, &T)> {
        // The in-order predecessor of `query.base` may start before the
        // query but still end inside (or past) it.
        let predecessor = self
            .by_base
            .range(..query.base)
            .next_back()
            .map(|(_, r)| (r.interval, &r.value))
            .filter(|(iv, _)| iv.overlaps(&query));

        let ascending = self
            .by_base
            .range(query.base..)
            .take_while(move |(base, _)| **base < query.end())
            .map(|(_, r)| (r.interval, &r.value))
            .filter(move |(iv, _)| iv.overlaps(&query));

        predecessor.into_iter().chain(ascending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_at_boundary() {
        let mut map: IntervalMap<&str> = IntervalMap::new();
        map.insert(Interval::new(0x1000, 0x1000).unwrap(), "a").unwrap();

        // exactly at the start of the region
        assert!(map.find(Interval::new(0x1000, 1).unwrap()).is_some());
        // exactly at the last byte
        assert!(map.find(Interval::new(0x1fff, 1).unwrap()).is_some());
        // one byte past the end
        assert!(map.find(Interval::new(0x2000, 1).unwrap()).is_none());
    }

    #[test]
    fn predecessor_overlap_is_found() {
        let mut map: IntervalMap<&str> = IntervalMap::new();
        map.insert(Interval::new(0, 100).unwrap(), "a").unwrap();
        // query base is greater than the stored region's base but still
        // falls inside it
        let got = map.find(Interval::new(50, 10).unwrap());
        assert_eq!(got.map(|(_, v)| *v), Some("a"));
    }

    #[test]
    fn pop_first_drains_in_base_order() {
        let mut map: IntervalMap<u32> = IntervalMap::new();
        map.insert(Interval::new(20, 5).unwrap(), 2).unwrap();
        map.insert(Interval::new(10, 5).unwrap(), 1).unwrap();
        map.insert(Interval::new(30, 5).unwrap(), 3).unwrap();

        let mut drained = vec![];
        while let Some((_, v)) = map.pop_first() {
            drained.push(v);
        }
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(map.is_empty());
    }
}
