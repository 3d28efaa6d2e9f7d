use crate::remote_ptr::{RemotePtr, Void};
use std::{
    cmp::{max, min, Ordering},
    fmt::{self, Display, Formatter},
    ops::{Deref, DerefMut},
};

/// A half-open range [start, end) of tracee addresses.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MemRange {
    start_: RemotePtr<Void>,
    end_: RemotePtr<Void>,
}

impl Default for MemRange {
    fn default() -> Self {
        MemRange {
            start_: RemotePtr::null(),
            end_: RemotePtr::null(),
        }
    }
}

impl MemRange {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize) -> MemRange {
        MemRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(start: RemotePtr<Void>, end: RemotePtr<Void>) -> MemRange {
        let result = MemRange {
            start_: start,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// True iff `other` is fully contained by self.
    pub fn contains(&self, other: &MemRange) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: MemRange) -> MemRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start_
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.end_
    }

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }

    pub fn is_empty(&self) -> bool {
        self.start_ == self.end_
    }

    pub(in crate::session::address_space) fn set_start(&mut self, start: RemotePtr<Void>) {
        self.start_ = start;
    }
}

impl Display for MemRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

/// The ordering wrapper for the memory map: two keys compare equal iff
/// their ranges intersect, which makes "the mapping containing address A" a
/// single point lookup with a one-byte query range. This violates strict
/// weak ordering for overlapping inserts, so insertions must go through
/// unmap-the-range first; the map itself never stores overlapping keys.
#[derive(Copy, Clone, Debug)]
pub struct RangeKey(pub MemRange);

impl PartialOrd for RangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if !self.0.intersects(&other.0) {
            // The Equal arm here also serves point queries built as
            // zero-length ranges at a stored range's start.
            self.0.start().cmp(&other.0.start())
        } else {
            Ordering::Equal
        }
    }
}

impl PartialEq for RangeKey {
    fn eq(&self, other: &Self) -> bool {
        if !self.0.intersects(&other.0) {
            self.0.start() == other.0.start()
        } else {
            true
        }
    }
}

impl Eq for RangeKey {}

impl Deref for RangeKey {
    type Target = MemRange;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RangeKey {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<MemRange> for RangeKey {
    fn from(r: MemRange) -> Self {
        RangeKey(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::{BTreeMap, BTreeSet},
        ops::Bound::{Included, Unbounded},
    };

    fn range(start: usize, end: usize) -> RangeKey {
        RangeKey(MemRange::from_range(start.into(), end.into()))
    }

    #[test]
    fn range_relations() {
        let a = MemRange::new(0x1000.into(), 0x1000);
        let b = MemRange::from_range(0x1800.into(), 0x2800.into());
        assert!(a.intersects(&b));
        assert_eq!(a.intersect(b), MemRange::from_range(0x1800.into(), 0x2000.into()));
        assert!(a.contains_ptr(0x1fff.into()));
        assert!(!a.contains_ptr(0x2000.into()));
        assert!(!a.contains(&b));
        assert_eq!(a.size(), 0x1000);
    }

    #[test]
    fn lookup_by_intersection() {
        let mut m: BTreeMap<RangeKey, u32> = BTreeMap::new();
        m.insert(range(0, 10), 1);
        m.insert(range(10, 15), 2);
        m.insert(range(15, 20), 3);
        assert_eq!(m.len(), 3);

        // Inserting an overlapping key replaces the stored value without
        // adding a key.
        let prev = m.insert(range(1, 10), 4);
        assert!(prev.is_some());
        assert_eq!(m.len(), 3);
        assert_eq!(m.get(&range(1, 10)), Some(&4));

        // A point query built as a one-byte range finds the containing
        // stored range.
        assert_eq!(m.get(&range(12, 13)), Some(&2));
        assert_eq!(m.get(&range(20, 21)), None);
    }

    #[test]
    fn range_scan_bounds() {
        let mut m: BTreeMap<RangeKey, u32> = BTreeMap::new();
        m.insert(range(0, 10), 1);
        m.insert(range(10, 15), 2);
        m.insert(range(15, 20), 3);

        // Keys >= a query intersecting [9, 11): the scan starts at the
        // first intersecting stored range.
        let q = range(9, 11);
        let mut it = m.range((Included(q), Unbounded));
        assert_eq!(it.next().map(|(k, _)| k.start().as_usize()), Some(0));
        assert_eq!(it.next().map(|(k, _)| k.start().as_usize()), Some(10));
        assert_eq!(it.next().map(|(k, _)| k.start().as_usize()), Some(15));
        assert!(it.next().is_none());
    }

    #[test]
    fn removal_by_overlap() {
        let mut s: BTreeSet<RangeKey> = BTreeSet::new();
        s.insert(range(0, 10));
        s.insert(range(10, 15));

        // [3, 11) overlaps both stored ranges; each remove erases one.
        let q = range(3, 11);
        let first = *s.get(&q).unwrap();
        assert_eq!(first.start().as_usize(), 0);
        assert!(s.remove(&q));
        let second = *s.get(&q).unwrap();
        assert_eq!(second.start().as_usize(), 10);
        assert!(s.remove(&q));
        assert!(s.get(&q).is_none());
    }
}
