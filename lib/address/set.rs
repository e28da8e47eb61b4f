//! A set of addresses kept as a sorted vector of disjoint ranges.

use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressRange};

/// A set of addresses.
///
/// The set is canonical at all times: ranges are sorted ascending, pairwise
/// disjoint, and never adjacent (adjacent ranges are merged on insert).
/// Membership and range probes are binary searches over the vector.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddressSet {
    ranges: Vec<AddressRange>,
}

impl AddressSet {
    pub fn new() -> AddressSet {
        AddressSet { ranges: Vec::new() }
    }

    pub fn from_range(range: AddressRange) -> AddressSet {
        AddressSet {
            ranges: vec![range],
        }
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn num_address_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn num_addresses(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |sum, r| sum.saturating_add(r.num_addresses()))
    }

    pub fn min_address(&self) -> Option<Address> {
        self.ranges.first().map(|r| r.start())
    }

    pub fn max_address(&self) -> Option<Address> {
        self.ranges.last().map(|r| r.end())
    }

    pub fn first_range(&self) -> Option<AddressRange> {
        self.ranges.first().copied()
    }

    pub fn last_range(&self) -> Option<AddressRange> {
        self.ranges.last().copied()
    }

    fn search(&self, addr: Address) -> Result<usize, usize> {
        self.ranges.binary_search_by(|r| r.start().cmp(&addr))
    }

    /// The range containing `addr`, if the set covers it.
    pub fn range_containing(&self, addr: Address) -> Option<AddressRange> {
        match self.search(addr) {
            Ok(i) => Some(self.ranges[i]),
            Err(0) => None,
            Err(i) => {
                let range = self.ranges[i - 1];
                if range.contains(addr) {
                    Some(range)
                } else {
                    None
                }
            }
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.range_containing(addr).is_some()
    }

    /// True if every address in `[start, end]` is in the set. Because the
    /// set is canonical this holds exactly when one stored range covers the
    /// whole probe range.
    pub fn contains_range(&self, start: Address, end: Address) -> bool {
        self.range_containing(start)
            .map_or(false, |r| r.contains(end))
    }

    pub fn contains_set(&self, other: &AddressSet) -> bool {
        other
            .ranges
            .iter()
            .all(|r| self.contains_range(r.start(), r.end()))
    }

    /// True if a range overlapping or adjoining `[start, end]` (same space)
    /// is already stored.
    fn mergeable(range: &AddressRange, start: Address, end: Address) -> bool {
        range.space() == start.space()
            && range.start().offset() <= end.offset().saturating_add(1)
            && start.offset() <= range.end().offset().saturating_add(1)
    }

    pub fn add(&mut self, range: AddressRange) {
        self.add_range(range.start(), range.end());
    }

    /// Add `[start, end]` to the set, merging with any overlapping or
    /// adjacent stored ranges.
    pub fn add_range(&mut self, start: Address, end: Address) {
        debug_assert_eq!(start.space(), end.space());
        debug_assert!(start <= end);
        let mut start = start;
        let mut end = end;
        let mut first = match self.search(start) {
            Ok(i) => i,
            Err(i) => i,
        };
        if first > 0 && Self::mergeable(&self.ranges[first - 1], start, end) {
            first -= 1;
        }
        let mut last = first;
        while last < self.ranges.len() && Self::mergeable(&self.ranges[last], start, end) {
            start = start.min(self.ranges[last].start());
            end = end.max(self.ranges[last].end());
            last += 1;
        }
        self.ranges
            .splice(first..last, std::iter::once(AddressRange::new(start, end)));
    }

    pub fn add_set(&mut self, other: &AddressSet) {
        for range in &other.ranges {
            self.add(*range);
        }
    }

    /// Remove `[start, end]` from the set, trimming or splitting any
    /// overlapping stored ranges.
    pub fn delete_range(&mut self, start: Address, end: Address) {
        debug_assert_eq!(start.space(), end.space());
        debug_assert!(start <= end);
        let mut first = match self.search(start) {
            Ok(i) => i,
            Err(i) => i,
        };
        if first > 0
            && self.ranges[first - 1].space() == start.space()
            && self.ranges[first - 1].end() >= start
        {
            first -= 1;
        }
        let mut replacement = Vec::new();
        let mut last = first;
        while last < self.ranges.len() {
            let range = self.ranges[last];
            if range.space() != start.space() || range.start() > end {
                break;
            }
            if range.start() < start {
                // start() < start implies a previous offset exists
                replacement.push(AddressRange::new(range.start(), start.previous().unwrap()));
            }
            if range.end() > end {
                replacement.push(AddressRange::new(end.next().unwrap(), range.end()));
            }
            last += 1;
        }
        self.ranges.splice(first..last, replacement);
    }

    /// True if any address of `[start, end]` is in the set.
    pub fn intersects_range(&self, start: Address, end: Address) -> bool {
        debug_assert_eq!(start.space(), end.space());
        let i = match self.search(start) {
            Ok(_) => return true,
            Err(i) => i,
        };
        if i > 0 && self.ranges[i - 1].space() == start.space() && self.ranges[i - 1].end() >= start
        {
            return true;
        }
        i < self.ranges.len() && self.ranges[i].start() <= end
    }

    pub fn intersects(&self, other: &AddressSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            if a.space() == b.space() && a.start() <= b.end() && b.start() <= a.end() {
                return true;
            }
            if a.end() <= b.end() {
                i += 1;
            }
            if b.end() <= a.end() {
                j += 1;
            }
        }
        false
    }

    pub fn intersect(&self, other: &AddressSet) -> AddressSet {
        let mut out = AddressSet::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            if a.space() == b.space() {
                let start = a.start().max(b.start());
                let end = a.end().min(b.end());
                if start <= end {
                    out.ranges.push(AddressRange::new(start, end));
                }
            }
            if a.end() <= b.end() {
                i += 1;
            }
            if b.end() <= a.end() {
                j += 1;
            }
        }
        out
    }

    pub fn intersect_range(&self, start: Address, end: Address) -> AddressSet {
        self.intersect(&AddressSet::from_range(AddressRange::new(start, end)))
    }

    pub fn union(&self, other: &AddressSet) -> AddressSet {
        let mut out = self.clone();
        out.add_set(other);
        out
    }

    pub fn subtract(&self, other: &AddressSet) -> AddressSet {
        let mut out = self.clone();
        for range in &other.ranges {
            out.delete_range(range.start(), range.end());
        }
        out
    }

    pub fn xor(&self, other: &AddressSet) -> AddressSet {
        self.union(other).subtract(&self.intersect(other))
    }

    /// True if both sets cover exactly the same addresses.
    pub fn has_same_addresses(&self, other: &AddressSet) -> bool {
        self == other
    }

    /// Iterate the addresses of the set starting at `start`, going forward
    /// or backward. `start` itself need not be a member; iteration begins
    /// at the nearest member in the chosen direction.
    pub fn addresses(&self, start: Address, forward: bool) -> AddressIter {
        if forward {
            AddressIter::new_forward(self, start)
        } else {
            AddressIter::new_backward(self, start)
        }
    }
}

/// An iterator over the addresses of an [`AddressSet`], seeded at an
/// arbitrary address. Holds a snapshot of the set's ranges.
#[derive(Clone, Debug)]
pub struct AddressIter {
    ranges: Vec<AddressRange>,
    index: usize,
    current: Option<Address>,
    forward: bool,
}

impl AddressIter {
    fn new_forward(set: &AddressSet, start: Address) -> AddressIter {
        let index = match set.search(start) {
            Ok(i) => i,
            Err(i) => {
                if i > 0 && set.ranges[i - 1].contains(start) {
                    i - 1
                } else {
                    i
                }
            }
        };
        let current = set.ranges.get(index).map(|r| {
            if r.contains(start) {
                start
            } else {
                r.start()
            }
        });
        AddressIter {
            ranges: set.ranges.clone(),
            index,
            current,
            forward: true,
        }
    }

    fn new_backward(set: &AddressSet, start: Address) -> AddressIter {
        let index = match set.search(start) {
            Ok(i) => i,
            Err(0) => {
                return AddressIter {
                    ranges: Vec::new(),
                    index: 0,
                    current: None,
                    forward: false,
                }
            }
            Err(i) => i - 1,
        };
        let range = set.ranges[index];
        let current = if range.contains(start) {
            start
        } else {
            range.end()
        };
        AddressIter {
            ranges: set.ranges.clone(),
            index,
            current: Some(current),
            forward: false,
        }
    }
}

impl Iterator for AddressIter {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        let addr = self.current?;
        let range = self.ranges[self.index];
        self.current = if self.forward {
            if addr < range.end() {
                addr.next()
            } else {
                self.index += 1;
                self.ranges.get(self.index).map(|r| r.start())
            }
        } else if addr > range.start() {
            addr.previous()
        } else if self.index == 0 {
            None
        } else {
            self.index -= 1;
            Some(self.ranges[self.index].end())
        };
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::AddressSet;
    use crate::address::{Address, AddressRange, SpaceId};

    fn addr(offset: u64) -> Address {
        Address::new(SpaceId::new(0), offset)
    }

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(addr(start), addr(end))
    }

    #[test]
    fn add_merges_overlapping_and_adjacent() {
        let mut set = AddressSet::new();
        set.add_range(addr(0x10), addr(0x1f));
        set.add_range(addr(0x30), addr(0x3f));
        assert_eq!(set.num_address_ranges(), 2);

        // adjacent below the second range
        set.add_range(addr(0x20), addr(0x2f));
        assert_eq!(set.ranges(), &[range(0x10, 0x3f)]);

        // fully contained
        set.add_range(addr(0x18), addr(0x1a));
        assert_eq!(set.ranges(), &[range(0x10, 0x3f)]);

        // spanning everything
        set.add_range(addr(0x0), addr(0x100));
        assert_eq!(set.ranges(), &[range(0x0, 0x100)]);
    }

    #[test]
    fn delete_trims_and_splits() {
        let mut set = AddressSet::new();
        set.add_range(addr(0x10), addr(0x3f));
        set.delete_range(addr(0x20), addr(0x2f));
        assert_eq!(set.ranges(), &[range(0x10, 0x1f), range(0x30, 0x3f)]);

        set.delete_range(addr(0x00), addr(0x17));
        assert_eq!(set.ranges(), &[range(0x18, 0x1f), range(0x30, 0x3f)]);

        set.delete_range(addr(0x00), addr(0xff));
        assert!(set.is_empty());
    }

    #[test]
    fn membership_probes() {
        let mut set = AddressSet::new();
        set.add_range(addr(0x10), addr(0x1f));
        set.add_range(addr(0x40), addr(0x4f));
        assert!(set.contains(addr(0x10)));
        assert!(set.contains(addr(0x4f)));
        assert!(!set.contains(addr(0x20)));
        assert!(set.contains_range(addr(0x12), addr(0x1e)));
        assert!(!set.contains_range(addr(0x12), addr(0x41)));
        assert!(set.intersects_range(addr(0x00), addr(0x10)));
        assert!(set.intersects_range(addr(0x1f), addr(0x40)));
        assert!(!set.intersects_range(addr(0x20), addr(0x3f)));
    }

    #[test]
    fn set_algebra() {
        let mut a = AddressSet::new();
        a.add_range(addr(0x00), addr(0x1f));
        let mut b = AddressSet::new();
        b.add_range(addr(0x10), addr(0x2f));

        assert_eq!(a.intersect(&b).ranges(), &[range(0x10, 0x1f)]);
        assert_eq!(a.union(&b).ranges(), &[range(0x00, 0x2f)]);
        assert_eq!(a.subtract(&b).ranges(), &[range(0x00, 0x0f)]);
        assert_eq!(
            a.xor(&b).ranges(),
            &[range(0x00, 0x0f), range(0x20, 0x2f)]
        );
        assert!(a.intersects(&b));
        assert_eq!(a.num_addresses(), 32);
    }

    #[test]
    fn multi_space_sets_stay_sorted() {
        let other = Address::new(SpaceId::new(1), 0x0);
        let mut set = AddressSet::new();
        set.add_range(other, Address::new(SpaceId::new(1), 0xf));
        set.add_range(addr(0x10), addr(0x1f));
        assert_eq!(set.min_address(), Some(addr(0x10)));
        assert_eq!(set.max_address(), Some(Address::new(SpaceId::new(1), 0xf)));
        // ranges in different spaces never merge
        assert_eq!(set.num_address_ranges(), 2);
    }

    #[test]
    fn forward_iteration() {
        let mut set = AddressSet::new();
        set.add_range(addr(0x10), addr(0x12));
        set.add_range(addr(0x20), addr(0x21));
        let collected: Vec<u64> = set.addresses(addr(0x0), true).map(|a| a.offset()).collect();
        assert_eq!(collected, vec![0x10, 0x11, 0x12, 0x20, 0x21]);

        let collected: Vec<u64> = set
            .addresses(addr(0x12), true)
            .map(|a| a.offset())
            .collect();
        assert_eq!(collected, vec![0x12, 0x20, 0x21]);

        assert!(set.addresses(addr(0x22), true).next().is_none());
    }

    #[test]
    fn backward_iteration() {
        let mut set = AddressSet::new();
        set.add_range(addr(0x10), addr(0x12));
        set.add_range(addr(0x20), addr(0x21));
        let collected: Vec<u64> = set
            .addresses(addr(0x30), false)
            .map(|a| a.offset())
            .collect();
        assert_eq!(collected, vec![0x21, 0x20, 0x12, 0x11, 0x10]);

        let collected: Vec<u64> = set
            .addresses(addr(0x15), false)
            .map(|a| a.offset())
            .collect();
        assert_eq!(collected, vec![0x12, 0x11, 0x10]);

        assert!(set.addresses(addr(0xf), false).next().is_none());
    }
}
