// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component B: the interval registry, the counterpart of Android libmemunreachable's `HeapWalker`.
//!
//! Stores every live allocation, ordered by `begin`, in an arena-backed
//! vector. Answers "which allocation, if any, contains address `p`?" in
//! `O(log n)` via binary search, and supports the ordered traversal the
//! sweep phase needs.

use crate::arena::SharedArena;
use crate::arena_vec::ArenaVec;
use crate::error::Result;
use crate::range::Range;
use crate::types::Allocation;

pub struct IntervalRegistry {
    arena: SharedArena,
    allocations: ArenaVec<Allocation>,
    total_bytes: usize,
}

impl IntervalRegistry {
    pub fn new(arena: SharedArena) -> Self {
        Self {
            allocations: ArenaVec::new(arena.clone()),
            arena,
            total_bytes: 0,
        }
    }

    /// Insert `[begin, end)` as a new allocation. Undefined (debug-asserts)
    /// if it overlaps an existing interval -- the mapping classifier and
    /// heap iterator are responsible for never producing overlapping ranges.
    pub fn insert(&mut self, begin: usize, end: usize) -> Result<()> {
        if begin >= end {
            return Ok(());
        }
        let range = Range::new(begin, end);
        let alloc = Allocation::new(range);

        let idx = self.lower_bound(begin);
        if cfg!(debug_assertions) {
            if let Some(prev) = idx.checked_sub(1).and_then(|i| self.allocations.get(i)) {
                debug_assert!(
                    !prev.range.overlaps(&range),
                    "overlapping allocation inserted: {:?} vs {:?}",
                    prev.range,
                    range
                );
            }
            if let Some(next) = self.allocations.get(idx) {
                debug_assert!(
                    !next.range.overlaps(&range),
                    "overlapping allocation inserted: {:?} vs {:?}",
                    next.range,
                    range
                );
            }
        }

        self.allocations.insert(idx, alloc)?;
        self.total_bytes += range.len();
        Ok(())
    }

    /// Index of the first allocation whose `begin >= addr`.
    fn lower_bound(&self, addr: usize) -> usize {
        let slice = self.allocations.as_slice();
        let mut lo = 0usize;
        let mut hi = slice.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if slice[mid].range.begin < addr {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Find the allocation (if any) whose range contains `p`.
    pub fn find_containing(&self, p: usize) -> Option<usize> {
        let slice = self.allocations.as_slice();
        if slice.is_empty() {
            return None;
        }
        let idx = self.lower_bound(p + 1);
        if idx == 0 {
            return None;
        }
        let candidate = idx - 1;
        if slice[candidate].range.contains(p) {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Allocation> {
        self.allocations.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Allocation> {
        self.allocations.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter()
    }

    pub fn count(&self) -> usize {
        self.allocations.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Allocations that never got marked reachable by the end of the sweep,
    /// sorted by descending size (ties by ascending `begin`), truncated to
    /// `limit`. Returns `(leaks, num_leaks, leak_bytes)` where the first two
    /// totals are never truncated even though the vector is.
    pub fn leaked(&self, limit: usize) -> Result<(ArenaVec<Range>, usize, usize)> {
        let mut leaked: ArenaVec<Range> = ArenaVec::new(self.arena.clone());
        let mut num_leaks = 0usize;
        let mut leak_bytes = 0usize;
        for alloc in self.allocations.iter().filter(|a| !a.is_marked()) {
            num_leaks += 1;
            leak_bytes += alloc.range.len();
            leaked.push(alloc.range)?;
        }

        // Unstable sort never allocates a scratch buffer (stable sort does),
        // which would call the target allocator mid-critical-section. Safe
        // to use here despite not being a stable sort: `begin` is unique
        // across disjoint allocations, so the comparator is already a total
        // order and the two sorts produce identical output.
        leaked
            .as_mut_slice()
            .sort_unstable_by(|a, b| b.len().cmp(&a.len()).then(a.begin.cmp(&b.begin)));
        leaked.truncate(limit);

        Ok((leaked, num_leaks, leak_bytes))
    }
}

impl std::fmt::Debug for IntervalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalRegistry")
            .field("count", &self.count())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_inserts_are_all_findable() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena);
        let ranges = [(0x1000, 0x1010), (0x2000, 0x2100), (0x500, 0x600)];
        for (b, e) in ranges {
            reg.insert(b, e).unwrap();
        }
        assert_eq!(reg.count(), 3);
        assert_eq!(reg.total_bytes(), 0x10 + 0x100 + 0x100);

        assert!(reg.find_containing(0x1008).is_some());
        assert!(reg.find_containing(0x2050).is_some());
        assert!(reg.find_containing(0x550).is_some());
        assert!(reg.find_containing(0x1010).is_none()); // exclusive end
        assert!(reg.find_containing(0x1700).is_none());
    }

    #[test]
    fn interior_pointer_resolves_to_base_allocation() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena);
        reg.insert(1000, 1100).unwrap();
        let idx = reg.find_containing(1042).expect("interior pointer must hit");
        assert_eq!(reg.get(idx).unwrap().range.begin, 1000);
    }

    #[test]
    fn leaked_sorts_descending_size_then_ascending_begin() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena);
        reg.insert(100, 116).unwrap(); // 16 bytes
        reg.insert(300, 332).unwrap(); // 32 bytes
        reg.insert(200, 216).unwrap(); // 16 bytes, begin between the above

        let (leaked, num_leaks, leak_bytes) = reg.leaked(100).unwrap();
        assert_eq!(num_leaks, 3);
        assert_eq!(leak_bytes, 16 + 32 + 16);
        assert_eq!(leaked[0].begin, 300);
        assert_eq!(leaked[1].begin, 100);
        assert_eq!(leaked[2].begin, 200);
    }

    #[test]
    fn limit_truncates_but_not_the_totals() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena);
        for i in 0..100usize {
            let base = 0x100000 + i * 0x100;
            reg.insert(base, base + 16).unwrap();
        }
        let (leaked, num_leaks, leak_bytes) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 100);
        assert_eq!(leak_bytes, 1600);
        assert_eq!(leaked.len(), 10);
    }
}
