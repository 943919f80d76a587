// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component C: the mark engine.
//!
//! A conservative, iterative, breadth-first trace over the interval
//! registry. The shape of this worklist loop -- pop a pointer-info, colour
//! it, scan its body for further word-aligned hits, repeat -- follows the
//! `enter_mark_phase`/`scan_stack` pair of a Boehm-style mark-sweep
//! collector; the difference here is that roots come from a list of
//! classified memory ranges captured by ptrace rather than an in-process
//! register spill.

use static_assertions::const_assert_eq;

use crate::arena::SharedArena;
use crate::arena_vec::ArenaVec;
use crate::error::Result;
use crate::registry::IntervalRegistry;

const WORD_SIZE: usize = std::mem::size_of::<usize>();
// Word-aligned scanning assumes a pointer is one machine word; every target
// this crate's ptrace backend supports (see capture.rs) is 64-bit.
const_assert_eq!(WORD_SIZE, 8);

/// A contiguous range of readable memory to scan for pointer-sized,
/// word-aligned values: register buffers, thread stacks, globals mappings,
/// and unclassified anonymous mappings.
#[derive(Clone, Copy)]
pub struct RootRange<'a> {
    pub bytes: &'a [u8],
    pub base: usize,
}

/// Hook point for platforms with tagged pointers (e.g. ARM pointer
/// authentication): strip metadata bits before the interval lookup. The
/// default is the identity function; this crate does not exercise tag
/// stripping on its supported targets.
pub trait RootScanner {
    fn strip_tag(&self, word: usize) -> usize {
        word
    }
}

/// Default, no-op tag stripping.
pub struct PlainRootScanner;
impl RootScanner for PlainRootScanner {}

/// The memory the mark engine scans allocation bodies from. In the real
/// walker this is simply the forked child's own address space (every
/// allocation range is guaranteed mapped there); tests implement it over an
/// in-memory fake so these scenarios run without forking or ptrace
/// privilege.
pub trait AddressSpace {
    fn read(&self, begin: usize, len: usize) -> &[u8];
}

/// Reads directly out of the current process's own address space. This is
/// what the walker child uses: every allocation range came from its own
/// (COW-snapshotted) memory map, so dereferencing is always valid.
pub struct LiveAddressSpace;

impl AddressSpace for LiveAddressSpace {
    fn read(&self, begin: usize, len: usize) -> &[u8] {
        // Safety: `begin..begin+len` is an allocation range taken from the
        // classified heap mappings of this same (forked) process image.
        unsafe { std::slice::from_raw_parts(begin as *const u8, len) }
    }
}

/// Scan `bytes` (mapped starting at `base`) at word alignment, looking up
/// each word in `registry`. Newly-marked allocations are pushed onto
/// `queue`.
fn scan_words(
    bytes: &[u8],
    base: usize,
    registry: &mut IntervalRegistry,
    scanner: &dyn RootScanner,
    queue: &mut ArenaVec<usize>,
    from_root: bool,
) -> Result<()> {
    let words = bytes.len() / WORD_SIZE;
    for i in 0..words {
        let offset = i * WORD_SIZE;
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(&bytes[offset..offset + WORD_SIZE]);
        let word = scanner.strip_tag(usize::from_ne_bytes(buf));

        if let Some(idx) = registry.find_containing(word) {
            let alloc = registry.get_mut(idx).unwrap();
            if !alloc.is_marked() {
                if from_root {
                    alloc.mark_from_root();
                } else {
                    alloc.mark();
                }
                queue.push(idx)?;
            }
        }
    }
    let _ = base; // kept for callers that want to log absolute addresses
    Ok(())
}

/// Run the full mark phase: seed the worklist from every root range, then
/// drain it by scanning each newly-marked allocation's own bytes (read
/// directly via `alloc_bytes`, since the registry only stores ranges, not
/// copies -- the forked walker process has these pages mapped read-only
/// copy-on-write).
pub fn mark(
    arena: SharedArena,
    registry: &mut IntervalRegistry,
    roots: &[RootRange<'_>],
    image: &impl AddressSpace,
    scanner: &dyn RootScanner,
) -> Result<()> {
    let mut queue: ArenaVec<usize> = ArenaVec::new(arena);

    for root in roots {
        scan_words(root.bytes, root.base, registry, scanner, &mut queue, true)?;
    }

    while let Some(idx) = queue.pop() {
        let range = registry.get(idx).unwrap().range;
        let bytes = image.read(range.begin, range.len());
        scan_words(bytes, range.begin, registry, scanner, &mut queue, false)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A tiny in-memory "process image": a map from address ranges to their
    /// bytes, used so the mark-phase unit tests do not need an actual forked
    /// child or real mapped memory.
    struct FakeImage {
        regions: HashMap<usize, Vec<u8>>,
    }

    impl FakeImage {
        fn new() -> Self {
            Self {
                regions: HashMap::new(),
            }
        }

        fn put(&mut self, begin: usize, bytes: Vec<u8>) {
            self.regions.insert(begin, bytes);
        }
    }

    impl AddressSpace for FakeImage {
        fn read(&self, begin: usize, len: usize) -> &[u8] {
            let bytes = self.regions.get(&begin).expect("unregistered range read");
            assert_eq!(bytes.len(), len);
            &bytes[..]
        }
    }

    fn word_bytes(addr: usize) -> [u8; WORD_SIZE] {
        addr.to_ne_bytes()
    }

    #[test]
    fn scenario_1_single_leak() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        reg.insert(0x10000, 0x10020).unwrap();
        let mut image = FakeImage::new();
        image.put(0x10000, vec![0u8; 0x20]);

        mark(arena, &mut reg, &[], &image, &PlainRootScanner).unwrap();

        let (leaked, num_leaks, leak_bytes) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 1);
        assert_eq!(leak_bytes, 32);
        assert_eq!(leaked[0].begin, 0x10000);
        assert_eq!(leaked[0].len(), 32);
    }

    #[test]
    fn scenario_2_root_reachable() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        reg.insert(0x10000, 0x10020).unwrap();
        let mut image = FakeImage::new();
        image.put(0x10000, vec![0u8; 0x20]);

        let root_bytes = word_bytes(0x10000);
        let roots = [RootRange {
            bytes: &root_bytes,
            base: 0,
        }];

        mark(arena, &mut reg, &roots, &image, &PlainRootScanner).unwrap();

        let (_, num_leaks, _) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 0);
    }

    #[test]
    fn root_reachable_allocation_sets_referenced_from_root() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        reg.insert(0x10000, 0x10040).unwrap();
        reg.insert(0x20000, 0x20040).unwrap();

        let mut image = FakeImage::new();
        let mut a_bytes = vec![0u8; 0x40];
        a_bytes[0..WORD_SIZE].copy_from_slice(&word_bytes(0x20000));
        image.put(0x10000, a_bytes);
        image.put(0x20000, vec![0u8; 0x40]);

        let root_bytes = word_bytes(0x10000);
        let roots = [RootRange {
            bytes: &root_bytes,
            base: 0,
        }];

        mark(arena, &mut reg, &roots, &image, &PlainRootScanner).unwrap();

        let a_idx = reg.find_containing(0x10000).unwrap();
        let b_idx = reg.find_containing(0x20000).unwrap();
        assert!(reg.get(a_idx).unwrap().is_referenced_from_root());
        assert!(
            !reg.get(b_idx).unwrap().is_referenced_from_root(),
            "B is only transitively reachable through A, not itself a root hit"
        );
    }

    #[test]
    fn scenario_3_interior_pointer() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        reg.insert(0x10000, 0x10020).unwrap();
        let mut image = FakeImage::new();
        image.put(0x10000, vec![0u8; 0x20]);

        let root_bytes = word_bytes(0x10010);
        let roots = [RootRange {
            bytes: &root_bytes,
            base: 0,
        }];

        mark(arena, &mut reg, &roots, &image, &PlainRootScanner).unwrap();

        let (_, num_leaks, _) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 0);
    }

    #[test]
    fn scenario_4_transitive_reachability() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        reg.insert(0x10000, 0x10040).unwrap();
        reg.insert(0x20000, 0x20040).unwrap();

        let mut image = FakeImage::new();
        let mut a_bytes = vec![0u8; 0x40];
        a_bytes[16..16 + WORD_SIZE].copy_from_slice(&word_bytes(0x20000));
        image.put(0x10000, a_bytes);
        image.put(0x20000, vec![0u8; 0x40]);

        let root_bytes = word_bytes(0x10000);
        let roots = [RootRange {
            bytes: &root_bytes,
            base: 0,
        }];

        mark(arena, &mut reg, &roots, &image, &PlainRootScanner).unwrap();

        let (_, num_leaks, _) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 0);
    }

    #[test]
    fn scenario_5_cycle_with_no_root_is_fully_leaked() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        reg.insert(0x10000, 0x10040).unwrap();
        reg.insert(0x20000, 0x20040).unwrap();

        let mut image = FakeImage::new();
        let mut a_bytes = vec![0u8; 0x40];
        a_bytes[0..WORD_SIZE].copy_from_slice(&word_bytes(0x20000));
        let mut b_bytes = vec![0u8; 0x40];
        b_bytes[0..WORD_SIZE].copy_from_slice(&word_bytes(0x10000));
        image.put(0x10000, a_bytes);
        image.put(0x20000, b_bytes);

        mark(arena, &mut reg, &[], &image, &PlainRootScanner).unwrap();

        let (_, num_leaks, _) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 2);
    }

    #[test]
    fn scenario_6_limit_truncation() {
        let arena = SharedArena::new();
        let mut reg = IntervalRegistry::new(arena.clone());
        let mut image = FakeImage::new();
        for i in 0..100usize {
            let base = 0x100000 + i * 0x100;
            reg.insert(base, base + 16).unwrap();
            image.put(base, vec![0u8; 16]);
        }

        mark(arena, &mut reg, &[], &image, &PlainRootScanner).unwrap();

        let (leaked, num_leaks, leak_bytes) = reg.leaked(10).unwrap();
        assert_eq!(num_leaks, 100);
        assert_eq!(leak_bytes, 1600);
        assert_eq!(leaked.len(), 10);
    }

    #[test]
    fn determinism_across_runs() {
        let build = || {
            let arena = SharedArena::new();
            let mut reg = IntervalRegistry::new(arena.clone());
            let mut image = FakeImage::new();
            for i in 0..20usize {
                let base = 0x40000 + i * 0x40;
                reg.insert(base, base + 16).unwrap();
                image.put(base, vec![0u8; 16]);
            }
            mark(arena, &mut reg, &[], &image, &PlainRootScanner).unwrap();
            reg.leaked(100).unwrap()
        };

        let (a_leaked, a_num, a_bytes) = build();
        let (b_leaked, b_num, b_bytes) = build();
        assert_eq!(a_num, b_num);
        assert_eq!(a_bytes, b_bytes);
        assert_eq!(
            a_leaked.iter().map(|r| (r.begin, r.end)).collect::<Vec<_>>(),
            b_leaked.iter().map(|r| (r.begin, r.end)).collect::<Vec<_>>()
        );
    }
}
