// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component D: the mapping classifier.
//!
//! Partitions the ordered mapping list from `/proc/<pid>/maps` into four
//! disjoint buckets: heap, anon (unclassified -- treated as roots), globals,
//! and stack. The policy is expressed as a trait so alternative
//! classification schemes can be substituted without touching the mark
//! engine.

use crate::arena::SharedArena;
use crate::arena_vec::ArenaVec;
use crate::error::Result;
use crate::types::Mapping;

pub struct ClassifiedMappings {
    pub heap: ArenaVec<Mapping>,
    pub anon: ArenaVec<Mapping>,
    pub globals: ArenaVec<Mapping>,
    pub stack: ArenaVec<Mapping>,
}

impl ClassifiedMappings {
    fn new(arena: SharedArena) -> Self {
        Self {
            heap: ArenaVec::new(arena.clone()),
            anon: ArenaVec::new(arena.clone()),
            globals: ArenaVec::new(arena.clone()),
            stack: ArenaVec::new(arena),
        }
    }
}

/// The classification rule table, evaluated top to bottom; a mapping matches at most
/// one rule. Implementors may override individual rules; the default
/// implementation reproduces Android libmemunreachable's rule table verbatim, including its
/// acknowledged imprecision in rule 8 (unknown `[anon:...]` mappings are
/// conservatively treated as roots). Draws its output buckets from `arena`
/// rather than the global allocator: this runs inside the walker child,
/// under the malloc guard.
pub trait ClassifyPolicy {
    fn classify(&self, mappings: &[Mapping], arena: SharedArena) -> Result<ClassifiedMappings> {
        let mut out = ClassifiedMappings::new(arena);
        let mut current_lib: [u8; crate::types::MAX_MAPPING_NAME_LEN] =
            [0u8; crate::types::MAX_MAPPING_NAME_LEN];
        let mut current_lib_len = 0usize;

        for mapping in mappings {
            // Rule 1: executable mappings are skipped, but remembered as the
            // "current library" so a following .rodata/.data mapping with
            // the same name can be tied to it by rule 3.
            if mapping.execute {
                let name = mapping.name();
                let len = name.len().min(current_lib.len());
                current_lib[..len].copy_from_slice(&name.as_bytes()[..len]);
                current_lib_len = len;
                continue;
            }

            // Rule 2: unreadable mappings carry no information.
            if !mapping.read {
                continue;
            }

            let current_lib_str =
                std::str::from_utf8(&current_lib[..current_lib_len]).unwrap_or("");
            let name = mapping.name();

            if name == "[anon:.bss]" {
                out.globals.push(*mapping)?; // Rule 3a
            } else if current_lib_len > 0 && name == current_lib_str {
                out.globals.push(*mapping)?; // Rule 3b
            } else if name == "[anon:libc_malloc]" {
                out.heap.push(*mapping)?; // Rule 4
            } else if name.starts_with("/dev/ashmem/dalvik") {
                out.globals.push(*mapping)?; // Rule 5
            } else if name.starts_with("[stack") {
                out.stack.push(*mapping)?; // Rule 6
            } else if name.is_empty() {
                out.globals.push(*mapping)?; // Rule 7
            } else if name.starts_with("[anon:") && name != "[anon:leak_detector_malloc]" {
                out.globals.push(*mapping)?; // Rule 8
            }
            // Rule 9: otherwise, skip.
        }

        Ok(out)
    }
}

/// The default, Android-derived policy.
pub struct DefaultClassifyPolicy;
impl ClassifyPolicy for DefaultClassifyPolicy {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Range;

    fn mapping(name: &str, r: bool, w: bool, x: bool) -> Mapping {
        Mapping::new(Range::new(0x1000, 0x2000), r, w, x, name)
    }

    fn classify(mappings: &[Mapping]) -> ClassifiedMappings {
        DefaultClassifyPolicy
            .classify(mappings, SharedArena::new())
            .unwrap()
    }

    #[test]
    fn rule1_executable_is_skipped_but_remembered() {
        let mappings = vec![
            mapping("/lib/libfoo.so", true, true, true),
            mapping("/lib/libfoo.so", true, true, false),
        ];
        let out = classify(&mappings);
        assert_eq!(out.globals.len(), 1); // only the second (rule 3b)
        assert!(out.heap.is_empty());
        assert!(out.stack.is_empty());
    }

    #[test]
    fn rule2_unreadable_is_skipped() {
        let mappings = vec![mapping("whatever", false, true, false)];
        let out = classify(&mappings);
        assert!(out.globals.is_empty() && out.heap.is_empty() && out.stack.is_empty());
    }

    #[test]
    fn rule3_bss_is_globals() {
        let mappings = vec![mapping("[anon:.bss]", true, true, false)];
        let out = classify(&mappings);
        assert_eq!(out.globals.len(), 1);
    }

    #[test]
    fn rule4_libc_malloc_is_heap() {
        let mappings = vec![mapping("[anon:libc_malloc]", true, true, false)];
        let out = classify(&mappings);
        assert_eq!(out.heap.len(), 1);
    }

    #[test]
    fn rule5_dalvik_heap_is_globals() {
        let mappings = vec![mapping("/dev/ashmem/dalvik-main space", true, true, false)];
        let out = classify(&mappings);
        assert_eq!(out.globals.len(), 1);
    }

    #[test]
    fn rule6_stack_is_stack() {
        let mappings = vec![mapping("[stack]", true, true, false)];
        let out = classify(&mappings);
        assert_eq!(out.stack.len(), 1);
    }

    #[test]
    fn rule7_empty_name_is_globals() {
        let mappings = vec![mapping("", true, true, false)];
        let out = classify(&mappings);
        assert_eq!(out.globals.len(), 1);
    }

    #[test]
    fn rule8_unknown_anon_is_conservatively_globals() {
        let mappings = vec![mapping("[anon:some_runtime_heap]", true, true, false)];
        let out = classify(&mappings);
        assert_eq!(out.globals.len(), 1);
    }

    #[test]
    fn rule8_exempts_the_leak_detector_own_arena() {
        let mappings = vec![mapping("[anon:leak_detector_malloc]", true, true, false)];
        let out = classify(&mappings);
        assert!(out.globals.is_empty());
        assert!(out.heap.is_empty());
        assert!(out.anon.is_empty());
    }

    #[test]
    fn rule9_unmatched_name_is_skipped() {
        let mappings = vec![mapping("/some/mapped/file", true, true, false)];
        let out = classify(&mappings);
        assert!(out.globals.is_empty() && out.heap.is_empty() && out.stack.is_empty());
    }
}
