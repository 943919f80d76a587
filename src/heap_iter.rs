// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component J: the malloc-iteration trampoline.
//!
//! The platform allocator exposes `malloc_iterate(base, size, callback, ctx)`
//! where `callback` is a raw `extern "C" fn` and `ctx` an opaque pointer.
//! `HeapIterator` wraps that shape behind a safe, typed closure: the
//! trampoline reconstructs a `&mut dyn FnMut` from the context pointer
//! exactly once per invocation and keeps no state of its own.

use std::os::raw::c_void;

use crate::types::Mapping;

/// Abstraction over the platform's malloc-introspection primitive. The real
/// Android `malloc_iterate` is not available as a stable export on generic
/// Linux allocators, so this crate ships a trait plus the trampoline
/// plumbing; an allocator integration supplies the concrete `iterate_raw`.
pub trait HeapIterator {
    /// Call `f(base, size)` once for every live allocation in `mapping`.
    fn iterate(&self, mapping: &Mapping, f: &mut dyn FnMut(usize, usize));
}

/// Trampoline used by a `HeapIterator` implementation that is itself built
/// on a C-style `extern "C" fn(base, size, ctx)` callback (the shape
/// `malloc_iterate` actually takes). `f` is boxed as a trait object behind a
/// raw pointer only for the duration of the call.
pub extern "C" fn trampoline(base: usize, size: usize, ctx: *mut c_void) {
    // Safety: `ctx` was produced by `call_with_trampoline` below and is only
    // ever used for the duration of that single call.
    let f = unsafe { &mut *(ctx as *mut &mut dyn FnMut(usize, usize)) };
    f(base, size);
}

/// Helper for implementing [`HeapIterator`] over a raw `malloc_iterate`-style
/// C entry point: `raw_iterate(base, size, trampoline, ctx)`.
pub fn call_with_trampoline(
    base: usize,
    size: usize,
    mut f: impl FnMut(usize, usize),
    raw_iterate: impl FnOnce(usize, usize, extern "C" fn(usize, usize, *mut c_void), *mut c_void),
) {
    let mut trait_obj: &mut dyn FnMut(usize, usize) = &mut f;
    let ctx = &mut trait_obj as *mut &mut dyn FnMut(usize, usize) as *mut c_void;
    raw_iterate(base, size, trampoline, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake `malloc_iterate`: splits a region into fixed-size blocks and
    /// invokes the trampoline for each, exactly like the real allocator
    /// introspection hook would.
    extern "C" fn fake_malloc_iterate(
        base: usize,
        size: usize,
        cb: extern "C" fn(usize, usize, *mut c_void),
        ctx: *mut c_void,
    ) {
        let block = 16usize;
        let mut addr = base;
        while addr + block <= base + size {
            cb(addr, block, ctx);
            addr += block;
        }
    }

    #[test]
    fn trampoline_forwards_every_block_exactly_once() {
        let mut seen = Vec::new();
        call_with_trampoline(
            0x1000,
            0x40,
            |base, size| seen.push((base, size)),
            |base, size, cb, ctx| fake_malloc_iterate(base, size, cb, ctx),
        );
        assert_eq!(seen, vec![(0x1000, 16), (0x1010, 16), (0x1020, 16), (0x1030, 16)]);
    }
}
