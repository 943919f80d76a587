// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component A: the private, page-backed arena allocator.
//!
//! Every detector data structure draws its storage from here instead of the
//! target process's general-purpose allocator. The target's malloc is held
//! under a recursive lock for the duration of the critical section (see
//! [`crate::sync::MallocGuard`]); any detector allocation that went through
//! it would deadlock. Grounded on the `allocator::vector` / `Allocator<T>`
//! wrapper in the original `libmemunreachable` sources: a thin bump arena
//! that owns whole pages and hands out sub-slices of them, plus an intrusive
//! free list so `deallocate`d blocks are recycled rather than leaked until
//! the whole arena exits.

use parking_lot::Mutex;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{DetectorError, Result};

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) never fails on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

struct Page {
    base: NonNull<u8>,
    size: usize,
    used: usize,
}

// Safety: `Page` only ever moves its raw pointer between threads while the
// owning `Arena` is behind a `Mutex`; no aliasing occurs.
unsafe impl Send for Page {}

/// Header written into the front of a freed block, forming an intrusive
/// singly-linked free list. Only blocks at least `size_of::<FreeBlock>()`
/// bytes are recyclable; smaller ones are abandoned until the arena itself
/// is dropped, matching the original's "arena exit releases all pages at
/// once" fallback.
struct FreeBlock {
    size: usize,
    next: Option<NonNull<FreeBlock>>,
}

struct ArenaInner {
    pages: Vec<Page>,
    page_size: usize,
    free_list: Option<NonNull<FreeBlock>>,
}

// Safety: `free_list` nodes are only ever read or linked while holding the
// `SharedArena`'s `Mutex`, same as `pages`.
unsafe impl Send for ArenaInner {}

impl ArenaInner {
    fn alloc_page(&mut self, min_size: usize) -> Result<&mut Page> {
        let size = min_size.max(self.page_size);
        let size = (size + self.page_size - 1) / self.page_size * self.page_size;

        // Safety: mmap with MAP_ANONYMOUS|MAP_PRIVATE returns a fresh,
        // zeroed region or MAP_FAILED; we check for the latter below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DetectorError::Resource(
                "arena: mmap failed while growing the private page pool".into(),
            ));
        }

        self.pages.push(Page {
            base: NonNull::new(ptr as *mut u8).unwrap(),
            size,
            used: 0,
        });
        Ok(self.pages.last_mut().unwrap())
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        for page in &self.pages {
            // Safety: `base`/`size` came from a successful mmap call above
            // and are only ever unmapped here, once.
            unsafe {
                libc::munmap(page.base.as_ptr() as *mut libc::c_void, page.size);
            }
        }
    }
}

/// A handle shared by every arena-backed container. Cloning is cheap (it
/// clones an `Arc`); the backing pages are released when the last handle
/// (and thus the last container) is dropped.
#[derive(Clone)]
pub struct SharedArena {
    inner: Arc<Mutex<ArenaInner>>,
}

impl SharedArena {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ArenaInner {
                pages: Vec::new(),
                page_size: page_size(),
                free_list: None,
            })),
        }
    }

    /// Allocate `len` bytes with the given alignment. Never calls into the
    /// target allocator: a matching block is served from the free list first
    /// (see [`Self::deallocate`]); failing that, the backing store is
    /// `mmap`-ed pages.
    pub fn alloc_bytes(&self, len: usize, align: usize) -> Result<NonNull<u8>> {
        let mut inner = self.inner.lock();

        // First-fit scan of the free list for a previously deallocated block
        // this request fits in.
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cur = inner.free_list;
        while let Some(node) = cur {
            // Safety: every node on the list was written by `deallocate`
            // below and is only ever touched while holding `self.inner`.
            let node_ref = unsafe { node.as_ref() };
            let addr = node.as_ptr() as usize;
            let next = node_ref.next;
            if node_ref.size >= len && addr % align == 0 {
                match prev {
                    // Safety: `p` is still a live free-list node (not this
                    // one), linked earlier in this same scan.
                    Some(p) => unsafe { (*p.as_ptr()).next = next },
                    None => inner.free_list = next,
                }
                return Ok(node.cast::<u8>());
            }
            prev = cur;
            cur = next;
        }

        for page in inner.pages.iter_mut().rev() {
            let base = page.base.as_ptr() as usize;
            let cur = base + page.used;
            let aligned = (cur + align - 1) & !(align - 1);
            let pad = aligned - cur;
            if page.used + pad + len <= page.size {
                page.used += pad + len;
                // Safety: `aligned` lies within `[base, base + size)` by the
                // bounds check above.
                return Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) });
            }
        }

        let page = inner.alloc_page(len + align)?;
        let base = page.base.as_ptr() as usize;
        let aligned = (base + align - 1) & !(align - 1);
        let pad = aligned - base;
        page.used = pad + len;
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Return `[ptr, ptr + size)` to the arena for reuse by a later
    /// `alloc_bytes` call of equal or smaller size. Blocks smaller than
    /// `size_of::<FreeBlock>()` cannot carry the intrusive header and are
    /// abandoned instead -- they are reclaimed in bulk when the arena itself
    /// is dropped. Never calls into the target allocator.
    ///
    /// Safety: `ptr` must have come from a prior `alloc_bytes` on this same
    /// arena with the given `size`, and must not be read or written again
    /// after this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if size < mem::size_of::<FreeBlock>() {
            return;
        }
        let mut inner = self.inner.lock();
        let mut block = ptr.cast::<FreeBlock>();
        block.as_ptr().write(FreeBlock {
            size,
            next: inner.free_list,
        });
        inner.free_list = Some(block);
    }

    pub fn page_size(&self) -> usize {
        self.inner.lock().page_size
    }
}

impl Default for SharedArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_non_overlapping_and_aligned() {
        let arena = SharedArena::new();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            let p = arena.alloc_bytes(24, 8).unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            ptrs.push(p.as_ptr() as usize);
        }
        ptrs.sort_unstable();
        for w in ptrs.windows(2) {
            assert!(w[1] >= w[0] + 24, "allocations must not overlap");
        }
    }

    #[test]
    fn grows_past_a_single_page() {
        let arena = SharedArena::new();
        let big = arena.page_size() * 3;
        let p = arena.alloc_bytes(big, 8);
        assert!(p.is_ok());
    }

    #[test]
    fn deallocated_block_is_reused_by_a_later_allocation() {
        let arena = SharedArena::new();
        let first = arena.alloc_bytes(64, 8).unwrap();
        // Safety: `first` came from this arena with size 64 and is not used
        // again until the reuse check below.
        unsafe { arena.deallocate(first, 64) };
        let second = arena.alloc_bytes(32, 8).unwrap();
        assert_eq!(
            first.as_ptr(),
            second.as_ptr(),
            "a fitting request should recycle the freed block instead of growing"
        );
    }

    #[test]
    fn tiny_deallocation_is_abandoned_without_panicking() {
        let arena = SharedArena::new();
        let p = arena.alloc_bytes(1, 1).unwrap();
        // Safety: `p` came from this arena with size 1 and is not used again.
        unsafe { arena.deallocate(p, 1) };
        assert!(arena.alloc_bytes(8, 8).is_ok());
    }
}
