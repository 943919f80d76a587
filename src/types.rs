// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared data model: `Allocation`, `Mapping`, `ThreadInfo`, `Leak`,
//! `UnreachableMemoryInfo`.
//!
//! `Mapping`, `ThreadInfo`, and `Leak` all store their variable-length
//! payload (a name, a register file, a content prefix) in a fixed-size,
//! `Copy` byte array plus a length, rather than a `String`/`Vec<u8>`. This is
//! deliberate: every one of these is built while the target allocator is
//! quiesced (P1 in the collection thread, P3 in the walker child), so they
//! must never touch the global allocator, and being `Copy` lets them live
//! directly in an [`crate::arena_vec::ArenaVec`] instead. See DESIGN.md for
//! the full rationale.

use packed_struct::prelude::*;
use std::time::Duration;

use crate::error::{DetectorError, Result};
use crate::range::Range;

/// Default number of bytes copied from a leaked allocation's contents.
pub const DEFAULT_LEAK_PREFIX_LEN: usize = 32;
/// Hard upper bound on the configurable prefix length -- callers asking for
/// more than this get clamped, see [`DetectorConfig::leak_prefix_len`].
pub const MAX_LEAK_PREFIX_LEN: usize = 128;
/// Hard upper bound on a `/proc/<pid>/maps` region name. Real names (library
/// paths, `[heap]`, `[anon:...]` tags) are always well under this; longer
/// names are truncated rather than rejected, matching the conservative
/// "false negatives over false positives" posture of the classifier itself.
pub const MAX_MAPPING_NAME_LEN: usize = 256;
/// Hard upper bound on a captured register file. The largest supported
/// target (`aarch64`'s `user_regs_struct`, 31 general registers plus sp/pc/
/// pstate) is under 300 bytes; this leaves generous headroom.
pub const MAX_REGS_LEN: usize = 512;

/// The mark/root bits live in a single packed byte rather than two separate
/// `bool` fields, mirroring the bit-packed allocation header style used by
/// the mark-sweep collector this crate's orchestration is modeled on.
#[derive(PackedStruct, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "1")]
pub struct AllocFlags {
    #[packed_field(bits = "0")]
    pub marked: bool,
    #[packed_field(bits = "1")]
    pub referenced_from_root: bool,
}

/// A live heap allocation discovered while iterating a heap mapping.
/// Allocations never overlap; each is either marked reachable or leaked by
/// the time the mark phase drains, never both, never neither.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub range: Range,
    pub flags: AllocFlags,
}

impl Allocation {
    pub fn new(range: Range) -> Self {
        Self {
            range,
            flags: AllocFlags::default(),
        }
    }

    pub fn is_marked(&self) -> bool {
        self.flags.marked
    }

    pub fn mark(&mut self) {
        self.flags.marked = true;
    }

    pub fn mark_from_root(&mut self) {
        self.flags.marked = true;
        self.flags.referenced_from_root = true;
    }

    pub fn is_referenced_from_root(&self) -> bool {
        self.flags.referenced_from_root
    }
}

/// Which bucket a [`Mapping`] was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Heap,
    Anon,
    Globals,
    Stack,
    Ignored,
}

/// A single `/proc/<pid>/maps` region. `Copy`, so it can live directly in an
/// arena-backed [`crate::arena_vec::ArenaVec<Mapping>`]; the region name is
/// a fixed buffer rather than a `String`, see the module docs.
#[derive(Clone, Copy)]
pub struct Mapping {
    pub range: Range,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    name: [u8; MAX_MAPPING_NAME_LEN],
    name_len: usize,
}

impl Mapping {
    pub fn new(range: Range, read: bool, write: bool, execute: bool, name: &str) -> Self {
        let mut buf = [0u8; MAX_MAPPING_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_MAPPING_NAME_LEN);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            range,
            read,
            write,
            execute,
            name: buf,
            name_len: len,
        }
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("range", &self.range)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("execute", &self.execute)
            .field("name", &self.name())
            .finish()
    }
}

/// Per-thread register file and stack pointer, captured while the target is
/// frozen. The register bytes are scanned word-by-word exactly like any
/// other root range; this crate does not interpret individual registers.
/// `Copy`, for the same arena reason as [`Mapping`].
#[derive(Clone, Copy)]
pub struct ThreadInfo {
    pub tid: i32,
    regs: [u8; MAX_REGS_LEN],
    regs_len: usize,
    pub stack_pointer: usize,
}

impl ThreadInfo {
    /// Fails only if the platform's register file is larger than
    /// [`MAX_REGS_LEN`], which no currently-supported architecture triggers.
    pub fn new(tid: i32, regs_bytes: &[u8], stack_pointer: usize) -> Result<Self> {
        if regs_bytes.len() > MAX_REGS_LEN {
            return Err(DetectorError::Resource(format!(
                "register file of {} bytes exceeds MAX_REGS_LEN ({})",
                regs_bytes.len(),
                MAX_REGS_LEN
            )));
        }
        let mut regs = [0u8; MAX_REGS_LEN];
        regs[..regs_bytes.len()].copy_from_slice(regs_bytes);
        Ok(Self {
            tid,
            regs,
            regs_len: regs_bytes.len(),
            stack_pointer,
        })
    }

    pub fn regs(&self) -> &[u8] {
        &self.regs[..self.regs_len]
    }
}

impl std::fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("tid", &self.tid)
            .field("regs_len", &self.regs_len)
            .field("stack_pointer", &self.stack_pointer)
            .finish()
    }
}

/// A reported leak: address, size, and a short content snapshot. `Copy`, for
/// the same arena reason as [`Mapping`]; the walker child assembles these
/// into an [`crate::arena_vec::ArenaVec<Leak>`] before it ever touches the
/// pipe.
#[derive(Clone, Copy)]
pub struct Leak {
    pub begin: usize,
    pub size: usize,
    contents: [u8; MAX_LEAK_PREFIX_LEN],
    contents_len: usize,
}

impl Leak {
    pub fn new(begin: usize, size: usize, contents_bytes: &[u8]) -> Self {
        let mut contents = [0u8; MAX_LEAK_PREFIX_LEN];
        let len = contents_bytes.len().min(MAX_LEAK_PREFIX_LEN);
        contents[..len].copy_from_slice(&contents_bytes[..len]);
        Self {
            begin,
            size,
            contents,
            contents_len: len,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents[..self.contents_len]
    }
}

impl std::fmt::Debug for Leak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leak")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("size", &self.size)
            .field("contents_len", &self.contents_len)
            .finish()
    }
}

/// Aggregate result of a single detection pass. Assembled by the caller only
/// after the critical section has ended (the pipe receiver runs once the
/// malloc guard has already been dropped, see `orchestrator::run_pass`), so
/// an ordinary `Vec<Leak>` here is not a layering violation: nothing under
/// the guard ever constructs or touches this type. The walker child instead
/// builds its results in a private arena-backed accumulator and only ever
/// streams them out over the pipe.
#[derive(Debug, Clone, Default)]
pub struct UnreachableMemoryInfo {
    pub num_allocations: usize,
    pub allocation_bytes: usize,
    pub num_leaks: usize,
    pub leak_bytes: usize,
    pub leaks: Vec<Leak>,
}

/// Tunables for a detection pass. `Default` reproduces Android libmemunreachable's single
/// hardcoded constants, but every field is overridable at the call site.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Maximum number of leak records returned (totals are never truncated).
    pub limit: usize,
    /// Bytes copied from each leaked allocation's front, clamped to
    /// [`MAX_LEAK_PREFIX_LEN`].
    pub leak_prefix_len: usize,
    /// How long the caller will wait for the collection thread to reach the
    /// fork point before giving up with [`crate::error::DetectorError::Timeout`].
    pub semaphore_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            leak_prefix_len: DEFAULT_LEAK_PREFIX_LEN,
            semaphore_timeout: Duration::from_secs(100),
        }
    }
}

impl DetectorConfig {
    pub fn clamped_prefix_len(&self) -> usize {
        self.leak_prefix_len.min(MAX_LEAK_PREFIX_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_flags_pack_into_one_byte() {
        let flags = AllocFlags {
            marked: true,
            referenced_from_root: false,
        };
        let bytes = flags.pack().unwrap();
        assert_eq!(bytes.len(), 1);
        let back = AllocFlags::unpack(&bytes).unwrap();
        assert_eq!(back, flags);
    }
}
