// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A conservative, fork-based unreachable-memory detector for POSIX
//! processes.
//!
//! Modeled on Android's `libmemunreachable`: freeze every thread of the
//! calling process with `ptrace`, `fork()` a private copy-on-write snapshot
//! of the whole address space, and run a Boehm-style mark-sweep trace over
//! that snapshot from a root set built out of thread registers, thread
//! stacks, and classified global mappings. Anything not reached is a leak.
//! The walk happens entirely in the forked child so the live process never
//! observes a partial trace, and the child reports its findings back to the
//! caller over a pipe before exiting.
//!
//! ```no_run
//! let info = leakwalk::get_unreachable_memory(&leakwalk::DetectorConfig::default())?;
//! println!("{} bytes leaked across {} allocations", info.leak_bytes, info.num_leaks);
//! # Ok::<(), leakwalk::DetectorError>(())
//! ```

mod arena;
mod arena_vec;
mod capture;
mod classify;
mod error;
mod heap_iter;
mod mark;
mod maps;
mod orchestrator;
mod pipe;
mod range;
mod registry;
mod sync;
mod types;

pub use error::{DetectorError, Result};
pub use orchestrator::{get_unreachable_memory, get_unreachable_memory_with_hooks};
pub use types::{
    Allocation, DetectorConfig, Leak, Mapping, MappingKind, ThreadInfo, UnreachableMemoryInfo,
    DEFAULT_LEAK_PREFIX_LEN, MAX_LEAK_PREFIX_LEN,
};

pub use arena::SharedArena;
pub use arena_vec::ArenaVec;
pub use capture::{PtraceThreadCapture, ThreadCapture};
pub use classify::{ClassifiedMappings, ClassifyPolicy, DefaultClassifyPolicy};
pub use heap_iter::{call_with_trampoline, trampoline, HeapIterator};
pub use mark::{AddressSpace, LiveAddressSpace, PlainRootScanner, RootRange, RootScanner};
pub use maps::read_process_mappings;
pub use range::Range;
pub use sync::{MallocGuard, MallocQuiescence, NullMallocQuiescence, Semaphore};

/// Run a detection pass and log a human-readable summary of every leak
/// found, in the style of the original `LogUnreachable`/`ALOGE` hex dump:
/// one line per leak giving its address and size, optionally followed by
/// its leading bytes.
pub fn log_unreachable_memory(config: &DetectorConfig, log_contents: bool) -> Result<()> {
    let info = get_unreachable_memory(config)?;

    log::warn!(
        "{} bytes unreachable across {} leaks ({} bytes live across {} allocations)",
        info.leak_bytes,
        info.num_leaks,
        info.allocation_bytes,
        info.num_allocations,
    );

    for leak in &info.leaks {
        if log_contents {
            log::warn!(
                "leak 0x{:x} size {}: {}",
                leak.begin,
                leak.size,
                hex_dump(leak.contents())
            );
        } else {
            log::warn!("leak 0x{:x} size {}", leak.begin, leak.size);
        }
    }

    Ok(())
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}
