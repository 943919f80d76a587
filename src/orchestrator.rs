// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component F: the orchestrator.
//!
//! Ties every other component into the six-phase detection pass:
//!
//!   P0  caller disables its own allocator (the target is itself, in-process).
//!   P1  a dedicated collection thread freezes every other thread, captures
//!       registers and `/proc/<pid>/maps`, then releases the caller's own
//!       thread early so it can drop its malloc guard while the rest of the
//!       process stays frozen.
//!   P2  the caller, once woken, drops its guard and waits for the
//!       collection thread to finish.
//!   P3  the collection thread `fork()`s; the child re-disables its own
//!       allocator, classifies the frozen mappings, walks the heap, marks
//!       from roots, and writes totals and leaks down the pipe.
//!   P4  the collection thread returns, releasing every thread it still
//!       holds captured (via `PtraceThreadCapture`'s `Drop`).
//!   P5  the caller reads the pipe and assembles the result.
//!
//! `fork()` inside a multithreaded process only carries the calling thread
//! into the child; every lock held by a sibling thread at that instant stays
//! held forever in the child's copy. The whole freeze dance exists to make
//! that safe: by the time `fork()` runs, every thread but the forking one is
//! stopped at a known point, so no lock the child might need is mid-acquire.

use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use nix::unistd::{fork, ForkResult};

use crate::arena::SharedArena;
use crate::arena_vec::ArenaVec;
use crate::capture::{PtraceThreadCapture, ThreadCapture};
use crate::classify::{ClassifiedMappings, ClassifyPolicy, DefaultClassifyPolicy};
use crate::error::{DetectorError, Result};
use crate::heap_iter::HeapIterator;
use crate::mark::{self, LiveAddressSpace, PlainRootScanner, RootRange};
use crate::maps::read_process_mappings;
use crate::pipe::LeakPipe;
use crate::registry::IntervalRegistry;
use crate::sync::{MallocGuard, MallocQuiescence, NullMallocQuiescence, Semaphore};
use crate::types::{DetectorConfig, Leak, Mapping, ThreadInfo, UnreachableMemoryInfo};

/// `HeapIterator` fallback used when no allocator-specific introspection
/// hook is wired in: the whole heap mapping is reported as a single
/// allocation. This undercounts individual leaks but never misses the
/// memory itself, so it is a conservative default rather than a stub.
struct WholeMappingHeapIterator;

impl HeapIterator for WholeMappingHeapIterator {
    fn iterate(&self, mapping: &Mapping, f: &mut dyn FnMut(usize, usize)) {
        f(mapping.range.begin, mapping.range.len());
    }
}

fn gettid() -> i32 {
    // Safety: SYS_gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Everything the collection thread needs, gathered before it starts so
/// `fork()` carries a ready-to-use snapshot into the child.
struct Pass {
    config: DetectorConfig,
    hooks: Arc<dyn MallocQuiescence>,
    heap_iter: Arc<dyn HeapIterator + Send + Sync>,
    classify: Arc<dyn ClassifyPolicy + Send + Sync>,
}

/// Run one detection pass against the calling process and return the
/// aggregate result. Safe to call repeatedly; each call is independent.
/// Uses the default `ClassifyPolicy`/`HeapIterator`/`MallocQuiescence`; to
/// substitute any of them, call [`get_unreachable_memory_with_hooks`]
/// instead.
pub fn get_unreachable_memory(config: &DetectorConfig) -> Result<UnreachableMemoryInfo> {
    get_unreachable_memory_with_hooks(
        config,
        Arc::new(DefaultClassifyPolicy),
        Arc::new(WholeMappingHeapIterator),
        Arc::new(NullMallocQuiescence::new()),
    )
}

/// Run one detection pass with caller-supplied `ClassifyPolicy`,
/// `HeapIterator`, and `MallocQuiescence` implementations. This is the
/// documented extension point for platform integrations that have a real
/// allocator hook (e.g. `jemalloc`/`bionic` malloc internals) instead of the
/// portable defaults.
pub fn get_unreachable_memory_with_hooks(
    config: &DetectorConfig,
    classify: Arc<dyn ClassifyPolicy + Send + Sync>,
    heap_iter: Arc<dyn HeapIterator + Send + Sync>,
    hooks: Arc<dyn MallocQuiescence>,
) -> Result<UnreachableMemoryInfo> {
    run_pass(Pass {
        config: config.clone(),
        hooks,
        heap_iter,
        classify,
    })
}

fn run_pass(pass: Pass) -> Result<UnreachableMemoryInfo> {
    let parent_pid = std::process::id() as i32;
    let parent_tid = gettid();

    let pipe = LeakPipe::new()?;
    let continue_sem = Arc::new(Semaphore::new());
    // Created before the guard is acquired (P0 setup, not yet inside the
    // critical section), then shared across the collection thread and
    // through fork(): safe because every sibling thread is ptrace-frozen by
    // the time fork() runs, and this thread is done touching the arena's
    // mutex well before it posts the semaphore and forks.
    let arena = SharedArena::new();

    // P0: caller quiesces its own allocator before any other thread is
    // touched, freezing happens only after the allocator is quiesced.
    let guard = MallocGuard::new(pass.hooks.clone());

    let thread_sem = Arc::clone(&continue_sem);
    let thread_pipe = pipe;
    let thread_hooks = Arc::clone(&pass.hooks);
    let thread_heap_iter = Arc::clone(&pass.heap_iter);
    let thread_classify = Arc::clone(&pass.classify);
    let thread_limit = pass.config.limit;
    let thread_prefix_len = pass.config.clamped_prefix_len();
    let thread_arena = arena.clone();

    let collector = thread::spawn(move || {
        collection_thread_body(
            parent_pid,
            parent_tid,
            &thread_sem,
            thread_pipe,
            thread_hooks,
            thread_heap_iter,
            thread_classify,
            thread_limit,
            thread_prefix_len,
            thread_arena,
        )
    });

    // P2: wait for the collection thread to either hand control back (after
    // releasing our own thread, pre-fork) or fail outright.
    let wait_result = continue_sem.wait(pass.config.semaphore_timeout);
    drop(guard);
    wait_result?;

    // P4/P5: the collection thread returns once fork() has happened and it
    // has released every thread it still held; join before reading the pipe
    // so a pre-fork failure surfaces as this thread's own error.
    let collector_result = collector
        .join()
        .map_err(|_| DetectorError::Resource("collection thread panicked".into()))?;
    let receiver_pipe = collector_result?;

    let mut receiver = receiver_pipe.open_receiver()?;
    let num_allocations = receiver.recv_usize()?;
    let allocation_bytes = receiver.recv_usize()?;
    let num_leaks = receiver.recv_usize()?;
    let leak_bytes = receiver.recv_usize()?;
    let leaks = receiver.recv_leaks()?;

    Ok(UnreachableMemoryInfo {
        num_allocations,
        allocation_bytes,
        num_leaks,
        leak_bytes,
        leaks,
    })
}

/// Body of the dedicated collection thread (P1 and the parent side of P3/P4).
/// Returns the pipe for the caller to open a receiver on once this thread
/// has rejoined, or an error if anything before `fork()` failed.
#[allow(clippy::too_many_arguments)]
fn collection_thread_body(
    parent_pid: i32,
    parent_tid: i32,
    continue_sem: &Semaphore,
    pipe: LeakPipe,
    hooks: Arc<dyn MallocQuiescence>,
    heap_iter: Arc<dyn HeapIterator + Send + Sync>,
    classify: Arc<dyn ClassifyPolicy + Send + Sync>,
    limit: usize,
    prefix_len: usize,
    arena: SharedArena,
) -> Result<LeakPipe> {
    let mut capture = PtraceThreadCapture::new(parent_pid, arena.clone());
    let own_tid = gettid();

    // Exclude ourselves: a thread can't PTRACE_ATTACH itself. Every other
    // thread, including the caller itself, gets frozen here.
    capture.capture_threads(own_tid)?;
    let thread_info = capture.captured_thread_info()?;
    let mappings = read_process_mappings(parent_pid, arena.clone())?;

    // Let the caller run again so it can drop its own malloc guard; every
    // other thread of the process stays frozen until this function returns.
    capture.release_thread(parent_tid)?;
    continue_sem.post();

    // Safety: every thread but this one is stopped at a ptrace-verified
    // SIGSTOP, so no lock the walker child might touch is mid-acquire.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let exit_code = walker_child_main(
                pipe,
                hooks,
                heap_iter,
                classify,
                thread_info,
                mappings,
                limit,
                prefix_len,
                arena,
            );
            // Safety: bypasses Rust destructors for locks inherited,
            // possibly held, from sibling threads frozen at fork time.
            unsafe { libc::_exit(exit_code) };
        }
        Ok(ForkResult::Parent { child }) => {
            debug!("walker child pid {} forked", child);
            // capture's Drop releases every thread still frozen here.
            Ok(pipe)
        }
        Err(e) => Err(e.into()),
    }
}

/// Runs entirely inside the forked walker child. Never returns to its
/// caller: every path ends in the process calling `_exit`, so this function
/// just computes the exit code.
#[allow(clippy::too_many_arguments)]
fn walker_child_main(
    pipe: LeakPipe,
    hooks: Arc<dyn MallocQuiescence>,
    heap_iter: Arc<dyn HeapIterator + Send + Sync>,
    classify: Arc<dyn ClassifyPolicy + Send + Sync>,
    threads: ArenaVec<ThreadInfo>,
    mappings: ArenaVec<Mapping>,
    limit: usize,
    prefix_len: usize,
    arena: SharedArena,
) -> i32 {
    // The walker child never returns, so its guard is never dropped; that is
    // fine, the allocator state dies with this process at _exit.
    let _guard = MallocGuard::new(hooks);

    let mut sender = match pipe.open_sender() {
        Ok(s) => s,
        Err(e) => {
            warn!("walker child: failed to open leak pipe sender: {}", e);
            return 1;
        }
    };

    let result = collect_and_mark(
        &classify,
        &heap_iter,
        threads.as_slice(),
        mappings.as_slice(),
        limit,
        prefix_len,
        arena,
    );
    let collected = match result {
        Ok(collected) => collected,
        Err(e) => {
            warn!("walker child: collection failed: {}", e);
            return 2;
        }
    };

    if let Err(e) = send_result(&mut sender, &collected) {
        warn!("walker child: failed to send result: {}", e);
        return 3;
    }

    0
}

/// Everything the walker child gathers before handing results across the
/// pipe. Arena-backed throughout -- this is built and torn down entirely
/// within the critical section, so none of it may touch the target
/// allocator. `UnreachableMemoryInfo` (plain `Vec`-based) is only ever
/// assembled afterwards, on the caller's side of the pipe.
struct CollectedLeaks {
    num_allocations: usize,
    allocation_bytes: usize,
    num_leaks: usize,
    leak_bytes: usize,
    leaks: ArenaVec<Leak>,
}

fn send_result(sender: &mut crate::pipe::LeakSender, info: &CollectedLeaks) -> Result<()> {
    sender.send_usize(info.num_allocations)?;
    sender.send_usize(info.allocation_bytes)?;
    sender.send_usize(info.num_leaks)?;
    sender.send_usize(info.leak_bytes)?;
    sender.send_leaks(info.leaks.as_slice())
}

/// Classify the frozen mappings, register every allocation candidate, mark
/// from every root, and summarize what never got marked. Runs only in the
/// walker child, against its own (copy-on-write) address space. Every
/// container built here draws from `arena`, never the global allocator.
fn collect_and_mark(
    classify: &Arc<dyn ClassifyPolicy + Send + Sync>,
    heap_iter: &Arc<dyn HeapIterator + Send + Sync>,
    threads: &[ThreadInfo],
    mappings: &[Mapping],
    limit: usize,
    prefix_len: usize,
    arena: SharedArena,
) -> Result<CollectedLeaks> {
    let mut registry = IntervalRegistry::new(arena.clone());

    let ClassifiedMappings { heap, anon, globals, stack } =
        classify.classify(mappings, arena.clone())?;

    for mapping in heap.iter() {
        let mut insert_err = None;
        heap_iter.iterate(mapping, &mut |base, size| {
            if insert_err.is_none() {
                if let Err(e) = registry.insert(base, base + size) {
                    insert_err = Some(e);
                }
            }
        });
        if let Some(e) = insert_err {
            return Err(e);
        }
    }
    // Unclassified anonymous mappings: never populated by the default
    // policy table, but an override (or a future rule) may add to it, and
    // each one becomes a single allocation spanning the whole mapping.
    for mapping in anon.iter() {
        registry.insert(mapping.range.begin, mapping.range.end)?;
    }

    let mut roots: ArenaVec<RootRange<'_>> = ArenaVec::new(arena.clone());

    for info in threads {
        roots.push(RootRange { bytes: info.regs(), base: 0 })?;
    }

    // Thread stacks: scan from the captured stack pointer to the top of
    // whichever stack mapping contains it, not the whole mapping -- the
    // portion below the pointer is unused stack space from a prior frame.
    for info in threads {
        if info.stack_pointer == 0 {
            continue;
        }
        if let Some(m) = stack.iter().find(|m| m.range.contains(info.stack_pointer)) {
            let len = m.range.end - info.stack_pointer;
            // Safety: `info.stack_pointer..m.range.end` lies within a
            // mapping read directly from this (walker child) process's own
            // /proc/self-equivalent maps snapshot.
            let bytes = unsafe { std::slice::from_raw_parts(info.stack_pointer as *const u8, len) };
            roots.push(RootRange { bytes, base: 0 })?;
        }
    }

    for mapping in globals.iter() {
        // Safety: `mapping` was read from this same process's maps file and
        // is frozen for the duration of the walker child's lifetime.
        let bytes = unsafe {
            std::slice::from_raw_parts(mapping.range.begin as *const u8, mapping.range.len())
        };
        roots.push(RootRange { bytes, base: 0 })?;
    }

    mark::mark(arena.clone(), &mut registry, roots.as_slice(), &LiveAddressSpace, &PlainRootScanner)?;

    let (leaked_ranges, num_leaks, leak_bytes) = registry.leaked(limit)?;
    let mut leaks: ArenaVec<Leak> = ArenaVec::new(arena);
    for range in leaked_ranges.iter() {
        let copy_len = range.len().min(prefix_len);
        // Safety: `range` came from the registry, which only ever holds
        // ranges taken from this process's own mapped memory.
        let contents =
            unsafe { std::slice::from_raw_parts(range.begin as *const u8, copy_len) };
        leaks.push(Leak::new(range.begin, range.len(), contents))?;
    }

    Ok(CollectedLeaks {
        num_allocations: registry.count(),
        allocation_bytes: registry.total_bytes(),
        num_leaks,
        leak_bytes,
        leaks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Range;

    /// `WholeMappingHeapIterator` is the only piece of this module that can
    /// be exercised without real ptrace/fork privilege; the full pass is
    /// covered by the crate's `#[ignore]`d integration test instead.
    #[test]
    fn whole_mapping_heap_iterator_reports_one_allocation() {
        let mapping = Mapping::new(Range::new(0x1000, 0x2000), true, true, false, "[anon:libc_malloc]");
        let mut seen = Vec::new();
        WholeMappingHeapIterator.iterate(&mapping, &mut |base, size| seen.push((base, size)));
        assert_eq!(seen, vec![(0x1000, 0x1000)]);
    }
}
