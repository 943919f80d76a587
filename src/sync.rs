// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component H: the continuation semaphore and the scoped malloc guard.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{DetectorError, Result};

/// A counting semaphore with a timed wait, used exactly once per detection
/// pass: the collection thread posts it right before `fork()`, and the
/// caller waits on it with a generous bound before giving up.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Wait until posted or `timeout` elapses, whichever comes first.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            return Ok(());
        }
        let result = self.condvar.wait_for(&mut count, timeout);
        if result.timed_out() {
            return Err(DetectorError::Timeout);
        }
        if *count > 0 {
            *count -= 1;
        }
        Ok(())
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook point for actually quiescing the target's allocator. The real
/// Android implementation hooks `jemalloc`/`bionic` malloc internals
/// directly; a portable Rust crate cannot assume such a hook exists, so this
/// trait is the documented extension point a platform integration plugs a
/// real `malloc_disable`/`malloc_enable` pair into. The default
/// implementation below serialises against the process's *own* allocations
/// with a recursive counter, which is sufficient for the guarantee this
/// crate actually needs: no detector code path calls into it while held.
pub trait MallocQuiescence: Send + Sync {
    fn disable(&self);
    fn enable(&self);
}

/// Default `MallocQuiescence`: a simple reentrant gate. It does not truly
/// suspend the target's malloc implementation (that requires a platform
/// hook this crate does not assume), but it does give the detector itself a
/// `Sync` point to observe "am I inside the critical section" from test
/// code. A platform integration substitutes a real hook by implementing
/// this trait and passing it to
/// [`crate::get_unreachable_memory_with_hooks`] instead of this default.
pub struct NullMallocQuiescence {
    depth: AtomicUsize,
    engaged: AtomicBool,
}

impl NullMallocQuiescence {
    pub fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            engaged: AtomicBool::new(false),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

impl Default for NullMallocQuiescence {
    fn default() -> Self {
        Self::new()
    }
}

impl MallocQuiescence for NullMallocQuiescence {
    fn disable(&self) {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.engaged.store(true, Ordering::SeqCst);
        }
    }

    fn enable(&self) {
        if self.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.engaged.store(false, Ordering::SeqCst);
        }
    }
}

/// RAII guard: acquisition disables the target allocator, release
/// re-enables it on every exit path of the enclosing scope, including
/// unwinding.
pub struct MallocGuard {
    hooks: Arc<dyn MallocQuiescence>,
}

impl MallocGuard {
    pub fn new(hooks: Arc<dyn MallocQuiescence>) -> Self {
        hooks.disable();
        Self { hooks }
    }
}

impl Drop for MallocGuard {
    fn drop(&mut self) {
        self.hooks.enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn semaphore_wait_blocks_until_posted() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem2.post();
        });
        let start = Instant::now();
        sem.wait(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        handle.join().unwrap();
    }

    #[test]
    fn semaphore_wait_times_out() {
        let sem = Semaphore::new();
        let err = sem.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DetectorError::Timeout));
    }

    #[test]
    fn malloc_guard_is_reentrant_and_releases_on_drop() {
        let hooks = Arc::new(NullMallocQuiescence::new());
        assert!(!hooks.is_engaged());
        {
            let _outer = MallocGuard::new(hooks.clone());
            assert!(hooks.is_engaged());
            {
                let _inner = MallocGuard::new(hooks.clone());
                assert!(hooks.is_engaged());
            }
            assert!(hooks.is_engaged(), "outer guard still held");
        }
        assert!(!hooks.is_engaged());
    }
}
