// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component E: the thread capture interface.
//!
//! Captures every thread of the target process, register file and all, so
//! the mark phase has a complete, frozen root set to scan. Built in the
//! style of a minidump-style ptrace dumper:
//! enumerate `/proc/<pid>/task`, `PTRACE_ATTACH` each thread, wait for
//! `SIGSTOP` (reinjecting any other pending signal), read registers with
//! `PTRACE_GETREGS`, and `PTRACE_DETACH` on release. `ESRCH` anywhere in
//! this dance means the thread already exited and is treated as benign, not
//! an error.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::mem;

use log::warn;

use crate::arena::SharedArena;
use crate::arena_vec::ArenaVec;
use crate::error::{DetectorError, Result};
use crate::types::ThreadInfo;

/// Contract consumed from the ptrace helper. A test double can implement
/// this to exercise the orchestrator without real ptrace privilege.
pub trait ThreadCapture {
    /// Stop every thread of the target except `exclude_tid`.
    fn capture_threads(&mut self, exclude_tid: i32) -> Result<()>;
    /// Registers and stack pointer for each currently-captured thread.
    fn captured_thread_info(&self) -> Result<ArenaVec<ThreadInfo>>;
    /// Resume a single captured thread (used to unfreeze the caller early).
    fn release_thread(&mut self, tid: i32) -> Result<()>;
}

fn ptrace_detach_benign(pid: Pid) -> Result<()> {
    match ptrace::detach(pid, None) {
        Ok(()) => Ok(()),
        Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Real Linux backend over `nix::sys::ptrace`.
pub struct PtraceThreadCapture {
    pid: i32,
    arena: SharedArena,
    captured: ArenaVec<i32>,
}

impl PtraceThreadCapture {
    pub fn new(pid: i32, arena: SharedArena) -> Self {
        Self {
            pid,
            captured: ArenaVec::new(arena.clone()),
            arena,
        }
    }

    fn enumerate_tids(&self) -> Result<ArenaVec<i32>> {
        let task_dir = format!("/proc/{}/task", self.pid);
        let entries = fs::read_dir(&task_dir)
            .map_err(|e| DetectorError::Data(format!("reading {}: {}", task_dir, e)))?;
        let mut tids = ArenaVec::new(self.arena.clone());
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
                tids.push(tid)?;
            }
        }
        Ok(tids)
    }

    fn suspend_one(tid: i32) -> Result<bool> {
        let pid = Pid::from_raw(tid);
        if let Err(e) = ptrace::attach(pid) {
            if e == nix::Error::ESRCH {
                return Ok(false); // thread already gone
            }
            return Err(e.into());
        }

        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, sig)) => {
                    if sig == Signal::SIGSTOP {
                        return Ok(true);
                    }
                    // Not our SIGSTOP: reinject so the signal is not lost,
                    // keep waiting for the real stop.
                    if let Err(e) = ptrace::cont(pid, Some(sig)) {
                        if e == nix::Error::ESRCH {
                            return Ok(false);
                        }
                        return Err(e.into());
                    }
                }
                Ok(_) => {
                    let _ = ptrace_detach_benign(pid);
                    return Ok(false);
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::ESRCH) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl ThreadCapture for PtraceThreadCapture {
    fn capture_threads(&mut self, exclude_tid: i32) -> Result<()> {
        let tids = self.enumerate_tids()?;
        for tid in tids {
            if tid == exclude_tid {
                continue;
            }
            match Self::suspend_one(tid) {
                Ok(true) => self.captured.push(tid)?,
                Ok(false) => {
                    // Non-fatal: the thread died mid-attach, or was otherwise
                    // unavailable. Skip it; the thread just never contributes a root/allocation.
                    warn!("thread {} could not be captured, skipping", tid);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn captured_thread_info(&self) -> Result<ArenaVec<ThreadInfo>> {
        let mut out = ArenaVec::new(self.arena.clone());
        for &tid in self.captured.iter() {
            let pid = Pid::from_raw(tid);
            let regs = match ptrace::getregs(pid) {
                Ok(r) => r,
                Err(nix::Error::ESRCH) => continue,
                Err(e) => return Err(e.into()),
            };

            let sp = stack_pointer(&regs);
            // Safety: `user_regs_struct` is a plain-old-data struct; viewing
            // it as bytes for word-aligned scanning does not read
            // uninitialized memory since ptrace fully populates it.
            let regs_bytes = unsafe {
                std::slice::from_raw_parts(
                    &regs as *const _ as *const u8,
                    mem::size_of_val(&regs),
                )
            };

            out.push(ThreadInfo::new(tid, regs_bytes, sp)?)?;
        }
        Ok(out)
    }

    fn release_thread(&mut self, tid: i32) -> Result<()> {
        if let Some(pos) = self.captured.iter().position(|&t| t == tid) {
            self.captured.swap_remove(pos);
        }
        ptrace_detach_benign(Pid::from_raw(tid))
    }
}

impl Drop for PtraceThreadCapture {
    fn drop(&mut self) {
        while let Some(tid) = self.captured.pop() {
            let _ = ptrace_detach_benign(Pid::from_raw(tid));
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn stack_pointer(regs: &libc::user_regs_struct) -> usize {
    regs.rsp as usize
}

#[cfg(target_arch = "aarch64")]
fn stack_pointer(regs: &libc::user_regs_struct) -> usize {
    regs.sp as usize
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("leakwalk's ThreadCapture backend needs a stack_pointer() accessor for this architecture");
