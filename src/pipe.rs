// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component G: the leak pipe.
//!
//! A typed one-shot channel over an anonymous pipe, carrying the four
//! scalar totals followed by the length-prefixed leak vector, in that fixed
//! order. The sender lives in the forked walker child; the receiver is
//! opened by the caller only after the child has begun exiting, so no other
//! descendant of the caller can inherit the descriptor.

use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

use crate::error::{DetectorError, Result};
use crate::types::{Leak, MAX_LEAK_PREFIX_LEN};

/// Raw pipe fds, cheap to copy: before `fork()` this is just two integers
/// referring to descriptors already open in the current process's fd table,
/// and after `fork()` the child inherits its own copy of that same table.
#[derive(Clone, Copy)]
pub struct LeakPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl LeakPipe {
    /// Create the underlying anonymous pipe. Must be called before `fork()`
    /// so both sides share the descriptors; each side then calls
    /// `open_sender`/`open_receiver` to get a typed handle and relinquish
    /// the fd it does not own.
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // Safety: `fds` is a valid, writable 2-element array as required by
        // pipe2(2).
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret != 0 {
            return Err(DetectorError::Resource(format!(
                "pipe2 failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Consume into the sender half (the walker child's role). Closes the
    /// unused read end.
    pub fn open_sender(self) -> Result<LeakSender> {
        // Safety: `read_fd` was produced by the pipe2 call above and has not
        // been closed yet.
        unsafe { libc::close(self.read_fd) };
        Ok(LeakSender {
            // Safety: `write_fd` is a valid, open fd owned by this process.
            file: unsafe { std::fs::File::from_raw_fd(self.write_fd) },
        })
    }

    /// Consume into the receiver half (the caller's role). Closes the
    /// unused write end.
    pub fn open_receiver(self) -> Result<LeakReceiver> {
        // Safety: see `open_sender`.
        unsafe { libc::close(self.write_fd) };
        Ok(LeakReceiver {
            file: unsafe { std::fs::File::from_raw_fd(self.read_fd) },
        })
    }
}

pub struct LeakSender {
    file: std::fs::File,
}

impl LeakSender {
    pub fn send_usize(&mut self, value: usize) -> Result<()> {
        self.file
            .write_all(&value.to_ne_bytes())
            .map_err(|e| protocol_err("send scalar", e))
    }

    pub fn send_leaks(&mut self, leaks: &[Leak]) -> Result<()> {
        self.send_usize(leaks.len())?;
        for leak in leaks {
            self.send_usize(leak.begin)?;
            self.send_usize(leak.size)?;
            self.send_usize(leak.contents().len())?;
            self.file
                .write_all(leak.contents())
                .map_err(|e| protocol_err("send leak contents", e))?;
        }
        Ok(())
    }
}

pub struct LeakReceiver {
    file: std::fs::File,
}

impl LeakReceiver {
    pub fn recv_usize(&mut self) -> Result<usize> {
        let mut buf = [0u8; std::mem::size_of::<usize>()];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| protocol_err("receive scalar", e))?;
        Ok(usize::from_ne_bytes(buf))
    }

    pub fn recv_leaks(&mut self) -> Result<Vec<Leak>> {
        let count = self.recv_usize()?;
        let mut leaks = Vec::with_capacity(count);
        for _ in 0..count {
            let begin = self.recv_usize()?;
            let size = self.recv_usize()?;
            let contents_len = self.recv_usize()?;
            if contents_len > MAX_LEAK_PREFIX_LEN {
                return Err(DetectorError::Protocol(format!(
                    "leak contents length {} exceeds MAX_LEAK_PREFIX_LEN ({})",
                    contents_len, MAX_LEAK_PREFIX_LEN
                )));
            }
            let mut contents = vec![0u8; contents_len];
            self.file
                .read_exact(&mut contents)
                .map_err(|e| protocol_err("receive leak contents", e))?;
            leaks.push(Leak::new(begin, size, &contents));
        }
        Ok(leaks)
    }
}

fn protocol_err(what: &str, e: std::io::Error) -> DetectorError {
    DetectorError::Protocol(format!("{}: {}", what, e))
}
