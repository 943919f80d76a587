// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use thiserror::Error;

/// The error taxonomy for the detector. Every fallible boundary in the crate
/// returns one of these variants instead of a bare `bool`.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// Attach refused, `/proc` unreadable, or another permission failure.
    #[error("insufficient privilege to inspect target process")]
    Privilege(#[source] io::Error),

    /// Fork, pipe, or arena exhaustion.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Truncated pipe stream or unexpected framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The continuation semaphore was not posted within the configured bound.
    #[error("timed out waiting for collection thread to reach the fork point")]
    Timeout,

    /// `/proc/<pid>/maps` could not be parsed.
    #[error("failed to parse process mappings: {0}")]
    Data(String),

    /// A `nix` system call failed in a way not covered by the above.
    #[error("system call failed")]
    Nix(#[source] nix::Error),
}

impl From<nix::Error> for DetectorError {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::EPERM | nix::Error::EACCES => {
                DetectorError::Privilege(io::Error::from(e))
            }
            other => DetectorError::Nix(other),
        }
    }
}

impl From<io::Error> for DetectorError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => DetectorError::Privilege(e),
            _ => DetectorError::Resource(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;
