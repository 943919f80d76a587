// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component I: the `/proc/<pid>/maps` parser. Malformed lines are skipped
//! with a logged warning rather than aborting the whole parse -- only a
//! total read/parse failure is a [`DetectorError::Data`].

use std::fs;

use log::warn;

use crate::arena::SharedArena;
use crate::arena_vec::ArenaVec;
use crate::error::{DetectorError, Result};
use crate::range::Range;
use crate::types::Mapping;

pub fn read_process_mappings(pid: i32, arena: SharedArena) -> Result<ArenaVec<Mapping>> {
    let path = format!("/proc/{}/maps", pid);
    let contents = fs::read_to_string(&path)
        .map_err(|e| DetectorError::Data(format!("reading {}: {}", path, e)))?;
    parse_maps(&contents, arena)
}

/// Parse the textual contents of a `/proc/<pid>/maps` file. Pure function of
/// its inputs (plus the arena to draw storage from), so it is easy to unit
/// test.
pub fn parse_maps(contents: &str, arena: SharedArena) -> Result<ArenaVec<Mapping>> {
    let mut mappings = ArenaVec::new(arena);

    for line in contents.lines() {
        match parse_line(line) {
            Some(m) => mappings.push(m)?,
            None => warn!("skipping unparsable /proc/pid/maps line: {:?}", line),
        }
    }

    Ok(mappings)
}

fn parse_line(line: &str) -> Option<Mapping> {
    // Format: "7f2c1e9d2000-7f2c1e9d3000 rw-p 00000000 00:00 0   [heap]"
    let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let addrs = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let name = fields.next().unwrap_or("").trim_start().to_string();

    let (begin_str, end_str) = addrs.split_once('-')?;
    let begin = usize::from_str_radix(begin_str, 16).ok()?;
    let end = usize::from_str_radix(end_str, 16).ok()?;
    if begin >= end {
        return None;
    }

    let mut perm_chars = perms.chars();
    let read = perm_chars.next()? == 'r';
    let write = perm_chars.next()? == 'w';
    let execute = perm_chars.next()? == 'x';

    Some(Mapping::new(Range::new(begin, end), read, write, execute, &name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_lines() {
        let sample = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/cat
7f2c1e9d2000-7f2c1e9d3000 rw-p 00000000 00:00 0    [heap]
7ffedcba1000-7ffedcba2000 rw-p 00000000 00:00 0    [stack]
7f2c1e7b0000-7f2c1e7b1000 rw-p 00000000 00:00 0
";
        let mappings = parse_maps(sample, SharedArena::new()).unwrap();
        assert_eq!(mappings.len(), 4);
        assert_eq!(mappings[0].name(), "/usr/bin/cat");
        assert!(mappings[0].execute && mappings[0].read && !mappings[0].write);
        assert_eq!(mappings[1].name(), "[heap]");
        assert_eq!(mappings[2].name(), "[stack]");
        assert_eq!(mappings[3].name(), "");
        assert_eq!(mappings[3].range.begin, 0x7f2c1e7b0000);
        assert_eq!(mappings[3].range.end, 0x7f2c1e7b1000);
    }

    #[test]
    fn skips_unparsable_lines_without_failing() {
        let sample = "garbage line that is not a mapping\n00400000-00452000 r-xp 00000000 08:02 173521 /bin/true\n";
        let mappings = parse_maps(sample, SharedArena::new()).unwrap();
        assert_eq!(mappings.len(), 1);
    }
}
