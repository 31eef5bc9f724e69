//! Per-page kernel flags from `/proc/self/pagemap`.
//!
//! Each page has one 64-bit entry. Only two bits matter here: whether the
//! page is present in memory and whether it was written since soft-dirty
//! tracking was last cleared.

use std::io;

use crate::space::AddressSpace;

/// Entries fetched per read.
pub const PAGEMAP_CHUNK: usize = 512;

/// One pagemap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagemapEntry(pub u64);

impl PagemapEntry {
    pub const PRESENT: u64 = 1 << 63;
    pub const SOFT_DIRTY: u64 = 1 << 55;

    /// What to assume when the pagemap cannot be consulted.
    pub const UNKNOWN: PagemapEntry = PagemapEntry(Self::PRESENT | Self::SOFT_DIRTY);

    pub fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn soft_dirty(self) -> bool {
        self.0 & Self::SOFT_DIRTY != 0
    }
}

/// Byte offset of the entry for `addr` within the pagemap file.
pub fn entry_offset(addr: usize) -> u64 {
    (addr as u64 / crate::page::PAGE_SIZE as u64) * 8
}

/// Sequential reader over the entries of one area.
pub struct PagemapCursor {
    buf: [u64; PAGEMAP_CHUNK],
    filled: usize,
    index: usize,
    next_addr: usize,
    remaining: usize,
    enabled: bool,
}

impl PagemapCursor {
    /// Walk `pages` entries starting at `start`. A disabled cursor reports
    /// [`PagemapEntry::UNKNOWN`] without any I/O.
    pub fn new(start: usize, pages: usize, enabled: bool) -> Self {
        PagemapCursor {
            buf: [0; PAGEMAP_CHUNK],
            filled: 0,
            index: 0,
            next_addr: start,
            remaining: pages,
            enabled,
        }
    }

    /// Entry for the next page.
    pub fn next_entry<S: AddressSpace + ?Sized>(&mut self, space: &S) -> io::Result<PagemapEntry> {
        if !self.enabled {
            return Ok(PagemapEntry::UNKNOWN);
        }
        if self.index == self.filled {
            if self.remaining == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            let n = self.remaining.min(PAGEMAP_CHUNK);
            space.read_pagemap(self.next_addr, &mut self.buf[..n])?;
            self.next_addr += n * crate::page::PAGE_SIZE;
            self.remaining -= n;
            self.filled = n;
            self.index = 0;
        }
        let entry = PagemapEntry(self.buf[self.index]);
        self.index += 1;
        Ok(entry)
    }
}
