//! The process address space as seen by the engine.
//!
//! Every memory-management primitive the engine needs goes through the
//! [`AddressSpace`] trait. The live implementation issues raw syscalls
//! against the calling process; the simulated one keeps an in-memory model
//! so the reconciler and the save/restore engines can be exercised without
//! rewriting the test process.

pub mod live;
#[cfg(any(test, feature = "test-utils"))]
pub mod sim;

pub use live::LiveAddressSpace;
#[cfg(any(test, feature = "test-utils"))]
pub use sim::{SimOp, SimulatedAddressSpace};

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::path::Path;

use crate::area::{AreaName, Protection};
use crate::page::PAGE_SIZE;

/// What a new mapping is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Anonymous,
    File { fd: RawFd, offset: u64 },
}

/// A fixed-address mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub addr: usize,
    pub len: usize,
    pub prot: Protection,
    pub shared: bool,
    pub backing: Backing,
}

/// Access-pattern hint for a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Sequential,
    Normal,
}

/// An opened backing file and its current length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingFile {
    pub fd: RawFd,
    pub len: u64,
}

/// Result of asking for a child process to perform a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Still in the caller; the child pid is given.
    Parent { child: i32 },
    /// Running in the child.
    Child,
    /// Forking is not possible; save inline.
    Unavailable,
}

/// Memory-management primitives used by the engine.
///
/// Addresses and lengths are always page aligned. Mutating calls report
/// failure through `io::Result`; callers decide whether a failure is fatal.
pub trait AddressSpace {
    /// Copy the current maps text into `buf` and return its length.
    fn read_maps(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Fill `out` with the pagemap entries of consecutive pages from `first_page`.
    fn read_pagemap(&self, first_page: usize, out: &mut [u64]) -> io::Result<()>;

    /// Reset soft-dirty tracking for the whole process.
    fn clear_soft_dirty(&mut self) -> io::Result<()>;

    /// Create a mapping at exactly `request.addr`; returns the address mapped.
    fn map(&mut self, request: &MapRequest) -> io::Result<usize>;

    fn unmap(&mut self, addr: usize, len: usize) -> io::Result<()>;

    fn protect(&mut self, addr: usize, len: usize, prot: Protection) -> io::Result<()>;

    /// Grow or shrink the mapping at `addr` without moving it; returns its address.
    fn resize_in_place(&mut self, addr: usize, old_len: usize, new_len: usize) -> io::Result<usize>;

    /// Move the program break to `end`.
    fn set_break(&mut self, end: usize) -> io::Result<()>;

    fn advise(&mut self, addr: usize, len: usize, advice: Advice) -> io::Result<()>;

    /// Reopen a mapping's backing file by path.
    fn open_backing_file(&mut self, path: &AreaName) -> Option<BackingFile>;

    fn close_backing_file(&mut self, file: BackingFile);

    /// Live descriptor for a memory-file mapping, when one is registered.
    fn memfd_descriptor(&self, name: &AreaName) -> Option<RawFd>;

    /// Bytes of the page at `addr`. The page must be mapped readable.
    fn page(&self, addr: usize) -> &[u8];

    /// Mutable bytes of the page at `addr`. The page must be mapped writable.
    fn page_mut(&mut self, addr: usize) -> &mut [u8];

    /// Write `len` bytes starting at `addr` into `sink`.
    fn write_pages(&self, addr: usize, len: usize, sink: &mut dyn Write) -> io::Result<()> {
        for page in (addr..addr + len).step_by(PAGE_SIZE) {
            sink.write_all(self.page(page))?;
        }
        Ok(())
    }

    /// Fill `len` bytes starting at `addr` from `source`.
    fn read_pages(&mut self, addr: usize, len: usize, source: &mut dyn Read) -> io::Result<()> {
        for page in (addr..addr + len).step_by(PAGE_SIZE) {
            source.read_exact(self.page_mut(page))?;
        }
        Ok(())
    }

    fn zero_page(&mut self, addr: usize) {
        self.page_mut(addr).fill(0);
    }

    /// Free bytes on the filesystem holding `dir`, if it can be determined.
    fn available_space(&self, dir: &Path) -> Option<u64>;

    fn fork_for_save(&mut self) -> ForkOutcome;

    /// Terminate a save child with `code` as its exit status.
    fn finish_forked_save(&mut self, code: i32) -> !;
}
