//! The calling process's own address space.
//!
//! Every primitive is a thin wrapper over the matching syscall. Nothing here
//! allocates, so the implementation stays usable from the checkpoint signal
//! handler while the heap mapping is being rewritten.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::{Advice, AddressSpace, Backing, BackingFile, ForkOutcome, MapRequest};
use crate::area::{AreaName, NAME_CAPACITY};
use crate::page::PAGE_SIZE;
use crate::pagemap::PagemapEntry;

/// Memory files the host created and wants remapped by descriptor.
pub const MAX_MEMFDS: usize = 8;

struct MemfdEntry {
    fd: RawFd,
    name: AreaName,
}

const NO_MEMFD: MemfdEntry = MemfdEntry {
    fd: -1,
    name: AreaName::empty(),
};

/// The live process address space.
pub struct LiveAddressSpace {
    pagemap: Option<File>,
    memfds: [MemfdEntry; MAX_MEMFDS],
}

fn open_c(path: &CStr, flags: libc::c_int) -> io::Result<File> {
    // SAFETY: `path` is NUL-terminated and the returned descriptor is owned
    // by the new `File`.
    let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just opened and is not shared.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn prot_bits(prot: crate::area::Protection) -> libc::c_int {
    prot.bits() as libc::c_int
}

impl LiveAddressSpace {
    /// Wrap the calling process.
    ///
    /// Without a readable pagemap every page is reported present and dirty,
    /// which disables `NO_PAGE` tagging and incremental inheritance.
    ///
    /// # Safety
    ///
    /// The engine reads and writes arbitrary mapped memory through this
    /// value. The caller must make sure no other thread runs while it does.
    pub unsafe fn new() -> Self {
        let pagemap = open_c(c"/proc/self/pagemap", libc::O_RDONLY).ok();
        LiveAddressSpace {
            pagemap,
            memfds: [NO_MEMFD; MAX_MEMFDS],
        }
    }

    pub fn has_pagemap(&self) -> bool {
        self.pagemap.is_some()
    }

    /// Record the descriptor behind a `/memfd:` mapping so a restore can map
    /// it shared again. Returns `false` when the table is full.
    pub fn register_memfd(&mut self, name: &AreaName, fd: RawFd) -> bool {
        if let Some(entry) = self.memfds.iter_mut().find(|e| e.fd >= 0 && e.name == *name) {
            entry.fd = fd;
            return true;
        }
        match self.memfds.iter_mut().find(|e| e.fd < 0) {
            Some(entry) => {
                entry.fd = fd;
                entry.name = *name;
                true
            }
            None => false,
        }
    }
}

impl AddressSpace for LiveAddressSpace {
    fn read_maps(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut maps = open_c(c"/proc/self/maps", libc::O_RDONLY)?;
        let mut len = 0;
        loop {
            if len == buf.len() {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "maps buffer too small"));
            }
            match maps.read(&mut buf[len..]) {
                Ok(0) => return Ok(len),
                Ok(n) => len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn read_pagemap(&self, first_page: usize, out: &mut [u64]) -> io::Result<()> {
        let Some(pagemap) = &self.pagemap else {
            out.fill(PagemapEntry::UNKNOWN.0);
            return Ok(());
        };
        // SAFETY: u64 has no invalid bit patterns and the byte view covers
        // exactly the entries of `out`.
        let bytes = unsafe { std::slice::from_raw_parts_mut(out.as_mut_ptr().cast::<u8>(), out.len() * 8) };
        pagemap.read_exact_at(bytes, crate::pagemap::entry_offset(first_page))
    }

    fn clear_soft_dirty(&mut self) -> io::Result<()> {
        let mut clear_refs = open_c(c"/proc/self/clear_refs", libc::O_WRONLY)?;
        clear_refs.write_all(b"4\n")
    }

    fn map(&mut self, request: &MapRequest) -> io::Result<usize> {
        let sharing = if request.shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        let (fd, offset, anon) = match request.backing {
            Backing::Anonymous => (-1, 0, libc::MAP_ANONYMOUS),
            Backing::File { fd, offset } => (fd, offset as libc::off_t, 0),
        };
        // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping.
        let got = unsafe {
            libc::mmap(
                request.addr as *mut libc::c_void,
                request.len,
                prot_bits(request.prot),
                sharing | anon | libc::MAP_FIXED_NOREPLACE,
                fd,
                offset,
            )
        };
        if got == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(got as usize)
    }

    fn unmap(&mut self, addr: usize, len: usize) -> io::Result<()> {
        // SAFETY: the reconciler only unmaps ranges absent from the snapshot
        // being restored; the engine's own memory is skipped.
        check(unsafe { libc::munmap(addr as *mut libc::c_void, len) })
    }

    fn protect(&mut self, addr: usize, len: usize, prot: crate::area::Protection) -> io::Result<()> {
        // SAFETY: changes access rights only.
        check(unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot_bits(prot)) })
    }

    fn resize_in_place(&mut self, addr: usize, old_len: usize, new_len: usize) -> io::Result<usize> {
        // SAFETY: flags 0 forbids the kernel from moving the mapping.
        let got = unsafe { libc::mremap(addr as *mut libc::c_void, old_len, new_len, 0) };
        if got == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(got as usize)
    }

    fn set_break(&mut self, end: usize) -> io::Result<()> {
        // SAFETY: the raw syscall returns the resulting break and never fails
        // with -1; a short break means the request was refused.
        let got = unsafe { libc::syscall(libc::SYS_brk, end) } as usize;
        if got == end {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOMEM))
        }
    }

    fn advise(&mut self, addr: usize, len: usize, advice: Advice) -> io::Result<()> {
        let advice = match advice {
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::Normal => libc::MADV_NORMAL,
        };
        // SAFETY: access-pattern hints do not change memory contents.
        check(unsafe { libc::madvise(addr as *mut libc::c_void, len, advice) })
    }

    fn open_backing_file(&mut self, path: &AreaName) -> Option<BackingFile> {
        let mut buf = [0u8; NAME_CAPACITY + 1];
        let file = open_c(path.to_c_str(&mut buf)?, libc::O_RDONLY).ok()?;
        let len = file.metadata().ok()?.len();
        let fd = file.into_raw_fd();
        Some(BackingFile { fd, len })
    }

    fn close_backing_file(&mut self, file: BackingFile) {
        // SAFETY: `file.fd` came from `open_backing_file` and is closed once.
        drop(unsafe { File::from_raw_fd(file.fd) });
    }

    fn memfd_descriptor(&self, name: &AreaName) -> Option<RawFd> {
        self.memfds
            .iter()
            .find(|e| e.fd >= 0 && e.name == *name)
            .map(|e| e.fd)
    }

    fn page(&self, addr: usize) -> &[u8] {
        // SAFETY: callers only pass addresses of readable mapped pages.
        unsafe { std::slice::from_raw_parts(addr as *const u8, PAGE_SIZE) }
    }

    fn page_mut(&mut self, addr: usize) -> &mut [u8] {
        // SAFETY: callers only pass addresses of writable mapped pages.
        unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, PAGE_SIZE) }
    }

    fn write_pages(&self, addr: usize, len: usize, sink: &mut dyn Write) -> io::Result<()> {
        // SAFETY: the whole run lies in readable pages of one area.
        sink.write_all(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
    }

    fn read_pages(&mut self, addr: usize, len: usize, source: &mut dyn Read) -> io::Result<()> {
        // SAFETY: the whole run lies in writable pages of one area.
        source.read_exact(unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) })
    }

    fn available_space(&self, dir: &Path) -> Option<u64> {
        let bytes = dir.as_os_str().as_bytes();
        let mut buf = [0u8; NAME_CAPACITY + 1];
        if bytes.len() > NAME_CAPACITY {
            return None;
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        let path = CStr::from_bytes_until_nul(&buf).ok()?;
        // SAFETY: statvfs only fills the out-parameter.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn fork_for_save(&mut self) -> ForkOutcome {
        // SAFETY: the child only performs the save and then `_exit`s.
        match unsafe { libc::fork() } {
            -1 => ForkOutcome::Unavailable,
            0 => ForkOutcome::Child,
            child => ForkOutcome::Parent { child },
        }
    }

    fn finish_forked_save(&mut self, code: i32) -> ! {
        // SAFETY: skips atexit handlers the parent still owns.
        unsafe { libc::_exit(code) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{ProcMaps, SkipPolicy};

    #[test]
    fn reads_own_maps() {
        // SAFETY: the test only reads its own memory map.
        let space = unsafe { LiveAddressSpace::new() };
        let mut buf = vec![0u8; 1 << 20];
        let len = space.read_maps(&mut buf).unwrap();
        let areas: Vec<_> = ProcMaps::new(&buf[..len], SkipPolicy::default())
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(!areas.is_empty());
        assert!(areas.windows(2).all(|w| w[0].end <= w[1].start), "ascending and disjoint");
        let here = &buf as *const _ as usize;
        assert!(areas.iter().any(|a| a.contains(here)), "stack of this test is mapped");
    }

    #[test]
    fn pagemap_sees_touched_heap_page() {
        // SAFETY: read-only introspection.
        let space = unsafe { LiveAddressSpace::new() };
        let mut data = vec![1u8; 4 * PAGE_SIZE];
        data[PAGE_SIZE] = 2;
        let page = (data.as_ptr() as usize + PAGE_SIZE) & !(PAGE_SIZE - 1);
        let mut entry = [0u64; 1];
        space.read_pagemap(page, &mut entry).unwrap();
        assert!(PagemapEntry(entry[0]).present());
    }

    #[test]
    fn memfd_table_updates_in_place() {
        // SAFETY: no memory is touched.
        let mut space = unsafe { LiveAddressSpace::new() };
        let name = AreaName::new(b"/memfd:save (deleted)").unwrap();
        assert!(space.register_memfd(&name, 40));
        assert!(space.register_memfd(&name, 41));
        assert_eq!(space.memfd_descriptor(&name), Some(41));
        assert_eq!(space.memfd_descriptor(&AreaName::new(b"/memfd:other").unwrap()), None);
    }
}
