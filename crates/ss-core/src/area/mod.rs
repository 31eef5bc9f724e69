//! Memory area model.
//!
//! An [`Area`] describes one contiguous mapping at one point in time:
//! - address range, protections and backing kind
//! - backing file identity (device, inode, offset, path)
//! - snapshot bookkeeping (`skip`, `uncommitted`, content offset, hash)
//!
//! Areas are plain `Copy` values with an inline fixed-size name so they can
//! be produced and consumed without touching the allocator.

pub mod maps;

pub use maps::{MapsParseError, ProcMaps};

use bitflags::bitflags;
use std::ffi::CStr;
use std::fmt;

use crate::page::{page_count, PAGE_SIZE};

bitflags! {
    /// Access permissions of a mapping. Bit values match `PROT_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Backing kind of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AreaFlags: u32 {
        const ANON = 0x01;
        const FILE = 0x02;
        const PRIVATE = 0x04;
        const SHARED = 0x08;
        const STACK = 0x10;
        const HEAP = 0x20;
        const MEMFD = 0x40;
        const SHM = 0x80;
        const SAVEFILE = 0x100;
    }
}

impl Protection {
    /// Render as the first three characters of a maps permission field.
    pub fn as_rwx(self) -> [u8; 3] {
        [
            if self.contains(Protection::READ) { b'r' } else { b'-' },
            if self.contains(Protection::WRITE) { b'w' } else { b'-' },
            if self.contains(Protection::EXEC) { b'x' } else { b'-' },
        ]
    }
}

/// Longest mapping path an area can carry.
pub const NAME_CAPACITY: usize = 1024;

/// Fixed-capacity mapping name.
#[derive(Clone, Copy)]
pub struct AreaName {
    len: u16,
    bytes: [u8; NAME_CAPACITY],
}

impl AreaName {
    pub const fn empty() -> Self {
        AreaName {
            len: 0,
            bytes: [0; NAME_CAPACITY],
        }
    }

    /// Copy `bytes` in, or `None` if they do not fit.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > NAME_CAPACITY {
            return None;
        }
        let mut name = AreaName::empty();
        name.bytes[..bytes.len()].copy_from_slice(bytes);
        name.len = bytes.len() as u16;
        Some(name)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.as_bytes().starts_with(prefix)
    }

    /// Bracketed kernel pseudo-name such as `[stack]`.
    pub fn is_pseudo(&self) -> bool {
        self.starts_with(b"[")
    }

    /// NUL-terminate into `buf` for passing to the kernel.
    pub fn to_c_str<'a>(&self, buf: &'a mut [u8; NAME_CAPACITY + 1]) -> Option<&'a CStr> {
        let len = self.len();
        buf[..len].copy_from_slice(self.as_bytes());
        buf[len] = 0;
        CStr::from_bytes_with_nul(&buf[..=len]).ok()
    }
}

impl Default for AreaName {
    fn default() -> Self {
        AreaName::empty()
    }
}

impl PartialEq for AreaName {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for AreaName {}

impl fmt::Display for AreaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for AreaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// One contiguous memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub start: usize,
    pub end: usize,
    /// Offset into the backing file.
    pub offset: u64,
    pub prot: Protection,
    pub max_prot: Protection,
    pub flags: AreaFlags,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    /// Excluded from snapshots; no page tags follow its record.
    pub skip: bool,
    /// Never touched; no page tags follow its record.
    pub uncommitted: bool,
    /// Content-stream offset where this area's page records begin.
    pub page_offset: u64,
    /// Debug-only content hash, zero when not computed.
    pub hash: u64,
    pub name: AreaName,
}

/// Addresses of the legacy fixed vsyscall pages.
const VSYSCALL_ADDRS: [usize; 2] = [0xffff_e000, 0xffff_ffff_ff60_0000];

/// Kernel pseudo areas that can be neither saved nor remapped.
const KERNEL_PSEUDO_NAMES: [&[u8]; 5] = [b"[vsyscall]", b"[vectors]", b"[vvar]", b"[vvar_vclock]", b"[vdso]"];

impl Area {
    /// Zero-sized area marking the end of a saved area list.
    pub const fn sentinel() -> Self {
        Area {
            start: 0,
            end: 0,
            offset: 0,
            prot: Protection::empty(),
            max_prot: Protection::empty(),
            flags: AreaFlags::empty(),
            dev_major: 0,
            dev_minor: 0,
            inode: 0,
            skip: false,
            uncommitted: false,
            page_offset: 0,
            hash: 0,
            name: AreaName::empty(),
        }
    }

    /// Anonymous private mapping.
    pub fn anonymous(start: usize, end: usize, prot: Protection) -> Self {
        Area {
            start,
            end,
            prot,
            max_prot: Protection::all(),
            flags: AreaFlags::ANON | AreaFlags::PRIVATE,
            ..Area::sentinel()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn page_count(&self) -> usize {
        page_count(self.size())
    }

    /// Whether this area carries page tags in a snapshot.
    pub fn has_pages(&self) -> bool {
        !self.skip && !self.uncommitted
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags.contains(AreaFlags::ANON)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(AreaFlags::SHARED)
    }

    /// Same name and same backing kind.
    pub fn same_identity(&self, other: &Area) -> bool {
        self.name == other.name && self.flags == other.flags
    }

    /// Page addresses covered by this area.
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        (self.start..self.end).step_by(PAGE_SIZE)
    }

    /// Derive backing-kind flags from a maps pathname.
    pub fn classify_name(name: &AreaName, shared: bool) -> AreaFlags {
        let mut flags = if shared {
            AreaFlags::SHARED
        } else {
            AreaFlags::PRIVATE
        };
        if name.is_empty() || name.is_pseudo() {
            flags |= AreaFlags::ANON;
        } else {
            flags |= AreaFlags::FILE;
        }
        if name.as_bytes() == b"[stack]" {
            flags |= AreaFlags::STACK;
        }
        if name.as_bytes() == b"[heap]" {
            flags |= AreaFlags::HEAP;
        }
        if name.starts_with(b"/memfd:") {
            flags |= AreaFlags::MEMFD;
        }
        if name.starts_with(b"/dev/shm/") {
            flags |= AreaFlags::SHM;
        }
        flags
    }

    /// Anonymous private mapping with no access at all.
    ///
    /// Such areas are address-space reservations; whether they really hold
    /// no pages is confirmed against the pagemap by the save path.
    pub fn is_reservation(&self) -> bool {
        self.prot.is_empty()
            && self.is_anonymous()
            && !self.is_shared()
            && !self.flags.intersects(AreaFlags::STACK | AreaFlags::HEAP)
    }
}

/// Which areas are left out of snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipPolicy {
    reserved_start: usize,
    reserved_end: usize,
}

impl SkipPolicy {
    /// Skip every area lying inside the engine's reserved region `[start, end)`.
    pub fn with_reserved(start: usize, end: usize) -> Self {
        SkipPolicy {
            reserved_start: start,
            reserved_end: end,
        }
    }

    pub fn should_skip(&self, area: &Area) -> bool {
        if VSYSCALL_ADDRS.contains(&area.start) {
            return true;
        }
        if area.size() == 0 {
            return true;
        }
        if KERNEL_PSEUDO_NAMES
            .iter()
            .any(|pseudo| area.name.as_bytes() == *pseudo)
        {
            return true;
        }
        if self.reserved_end > self.reserved_start
            && area.start >= self.reserved_start
            && area.end <= self.reserved_end
        {
            return true;
        }
        if area.prot.contains(Protection::WRITE) {
            return false;
        }
        if area.is_anonymous() {
            return false;
        }
        // Read-only file mappings come back from the file itself.
        true
    }
}
