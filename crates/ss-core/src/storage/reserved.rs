//! The engine's reserved memory region.
//!
//! One anonymous mapping, set up before the first checkpoint, holds all
//! state the engine touches while the rest of the address space is being
//! rewritten:
//!
//! ```text
//! | guard | registry, descriptors, inflater, compressor | maps text | guard | alt stack | guard |
//! ```
//!
//! Every area inside the region is skipped by snapshots, so nothing here is
//! ever saved or restored.

use flate2::{Compress, Compression};
use miniz_oxide::inflate::stream::InflateState;
use miniz_oxide::DataFormat;
use std::io;
use std::mem::size_of;
use std::ptr;

use super::DescriptorTable;
use crate::area::SkipPolicy;
use crate::chain::SnapshotRegistry;
use crate::logging::Hex;
use crate::page::PAGE_SIZE;

/// Sizes of the variable parts of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Bytes reserved for one copy of the maps text.
    pub maps_capacity: usize,
    /// Alternate signal stack size.
    pub stack_size: usize,
}

impl Default for RegionLayout {
    fn default() -> Self {
        RegionLayout {
            maps_capacity: 1 << 20,
            stack_size: 1 << 22,
        }
    }
}

/// Engine state kept inside the region.
struct RegionState {
    registry: SnapshotRegistry,
    descriptors: DescriptorTable,
    inflater: InflateState,
    compressor: Compress,
}

/// Mutable views of the engine's working state.
pub struct Scratch<'r> {
    pub registry: &'r mut SnapshotRegistry,
    pub descriptors: &'r mut DescriptorTable,
    pub maps: &'r mut [u8],
    pub inflater: &'r mut InflateState,
    pub compressor: &'r mut Compress,
}

/// Smallest alternate stack accepted.
const MIN_STACK: usize = 64 * 1024;

const fn round_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Compression level for non-base snapshots.
pub fn snapshot_compression() -> Compression {
    Compression::fast()
}

/// The mapped region.
#[derive(Debug)]
pub struct ReservedRegion {
    base: usize,
    len: usize,
    maps_len: usize,
    stack: usize,
    stack_len: usize,
}

// SAFETY: the region is only touched by the thread performing checkpoints.
unsafe impl Send for ReservedRegion {}
// SAFETY: see above; shared references never hand out interior access.
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    pub fn new(layout: RegionLayout, registry: SnapshotRegistry) -> io::Result<Self> {
        let state_len = round_up(size_of::<RegionState>());
        let maps_len = round_up(layout.maps_capacity.max(PAGE_SIZE));
        let stack_len = round_up(layout.stack_size.max(MIN_STACK));
        let len = PAGE_SIZE + state_len + maps_len + PAGE_SIZE + stack_len + PAGE_SIZE;

        // SAFETY: a fresh private anonymous mapping at a kernel-chosen address.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as usize;
        let region = ReservedRegion {
            base,
            len,
            maps_len,
            stack: base + PAGE_SIZE + state_len + maps_len + PAGE_SIZE,
            stack_len,
        };

        let rw = libc::PROT_READ | libc::PROT_WRITE;
        // SAFETY: both ranges lie inside the mapping created above.
        unsafe {
            if libc::mprotect((base + PAGE_SIZE) as *mut libc::c_void, state_len + maps_len, rw) != 0
                || libc::mprotect(region.stack as *mut libc::c_void, stack_len, rw) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(base as *mut libc::c_void, len);
                return Err(err);
            }
            ptr::write(
                region.state(),
                RegionState {
                    registry,
                    descriptors: DescriptorTable::new(),
                    inflater: InflateState::new(DataFormat::Raw),
                    compressor: Compress::new(snapshot_compression(), false),
                },
            );
        }
        tracing::debug!(start = %Hex(base), end = %Hex(base + len), "reserved region mapped");
        Ok(region)
    }

    fn state(&self) -> *mut RegionState {
        (self.base + PAGE_SIZE) as *mut RegionState
    }

    /// `[start, end)` of the whole region.
    pub fn bounds(&self) -> (usize, usize) {
        (self.base, self.base + self.len)
    }

    /// Snapshot skip policy excluding this region.
    pub fn skip_policy(&self) -> SkipPolicy {
        let (start, end) = self.bounds();
        SkipPolicy::with_reserved(start, end)
    }

    /// `(base, len)` of the alternate signal stack.
    pub fn alt_stack(&self) -> (usize, usize) {
        (self.stack, self.stack_len)
    }

    pub fn stack_contains(&self, sp: usize) -> bool {
        sp >= self.stack && sp < self.stack + self.stack_len
    }

    /// Register the alternate stack for the calling thread.
    pub fn install_alt_stack(&self) -> io::Result<()> {
        let stack = libc::stack_t {
            ss_sp: self.stack as *mut libc::c_void,
            ss_flags: 0,
            ss_size: self.stack_len,
        };
        // SAFETY: the stack memory stays mapped for the region's lifetime.
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Working state of the engine.
    ///
    /// # Safety
    ///
    /// At most one `Scratch` may exist at a time; the checkpoint thread is
    /// the only caller.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn scratch(&self) -> Scratch<'_> {
        let state = &mut *self.state();
        let maps_start = self.base + PAGE_SIZE + round_up(size_of::<RegionState>());
        Scratch {
            registry: &mut state.registry,
            descriptors: &mut state.descriptors,
            maps: std::slice::from_raw_parts_mut(maps_start as *mut u8, self.maps_len),
            inflater: &mut state.inflater,
            compressor: &mut state.compressor,
        }
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // SAFETY: the state was written in `new` and the mapping is ours.
        unsafe {
            ptr::drop_in_place(self.state());
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Heap-backed working state for tests and tools that do not rewrite the
/// heap underneath themselves.
#[cfg(any(test, feature = "test-utils"))]
pub struct HeapScratch {
    registry: SnapshotRegistry,
    descriptors: DescriptorTable,
    maps: Vec<u8>,
    inflater: Box<InflateState>,
    compressor: Compress,
}

#[cfg(any(test, feature = "test-utils"))]
impl HeapScratch {
    pub fn new(registry: SnapshotRegistry) -> Self {
        HeapScratch {
            registry,
            descriptors: DescriptorTable::new(),
            maps: vec![0; 1 << 16],
            inflater: InflateState::new_boxed(DataFormat::Raw),
            compressor: Compress::new(snapshot_compression(), false),
        }
    }

    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }

    pub fn scratch(&mut self) -> Scratch<'_> {
        Scratch {
            registry: &mut self.registry,
            descriptors: &mut self.descriptors,
            maps: &mut self.maps,
            inflater: &mut self.inflater,
            compressor: &mut self.compressor,
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Drop for HeapScratch {
    fn drop(&mut self) {
        let mut store = super::SnapshotStore::new(&mut self.descriptors);
        for slot in 0..super::MAX_SLOTS {
            store.forget(ss_common::SlotIndex(slot));
        }
    }
}
