//! Area reconciliation.
//!
//! Rewrites the live address space so its layout matches a saved area list.
//! Both lists are walked in ascending address order like a merge join. Each
//! step compares the head of each list and either consumes both, consumes
//! one, or trims one head to its unprocessed remainder and compares again.
//! Every structural change (unmap, fixed map, protection change, in-place
//! resize, program break move) is applied as soon as it is decided.
//!
//! Areas flagged `skip` are never touched on either side.

use std::io;

use thiserror::Error;
use tracing::{debug, warn};

use crate::area::{Area, AreaFlags, MapsParseError, ProcMaps, SkipPolicy};
use crate::codec::{CodecError, ReadAt};
use crate::logging::Hex;
use crate::space::{AddressSpace, Backing, MapRequest};
use crate::state::SavedState;

/// Reconciliation failures. Every one of them leaves the address space in
/// an unknown shape.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading saved areas: {0}")]
    Source(#[from] CodecError),

    #[error("parsing live areas: {0}")]
    Maps(#[from] MapsParseError),

    #[error("{op} of {len:#x} bytes at {addr:#x} failed: {source}")]
    Io {
        op: &'static str,
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("stack at {from:#x} was relocated to {to:#x}")]
    StackMoved { from: usize, to: usize },

    #[error("live area at {addr:#x} is excluded from snapshots but the saved one is not")]
    SkipCollision { addr: usize },

    #[error("mapping for {wanted:#x} landed at {got:#x}")]
    Misplaced { wanted: usize, got: usize },
}

/// Restartable cursor over saved areas.
pub trait AreaSource {
    /// Area under the cursor; the sentinel once the list is exhausted.
    fn current_area(&self) -> Area;

    /// Move to the next area and return it.
    fn advance(&mut self) -> Result<Area, CodecError>;
}

impl<R: ReadAt + ?Sized> AreaSource for SavedState<'_, R> {
    fn current_area(&self) -> Area {
        *self.area()
    }

    fn advance(&mut self) -> Result<Area, CodecError> {
        self.next_area().copied()
    }
}

/// Saved areas held in memory.
#[derive(Debug, Clone)]
pub struct AreaList<'a> {
    areas: &'a [Area],
    index: usize,
}

impl<'a> AreaList<'a> {
    pub fn new(areas: &'a [Area]) -> Self {
        AreaList { areas, index: 0 }
    }
}

impl AreaSource for AreaList<'_> {
    fn current_area(&self) -> Area {
        self.areas.get(self.index).copied().unwrap_or_else(Area::sentinel)
    }

    fn advance(&mut self) -> Result<Area, CodecError> {
        self.index = (self.index + 1).min(self.areas.len());
        Ok(self.current_area())
    }
}

/// Counts of the structural changes applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub unmapped: u64,
    pub mapped: u64,
    pub protected: u64,
    pub resized: u64,
    /// File or memory-file areas recreated as anonymous memory.
    pub demoted: u64,
    /// Areas skipped at save time whose live counterpart is no longer skipped.
    pub skip_drift: u64,
}

enum Step {
    Both,
    Current,
    Saved,
    Again,
}

/// Make the live layout described by `maps_text` match `saved`.
///
/// `maps_text` is a stable copy of the live maps taken before the call; it
/// is parsed with `policy` so reserved and pseudo areas are left alone.
pub fn reconcile<S, A>(
    space: &mut S,
    saved: &mut A,
    maps_text: &[u8],
    policy: SkipPolicy,
) -> Result<ReconcileStats, ReconcileError>
where
    S: AddressSpace + ?Sized,
    A: AreaSource + ?Sized,
{
    let mut live = ProcMaps::new(maps_text, policy);
    let mut reconciler = Reconciler {
        space,
        stats: ReconcileStats::default(),
    };

    let mut saved_area = saved.current_area();
    let mut current = live.next_area()?;
    loop {
        let step = match current.as_mut() {
            None if saved_area.is_sentinel() => break,
            None => reconciler.saved_first(&mut saved_area, None)?,
            Some(cur) if saved_area.is_sentinel() => reconciler.current_first(&saved_area, cur)?,
            Some(cur) if saved_area.start == cur.start => reconciler.same_start(&mut saved_area, cur)?,
            Some(cur) if cur.start < saved_area.start => reconciler.current_first(&saved_area, cur)?,
            Some(cur) => reconciler.saved_first(&mut saved_area, Some(cur))?,
        };
        match step {
            Step::Both => {
                saved_area = saved.advance()?;
                current = live.next_area()?;
            }
            Step::Current => current = live.next_area()?,
            Step::Saved => saved_area = saved.advance()?,
            Step::Again => {}
        }
    }

    debug!(
        unmapped = reconciler.stats.unmapped,
        mapped = reconciler.stats.mapped,
        protected = reconciler.stats.protected,
        resized = reconciler.stats.resized,
        demoted = reconciler.stats.demoted,
        skip_drift = reconciler.stats.skip_drift,
        "address space reconciled"
    );
    Ok(reconciler.stats)
}

struct Reconciler<'s, S: AddressSpace + ?Sized> {
    space: &'s mut S,
    stats: ReconcileStats,
}

fn io_error(op: &'static str, addr: usize, len: usize) -> impl FnOnce(io::Error) -> ReconcileError {
    move |source| ReconcileError::Io { op, addr, len, source }
}

impl<S: AddressSpace + ?Sized> Reconciler<'_, S> {
    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), ReconcileError> {
        debug!(addr = %Hex(addr), len = %Hex(len), "unmapping live area");
        self.space.unmap(addr, len).map_err(io_error("munmap", addr, len))?;
        self.stats.unmapped += 1;
        Ok(())
    }

    fn same_start(&mut self, saved: &mut Area, cur: &mut Area) -> Result<Step, ReconcileError> {
        if saved.skip {
            if !cur.skip {
                warn!(addr = %Hex(cur.start), name = %cur.name, "saved area was skipped but the live one is not");
                self.stats.skip_drift += 1;
            }
            return Ok(Step::Both);
        }
        if cur.skip {
            return Err(ReconcileError::SkipCollision { addr: cur.start });
        }
        if !saved.same_identity(cur) {
            self.unmap(cur.start, cur.size())?;
            return Ok(Step::Current);
        }

        let mut copy = saved.size().min(cur.size());
        if saved.size() != cur.size() && self.resize(saved, cur)? {
            copy = saved.size();
            cur.end = saved.end;
        }
        if saved.prot != cur.prot {
            self.space
                .protect(saved.start, copy, saved.prot)
                .map_err(io_error("mprotect", saved.start, copy))?;
            self.stats.protected += 1;
        }

        if saved.end == cur.end {
            Ok(Step::Both)
        } else if saved.end > cur.end {
            trim_front(saved, cur.end);
            Ok(Step::Current)
        } else {
            cur.start = saved.end;
            Ok(Step::Saved)
        }
    }

    /// Resize areas that cannot be split or recreated. Returns whether the
    /// live area now spans the saved range.
    fn resize(&mut self, saved: &Area, cur: &Area) -> Result<bool, ReconcileError> {
        let (old_len, new_len) = (cur.size(), saved.size());
        if saved.flags.contains(AreaFlags::STACK) {
            let got = self
                .space
                .resize_in_place(cur.start, old_len, new_len)
                .map_err(io_error("mremap stack", cur.start, new_len))?;
            if got != cur.start {
                return Err(ReconcileError::StackMoved { from: cur.start, to: got });
            }
        } else if saved.flags.contains(AreaFlags::HEAP) {
            self.space
                .set_break(saved.end)
                .map_err(io_error("brk", cur.start, new_len))?;
        } else if saved.flags.contains(AreaFlags::MEMFD) {
            let got = self
                .space
                .resize_in_place(cur.start, old_len, new_len)
                .map_err(io_error("mremap memfd", cur.start, new_len))?;
            if got != cur.start {
                return Err(ReconcileError::Misplaced {
                    wanted: cur.start,
                    got,
                });
            }
        } else {
            return Ok(false);
        }
        debug!(
            addr = %Hex(cur.start),
            from = %Hex(old_len),
            to = %Hex(new_len),
            name = %saved.name,
            "resized live area in place"
        );
        self.stats.resized += 1;
        Ok(true)
    }

    fn current_first(&mut self, saved: &Area, cur: &mut Area) -> Result<Step, ReconcileError> {
        if !saved.is_sentinel() && cur.end > saved.start {
            if !cur.skip {
                self.unmap(cur.start, saved.start - cur.start)?;
            }
            cur.start = saved.start;
            return Ok(Step::Again);
        }
        if !cur.skip {
            self.unmap(cur.start, cur.size())?;
        }
        Ok(Step::Current)
    }

    fn saved_first(&mut self, saved: &mut Area, cur: Option<&mut Area>) -> Result<Step, ReconcileError> {
        if saved.skip {
            return Ok(Step::Saved);
        }
        let overlap = cur.map(|c| c.start).filter(|start| *start < saved.end);
        let len = match overlap {
            Some(start) => start - saved.start,
            None => saved.size(),
        };
        self.map_saved(saved, len)?;
        match overlap {
            Some(start) => {
                trim_front(saved, start);
                Ok(Step::Again)
            }
            None => Ok(Step::Saved),
        }
    }

    /// Recreate the first `len` bytes of a saved area.
    fn map_saved(&mut self, saved: &Area, len: usize) -> Result<(), ReconcileError> {
        let mut opened = None;
        let mut backing = Backing::Anonymous;
        let mut shared = false;

        if saved.flags.contains(AreaFlags::MEMFD) {
            match self.space.memfd_descriptor(&saved.name) {
                Some(fd) => {
                    backing = Backing::File { fd, offset: saved.offset };
                    shared = saved.is_shared();
                }
                None => {
                    debug!(addr = %Hex(saved.start), name = %saved.name, "no live descriptor, mapping anonymous");
                    self.stats.demoted += 1;
                }
            }
        } else if saved.flags.contains(AreaFlags::FILE) {
            match self.space.open_backing_file(&saved.name) {
                Some(file) if file.len >= saved.offset + len as u64 => {
                    backing = Backing::File {
                        fd: file.fd,
                        offset: saved.offset,
                    };
                    shared = saved.is_shared();
                    opened = Some(file);
                }
                found => {
                    if let Some(file) = found {
                        self.space.close_backing_file(file);
                    }
                    debug!(addr = %Hex(saved.start), name = %saved.name, "backing file missing or short, mapping anonymous");
                    self.stats.demoted += 1;
                }
            }
        } else {
            shared = saved.is_shared();
        }

        let request = MapRequest {
            addr: saved.start,
            len,
            prot: saved.prot,
            shared,
            backing,
        };
        let mapped = self.space.map(&request);
        if let Some(file) = opened {
            self.space.close_backing_file(file);
        }
        let got = mapped.map_err(io_error("mmap", saved.start, len))?;
        if got != saved.start {
            return Err(ReconcileError::Misplaced {
                wanted: saved.start,
                got,
            });
        }
        debug!(addr = %Hex(saved.start), len = %Hex(len), name = %saved.name, "mapped saved area");
        self.stats.mapped += 1;
        Ok(())
    }
}

/// Drop the part of `area` below `start`, keeping file offsets aligned.
fn trim_front(area: &mut Area, start: usize) {
    if area.flags.contains(AreaFlags::FILE) {
        area.offset += (start - area.start) as u64;
    }
    area.start = start;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::Protection;
    use crate::page::PAGE_SIZE;
    use crate::space::{SimOp, SimulatedAddressSpace};

    const R: Protection = Protection::READ;
    const RW: Protection = Protection::READ.union(Protection::WRITE);

    fn maps_of(space: &SimulatedAddressSpace) -> Vec<u8> {
        let mut buf = vec![0u8; 1 << 16];
        let len = space.read_maps(&mut buf).unwrap();
        buf.truncate(len);
        buf
    }

    fn run(space: &mut SimulatedAddressSpace, saved: &[Area]) -> ReconcileStats {
        let text = maps_of(space);
        reconcile(space, &mut AreaList::new(saved), &text, SkipPolicy::default()).unwrap()
    }

    fn layout(space: &SimulatedAddressSpace) -> Vec<(usize, usize, Protection, AreaFlags)> {
        space.areas().iter().map(|a| (a.start, a.end, a.prot, a.flags)).collect()
    }

    fn named(space: &SimulatedAddressSpace, name: &str) -> Area {
        *space
            .areas()
            .iter()
            .find(|a| a.name.as_bytes() == name.as_bytes())
            .unwrap()
    }

    #[test]
    fn extra_live_areas_are_unmapped_and_missing_ones_mapped() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x2000, RW);
        space.map_anonymous(0x40000, 0x1000, RW);

        let saved = [Area::anonymous(0x10000, 0x12000, RW), Area::anonymous(0x30000, 0x33000, R)];
        let stats = run(&mut space, &saved);

        assert_eq!(
            layout(&space),
            vec![
                (0x10000, 0x12000, RW, AreaFlags::ANON | AreaFlags::PRIVATE),
                (0x30000, 0x33000, R, AreaFlags::ANON | AreaFlags::PRIVATE),
            ]
        );
        assert_eq!((stats.mapped, stats.unmapped), (1, 1));
    }

    #[test]
    fn partial_overlaps_split_into_remainders() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x6000, RW);

        let saved = [
            Area::anonymous(0x0e000, 0x12000, RW),
            Area::anonymous(0x12000, 0x14000, R),
            Area::anonymous(0x15000, 0x18000, RW),
        ];
        run(&mut space, &saved);

        let areas = layout(&space);
        let spans: Vec<_> = areas.iter().map(|(s, e, p, _)| (*s, *e, *p)).collect();
        assert_eq!(
            spans,
            vec![(0x0e000, 0x12000, RW), (0x12000, 0x14000, R), (0x15000, 0x18000, RW)]
        );
    }

    #[test]
    fn identity_change_replaces_the_mapping() {
        let mut space = SimulatedAddressSpace::new();
        space.add_file("/opt/game/data.bin", vec![3u8; 2 * PAGE_SIZE]);
        space.map_named(0x20000, 0x2000, RW, "/opt/game/data.bin", false);

        run(&mut space, &[Area::anonymous(0x20000, 0x22000, RW)]);
        let areas = space.areas();
        assert_eq!(areas.len(), 1);
        assert!(areas[0].is_anonymous());
        assert!(!space.is_present(0x20000), "old file pages are gone");
    }

    #[test]
    fn stack_is_resized_without_moving() {
        let mut space = SimulatedAddressSpace::new();
        space.map_named(0x7f000, 0x2000, RW, "[stack]", false);
        let mut saved = named(&space, "[stack]");
        saved.end = 0x83000;

        let stats = run(&mut space, &[saved]);
        let stack = named(&space, "[stack]");
        assert_eq!((stack.start, stack.end), (0x7f000, 0x83000));
        assert_eq!(stats.resized, 1);
        assert!(space.ops().contains(&SimOp::Resize {
            addr: 0x7f000,
            old_len: 0x2000,
            new_len: 0x4000
        }));
    }

    #[test]
    fn stack_that_cannot_grow_is_fatal() {
        let mut space = SimulatedAddressSpace::new();
        space.map_named(0x7f000, 0x1000, RW, "[stack]", false);
        space.map_anonymous(0x80000, 0x1000, R);
        let mut saved = named(&space, "[stack]");
        saved.end = 0x82000;

        let text = maps_of(&space);
        let err = reconcile(&mut space, &mut AreaList::new(&[saved]), &text, SkipPolicy::default()).unwrap_err();
        assert!(matches!(err, ReconcileError::Io { op: "mremap stack", .. }));
    }

    #[test]
    fn heap_moves_the_program_break() {
        let mut space = SimulatedAddressSpace::new();
        space.map_named(0x50000, 0x4000, RW, "[heap]", false);
        let mut saved = named(&space, "[heap]");
        saved.end = 0x52000;

        run(&mut space, &[saved]);
        assert!(space.ops().contains(&SimOp::Break { end: 0x52000 }));
        let heap = named(&space, "[heap]");
        assert_eq!((heap.start, heap.end), (0x50000, 0x52000));
    }

    #[test]
    fn protection_is_applied_to_matched_areas() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x2000, R);
        run(&mut space, &[Area::anonymous(0x10000, 0x12000, RW)]);
        assert_eq!(layout(&space)[0].2, RW);
    }

    #[test]
    fn short_backing_file_is_demoted_to_anonymous() {
        let mut space = SimulatedAddressSpace::new();
        space.add_file("/opt/game/save.dat", vec![9u8; 4 * PAGE_SIZE]);
        space.map_named(0x30000, 0x4000, RW, "/opt/game/save.dat", false);
        let saved = named(&space, "/opt/game/save.dat");
        space.unmap(0x30000, 0x4000).unwrap();
        space.truncate_file("/opt/game/save.dat", PAGE_SIZE);

        let stats = run(&mut space, &[saved]);
        assert_eq!(stats.demoted, 1);
        let areas = space.areas();
        assert_eq!((areas[0].start, areas[0].end), (0x30000, 0x34000));
        assert!(areas[0].is_anonymous());
    }

    #[test]
    fn intact_backing_file_is_remapped() {
        let mut space = SimulatedAddressSpace::new();
        space.add_file("/opt/game/save.dat", vec![9u8; 4 * PAGE_SIZE]);
        space.map_named(0x30000, 0x4000, RW, "/opt/game/save.dat", false);
        let saved = named(&space, "/opt/game/save.dat");
        space.unmap(0x30000, 0x4000).unwrap();

        let stats = run(&mut space, &[saved]);
        assert_eq!(stats.demoted, 0);
        assert_eq!(named(&space, "/opt/game/save.dat").end, 0x34000);
        assert_eq!(space.peek(0x33000, 1), [9]);
    }

    #[test]
    fn memfd_area_maps_its_live_descriptor() {
        let mut space = SimulatedAddressSpace::new();
        space.register_memfd("/memfd:savefile", vec![4u8; 2 * PAGE_SIZE]);
        space.map_named(0x60000, 0x2000, RW, "/memfd:savefile", true);
        let saved = named(&space, "/memfd:savefile");
        space.unmap(0x60000, 0x2000).unwrap();

        run(&mut space, &[saved]);
        let area = named(&space, "/memfd:savefile");
        assert!(area.flags.contains(AreaFlags::MEMFD | AreaFlags::SHARED));
        assert_eq!(space.peek(0x61000, 1), [4]);
    }

    #[test]
    fn skipped_areas_are_left_alone() {
        let mut space = SimulatedAddressSpace::new();
        space.map_named(0x90000, 0x1000, R, "[vdso]", false);
        let mut vdso = named(&space, "[vdso]");
        vdso.skip = true;

        let stats = run(&mut space, &[vdso]);
        assert_eq!(stats, ReconcileStats::default());
        assert_eq!(space.areas().len(), 1);
    }

    #[test]
    fn skip_drift_is_counted_and_the_live_area_kept() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x2000, RW);
        let mut saved = Area::anonymous(0x10000, 0x12000, RW);
        saved.skip = true;

        let stats = run(&mut space, &[saved]);
        assert_eq!(stats.skip_drift, 1);
        assert_eq!((stats.mapped, stats.unmapped), (0, 0));
        assert_eq!(layout(&space), vec![(0x10000, 0x12000, RW, AreaFlags::ANON | AreaFlags::PRIVATE)]);
    }
}
