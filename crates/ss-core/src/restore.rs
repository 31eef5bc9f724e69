//! Page restoration.
//!
//! Runs after reconciliation, once the live layout matches the saved one.
//! Walks the saved areas again and brings every page back according to its
//! tag: stored bytes are read (raw runs coalesced, compressed blocks
//! inflated in place), zero pages are cleared, and base pages are fetched
//! from the base snapshot unless live memory provably already holds them.

use std::io;

use thiserror::Error;
use tracing::trace;

use crate::area::{Area, Protection};
use crate::classify::TagLookup;
use crate::codec::{CodecError, ReadAt};
use crate::logging::Hex;
use crate::page::{is_zero_page, PageCounts, PageKind};
use crate::pagemap::PagemapCursor;
use crate::space::AddressSpace;
use crate::state::SavedState;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{op} of {len:#x} bytes at {addr:#x} failed: {source}")]
    Io {
        op: &'static str,
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("page {addr:#x} refers to the base snapshot, which is unavailable")]
    MissingBase { addr: usize },

    #[error("page {addr:#x} refers to the base snapshot, which stores {found:?} there")]
    BaseMismatch { addr: usize, found: Option<PageKind> },

    #[error("file page tag at {addr:#x} cannot be restored")]
    FilePage { addr: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreOptions {
    pub incremental: bool,
    pub present_tracking: bool,
    /// Compare each area against its recorded hash afterwards.
    pub verify_hash: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreStats {
    pub pages: PageCounts,
    pub areas: u64,
    pub loaded_from_base: u64,
    pub hash_mismatches: u64,
}

/// Restore the content of every saved area into `space`.
///
/// `parent` is the snapshot live memory currently corresponds to, if any;
/// `base` must be given whenever `saved` contains base pages.
pub fn restore_pages<S, R>(
    space: &mut S,
    saved: &mut SavedState<'_, R>,
    mut parent: Option<&mut dyn TagLookup>,
    mut base: Option<&mut SavedState<'_, R>>,
    options: RestoreOptions,
) -> Result<RestoreStats, RestoreError>
where
    S: AddressSpace + ?Sized,
    R: ReadAt + ?Sized,
{
    saved.restart()?;
    let mut stats = RestoreStats::default();
    while !saved.area().is_sentinel() {
        let area = *saved.area();
        if area.has_pages() {
            restore_area(space, saved, parent.as_deref_mut(), base.as_deref_mut(), &area, options, &mut stats)?;
            stats.areas += 1;
        }
        saved.next_area()?;
    }
    if options.incremental {
        space.clear_soft_dirty().map_err(|source| RestoreError::Io {
            op: "clear soft-dirty",
            addr: 0,
            len: 0,
            source,
        })?;
    }
    Ok(stats)
}

fn restore_area<S, R>(
    space: &mut S,
    saved: &mut SavedState<'_, R>,
    mut parent: Option<&mut (dyn TagLookup + '_)>,
    mut base: Option<&mut SavedState<'_, R>>,
    area: &Area,
    options: RestoreOptions,
    stats: &mut RestoreStats,
) -> Result<(), RestoreError>
where
    S: AddressSpace + ?Sized,
    R: ReadAt + ?Sized,
{
    let rw = Protection::READ | Protection::WRITE;
    let opened = !area.prot.contains(rw);
    if opened {
        protect(space, area, area.prot | rw)?;
    }
    trace!(start = %Hex(area.start), end = %Hex(area.end), name = %area.name, "restoring area");

    let mut pagemap = PagemapCursor::new(
        area.start,
        area.page_count(),
        options.present_tracking || options.incremental,
    );
    for addr in area.pages() {
        let entry = pagemap.next_entry(&*space).map_err(|source| RestoreError::Io {
            op: "pagemap read",
            addr,
            len: area.end - addr,
            source,
        })?;
        let kind = saved.next_page_tag()?;
        stats.pages.record(kind);
        match kind {
            PageKind::NoPage => {
                if area.is_anonymous() && entry.present() && !is_zero_page(space.page(addr)) {
                    space.zero_page(addr);
                }
            }
            PageKind::ZeroPage => {
                let untouched = area.is_anonymous() && options.present_tracking && !entry.present();
                if !untouched && !is_zero_page(space.page(addr)) {
                    space.zero_page(addr);
                }
            }
            PageKind::FullPage | PageKind::CompressedPage => saved.queue_page_load(space, addr)?,
            PageKind::BasePage => {
                saved.finish_load(space)?;
                let unchanged = match parent.as_deref_mut() {
                    Some(parent) => !entry.soft_dirty() && parent.tag_at(addr)? == Some(PageKind::BasePage),
                    None => false,
                };
                if !unchanged {
                    let base = base.as_deref_mut().ok_or(RestoreError::MissingBase { addr })?;
                    match base.tag_at(addr)? {
                        Some(PageKind::FullPage) => base.queue_page_load(space, addr)?,
                        found => return Err(RestoreError::BaseMismatch { addr, found }),
                    }
                    stats.loaded_from_base += 1;
                }
            }
            PageKind::FilePage => return Err(RestoreError::FilePage { addr }),
        }
    }
    saved.finish_load(space)?;
    if let Some(base) = base.as_deref_mut() {
        base.finish_load(space)?;
    }

    if options.verify_hash && !saved.check_hash(&*space) {
        stats.hash_mismatches += 1;
    }
    if opened {
        protect(space, area, area.prot)?;
    }
    Ok(())
}

fn protect<S: AddressSpace + ?Sized>(space: &mut S, area: &Area, prot: Protection) -> Result<(), RestoreError> {
    space
        .protect(area.start, area.size(), prot)
        .map_err(|source| RestoreError::Io {
            op: "mprotect",
            addr: area.start,
            len: area.size(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::space::SimulatedAddressSpace;
    use crate::state::tests::StreamBuilder;
    use PageKind::*;

    const RW: Protection = Protection::READ.union(Protection::WRITE);

    fn options() -> RestoreOptions {
        RestoreOptions {
            present_tracking: true,
            ..Default::default()
        }
    }

    #[test]
    fn tags_drive_page_content() {
        let streams = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x14000, RW), &[FullPage, ZeroPage, NoPage, FullPage], 0x30)
            .finish();
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x4000, RW);
        space.fill(0x10000, 0x4000, 0xee);

        let (_, mut saved) = SavedState::open(&streams.tags, &streams.content, None).unwrap();
        let stats = restore_pages(&mut space, &mut saved, None, None, options()).unwrap();

        assert_eq!(space.peek(0x10000, 2), [0x30, 0x30]);
        assert_eq!(space.peek(0x11000, PAGE_SIZE), vec![0; PAGE_SIZE]);
        assert_eq!(space.peek(0x12000, PAGE_SIZE), vec![0; PAGE_SIZE], "present non-zero page is cleared");
        assert_eq!(space.peek(0x13000, 1), [0x33]);
        assert_eq!(stats.pages.full_page, 2);
        assert_eq!(stats.areas, 1);
    }

    #[test]
    fn read_only_areas_are_opened_and_closed_again() {
        let streams = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x11000, Protection::READ), &[FullPage], 0x44)
            .finish();
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x1000, Protection::READ);

        let (_, mut saved) = SavedState::open(&streams.tags, &streams.content, None).unwrap();
        restore_pages(&mut space, &mut saved, None, None, options()).unwrap();
        assert_eq!(space.peek(0x10000, 1), [0x44]);
        assert_eq!(space.areas()[0].prot, Protection::READ);
    }

    #[test]
    fn base_pages_come_from_the_base() {
        let base = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x12000, RW), &[FullPage, FullPage], 0x70)
            .finish();
        let state = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x12000, RW), &[BasePage, FullPage], 0x20)
            .finish();
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x2000, RW);

        let (_, mut saved) = SavedState::open(&state.tags, &state.content, None).unwrap();
        let (_, mut base_state) = SavedState::open(&base.tags, &base.content, None).unwrap();
        let stats = restore_pages(&mut space, &mut saved, None, Some(&mut base_state), options()).unwrap();

        assert_eq!(space.peek(0x10000, 1), [0x70]);
        assert_eq!(space.peek(0x11000, 1), [0x21]);
        assert_eq!(stats.loaded_from_base, 1);
    }

    #[test]
    fn clean_pages_matching_the_parent_are_kept() {
        let base = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x12000, RW), &[FullPage, FullPage], 0x70)
            .finish();
        let parent = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x12000, RW), &[BasePage, BasePage], 0)
            .finish();
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x2000, RW);
        space.fill(0x10000, 0x2000, 0x70);
        space.clear_soft_dirty().unwrap();
        space.poke(0x11000, b"x");

        let (_, mut saved) = SavedState::open(&parent.tags, &parent.content, None).unwrap();
        let (_, mut parent_state) = SavedState::open(&parent.tags, &parent.content, None).unwrap();
        let (_, mut base_state) = SavedState::open(&base.tags, &base.content, None).unwrap();
        let stats = restore_pages(
            &mut space,
            &mut saved,
            Some(&mut parent_state),
            Some(&mut base_state),
            RestoreOptions {
                incremental: true,
                ..options()
            },
        )
        .unwrap();

        assert_eq!(stats.loaded_from_base, 1, "only the dirty page is reloaded");
        assert_eq!(space.peek(0x11000, 1), [0x71]);
    }

    #[test]
    fn base_page_without_a_base_is_an_error() {
        let state = StreamBuilder::new()
            .area(Area::anonymous(0x10000, 0x11000, RW), &[BasePage], 0)
            .finish();
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x1000, RW);
        let (_, mut saved) = SavedState::open(&state.tags, &state.content, None).unwrap();
        assert!(matches!(
            restore_pages(&mut space, &mut saved, None, None, options()),
            Err(RestoreError::MissingBase { addr: 0x10000 })
        ));
    }
}
