//! Snapshot writing.
//!
//! Three passes over one stable copy of the live maps:
//! 1. open every saved area for reading and hint sequential access
//! 2. write the header, then each area's record and page tags, storing
//!    page bytes through the content writer; close with the sentinel
//! 3. put protections and access hints back
//!
//! The third pass runs even when the second fails, so a failed save never
//! leaves the process with widened protections.

use std::io::{self, Write};

use thiserror::Error;
use tracing::{debug, trace};

use crate::area::{Area, MapsParseError, ProcMaps, Protection, SkipPolicy};
use crate::classify::{ClassifyOptions, SaveClassifier, TagLookup};
use crate::codec::{area_hash, CodecError, ContentWriter, StateHeader, TagWriter, AREA_RECORD_LEN, HEADER_LEN};
use crate::logging::Hex;
use crate::page::{PageCounts, PageKind};
use crate::pagemap::PagemapCursor;
use crate::space::{AddressSpace, Advice};

#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Codec(#[from] CodecError),

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
}

impl SaveError {
    fn io(op: &'static str, addr: usize, len: usize) -> impl FnOnce(io::Error) -> SaveError {
        move |source| SaveError::Io { op, addr, len, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveOptions {
    pub incremental: bool,
    /// Writing the base snapshot of the incremental chain.
    pub building_base: bool,
    pub present_tracking: bool,
    /// Re-inspect pages inherited from the chain.
    pub verify: bool,
    /// Record a content hash per area.
    pub hash_areas: bool,
}

/// Sizes and page counts of one written snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveStats {
    pub pages: PageCounts,
    pub areas: u64,
    pub uncommitted_areas: u64,
    pub tag_bytes: u64,
    pub content_bytes: u64,
    /// Inherited pages that failed verification and were stored.
    pub mismatches: u64,
}

impl SaveStats {
    pub fn total_bytes(&self) -> u64 {
        self.tag_bytes + self.content_bytes
    }
}

/// Write a snapshot of the areas listed in `maps_text`.
#[allow(clippy::too_many_arguments)]
pub fn save_areas<S, T, C>(
    space: &mut S,
    maps_text: &[u8],
    policy: SkipPolicy,
    header: &StateHeader,
    tags: &mut T,
    content: &mut ContentWriter<'_, C>,
    parent: Option<&mut dyn TagLookup>,
    base: Option<&mut dyn TagLookup>,
    options: SaveOptions,
) -> Result<SaveStats, SaveError>
where
    S: AddressSpace + ?Sized,
    T: Write + ?Sized,
    C: Write,
{
    let opened = open_for_reading(space, maps_text, policy);
    let written = match opened {
        Ok(()) => write_areas(space, maps_text, policy, header, tags, content, parent, base, options),
        Err(e) => Err(e),
    };
    let restored = restore_protections(space, maps_text, policy);
    let stats = written?;
    restored?;

    if options.incremental {
        space.clear_soft_dirty().map_err(SaveError::io("clear soft-dirty", 0, 0))?;
    }
    Ok(stats)
}

fn open_for_reading<S: AddressSpace + ?Sized>(space: &mut S, maps_text: &[u8], policy: SkipPolicy) -> Result<(), SaveError> {
    for area in ProcMaps::new(maps_text, policy) {
        let area = area?;
        if area.skip {
            continue;
        }
        if !area.prot.contains(Protection::READ) {
            space
                .protect(area.start, area.size(), area.prot | Protection::READ)
                .map_err(SaveError::io("mprotect", area.start, area.size()))?;
        }
        if let Err(e) = space.advise(area.start, area.size(), Advice::Sequential) {
            trace!(addr = %Hex(area.start), error = %e, "sequential hint refused");
        }
    }
    Ok(())
}

fn restore_protections<S: AddressSpace + ?Sized>(space: &mut S, maps_text: &[u8], policy: SkipPolicy) -> Result<(), SaveError> {
    for area in ProcMaps::new(maps_text, policy) {
        let area = area?;
        if area.skip {
            continue;
        }
        if !area.prot.contains(Protection::READ) {
            space
                .protect(area.start, area.size(), area.prot)
                .map_err(SaveError::io("mprotect", area.start, area.size()))?;
        }
        if let Err(e) = space.advise(area.start, area.size(), Advice::Normal) {
            trace!(addr = %Hex(area.start), error = %e, "normal hint refused");
        }
    }
    Ok(())
}

/// Whether any page of `area` is populated.
fn has_present_page<S: AddressSpace + ?Sized>(space: &S, area: &Area) -> io::Result<bool> {
    let mut cursor = PagemapCursor::new(area.start, area.page_count(), true);
    for _ in 0..area.page_count() {
        if cursor.next_entry(space)?.present() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[allow(clippy::too_many_arguments)]
fn write_areas<S, T, C>(
    space: &S,
    maps_text: &[u8],
    policy: SkipPolicy,
    header: &StateHeader,
    tags: &mut T,
    content: &mut ContentWriter<'_, C>,
    parent: Option<&mut dyn TagLookup>,
    base: Option<&mut dyn TagLookup>,
    options: SaveOptions,
) -> Result<SaveStats, SaveError>
where
    S: AddressSpace + ?Sized,
    T: Write + ?Sized,
    C: Write,
{
    let mut stats = SaveStats::default();
    let mut classifier = SaveClassifier::new(
        ClassifyOptions {
            incremental: options.incremental,
            building_base: options.building_base,
            present_tracking: options.present_tracking,
            verify: options.verify,
        },
        parent.map(|p| -> &mut dyn TagLookup { p }),
        base.map(|b| -> &mut dyn TagLookup { b }),
    );

    let mut raw_header = [0u8; HEADER_LEN];
    header.encode(&mut raw_header);
    tags.write_all(&raw_header).map_err(CodecError::from)?;
    stats.tag_bytes = HEADER_LEN as u64;

    let mut record = [0u8; AREA_RECORD_LEN];
    let mut writer = TagWriter::new();
    for area in ProcMaps::new(maps_text, policy) {
        let mut area = area?;
        if !area.skip
            && area.is_reservation()
            && (!options.present_tracking
                || !has_present_page(space, &area).map_err(SaveError::io("pagemap read", area.start, area.size()))?)
        {
            area.uncommitted = true;
            stats.uncommitted_areas += 1;
        }
        area.page_offset = content.position();
        if options.hash_areas && area.has_pages() {
            area.hash = area_hash(space, &area).map_err(SaveError::io("pagemap read", area.start, area.size()))?;
        }

        area.encode(&mut record);
        tags.write_all(&record).map_err(CodecError::from)?;
        stats.tag_bytes += AREA_RECORD_LEN as u64;
        stats.areas += 1;
        if !area.has_pages() {
            continue;
        }

        let mut pagemap = PagemapCursor::new(
            area.start,
            area.page_count(),
            options.present_tracking || options.incremental,
        );
        let mut counts = PageCounts::default();
        for addr in area.pages() {
            let entry = pagemap
                .next_entry(space)
                .map_err(SaveError::io("pagemap read", addr, area.end - addr))?;
            let mut kind = classifier.classify(space, &area, addr, entry)?;
            if kind == PageKind::FullPage {
                kind = content.store_page(space, addr)?;
            }
            counts.record(kind);
            writer.push(tags, kind)?;
        }
        content.flush(space)?;
        writer.flush(tags)?;
        stats.tag_bytes += area.page_count() as u64;
        trace!(
            start = %Hex(area.start),
            end = %Hex(area.end),
            name = %area.name,
            full = counts.full_page + counts.compressed_page,
            base = counts.base_page,
            zero = counts.zero_page,
            "area saved"
        );
        stats.pages.merge(&counts);
    }

    Area::sentinel().encode(&mut record);
    tags.write_all(&record).map_err(CodecError::from)?;
    tags.flush().map_err(CodecError::from)?;
    stats.tag_bytes += AREA_RECORD_LEN as u64;
    stats.content_bytes = content.position();
    stats.mismatches = classifier.mismatches();

    debug!(
        areas = stats.areas,
        uncommitted = stats.uncommitted_areas,
        pages = stats.pages.total(),
        bytes = stats.total_bytes(),
        "snapshot written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SimulatedAddressSpace;
    use crate::state::SavedState;

    const RW: Protection = Protection::READ.union(Protection::WRITE);

    fn maps_of(space: &SimulatedAddressSpace) -> Vec<u8> {
        let mut buf = vec![0u8; 1 << 16];
        let len = space.read_maps(&mut buf).unwrap();
        buf.truncate(len);
        buf
    }

    fn save(space: &mut SimulatedAddressSpace, options: SaveOptions) -> (Vec<u8>, Vec<u8>, SaveStats) {
        let text = maps_of(space);
        let mut tags = Vec::new();
        let mut content = ContentWriter::new(Vec::new(), None);
        let stats = save_areas(
            space,
            &text,
            SkipPolicy::default(),
            &StateHeader::new(),
            &mut tags,
            &mut content,
            None,
            None,
            options,
        )
        .unwrap();
        (tags, content.into_inner(), stats)
    }

    #[test]
    fn writes_records_tags_and_content() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x3000, RW);
        space.poke(0x10000, b"AB");
        space.poke(0x12000, b"CD");

        let (tags, content, stats) = save(
            &mut space,
            SaveOptions {
                present_tracking: true,
                ..Default::default()
            },
        );
        assert_eq!(stats.pages.full_page, 2);
        assert_eq!(stats.pages.no_page, 1);
        assert_eq!(content.len(), 2 * crate::page::PAGE_SIZE);
        assert_eq!(stats.content_bytes, content.len() as u64);
        assert_eq!(stats.tag_bytes, tags.len() as u64);

        let (_, mut state) = SavedState::open(&tags, &content, None).unwrap();
        assert_eq!(state.area().start, 0x10000);
        assert_eq!(state.tag_at(0x11000).unwrap(), Some(PageKind::NoPage));
        assert!(state.next_area().unwrap().is_sentinel());
    }

    fn page_tags(tags: &[u8], content: &[u8]) -> Vec<PageKind> {
        let (_, mut state) = SavedState::open(tags, content, None).unwrap();
        let mut kinds = Vec::new();
        loop {
            let area = *state.area();
            if area.is_sentinel() {
                return kinds;
            }
            if area.has_pages() {
                for _ in 0..area.page_count() {
                    kinds.push(state.next_page_tag().unwrap());
                }
            }
            state.next_area().unwrap();
        }
    }

    #[test]
    fn area_hashing_does_not_change_page_tags() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x3000, RW);
        space.poke(0x10000, b"AB");
        space.fill(0x12000, crate::page::PAGE_SIZE, 0);
        let tracked = SaveOptions {
            present_tracking: true,
            ..Default::default()
        };

        let (hashed_tags, hashed_content, hashed) = save(
            &mut space,
            SaveOptions {
                hash_areas: true,
                ..tracked
            },
        );
        assert!(!space.is_present(0x11000), "hashing touched an absent page");
        let (plain_tags, plain_content, plain) = save(&mut space, tracked);

        assert_eq!(hashed.pages, plain.pages);
        assert_eq!(hashed.pages.no_page, 1);
        assert_eq!(
            page_tags(&hashed_tags, &hashed_content),
            page_tags(&plain_tags, &plain_content)
        );
        assert_eq!(hashed_content, plain_content);
    }

    #[test]
    fn unreadable_areas_are_opened_then_restored() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x1000, Protection::WRITE);
        space.poke(0x10000, b"x");
        let (_, _, stats) = save(&mut space, SaveOptions::default());
        assert_eq!(stats.pages.full_page, 1);
        assert_eq!(space.areas()[0].prot, Protection::WRITE);
    }

    #[test]
    fn reservations_are_recorded_without_pages() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x100000, Protection::empty());
        space.map_anonymous(0x200000, 0x1000, RW);
        let (tags, _, stats) = save(
            &mut space,
            SaveOptions {
                present_tracking: true,
                ..Default::default()
            },
        );
        assert_eq!(stats.uncommitted_areas, 1);
        assert_eq!(stats.pages.total(), 1);

        let no_content = Vec::new();
        let (_, state) = SavedState::open(&tags, &no_content, None).unwrap();
        assert!(state.area().uncommitted);
    }

    #[test]
    fn incremental_save_clears_soft_dirty() {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x1000, RW);
        save(
            &mut space,
            SaveOptions {
                incremental: true,
                building_base: true,
                ..Default::default()
            },
        );
        assert_eq!(space.ops().last(), Some(&crate::space::SimOp::ClearSoftDirty));
    }
}
