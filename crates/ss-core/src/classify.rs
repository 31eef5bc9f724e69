//! Save-side page classification.
//!
//! Decides, page by page, whether a page is stored, synthesized on restore,
//! or inherited from the incremental chain. Inheritance relies on the
//! soft-dirty bit: a clean page is assumed to still hold what the parent (or
//! base) recorded. With verification on, that assumption is checked against
//! live memory and a failed check stores the page in full.

use tracing::warn;

use crate::area::Area;
use crate::codec::CodecError;
use crate::logging::Hex;
use crate::page::{is_zero_page, PageKind, PAGE_SIZE};
use crate::pagemap::PagemapEntry;
use crate::space::AddressSpace;

/// Forward-only tag lookups into a stored snapshot.
pub trait TagLookup {
    /// Tag of the page at `addr`, `None` when the snapshot holds nothing for it.
    fn tag_at(&mut self, addr: usize) -> Result<Option<PageKind>, CodecError>;

    /// Raw bytes of the page last returned by `tag_at`, when stored raw.
    fn stored_page(&self, _buf: &mut [u8; PAGE_SIZE]) -> Result<bool, CodecError> {
        Ok(false)
    }
}

impl<R: crate::codec::ReadAt + ?Sized> TagLookup for crate::state::SavedState<'_, R> {
    fn tag_at(&mut self, addr: usize) -> Result<Option<PageKind>, CodecError> {
        crate::state::SavedState::tag_at(self, addr)
    }

    fn stored_page(&self, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, CodecError> {
        crate::state::SavedState::stored_page(self, buf)
    }
}

/// Flags steering classification for one save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassifyOptions {
    pub incremental: bool,
    /// Writing the base snapshot itself; nothing is inherited.
    pub building_base: bool,
    /// Unpopulated pages become `NoPage`.
    pub present_tracking: bool,
    /// Re-inspect inherited pages before trusting them.
    pub verify: bool,
}

/// Page classifier for one save pass.
pub struct SaveClassifier<'r> {
    options: ClassifyOptions,
    parent: Option<&'r mut dyn TagLookup>,
    base: Option<&'r mut dyn TagLookup>,
    stored: [u8; PAGE_SIZE],
    mismatches: u64,
}

impl<'r> SaveClassifier<'r> {
    pub fn new(
        options: ClassifyOptions,
        parent: Option<&'r mut dyn TagLookup>,
        base: Option<&'r mut dyn TagLookup>,
    ) -> Self {
        SaveClassifier {
            options,
            parent,
            base,
            stored: [0; PAGE_SIZE],
            mismatches: 0,
        }
    }

    /// Pages whose inherited tag failed verification so far.
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    /// Classify the page at `addr` of `area`.
    ///
    /// `FullPage` means "store the bytes"; the content writer decides
    /// whether they go out raw or compressed.
    pub fn classify<S: AddressSpace + ?Sized>(
        &mut self,
        space: &S,
        area: &Area,
        addr: usize,
        entry: PagemapEntry,
    ) -> Result<PageKind, CodecError> {
        let opts = self.options;
        if opts.present_tracking && !entry.present() {
            return Ok(PageKind::NoPage);
        }
        if area.is_anonymous() && is_zero_page(space.page(addr)) {
            return Ok(PageKind::ZeroPage);
        }
        if !opts.incremental || opts.building_base || entry.soft_dirty() {
            return Ok(PageKind::FullPage);
        }

        let inherited = self.reference_tag(addr)?;
        if inherited != PageKind::FullPage && opts.verify && !self.verify(space, addr, inherited)? {
            self.mismatches += 1;
            warn!(
                addr = %Hex(addr),
                assumed = %inherited,
                "clean page differs from its reference, storing it"
            );
            return Ok(PageKind::FullPage);
        }
        Ok(inherited)
    }

    fn reference_tag(&mut self, addr: usize) -> Result<PageKind, CodecError> {
        // A parent that never saw the page defers to the base.
        if let Some(parent) = self.parent.as_deref_mut() {
            match parent.tag_at(addr)? {
                Some(kind @ (PageKind::ZeroPage | PageKind::BasePage)) => return Ok(kind),
                Some(_) => return Ok(PageKind::FullPage),
                None => {}
            }
        }
        if let Some(base) = self.base.as_deref_mut() {
            return Ok(match base.tag_at(addr)? {
                Some(PageKind::FullPage) => PageKind::BasePage,
                Some(PageKind::ZeroPage) => PageKind::ZeroPage,
                _ => PageKind::FullPage,
            });
        }
        Ok(PageKind::FullPage)
    }

    fn verify<S: AddressSpace + ?Sized>(&mut self, space: &S, addr: usize, kind: PageKind) -> Result<bool, CodecError> {
        let live = space.page(addr);
        match kind {
            PageKind::ZeroPage => Ok(is_zero_page(live)),
            PageKind::BasePage => {
                let Some(base) = self.base.as_deref_mut() else {
                    return Ok(false);
                };
                if base.tag_at(addr)? != Some(PageKind::FullPage) {
                    return Ok(false);
                }
                Ok(base.stored_page(&mut self.stored)? && self.stored[..] == live[..])
            }
            _ => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::Protection;
    use crate::space::SimulatedAddressSpace;
    use std::collections::BTreeMap;

    /// Lookup table standing in for a stored snapshot.
    #[derive(Default)]
    struct FixedTags {
        tags: BTreeMap<usize, PageKind>,
        bytes: BTreeMap<usize, u8>,
        last: Option<usize>,
    }

    impl FixedTags {
        fn with(mut self, addr: usize, kind: PageKind, fill: u8) -> Self {
            self.tags.insert(addr, kind);
            self.bytes.insert(addr, fill);
            self
        }
    }

    impl TagLookup for FixedTags {
        fn tag_at(&mut self, addr: usize) -> Result<Option<PageKind>, CodecError> {
            self.last = Some(addr);
            Ok(self.tags.get(&addr).copied())
        }

        fn stored_page(&self, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, CodecError> {
            let Some(fill) = self.last.and_then(|a| self.bytes.get(&a)) else {
                return Ok(false);
            };
            buf.fill(*fill);
            Ok(true)
        }
    }

    const RW: Protection = Protection::READ.union(Protection::WRITE);
    const CLEAN_PRESENT: PagemapEntry = PagemapEntry(PagemapEntry::PRESENT);
    const DIRTY_PRESENT: PagemapEntry = PagemapEntry(PagemapEntry::PRESENT | PagemapEntry::SOFT_DIRTY);

    fn space() -> (SimulatedAddressSpace, Area) {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10000, 0x4000, RW);
        space.fill(0x10000, 0x4000, 0x5a);
        (space, Area::anonymous(0x10000, 0x14000, RW))
    }

    fn incremental() -> ClassifyOptions {
        ClassifyOptions {
            incremental: true,
            present_tracking: true,
            ..Default::default()
        }
    }

    #[test]
    fn absent_and_zero_pages_come_first() {
        let (mut space, area) = space();
        space.fill(0x11000, PAGE_SIZE, 0);
        let mut classifier = SaveClassifier::new(incremental(), None, None);
        assert_eq!(
            classifier.classify(&space, &area, 0x10000, PagemapEntry(0)).unwrap(),
            PageKind::NoPage
        );
        assert_eq!(
            classifier.classify(&space, &area, 0x11000, DIRTY_PRESENT).unwrap(),
            PageKind::ZeroPage
        );
        assert_eq!(
            classifier.classify(&space, &area, 0x12000, CLEAN_PRESENT).unwrap(),
            PageKind::FullPage,
            "no reference available"
        );
    }

    #[test]
    fn parent_tags_are_inherited_for_clean_pages() {
        let (space, area) = space();
        let mut parent = FixedTags::default()
            .with(0x10000, PageKind::BasePage, 0)
            .with(0x11000, PageKind::FullPage, 0)
            .with(0x12000, PageKind::CompressedPage, 0);
        let mut base = FixedTags::default();
        let mut classifier = SaveClassifier::new(incremental(), Some(&mut parent), Some(&mut base));

        let kinds: Vec<_> = [0x10000, 0x11000, 0x12000, 0x13000]
            .iter()
            .map(|addr| classifier.classify(&space, &area, *addr, CLEAN_PRESENT).unwrap())
            .collect();
        assert_eq!(
            kinds,
            [PageKind::BasePage, PageKind::FullPage, PageKind::FullPage, PageKind::FullPage]
        );
        assert_eq!(
            classifier.classify(&space, &area, 0x10000, DIRTY_PRESENT).unwrap(),
            PageKind::FullPage,
            "dirty pages are always stored"
        );
    }

    #[test]
    fn base_is_consulted_without_a_parent() {
        let (space, area) = space();
        let mut base = FixedTags::default()
            .with(0x10000, PageKind::FullPage, 0x5a)
            .with(0x11000, PageKind::NoPage, 0);
        let mut classifier = SaveClassifier::new(incremental(), None, Some(&mut base));
        assert_eq!(
            classifier.classify(&space, &area, 0x10000, CLEAN_PRESENT).unwrap(),
            PageKind::BasePage
        );
        assert_eq!(
            classifier.classify(&space, &area, 0x11000, CLEAN_PRESENT).unwrap(),
            PageKind::FullPage
        );
    }

    #[test]
    fn pages_the_parent_never_saw_fall_back_to_the_base() {
        let (space, area) = space();
        let mut parent = FixedTags::default().with(0x10000, PageKind::FullPage, 0);
        let mut base = FixedTags::default()
            .with(0x11000, PageKind::FullPage, 0x5a)
            .with(0x12000, PageKind::ZeroPage, 0);
        let mut classifier = SaveClassifier::new(incremental(), Some(&mut parent), Some(&mut base));

        let kinds: Vec<_> = [0x10000, 0x11000, 0x12000, 0x13000]
            .iter()
            .map(|addr| classifier.classify(&space, &area, *addr, CLEAN_PRESENT).unwrap())
            .collect();
        assert_eq!(
            kinds,
            [PageKind::FullPage, PageKind::BasePage, PageKind::ZeroPage, PageKind::FullPage]
        );
    }

    #[test]
    fn building_the_base_inherits_nothing() {
        let (space, area) = space();
        let mut base = FixedTags::default().with(0x10000, PageKind::FullPage, 0x5a);
        let options = ClassifyOptions {
            building_base: true,
            ..incremental()
        };
        let mut classifier = SaveClassifier::new(options, None, Some(&mut base));
        assert_eq!(
            classifier.classify(&space, &area, 0x10000, CLEAN_PRESENT).unwrap(),
            PageKind::FullPage
        );
    }

    #[test]
    fn verification_catches_stale_assumptions() {
        let (space, area) = space();
        let mut base = FixedTags::default()
            .with(0x10000, PageKind::FullPage, 0x5a)
            .with(0x11000, PageKind::FullPage, 0x11);
        let options = ClassifyOptions {
            verify: true,
            ..incremental()
        };
        let mut classifier = SaveClassifier::new(options, None, Some(&mut base));
        assert_eq!(
            classifier.classify(&space, &area, 0x10000, CLEAN_PRESENT).unwrap(),
            PageKind::BasePage
        );
        assert_eq!(
            classifier.classify(&space, &area, 0x11000, CLEAN_PRESENT).unwrap(),
            PageKind::FullPage,
            "live bytes differ from the base"
        );
        assert_eq!(classifier.mismatches(), 1);
    }

    #[test]
    fn inherited_zero_is_verified_against_live_memory() {
        let (space, area) = space();
        let mut parent = FixedTags::default().with(0x10000, PageKind::ZeroPage, 0);
        let options = ClassifyOptions {
            verify: true,
            ..incremental()
        };
        let mut classifier = SaveClassifier::new(options, Some(&mut parent), None);
        assert_eq!(
            classifier.classify(&space, &area, 0x10000, CLEAN_PRESENT).unwrap(),
            PageKind::FullPage
        );

        let options = ClassifyOptions {
            verify: false,
            ..incremental()
        };
        let mut parent = FixedTags::default().with(0x10000, PageKind::ZeroPage, 0);
        let mut trusting = SaveClassifier::new(options, Some(&mut parent), None);
        assert_eq!(
            trusting.classify(&space, &area, 0x10000, CLEAN_PRESENT).unwrap(),
            PageKind::ZeroPage,
            "trusting mode keeps the stale assumption"
        );
    }
}
