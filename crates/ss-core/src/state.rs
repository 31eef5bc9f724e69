//! Reader over a stored snapshot.
//!
//! A `SavedState` walks the tag stream area by area and page by page,
//! tracking where each page's bytes sit in the content stream. It serves
//! three users: the reconciler (area records only), the restore engine
//! (sequential tags plus page loads) and the save classifier (forward
//! random lookups into a parent or base).
//!
//! All reads are positioned, so several readers over the same snapshot never
//! disturb each other.

use miniz_oxide::inflate::stream::InflateState;
use miniz_oxide::DataFormat;
use tracing::warn;

use crate::area::Area;
use crate::codec::{
    area_hash, inflate_page, CodecError, PositionedReader, ReadAt, StateHeader, TagReader, AREA_RECORD_LEN,
    COMPRESS_SCRATCH, HEADER_LEN,
};
use crate::logging::Hex;
use crate::page::{PageKind, PAGE_SIZE};
use crate::space::AddressSpace;

/// Read and validate the header at the start of a tag stream.
pub fn read_header<R: ReadAt + ?Sized>(tags: &R) -> Result<StateHeader, CodecError> {
    let mut raw = [0u8; HEADER_LEN];
    tags.read_exact_at(&mut raw, 0)?;
    StateHeader::decode(&raw)
}

#[derive(Debug, Clone, Copy)]
struct QueuedRun {
    addr: usize,
    offset: u64,
    len: usize,
}

/// Cursor over one snapshot's areas and page tags.
pub struct SavedState<'s, R: ReadAt + ?Sized> {
    tags: &'s R,
    content: &'s R,
    inflater: Option<&'s mut InflateState>,
    next_record: u64,
    area: Area,
    at_end: bool,
    reader: TagReader,
    /// Address just past the last page whose tag was consumed.
    current_addr: usize,
    current_tag: Option<PageKind>,
    /// Content offset just past the last consumed page's bytes.
    next_content: u64,
    /// Offset and length of the last consumed compressed block.
    block: (u64, usize),
    queued: Option<QueuedRun>,
}

impl<'s, R: ReadAt + ?Sized> SavedState<'s, R> {
    /// Open a snapshot and position it on its first area.
    ///
    /// `inflater` is needed only when compressed pages are going to be
    /// loaded; lookups work without it.
    pub fn open(tags: &'s R, content: &'s R, inflater: Option<&'s mut InflateState>) -> Result<(StateHeader, Self), CodecError> {
        let header = read_header(tags)?;
        let mut state = SavedState {
            tags,
            content,
            inflater,
            next_record: HEADER_LEN as u64,
            area: Area::sentinel(),
            at_end: false,
            reader: TagReader::new(),
            current_addr: 0,
            current_tag: None,
            next_content: 0,
            block: (0, 0),
            queued: None,
        };
        state.restart()?;
        Ok((header, state))
    }

    /// Rewind to the first area.
    pub fn restart(&mut self) -> Result<(), CodecError> {
        if let Some(inflater) = self.inflater.as_deref_mut() {
            inflater.reset(DataFormat::Raw);
        }
        self.next_record = HEADER_LEN as u64;
        self.at_end = false;
        self.queued = None;
        self.next_area()?;
        Ok(())
    }

    /// The area under the cursor; the sentinel once the list is exhausted.
    pub fn area(&self) -> &Area {
        &self.area
    }

    /// Move to the next area record, skipping unread tags.
    pub fn next_area(&mut self) -> Result<&Area, CodecError> {
        if self.at_end {
            return Ok(&self.area);
        }
        let at = self.next_record;
        let mut raw = [0u8; AREA_RECORD_LEN];
        self.tags.read_exact_at(&mut raw, at)?;
        let area = Area::decode(&raw, at)?;

        let tag_count = if area.has_pages() { area.page_count() as u64 } else { 0 };
        let tags_at = at + AREA_RECORD_LEN as u64;
        self.reader.begin(tags_at, tag_count);
        self.next_record = tags_at + tag_count;
        self.current_addr = area.start;
        self.current_tag = None;
        self.next_content = area.page_offset;
        self.at_end = area.is_sentinel();
        self.area = area;
        Ok(&self.area)
    }

    /// Tag of the next page of the current area.
    pub fn next_page_tag(&mut self) -> Result<PageKind, CodecError> {
        let addr = self.current_addr;
        let byte = self.reader.next_byte(self.tags)?.ok_or(CodecError::TagsExhausted)?;
        let kind = PageKind::from_byte(byte).ok_or(CodecError::BadTag { tag: byte, addr })?;
        match kind {
            PageKind::FullPage => self.next_content += PAGE_SIZE as u64,
            PageKind::CompressedPage => {
                let mut len = [0u8; 4];
                self.content.read_exact_at(&mut len, self.next_content)?;
                let len = u32::from_le_bytes(len) as usize;
                if len > COMPRESS_SCRATCH {
                    return Err(CodecError::BlockTooLarge { len });
                }
                self.block = (self.next_content + 4, len);
                self.next_content += 4 + len as u64;
            }
            _ => {}
        }
        self.current_addr += PAGE_SIZE;
        self.current_tag = Some(kind);
        Ok(kind)
    }

    /// Tag stored for the page at `addr`, or `None` when the snapshot holds
    /// nothing for it (unmapped, skipped or uncommitted).
    ///
    /// Queries must come in ascending address order; asking for the page
    /// just returned again is allowed.
    pub fn tag_at(&mut self, addr: usize) -> Result<Option<PageKind>, CodecError> {
        if self.current_tag.is_some() && addr + PAGE_SIZE == self.current_addr {
            return Ok(self.current_tag);
        }
        while !self.area.is_sentinel() && addr >= self.area.end {
            self.next_area()?;
        }
        if self.area.is_sentinel() || addr < self.area.start || !self.area.has_pages() {
            return Ok(None);
        }
        if addr < self.current_addr {
            return Err(CodecError::Backwards {
                addr,
                position: self.current_addr,
            });
        }
        let mut kind = None;
        while self.current_addr <= addr {
            kind = Some(self.next_page_tag()?);
        }
        Ok(kind)
    }

    /// Load the bytes of the page whose tag was consumed last into `addr`.
    ///
    /// Raw pages are queued and read as one run while addresses and content
    /// offsets stay contiguous. Compressed pages are inflated immediately.
    pub fn queue_page_load<S: AddressSpace + ?Sized>(&mut self, space: &mut S, addr: usize) -> Result<(), CodecError> {
        debug_assert_eq!(addr + PAGE_SIZE, self.current_addr, "load of a page other than the last consumed");
        match self.current_tag {
            Some(PageKind::FullPage) => {
                let offset = self.next_content - PAGE_SIZE as u64;
                match self.queued.as_mut() {
                    Some(run) if run.addr + run.len == addr && run.offset + run.len as u64 == offset => {
                        run.len += PAGE_SIZE;
                    }
                    _ => {
                        self.finish_load(space)?;
                        self.queued = Some(QueuedRun {
                            addr,
                            offset,
                            len: PAGE_SIZE,
                        });
                    }
                }
                Ok(())
            }
            Some(PageKind::CompressedPage) => {
                self.finish_load(space)?;
                let (offset, len) = self.block;
                let mut block = [0u8; COMPRESS_SCRATCH];
                self.content.read_exact_at(&mut block[..len], offset)?;
                let inflater = self.inflater.as_deref_mut().ok_or(CodecError::Inflate { addr })?;
                inflate_page(inflater, &block[..len], space.page_mut(addr), addr)
            }
            _ => Ok(()),
        }
    }

    /// Read the queued run of raw pages, if any.
    pub fn finish_load<S: AddressSpace + ?Sized>(&mut self, space: &mut S) -> Result<(), CodecError> {
        if let Some(run) = self.queued.take() {
            let mut source = PositionedReader::new(self.content, run.offset);
            space.read_pages(run.addr, run.len, &mut source)?;
        }
        Ok(())
    }

    /// Copy the stored bytes of the last consumed page into `buf`. Returns
    /// `false` when that page has no raw bytes in this snapshot.
    pub fn stored_page(&self, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, CodecError> {
        if self.current_tag != Some(PageKind::FullPage) {
            return Ok(false);
        }
        self.content.read_exact_at(buf, self.next_content - PAGE_SIZE as u64)?;
        Ok(true)
    }

    /// Compare the live content of the current area against its recorded
    /// hash. Mismatches are logged, never fatal.
    pub fn check_hash<S: AddressSpace + ?Sized>(&self, space: &S) -> bool {
        if self.area.hash == 0 {
            return true;
        }
        let live = match area_hash(space, &self.area) {
            Ok(live) => live,
            Err(e) => {
                warn!(start = %Hex(self.area.start), error = %e, "area hash unavailable");
                return false;
            }
        };
        if live != self.area.hash {
            warn!(
                start = %Hex(self.area.start),
                stored = %Hex(self.area.hash as usize),
                live = %Hex(live as usize),
                "area hash mismatch"
            );
            return false;
        }
        true
    }
}
