//! Page-content stream.
//!
//! Raw pages are coalesced: consecutive page addresses are queued and
//! written with one call once the run breaks. Compressed pages are written
//! one block at a time as a little-endian `u32` length followed by the
//! raw-deflate output of a compressor shared by the whole snapshot.

use flate2::{Compress, FlushCompress};
use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::MZFlush;
use std::io::{self, Read, Write};

use super::{CodecError, ReadAt};
use crate::page::{PageKind, PAGE_SIZE};
use crate::space::AddressSpace;

/// Room for one compressed page, including deflate's worst-case expansion.
pub const COMPRESS_SCRATCH: usize = PAGE_SIZE + 1024;

/// Appends page records to the content stream.
pub struct ContentWriter<'c, W: Write> {
    out: W,
    position: u64,
    pending: Option<(usize, usize)>,
    compressor: Option<&'c mut Compress>,
    scratch: [u8; COMPRESS_SCRATCH],
}

impl<'c, W: Write> ContentWriter<'c, W> {
    /// Writer appending to an empty stream. A compressor, when given, is
    /// reset and used for every stored page.
    pub fn new(out: W, compressor: Option<&'c mut Compress>) -> Self {
        let compressor = compressor.map(|c| {
            c.reset();
            c
        });
        ContentWriter {
            out,
            position: 0,
            pending: None,
            compressor,
            scratch: [0; COMPRESS_SCRATCH],
        }
    }

    /// Stream offset of the next record, counting queued pages.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Store the page at `addr`; returns the tag describing how.
    pub fn store_page<S: AddressSpace + ?Sized>(&mut self, space: &S, addr: usize) -> Result<PageKind, CodecError> {
        if self.compressor.is_some() {
            self.flush(space)?;
            let len = self.deflate(space.page(addr))?;
            self.out.write_all(&(len as u32).to_le_bytes())?;
            self.out.write_all(&self.scratch[..len])?;
            self.position += 4 + len as u64;
            return Ok(PageKind::CompressedPage);
        }

        match self.pending {
            Some((start, len)) if start + len == addr => {
                self.pending = Some((start, len + PAGE_SIZE));
            }
            _ => {
                self.flush(space)?;
                self.pending = Some((addr, PAGE_SIZE));
            }
        }
        self.position += PAGE_SIZE as u64;
        Ok(PageKind::FullPage)
    }

    /// Write out the queued run of raw pages.
    pub fn flush<S: AddressSpace + ?Sized>(&mut self, space: &S) -> Result<(), CodecError> {
        if let Some((addr, len)) = self.pending.take() {
            space.write_pages(addr, len, &mut self.out)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn deflate(&mut self, page: &[u8]) -> Result<usize, CodecError> {
        let Some(compressor) = self.compressor.as_deref_mut() else {
            return Ok(0);
        };
        let in_start = compressor.total_in();
        let out_start = compressor.total_out();
        loop {
            let consumed = (compressor.total_in() - in_start) as usize;
            let produced = (compressor.total_out() - out_start) as usize;
            if produced == self.scratch.len() {
                return Err(CodecError::BlockTooLarge { len: produced });
            }
            compressor.compress(&page[consumed..], &mut self.scratch[produced..], FlushCompress::Sync)?;
            let now_consumed = (compressor.total_in() - in_start) as usize;
            let now_produced = (compressor.total_out() - out_start) as usize;
            if now_consumed == page.len() && now_produced < self.scratch.len() {
                return Ok(now_produced);
            }
            if now_consumed == consumed && now_produced == produced {
                return Err(CodecError::BlockTooLarge { len: now_produced });
            }
        }
    }
}

/// `Read` adapter over positioned reads, starting at a fixed offset.
pub struct PositionedReader<'a, R: ReadAt + ?Sized> {
    src: &'a R,
    offset: u64,
}

impl<'a, R: ReadAt + ?Sized> PositionedReader<'a, R> {
    pub fn new(src: &'a R, offset: u64) -> Self {
        PositionedReader { src, offset }
    }
}

impl<R: ReadAt + ?Sized> Read for PositionedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.src.read_exact_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }
}

/// Decompress one block into `out`, which must end up exactly filled.
///
/// The inflater keeps its window between calls, so blocks must be fed in
/// the order they were written.
pub fn inflate_page(state: &mut InflateState, input: &[u8], out: &mut [u8], addr: usize) -> Result<(), CodecError> {
    let mut consumed = 0;
    let mut written = 0;
    while written < out.len() {
        let step = inflate(state, &input[consumed..], &mut out[written..], MZFlush::None);
        consumed += step.bytes_consumed;
        written += step.bytes_written;
        if step.status.is_err() || (step.bytes_consumed == 0 && step.bytes_written == 0) {
            return Err(CodecError::Inflate { addr });
        }
    }
    // The flush marker after the page produces no output.
    let mut tail = [0u8; 64];
    while consumed < input.len() {
        let step = inflate(state, &input[consumed..], &mut tail, MZFlush::None);
        consumed += step.bytes_consumed;
        if step.status.is_err() || step.bytes_written != 0 || step.bytes_consumed == 0 {
            return Err(CodecError::Inflate { addr });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::Protection;
    use crate::space::SimulatedAddressSpace;
    use flate2::Compression;
    use miniz_oxide::DataFormat;

    /// Counts write calls reaching the stream.
    #[derive(Default)]
    struct CountingSink {
        bytes: Vec<u8>,
        writes: usize,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn space_with_pages(pages: usize) -> SimulatedAddressSpace {
        let mut space = SimulatedAddressSpace::new();
        space.map_anonymous(0x10_000, pages * PAGE_SIZE, Protection::READ | Protection::WRITE);
        for i in 0..pages {
            let fill = vec![(i as u8).wrapping_mul(37).wrapping_add(1); PAGE_SIZE];
            space.poke(0x10_000 + i * PAGE_SIZE, &fill);
        }
        space
    }

    #[test]
    fn contiguous_pages_become_one_write() {
        let space = space_with_pages(6);
        let mut writer = ContentWriter::new(CountingSink::default(), None);
        for i in [0usize, 1, 2, 4, 5] {
            let kind = writer.store_page(&space, 0x10_000 + i * PAGE_SIZE).unwrap();
            assert_eq!(kind, PageKind::FullPage);
        }
        writer.flush(&space).unwrap();
        assert_eq!(writer.position(), 5 * PAGE_SIZE as u64);
        let sink = writer.into_inner();
        assert_eq!(sink.writes, 2, "two runs, two writes");
        assert_eq!(sink.bytes.len(), 5 * PAGE_SIZE);
        assert_eq!(sink.bytes[3 * PAGE_SIZE], space.page(0x10_000 + 4 * PAGE_SIZE)[0]);
    }

    #[test]
    fn compressed_pages_decode_in_order() {
        let space = space_with_pages(4);
        let mut compressor = Compress::new(Compression::fast(), false);
        let mut writer = ContentWriter::new(Vec::new(), Some(&mut compressor));
        for i in 0..4 {
            let kind = writer.store_page(&space, 0x10_000 + i * PAGE_SIZE).unwrap();
            assert_eq!(kind, PageKind::CompressedPage);
        }
        let position = writer.position();
        let stream = writer.into_inner();
        assert_eq!(position, stream.len() as u64);
        assert!(stream.len() < 4 * PAGE_SIZE, "uniform pages must shrink");

        let mut inflater = InflateState::new_boxed(DataFormat::Raw);
        let mut at = 0usize;
        for i in 0..4 {
            let len = u32::from_le_bytes(stream[at..at + 4].try_into().unwrap()) as usize;
            let mut page = vec![0u8; PAGE_SIZE];
            inflate_page(&mut inflater, &stream[at + 4..at + 4 + len], &mut page, i).unwrap();
            assert_eq!(page.as_slice(), space.page(0x10_000 + i * PAGE_SIZE));
            at += 4 + len;
        }
        assert_eq!(at, stream.len());
    }

    #[test]
    fn garbage_block_is_rejected() {
        let mut inflater = InflateState::new_boxed(DataFormat::Raw);
        let mut page = vec![0u8; PAGE_SIZE];
        let err = inflate_page(&mut inflater, &[0xff, 0xff, 0xff, 0xff], &mut page, 0x5000).unwrap_err();
        assert!(matches!(err, CodecError::Inflate { addr: 0x5000 }));
    }

    #[test]
    fn positioned_reader_advances() {
        let data: Vec<u8> = (0u8..32).collect();
        let mut reader = PositionedReader::new(&data, 8);
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11]);
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [12, 13, 14, 15]);
    }
}
