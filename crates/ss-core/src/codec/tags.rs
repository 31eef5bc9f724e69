//! Chunked page-tag I/O.
//!
//! Tags are one byte per page. They are buffered and moved in chunks of up
//! to [`TAG_CHUNK`] bytes; the chunk length is adjustable so the refill
//! boundary can be exercised with small inputs.

use std::io::Write;

use super::{CodecError, ReadAt};
use crate::page::PageKind;

/// Default and maximum tag chunk size.
pub const TAG_CHUNK: usize = 4096;

/// Buffers tags of one area and writes them out chunk by chunk.
pub struct TagWriter {
    buf: [u8; TAG_CHUNK],
    len: usize,
    chunk: usize,
}

impl Default for TagWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TagWriter {
    pub fn new() -> Self {
        Self::with_chunk(TAG_CHUNK)
    }

    /// Writer flushing every `chunk` tags (clamped to `1..=TAG_CHUNK`).
    pub fn with_chunk(chunk: usize) -> Self {
        TagWriter {
            buf: [0; TAG_CHUNK],
            len: 0,
            chunk: chunk.clamp(1, TAG_CHUNK),
        }
    }

    pub fn push<W: Write + ?Sized>(&mut self, out: &mut W, kind: PageKind) -> Result<(), CodecError> {
        self.buf[self.len] = kind.to_byte();
        self.len += 1;
        if self.len == self.chunk {
            self.flush(out)?;
        }
        Ok(())
    }

    /// Write out buffered tags.
    pub fn flush<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<(), CodecError> {
        if self.len > 0 {
            out.write_all(&self.buf[..self.len])?;
            self.len = 0;
        }
        Ok(())
    }
}

/// Reads the tags of one area at a time through positioned reads.
pub struct TagReader {
    buf: [u8; TAG_CHUNK],
    chunk: usize,
    filled: usize,
    index: usize,
    /// Stream offset of the next tag not yet buffered.
    pos: u64,
    /// Tags of the current area not yet buffered.
    remaining: u64,
}

impl Default for TagReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TagReader {
    pub fn new() -> Self {
        Self::with_chunk(TAG_CHUNK)
    }

    pub fn with_chunk(chunk: usize) -> Self {
        TagReader {
            buf: [0; TAG_CHUNK],
            chunk: chunk.clamp(1, TAG_CHUNK),
            filled: 0,
            index: 0,
            pos: 0,
            remaining: 0,
        }
    }

    /// Position on an area whose `count` tags start at stream offset `pos`.
    pub fn begin(&mut self, pos: u64, count: u64) {
        self.pos = pos;
        self.remaining = count;
        self.filled = 0;
        self.index = 0;
    }

    /// Stream offset just past the current area's tags.
    pub fn end_offset(&self) -> u64 {
        self.pos + self.remaining
    }

    /// Next raw tag byte, `None` once the area is exhausted.
    pub fn next_byte<R: ReadAt + ?Sized>(&mut self, src: &R) -> Result<Option<u8>, CodecError> {
        if self.index == self.filled {
            if self.remaining == 0 {
                return Ok(None);
            }
            let n = self.remaining.min(self.chunk as u64) as usize;
            src.read_exact_at(&mut self.buf[..n], self.pos)?;
            self.pos += n as u64;
            self.remaining -= n as u64;
            self.filled = n;
            self.index = 0;
        }
        let byte = self.buf[self.index];
        self.index += 1;
        Ok(Some(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kind_for(i: usize) -> PageKind {
        PageKind::ALL[(i * 7 + i / 3) % PageKind::ALL.len()]
    }

    fn write_tags(count: usize, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = TagWriter::with_chunk(chunk);
        for i in 0..count {
            writer.push(&mut out, kind_for(i)).unwrap();
        }
        writer.flush(&mut out).unwrap();
        out
    }

    fn read_tags(stream: &[u8], offset: u64, count: usize, chunk: usize) -> Vec<u8> {
        let mut reader = TagReader::with_chunk(chunk);
        reader.begin(offset, count as u64);
        let mut tags = Vec::new();
        while let Some(b) = reader.next_byte(stream).unwrap() {
            tags.push(b);
        }
        tags
    }

    #[test]
    fn boundary_counts_with_default_chunk() {
        for count in [4096usize, 4097, 8191] {
            let stream = write_tags(count, TAG_CHUNK);
            assert_eq!(stream.len(), count);
            let tags = read_tags(&stream, 0, count, TAG_CHUNK);
            let expected: Vec<u8> = (0..count).map(|i| kind_for(i).to_byte()).collect();
            assert_eq!(tags, expected, "count {count}");
        }
    }

    #[test]
    fn reader_stops_at_area_end() {
        let mut stream = vec![0xEE; 10];
        stream.extend(write_tags(5, 2));
        stream.extend([0xAA; 4]);
        let mut reader = TagReader::with_chunk(2);
        reader.begin(10, 5);
        assert_eq!(reader.end_offset(), 15);
        let mut seen = 0;
        while reader.next_byte(stream.as_slice()).unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn short_stream_is_an_error() {
        let stream = write_tags(3, TAG_CHUNK);
        let mut reader = TagReader::new();
        reader.begin(0, 10);
        assert!(reader.next_byte(stream.as_slice()).is_err());
    }

    proptest! {
        #[test]
        fn chunk_size_does_not_change_the_sequence(
            count in prop::sample::select(vec![1usize, 63, 4096, 4097, 8191]),
            write_chunk in 1usize..=64,
            read_chunk in 1usize..=64,
        ) {
            let small = write_tags(count, write_chunk);
            let large = write_tags(count, TAG_CHUNK);
            prop_assert_eq!(&small, &large);
            prop_assert_eq!(read_tags(&small, 0, count, read_chunk), large);
        }
    }
}
