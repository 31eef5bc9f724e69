//! Snapshot stream encoding.
//!
//! A snapshot is two streams:
//! - the tag stream: header, then for each area its fixed-width record and
//!   one tag byte per page, closed by a sentinel record
//! - the content stream: raw pages and length-prefixed compressed blocks,
//!   located through the per-area `page_offset` and the tags

pub mod content;
pub mod hash;
pub mod header;
pub mod record;
pub mod tags;

pub use content::{inflate_page, ContentWriter, PositionedReader, COMPRESS_SCRATCH};
pub use hash::area_hash;
pub use header::{HeaderThread, StateHeader, HEADER_LEN, MAX_THREADS};
pub use record::AREA_RECORD_LEN;
pub use tags::{TagReader, TagWriter, TAG_CHUNK};

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use thiserror::Error;

/// Errors while encoding or decoding snapshot streams.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot header has bad magic")]
    BadMagic,

    #[error("incompatible snapshot format version {0}")]
    Version(u32),

    #[error("snapshot lists {count} threads, at most {max} fit the header")]
    TooManyThreads { count: usize, max: usize },

    #[error("corrupt area record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: &'static str },

    #[error("invalid page tag {tag:#04x} for page {addr:#x}")]
    BadTag { tag: u8, addr: usize },

    #[error("tag stream ended inside an area")]
    TagsExhausted,

    #[error("page query at {addr:#x} is behind the reader position {position:#x}")]
    Backwards { addr: usize, position: usize },

    #[error("compressed block for page {addr:#x} is corrupt")]
    Inflate { addr: usize },

    #[error("compressed block of {len} bytes does not fit the scratch buffer")]
    BlockTooLarge { len: usize },

    #[error("compression failed: {0}")]
    Deflate(#[from] flate2::CompressError),
}

/// Positioned reads that leave no shared file offset behind.
pub trait ReadAt {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
}

impl ReadAt for File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl ReadAt for Vec<u8> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.as_slice().read_exact_at(buf, offset)
    }
}
