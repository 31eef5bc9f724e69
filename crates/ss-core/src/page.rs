//! Page geometry and per-page tags.

use serde::Serialize;
use std::fmt;

/// Granularity of every tag and every content record.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages covering `len` bytes (areas are always page aligned).
pub const fn page_count(len: usize) -> usize {
    len / PAGE_SIZE
}

/// Classification of one page in a snapshot.
///
/// The byte values are the on-disk tag encoding. Zero is reserved for
/// "no information" and never appears in a tag stream; lookups that find
/// nothing return `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PageKind {
    /// Page was not present when saved.
    NoPage = 1,
    /// Page is all zero bytes; nothing stored.
    ZeroPage = 2,
    /// Page bytes stored raw in the content stream.
    FullPage = 3,
    /// Page is identical to the base snapshot's page.
    BasePage = 4,
    /// Page bytes stored as a length-prefixed compressed block.
    CompressedPage = 5,
    /// Page is identical to its backing file. Reserved.
    FilePage = 6,
}

impl PageKind {
    pub const ALL: [PageKind; 6] = [
        PageKind::NoPage,
        PageKind::ZeroPage,
        PageKind::FullPage,
        PageKind::BasePage,
        PageKind::CompressedPage,
        PageKind::FilePage,
    ];

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Decode a stored tag byte.
    pub fn from_byte(byte: u8) -> Option<PageKind> {
        match byte {
            1 => Some(PageKind::NoPage),
            2 => Some(PageKind::ZeroPage),
            3 => Some(PageKind::FullPage),
            4 => Some(PageKind::BasePage),
            5 => Some(PageKind::CompressedPage),
            6 => Some(PageKind::FilePage),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageKind::NoPage => "no_page",
            PageKind::ZeroPage => "zero_page",
            PageKind::FullPage => "full_page",
            PageKind::BasePage => "base_page",
            PageKind::CompressedPage => "compressed_page",
            PageKind::FilePage => "file_page",
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind page counters, used for save-size reporting and inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageCounts {
    pub no_page: u64,
    pub zero_page: u64,
    pub full_page: u64,
    pub base_page: u64,
    pub compressed_page: u64,
    pub file_page: u64,
}

impl PageCounts {
    pub fn record(&mut self, kind: PageKind) {
        match kind {
            PageKind::NoPage => self.no_page += 1,
            PageKind::ZeroPage => self.zero_page += 1,
            PageKind::FullPage => self.full_page += 1,
            PageKind::BasePage => self.base_page += 1,
            PageKind::CompressedPage => self.compressed_page += 1,
            PageKind::FilePage => self.file_page += 1,
        }
    }

    pub fn get(&self, kind: PageKind) -> u64 {
        match kind {
            PageKind::NoPage => self.no_page,
            PageKind::ZeroPage => self.zero_page,
            PageKind::FullPage => self.full_page,
            PageKind::BasePage => self.base_page,
            PageKind::CompressedPage => self.compressed_page,
            PageKind::FilePage => self.file_page,
        }
    }

    pub fn total(&self) -> u64 {
        PageKind::ALL.iter().map(|k| self.get(*k)).sum()
    }

    pub fn merge(&mut self, other: &PageCounts) {
        self.no_page += other.no_page;
        self.zero_page += other.zero_page;
        self.full_page += other.full_page;
        self.base_page += other.base_page;
        self.compressed_page += other.compressed_page;
        self.file_page += other.file_page;
    }
}

/// Whether a page holds only zero bytes.
///
/// Scans eight words per step and stops at the first block with a set bit.
pub fn is_zero_page(page: &[u8]) -> bool {
    page.chunks(64).all(|block| {
        let mut acc = 0u64;
        for word in block.chunks(8) {
            let mut bytes = [0u8; 8];
            bytes[..word.len()].copy_from_slice(word);
            acc |= u64::from_ne_bytes(bytes);
        }
        acc == 0
    })
}
