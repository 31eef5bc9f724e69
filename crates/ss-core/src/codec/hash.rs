//! Debug-only area content hash.

use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::io;

use crate::area::Area;
use crate::page::PAGE_SIZE;
use crate::pagemap::PagemapCursor;
use crate::space::AddressSpace;

const WORDS_PER_PAGE: usize = PAGE_SIZE / 8;

/// Order-sensitive hash over every word of `area`.
///
/// Pages the pagemap reports absent hash as zeros and are never read, so
/// hashing leaves the set of present pages unchanged.
pub fn area_hash<S: AddressSpace + ?Sized>(space: &S, area: &Area) -> io::Result<u64> {
    let mut hasher = FxHasher::default();
    let mut pagemap = PagemapCursor::new(area.start, area.page_count(), true);
    for addr in area.pages() {
        if !pagemap.next_entry(space)?.present() {
            for _ in 0..WORDS_PER_PAGE {
                hasher.write_u64(0);
            }
            continue;
        }
        for word in space.page(addr).chunks(8) {
            let mut bytes = [0u8; 8];
            bytes[..word.len()].copy_from_slice(word);
            hasher.write_u64(u64::from_ne_bytes(bytes));
        }
    }
    Ok(hasher.finish())
}
