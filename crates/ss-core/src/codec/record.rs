//! Fixed-width area records.
//!
//! Little-endian layout, independent of the in-memory `Area`:
//!
//! | field        | bytes |
//! |--------------|-------|
//! | start        | 8     |
//! | end          | 8     |
//! | size         | 8     |
//! | offset       | 8     |
//! | prot         | 4     |
//! | max_prot     | 4     |
//! | flags        | 4     |
//! | dev major    | 4     |
//! | dev minor    | 4     |
//! | inode        | 8     |
//! | skip         | 1     |
//! | uncommitted  | 1     |
//! | name length  | 2     |
//! | page_offset  | 8     |
//! | hash         | 8     |
//! | name         | 1024  |

use super::CodecError;
use crate::area::{Area, AreaFlags, AreaName, Protection, NAME_CAPACITY};

pub const AREA_RECORD_LEN: usize = 8 * 4 + 4 * 5 + 8 + 1 + 1 + 2 + 8 + 8 + NAME_CAPACITY;

struct Put<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Put<'_> {
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }
    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }
    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }
}

struct Take<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Take<'a> {
    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        b
    }
    fn u64(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8));
        u64::from_le_bytes(raw)
    }
    fn u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(4));
        u32::from_le_bytes(raw)
    }
    fn u16(&mut self) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.bytes(2));
        u16::from_le_bytes(raw)
    }
    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }
}

impl Area {
    /// Encode into a fixed-width record.
    pub fn encode(&self, out: &mut [u8; AREA_RECORD_LEN]) {
        let mut put = Put { buf: out, pos: 0 };
        put.u64(self.start as u64);
        put.u64(self.end as u64);
        put.u64(self.size() as u64);
        put.u64(self.offset);
        put.u32(self.prot.bits());
        put.u32(self.max_prot.bits());
        put.u32(self.flags.bits());
        put.u32(self.dev_major);
        put.u32(self.dev_minor);
        put.u64(self.inode);
        put.u8(self.skip as u8);
        put.u8(self.uncommitted as u8);
        put.u16(self.name.len() as u16);
        put.u64(self.page_offset);
        put.u64(self.hash);
        let mut name = [0u8; NAME_CAPACITY];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        put.bytes(&name);
    }

    /// Decode a record read from stream offset `at`.
    pub fn decode(raw: &[u8; AREA_RECORD_LEN], at: u64) -> Result<Area, CodecError> {
        let corrupt = |reason| CodecError::CorruptRecord { offset: at, reason };
        let mut take = Take { buf: raw, pos: 0 };

        let start = take.u64() as usize;
        let end = take.u64() as usize;
        let size = take.u64() as usize;
        if end < start || end - start != size {
            return Err(corrupt("size does not match address range"));
        }
        let offset = take.u64();
        let prot = Protection::from_bits(take.u32()).ok_or_else(|| corrupt("unknown protection bits"))?;
        let max_prot = Protection::from_bits(take.u32()).ok_or_else(|| corrupt("unknown protection bits"))?;
        let flags = AreaFlags::from_bits(take.u32()).ok_or_else(|| corrupt("unknown area flags"))?;
        let dev_major = take.u32();
        let dev_minor = take.u32();
        let inode = take.u64();
        let skip = take.u8() != 0;
        let uncommitted = take.u8() != 0;
        let name_len = take.u16() as usize;
        let page_offset = take.u64();
        let hash = take.u64();
        if name_len > NAME_CAPACITY {
            return Err(corrupt("name length exceeds capacity"));
        }
        let name = AreaName::new(&take.bytes(NAME_CAPACITY)[..name_len])
            .ok_or_else(|| corrupt("name length exceeds capacity"))?;

        Ok(Area {
            start,
            end,
            offset,
            prot,
            max_prot,
            flags,
            dev_major,
            dev_minor,
            inode,
            skip,
            uncommitted,
            page_offset,
            hash,
            name,
        })
    }
}
