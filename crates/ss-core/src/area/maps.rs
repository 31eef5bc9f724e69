//! Parser for the Linux `/proc/<pid>/maps` text format.
//!
//! The enumerator never reads the kernel file itself. Callers copy the text
//! into a stable buffer first (see `AddressSpace::read_maps`), so a walk can
//! be restarted without the live list changing underneath it.

use thiserror::Error;

use super::{Area, AreaFlags, AreaName, Protection, SkipPolicy};

/// A maps record that does not follow the expected layout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapsParseError {
    #[error("unexpected byte {found:#04x} at offset {offset}, expected {expected}")]
    Unexpected {
        offset: usize,
        found: u8,
        expected: &'static str,
    },

    #[error("map record truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("mapping name at offset {offset} exceeds the name capacity")]
    NameTooLong { offset: usize },

    #[error("adjacent heap records at {start:#x} disagree on protection or backing")]
    HeapMismatch { start: usize },

    #[error("map record at {start:#x} ends before it starts")]
    InvertedRange { start: usize },
}

/// Restartable walk over a copy of the maps text.
#[derive(Debug, Clone)]
pub struct ProcMaps<'a> {
    text: &'a [u8],
    pos: usize,
    policy: SkipPolicy,
}

impl<'a> ProcMaps<'a> {
    pub fn new(text: &'a [u8], policy: SkipPolicy) -> Self {
        ProcMaps {
            text,
            pos: 0,
            policy,
        }
    }

    /// Rewind to the first record.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Next area in ascending address order, `None` at the end.
    ///
    /// Adjacent `[heap]` records are returned as one area.
    pub fn next_area(&mut self) -> Result<Option<Area>, MapsParseError> {
        let mut area = match self.parse_record()? {
            Some(area) => area,
            None => return Ok(None),
        };

        if area.flags.contains(AreaFlags::HEAP) {
            loop {
                let mark = self.pos;
                match self.parse_record()? {
                    Some(next) if next.flags.contains(AreaFlags::HEAP) && next.start == area.end => {
                        if next.prot != area.prot || next.flags != area.flags {
                            return Err(MapsParseError::HeapMismatch { start: next.start });
                        }
                        area.end = next.end;
                    }
                    _ => {
                        self.pos = mark;
                        break;
                    }
                }
            }
        }

        area.skip = self.policy.should_skip(&area);
        Ok(Some(area))
    }

    fn parse_record(&mut self) -> Result<Option<Area>, MapsParseError> {
        if self.pos >= self.text.len() {
            return Ok(None);
        }

        let start = self.hex(b'-', "'-' after start address")? as usize;
        let end = self.hex(b' ', "' ' after end address")? as usize;
        if end < start {
            return Err(MapsParseError::InvertedRange { start });
        }

        let mut prot = Protection::empty();
        if self.flag(b'r', "'r' or '-'")? {
            prot |= Protection::READ;
        }
        if self.flag(b'w', "'w' or '-'")? {
            prot |= Protection::WRITE;
        }
        if self.flag(b'x', "'x' or '-'")? {
            prot |= Protection::EXEC;
        }
        let shared = match self.byte()? {
            b's' => true,
            b'p' => false,
            found => return Err(self.unexpected(found, "'s' or 'p'")),
        };
        self.expect(b' ', "' ' after permissions")?;

        let offset = self.hex(b' ', "' ' after offset")?;
        let dev_major = self.hex(b':', "':' in device")? as u32;
        let dev_minor = self.hex(b' ', "' ' after device")? as u32;
        let inode = self.decimal()?;

        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
        let name_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        let name = AreaName::new(&self.text[name_start..self.pos])
            .ok_or(MapsParseError::NameTooLong { offset: name_start })?;
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }

        Ok(Some(Area {
            start,
            end,
            offset,
            prot,
            // Linux does not expose a maximum protection.
            max_prot: Protection::all(),
            flags: Area::classify_name(&name, shared),
            dev_major,
            dev_minor,
            inode,
            name,
            ..Area::sentinel()
        }))
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn byte(&mut self) -> Result<u8, MapsParseError> {
        let b = self
            .peek()
            .ok_or(MapsParseError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn unexpected(&self, found: u8, expected: &'static str) -> MapsParseError {
        MapsParseError::Unexpected {
            offset: self.pos.saturating_sub(1),
            found,
            expected,
        }
    }

    fn expect(&mut self, want: u8, expected: &'static str) -> Result<(), MapsParseError> {
        match self.byte()? {
            b if b == want => Ok(()),
            found => Err(self.unexpected(found, expected)),
        }
    }

    fn flag(&mut self, set: u8, expected: &'static str) -> Result<bool, MapsParseError> {
        match self.byte()? {
            b if b == set => Ok(true),
            b'-' => Ok(false),
            found => Err(self.unexpected(found, expected)),
        }
    }

    fn hex(&mut self, delim: u8, expected: &'static str) -> Result<u64, MapsParseError> {
        let mut value: u64 = 0;
        let mut digits = 0;
        loop {
            let b = self.byte()?;
            let digit = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                b'A'..=b'F' => b - b'A' + 10,
                _ if b == delim && digits > 0 => return Ok(value),
                found => return Err(self.unexpected(found, expected)),
            };
            value = (value << 4) | u64::from(digit);
            digits += 1;
        }
    }

    fn decimal(&mut self) -> Result<u64, MapsParseError> {
        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some(b @ b'0'..=b'9') = self.peek() {
            value = value * 10 + u64::from(b - b'0');
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 {
            let found = self.byte()?;
            return Err(self.unexpected(found, "decimal inode"));
        }
        Ok(value)
    }
}

impl Iterator for ProcMaps<'_> {
    type Item = Result<Area, MapsParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_area().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 fd:01 1835123                    /usr/bin/cat
55d0c0a02000-55d0c0a07000 r-xp 00002000 fd:01 1835123                    /usr/bin/cat
55d0c0a0c000-55d0c0a0d000 rw-p 0000b000 fd:01 1835123                    /usr/bin/cat
55d0c1e6b000-55d0c1e8c000 rw-p 00000000 00:00 0                          [heap]
7f3a10000000-7f3a10021000 rw-p 00000000 00:00 0
7f3a12400000-7f3a12401000 rw-s 00000000 00:01 2048                       /memfd:savefile (deleted)
7ffc8e7a1000-7ffc8e7c2000 rw-p 00000000 00:00 0                          [stack]
7ffc8e7f5000-7ffc8e7f9000 r--p 00000000 00:00 0                          [vvar]
7ffc8e7f9000-7ffc8e7fb000 r-xp 00000000 00:00 0                          [vdso]
";

    fn parse_all(text: &str) -> Vec<Area> {
        ProcMaps::new(text.as_bytes(), SkipPolicy::default())
            .collect::<Result<Vec<_>, _>>()
            .expect("sample parses")
    }

    #[test]
    fn parses_every_field() {
        let areas = parse_all(SAMPLE);
        assert_eq!(areas.len(), 9);

        let text = &areas[1];
        assert_eq!(text.start, 0x55d0_c0a0_2000);
        assert_eq!(text.end, 0x55d0_c0a0_7000);
        assert_eq!(text.prot, Protection::READ | Protection::EXEC);
        assert_eq!(text.offset, 0x2000);
        assert_eq!((text.dev_major, text.dev_minor), (0xfd, 0x01));
        assert_eq!(text.inode, 1_835_123);
        assert_eq!(text.name.as_bytes(), b"/usr/bin/cat");
        assert!(text.flags.contains(AreaFlags::FILE | AreaFlags::PRIVATE));
        assert!(text.skip, "read-only file mapping is skipped");

        let anon = &areas[4];
        assert!(anon.name.is_empty());
        assert!(anon.is_anonymous());
        assert!(!anon.skip);

        let memfd = &areas[5];
        assert!(memfd.flags.contains(AreaFlags::MEMFD | AreaFlags::SHARED));
        assert_eq!(memfd.name.as_bytes(), b"/memfd:savefile (deleted)");

        assert!(areas[6].flags.contains(AreaFlags::STACK));
        assert!(areas[7].skip && areas[8].skip);
    }

    #[test]
    fn coalesces_split_heap() {
        let text = "\
00400000-00401000 rw-p 00000000 00:00 0
01000000-01010000 rw-p 00000000 00:00 0                                  [heap]
01010000-01020000 rw-p 00000000 00:00 0                                  [heap]
01020000-01080000 rw-p 00000000 00:00 0                                  [heap]
02000000-02001000 rw-p 00000000 00:00 0
";
        let areas = parse_all(text);
        assert_eq!(areas.len(), 3, "three heap records become one area");
        assert_eq!(areas[1].start, 0x0100_0000);
        assert_eq!(areas[1].end, 0x0108_0000);
        assert!(areas[1].flags.contains(AreaFlags::HEAP));
        assert_eq!(areas[2].start, 0x0200_0000);
    }

    #[test]
    fn heap_records_must_agree() {
        let text = "\
01000000-01010000 rw-p 00000000 00:00 0                                  [heap]
01010000-01020000 r--p 00000000 00:00 0                                  [heap]
";
        let err = ProcMaps::new(text.as_bytes(), SkipPolicy::default())
            .next_area()
            .unwrap_err();
        assert_eq!(err, MapsParseError::HeapMismatch { start: 0x0101_0000 });
    }

    #[test]
    fn reset_restarts_the_walk() {
        let mut maps = ProcMaps::new(SAMPLE.as_bytes(), SkipPolicy::default());
        let first = maps.next_area().unwrap().unwrap();
        while maps.next_area().unwrap().is_some() {}
        maps.reset();
        assert_eq!(maps.next_area().unwrap().unwrap(), first);
    }

    #[test]
    fn bad_delimiter_is_reported() {
        let text = "00400000+00401000 rw-p 00000000 00:00 0\n";
        let err = ProcMaps::new(text.as_bytes(), SkipPolicy::default())
            .next_area()
            .unwrap_err();
        assert!(matches!(
            err,
            MapsParseError::Unexpected { found: b'+', offset: 8, .. }
        ));

        let text = "00400000-00401000 rwzp 00000000 00:00 0\n";
        assert!(ProcMaps::new(text.as_bytes(), SkipPolicy::default())
            .next_area()
            .is_err());
    }

    #[test]
    fn truncated_record() {
        let text = "00400000-00401000 rw";
        let err = ProcMaps::new(text.as_bytes(), SkipPolicy::default())
            .next_area()
            .unwrap_err();
        assert_eq!(err, MapsParseError::Truncated { offset: 20 });
    }

    #[test]
    fn reserved_region_is_skipped() {
        let text = "7f0000000000-7f0000100000 rw-p 00000000 00:00 0 \n";
        let policy = SkipPolicy::with_reserved(0x7f00_0000_0000, 0x7f00_0010_0000);
        let area = ProcMaps::new(text.as_bytes(), policy)
            .next_area()
            .unwrap()
            .unwrap();
        assert!(area.skip);
    }
}
