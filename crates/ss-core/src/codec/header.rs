//! Snapshot header: format identification and the suspended-thread list.

use ss_common::schema::{is_compatible, SNAPSHOT_MAGIC};
use ss_common::{LogicalThreadId, ThreadHandle, SNAPSHOT_FORMAT_VERSION};

use super::CodecError;
use crate::threads::{ThreadRegistry, ThreadState};

/// Threads a header can describe.
pub const MAX_THREADS: usize = 128;

const THREAD_ENTRY_LEN: usize = 16;

/// Encoded header size: magic, version, count, then the thread table.
pub const HEADER_LEN: usize = 4 + 4 + 4 + MAX_THREADS * THREAD_ENTRY_LEN;

/// One thread recorded in a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderThread {
    pub handle: ThreadHandle,
    pub tid: LogicalThreadId,
    /// Run state before the checkpoint suspended it.
    pub state: ThreadState,
}

const EMPTY_THREAD: HeaderThread = HeaderThread {
    handle: ThreadHandle(0),
    tid: LogicalThreadId(0),
    state: ThreadState::Uninitialized,
};

/// Snapshot header with an inline thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    count: usize,
    threads: [HeaderThread; MAX_THREADS],
}

impl Default for StateHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHeader {
    pub const fn new() -> Self {
        StateHeader {
            count: 0,
            threads: [EMPTY_THREAD; MAX_THREADS],
        }
    }

    /// Header listing every suspended thread of `registry`.
    pub fn from_registry(registry: &dyn ThreadRegistry) -> Result<Self, CodecError> {
        let mut header = StateHeader::new();
        let mut overflow = 0usize;
        registry.for_each_thread(&mut |thread| {
            if thread.state != ThreadState::Suspended {
                return;
            }
            let entry = HeaderThread {
                handle: thread.handle,
                tid: thread.tid,
                state: thread.prior_state,
            };
            if header.push(entry).is_err() {
                overflow += 1;
            }
        });
        if overflow > 0 {
            return Err(CodecError::TooManyThreads {
                count: MAX_THREADS + overflow,
                max: MAX_THREADS,
            });
        }
        Ok(header)
    }

    pub fn push(&mut self, thread: HeaderThread) -> Result<(), CodecError> {
        if self.count == MAX_THREADS {
            return Err(CodecError::TooManyThreads {
                count: self.count + 1,
                max: MAX_THREADS,
            });
        }
        self.threads[self.count] = thread;
        self.count += 1;
        Ok(())
    }

    pub fn threads(&self) -> &[HeaderThread] {
        &self.threads[..self.count]
    }

    pub fn contains(&self, handle: ThreadHandle, tid: LogicalThreadId) -> bool {
        self.threads()
            .iter()
            .any(|t| t.handle == handle && t.tid == tid)
    }

    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
        out.fill(0);
        out[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        out[4..8].copy_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&(self.count as u32).to_le_bytes());
        for (i, thread) in self.threads().iter().enumerate() {
            let at = 12 + i * THREAD_ENTRY_LEN;
            out[at..at + 8].copy_from_slice(&thread.handle.0.to_le_bytes());
            out[at + 8..at + 12].copy_from_slice(&thread.tid.0.to_le_bytes());
            out[at + 12] = thread.state as u8;
        }
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, CodecError> {
        if raw[0..4] != SNAPSHOT_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let version = word(4);
        if !is_compatible(version) {
            return Err(CodecError::Version(version));
        }
        let count = word(8) as usize;
        if count > MAX_THREADS {
            return Err(CodecError::TooManyThreads {
                count,
                max: MAX_THREADS,
            });
        }

        let mut header = StateHeader::new();
        for i in 0..count {
            let at = 12 + i * THREAD_ENTRY_LEN;
            let mut handle = [0u8; 8];
            handle.copy_from_slice(&raw[at..at + 8]);
            let state = ThreadState::from_byte(raw[at + 12]).ok_or(CodecError::CorruptRecord {
                offset: at as u64,
                reason: "unknown thread state",
            })?;
            header.push(HeaderThread {
                handle: ThreadHandle(u64::from_le_bytes(handle)),
                tid: LogicalThreadId(word(at + 8)),
                state,
            })?;
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::{StaticThreadRegistry, ThreadRecord};

    #[test]
    fn only_suspended_threads_are_recorded() {
        let registry = StaticThreadRegistry::new(vec![
            ThreadRecord {
                handle: ThreadHandle(0x7f00),
                tid: LogicalThreadId(11),
                state: ThreadState::Suspended,
                prior_state: ThreadState::Zombie,
            },
            ThreadRecord {
                handle: ThreadHandle(0x7f01),
                tid: LogicalThreadId(12),
                state: ThreadState::CheckpointThread,
                prior_state: ThreadState::Running,
            },
        ]);
        let header = StateHeader::from_registry(&registry).unwrap();
        assert_eq!(header.threads().len(), 1);
        assert_eq!(header.threads()[0].state, ThreadState::Zombie);

        let mut raw = [0u8; HEADER_LEN];
        header.encode(&mut raw);
        assert_eq!(StateHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn rejects_foreign_bytes() {
        let mut raw = [0u8; HEADER_LEN];
        assert!(matches!(StateHeader::decode(&raw), Err(CodecError::BadMagic)));

        StateHeader::new().encode(&mut raw);
        raw[4] = 0x7f;
        assert!(matches!(StateHeader::decode(&raw), Err(CodecError::Version(_))));
    }

    #[test]
    fn table_is_bounded() {
        let mut header = StateHeader::new();
        for i in 0..MAX_THREADS {
            header
                .push(HeaderThread {
                    handle: ThreadHandle(i as u64),
                    tid: LogicalThreadId(i as u32),
                    state: ThreadState::Running,
                })
                .unwrap();
        }
        assert!(matches!(
            header.push(EMPTY_THREAD),
            Err(CodecError::TooManyThreads { .. })
        ));
    }
}
