//! Thread registry seam.
//!
//! Suspending the other threads is the host's job. The engine only needs to
//! enumerate them: suspended threads are recorded in every snapshot header
//! and the live list is compared against a header before restoring.

use ss_common::{LogicalThreadId, ThreadHandle};

use crate::codec::StateHeader;

/// Lifecycle state of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    Uninitialized = 0,
    Running = 1,
    Signaled = 2,
    SuspendInProgress = 3,
    Suspended = 4,
    Zombie = 5,
    Free = 6,
    Recycled = 7,
    CheckpointThread = 8,
}

impl ThreadState {
    pub fn from_byte(byte: u8) -> Option<ThreadState> {
        Some(match byte {
            0 => ThreadState::Uninitialized,
            1 => ThreadState::Running,
            2 => ThreadState::Signaled,
            3 => ThreadState::SuspendInProgress,
            4 => ThreadState::Suspended,
            5 => ThreadState::Zombie,
            6 => ThreadState::Free,
            7 => ThreadState::Recycled,
            8 => ThreadState::CheckpointThread,
            _ => return None,
        })
    }

    /// States that take part in a snapshot's thread list.
    pub fn is_tracked(self) -> bool {
        matches!(
            self,
            ThreadState::Running | ThreadState::Zombie | ThreadState::Free
        )
    }
}

/// One host thread as the registry reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    pub handle: ThreadHandle,
    pub tid: LogicalThreadId,
    pub state: ThreadState,
    /// State before the host suspended it for a checkpoint.
    pub prior_state: ThreadState,
}

/// Source of the host's thread list.
pub trait ThreadRegistry {
    /// Visit every known thread.
    fn for_each_thread(&self, visit: &mut dyn FnMut(&ThreadRecord));

    /// Called after a restore so per-thread bookkeeping can be re-synced.
    fn restored(&self, _header: &StateHeader) {}
}

/// Fixed thread list for single-threaded hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticThreadRegistry {
    threads: Vec<ThreadRecord>,
}

impl StaticThreadRegistry {
    pub fn new(threads: Vec<ThreadRecord>) -> Self {
        Self { threads }
    }

    /// A single running main thread.
    pub fn main_thread(handle: u64, tid: u32) -> Self {
        Self::new(vec![ThreadRecord {
            handle: ThreadHandle(handle),
            tid: LogicalThreadId(tid),
            state: ThreadState::Running,
            prior_state: ThreadState::Running,
        }])
    }
}

impl ThreadRegistry for StaticThreadRegistry {
    fn for_each_thread(&self, visit: &mut dyn FnMut(&ThreadRecord)) {
        for thread in &self.threads {
            visit(thread);
        }
    }
}

/// Whether the tracked live threads are exactly the threads in `header`.
pub fn threads_match(registry: &dyn ThreadRegistry, header: &StateHeader) -> bool {
    let mut matched = 0usize;
    let mut missing = false;
    registry.for_each_thread(&mut |thread| {
        if !thread.state.is_tracked() {
            return;
        }
        if header.contains(thread.handle, thread.tid) {
            matched += 1;
        } else {
            missing = true;
        }
    });
    !missing && matched == header.threads().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HeaderThread;

    fn record(handle: u64, tid: u32, state: ThreadState) -> ThreadRecord {
        ThreadRecord {
            handle: ThreadHandle(handle),
            tid: LogicalThreadId(tid),
            state,
            prior_state: ThreadState::Running,
        }
    }

    fn header_of(pairs: &[(u64, u32)]) -> StateHeader {
        let mut header = StateHeader::new();
        for &(handle, tid) in pairs {
            header
                .push(HeaderThread {
                    handle: ThreadHandle(handle),
                    tid: LogicalThreadId(tid),
                    state: ThreadState::Running,
                })
                .unwrap();
        }
        header
    }

    #[test]
    fn identical_lists_match() {
        let registry = StaticThreadRegistry::new(vec![
            record(1, 100, ThreadState::Running),
            record(2, 101, ThreadState::Zombie),
            record(3, 102, ThreadState::Uninitialized),
        ]);
        assert!(threads_match(&registry, &header_of(&[(1, 100), (2, 101)])));
    }

    #[test]
    fn new_thread_rejects() {
        let registry = StaticThreadRegistry::new(vec![
            record(1, 100, ThreadState::Running),
            record(9, 109, ThreadState::Running),
        ]);
        assert!(!threads_match(&registry, &header_of(&[(1, 100)])));
    }

    #[test]
    fn vanished_thread_rejects() {
        let registry = StaticThreadRegistry::main_thread(1, 100);
        assert!(!threads_match(&registry, &header_of(&[(1, 100), (2, 101)])));
    }

    #[test]
    fn reused_handle_with_new_tid_rejects() {
        let registry = StaticThreadRegistry::main_thread(1, 200);
        assert!(!threads_match(&registry, &header_of(&[(1, 100)])));
    }
}
