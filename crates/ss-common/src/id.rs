//! Slot and thread identity types.
//!
//! Snapshots live in numbered slots; threads are recorded in snapshot
//! headers by their OS handle and the logical id the host assigned them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a snapshot slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotIndex(pub usize);

impl SlotIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for SlotIndex {
    fn from(index: usize) -> Self {
        SlotIndex(index)
    }
}

/// Opaque OS thread handle (a `pthread_t` on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadHandle(pub u64);

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for ThreadHandle {
    fn from(handle: u64) -> Self {
        ThreadHandle(handle)
    }
}

/// Logical thread id assigned by the host (the kernel tid on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalThreadId(pub u32);

impl fmt::Display for LogicalThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LogicalThreadId {
    fn from(tid: u32) -> Self {
        LogicalThreadId(tid)
    }
}
