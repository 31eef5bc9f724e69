//! Incremental save chain bookkeeping.
//!
//! Three snapshot identities are tracked: the current target, the parent
//! (the snapshot the next save diffs against) and the base (the long-lived
//! full reference). The registry lives in the reserved region, so paths are
//! kept in fixed inline buffers instead of `PathBuf`s.

use std::ffi::{CStr, OsStr};
use std::fmt;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use ss_common::SlotIndex;

/// Longest snapshot path stem.
pub const PATH_CAPACITY: usize = 1024;

/// Room for a stem plus the longest suffix and its NUL.
pub const SUFFIXED_CAPACITY: usize = PATH_CAPACITY + 16;

/// Path stem of a path-mode snapshot; `.pm` and `.p` are appended per stream.
#[derive(Clone, Copy)]
pub struct SnapshotPath {
    len: u16,
    bytes: [u8; PATH_CAPACITY],
}

impl SnapshotPath {
    /// Copy `path` in, or `None` if it does not fit or contains a NUL.
    pub fn new(path: &Path) -> Option<Self> {
        Self::from_bytes(path.as_os_str().as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > PATH_CAPACITY || bytes.contains(&0) {
            return None;
        }
        let mut stem = SnapshotPath {
            len: bytes.len() as u16,
            bytes: [0; PATH_CAPACITY],
        };
        stem.bytes[..bytes.len()].copy_from_slice(bytes);
        Some(stem)
    }

    /// `<dir>/<name><slot>` without allocating.
    pub fn in_dir(dir: &Path, name: &str, slot: SlotIndex) -> Option<Self> {
        let mut buf = [0u8; PATH_CAPACITY];
        let mut cursor = &mut buf[..];
        let dir = dir.as_os_str().as_bytes();
        cursor.write_all(dir).ok()?;
        if !dir.ends_with(b"/") {
            cursor.write_all(b"/").ok()?;
        }
        write!(cursor, "{name}{slot}").ok()?;
        let remaining = cursor.len();
        Self::from_bytes(&buf[..PATH_CAPACITY - remaining])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.as_bytes()))
    }

    /// NUL-terminated `<stem><suffix>` in `buf`.
    pub fn with_suffix<'b>(&self, suffix: &[u8], buf: &'b mut [u8; SUFFIXED_CAPACITY]) -> Option<&'b CStr> {
        let len = self.len as usize;
        let total = len + suffix.len();
        if total >= SUFFIXED_CAPACITY {
            return None;
        }
        buf[..len].copy_from_slice(self.as_bytes());
        buf[len..total].copy_from_slice(suffix);
        buf[total] = 0;
        CStr::from_bytes_with_nul(&buf[..=total]).ok()
    }
}

impl PartialEq for SnapshotPath {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SnapshotPath {}

impl fmt::Debug for SnapshotPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_path())
    }
}

/// Where a snapshot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotRef {
    /// No snapshot.
    #[default]
    None,
    /// Resident descriptor pair at this table index.
    Slot(SlotIndex),
    /// `.pm`/`.p` file pair under this stem.
    Path(SnapshotPath),
}

impl SnapshotRef {
    pub fn is_none(&self) -> bool {
        matches!(self, SnapshotRef::None)
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotRef::None => f.write_str("none"),
            SnapshotRef::Slot(slot) => write!(f, "slot {slot}"),
            SnapshotRef::Path(path) => write!(f, "{}", path.as_path().display()),
        }
    }
}

/// Current, parent and base identities of the incremental chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRegistry {
    current: SnapshotRef,
    current_slot: SlotIndex,
    parent: SnapshotRef,
    base: SnapshotRef,
}

impl SnapshotRegistry {
    pub fn new(base: SnapshotRef) -> Self {
        SnapshotRegistry {
            current: SnapshotRef::None,
            current_slot: SlotIndex(0),
            parent: SnapshotRef::None,
            base,
        }
    }

    /// Target the snapshot stored as `slot`.
    pub fn select(&mut self, slot: SlotIndex, target: SnapshotRef) {
        self.current_slot = slot;
        self.current = target;
    }

    pub fn current(&self) -> &SnapshotRef {
        &self.current
    }

    /// User-visible slot number of the current target.
    pub fn current_slot(&self) -> SlotIndex {
        self.current_slot
    }

    pub fn parent(&self) -> &SnapshotRef {
        &self.parent
    }

    pub fn base(&self) -> &SnapshotRef {
        &self.base
    }

    /// The current target becomes the parent of the next save. No-op
    /// outside incremental mode.
    pub fn promote_to_parent(&mut self, incremental: bool) {
        if incremental {
            self.parent = self.current;
        }
    }

    /// Forget the parent, e.g. after the base was rebuilt.
    pub fn reset_parent(&mut self) {
        self.parent = SnapshotRef::None;
    }

    /// Whether the current target is also the parent.
    pub fn current_is_parent(&self) -> bool {
        !self.current.is_none() && self.current == self.parent
    }
}
