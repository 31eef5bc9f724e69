//! Snapshot storage.
//!
//! A snapshot is a pair of streams: tags (`.pm`) and content (`.p`). In
//! resident mode both are memory files whose descriptors sit in a fixed
//! table; in persistent mode they are files next to a path stem. Writes that
//! may replace the parent go through a staging pair that is swapped in only
//! once the save completed.

pub mod reserved;

pub use reserved::{snapshot_compression, RegionLayout, ReservedRegion, Scratch};
#[cfg(any(test, feature = "test-utils"))]
pub use reserved::HeapScratch;

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use ss_common::SlotIndex;
use thiserror::Error;
use tracing::debug;

use crate::chain::{SnapshotPath, SnapshotRef, SUFFIXED_CAPACITY};

/// Capacity of the resident descriptor table.
pub const MAX_SLOTS: usize = 32;

pub const TAGS_SUFFIX: &[u8] = b".pm";
pub const CONTENT_SUFFIX: &[u8] = b".p";
pub const TEMP_TAGS_SUFFIX: &[u8] = b".pm.temp";
pub const TEMP_CONTENT_SUFFIX: &[u8] = b".p.temp";

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} failed for {target}: {source}")]
    Io {
        op: &'static str,
        target: SnapshotRef,
        #[source]
        source: io::Error,
    },

    #[error("slot {slot} is outside the descriptor table")]
    SlotOutOfRange { slot: SlotIndex },

    #[error("snapshot path does not fit the path buffer")]
    PathTooLong,

    #[error("no snapshot identity selected")]
    NoTarget,
}

impl StorageError {
    fn io(op: &'static str, target: &SnapshotRef, source: io::Error) -> Self {
        StorageError::Io {
            op,
            target: *target,
            source,
        }
    }
}

/// Descriptor pairs of resident snapshots, `-1` when empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    tags: [RawFd; MAX_SLOTS],
    content: [RawFd; MAX_SLOTS],
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    pub const fn new() -> Self {
        DescriptorTable {
            tags: [-1; MAX_SLOTS],
            content: [-1; MAX_SLOTS],
        }
    }

    pub fn get(&self, slot: SlotIndex) -> Option<(RawFd, RawFd)> {
        let i = slot.get();
        if i >= MAX_SLOTS || self.tags[i] < 0 {
            return None;
        }
        Some((self.tags[i], self.content[i]))
    }

    /// Install a pair, returning the one it replaces.
    fn replace(&mut self, slot: SlotIndex, pair: (RawFd, RawFd)) -> Option<(RawFd, RawFd)> {
        let i = slot.get();
        let old = self.get(slot);
        self.tags[i] = pair.0;
        self.content[i] = pair.1;
        old
    }
}

/// How a new snapshot is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Truncate and rewrite the target in place.
    Overwrite,
    /// Create the target afresh; used for the base.
    Fresh,
    /// Write a staging pair and swap it in on commit.
    Staged,
}

/// Open stream pair of one snapshot.
#[derive(Debug)]
pub struct SnapshotFiles {
    pub tags: File,
    pub content: File,
}

/// A snapshot being written.
#[derive(Debug)]
pub struct PendingSnapshot {
    pub files: SnapshotFiles,
    target: SnapshotRef,
    kind: WriteKind,
}

/// Opens, creates and commits snapshots for one storage mode.
pub struct SnapshotStore<'t> {
    table: &'t mut DescriptorTable,
}

fn dup(fd: RawFd) -> io::Result<File> {
    // SAFETY: dup of a descriptor owned by the table; the copy is owned by
    // the returned `File`.
    let copy = unsafe { libc::dup(fd) };
    if copy < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `copy` is a fresh descriptor.
    Ok(unsafe { File::from_raw_fd(copy) })
}

fn close(fd: RawFd) {
    // SAFETY: the table owns `fd` and forgets it right after.
    drop(unsafe { File::from_raw_fd(fd) });
}

fn memfd(name: &std::ffi::CStr) -> io::Result<File> {
    // SAFETY: `name` is NUL-terminated; the descriptor is owned by the `File`.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn open_path(stem: &SnapshotPath, suffix: &[u8], flags: libc::c_int) -> io::Result<File> {
    let mut buf = [0u8; SUFFIXED_CAPACITY];
    let path = stem
        .with_suffix(suffix, &mut buf)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENAMETOOLONG))?;
    // SAFETY: NUL-terminated path; the descriptor is owned by the `File`.
    let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, 0o644 as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just opened.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn path_exists(stem: &SnapshotPath, suffix: &[u8]) -> bool {
    let mut buf = [0u8; SUFFIXED_CAPACITY];
    match stem.with_suffix(suffix, &mut buf) {
        // SAFETY: NUL-terminated path.
        Some(path) => unsafe { libc::access(path.as_ptr(), libc::F_OK) == 0 },
        None => false,
    }
}

fn unlink(stem: &SnapshotPath, suffix: &[u8]) {
    let mut buf = [0u8; SUFFIXED_CAPACITY];
    if let Some(path) = stem.with_suffix(suffix, &mut buf) {
        // SAFETY: NUL-terminated path; a missing file is fine.
        unsafe { libc::unlink(path.as_ptr()) };
    }
}

fn rename(stem: &SnapshotPath, from: &[u8], to: &[u8]) -> io::Result<()> {
    let mut from_buf = [0u8; SUFFIXED_CAPACITY];
    let mut to_buf = [0u8; SUFFIXED_CAPACITY];
    let (Some(from), Some(to)) = (stem.with_suffix(from, &mut from_buf), stem.with_suffix(to, &mut to_buf)) else {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    };
    // SAFETY: both paths are NUL-terminated.
    if unsafe { libc::rename(from.as_ptr(), to.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

const CREATE: libc::c_int = libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC;

impl<'t> SnapshotStore<'t> {
    pub fn new(table: &'t mut DescriptorTable) -> Self {
        SnapshotStore { table }
    }

    fn check_slot(slot: SlotIndex) -> Result<(), StorageError> {
        if slot.get() >= MAX_SLOTS {
            return Err(StorageError::SlotOutOfRange { slot });
        }
        Ok(())
    }

    /// Whether `snapshot` has been written.
    pub fn exists(&self, snapshot: &SnapshotRef) -> bool {
        match snapshot {
            SnapshotRef::None => false,
            SnapshotRef::Slot(slot) => self.table.get(*slot).is_some(),
            SnapshotRef::Path(stem) => path_exists(stem, TAGS_SUFFIX) && path_exists(stem, CONTENT_SUFFIX),
        }
    }

    /// Open an existing snapshot for positioned reads; `None` when absent.
    pub fn open(&self, snapshot: &SnapshotRef) -> Result<Option<SnapshotFiles>, StorageError> {
        if !self.exists(snapshot) {
            return Ok(None);
        }
        let files = match snapshot {
            SnapshotRef::None => return Ok(None),
            SnapshotRef::Slot(slot) => {
                let Some((tags, content)) = self.table.get(*slot) else {
                    return Ok(None);
                };
                SnapshotFiles {
                    tags: dup(tags).map_err(|e| StorageError::io("dup", snapshot, e))?,
                    content: dup(content).map_err(|e| StorageError::io("dup", snapshot, e))?,
                }
            }
            SnapshotRef::Path(stem) => SnapshotFiles {
                tags: open_path(stem, TAGS_SUFFIX, libc::O_RDONLY).map_err(|e| StorageError::io("open", snapshot, e))?,
                content: open_path(stem, CONTENT_SUFFIX, libc::O_RDONLY)
                    .map_err(|e| StorageError::io("open", snapshot, e))?,
            },
        };
        Ok(Some(files))
    }

    /// Start writing `target`.
    pub fn create(&mut self, target: &SnapshotRef, kind: WriteKind) -> Result<PendingSnapshot, StorageError> {
        let files = match target {
            SnapshotRef::None => return Err(StorageError::NoTarget),
            SnapshotRef::Slot(slot) => {
                Self::check_slot(*slot)?;
                self.create_resident(target, *slot, kind)?
            }
            SnapshotRef::Path(stem) => Self::create_persistent(target, stem, kind)?,
        };
        debug!(target = %target, ?kind, "writing snapshot");
        Ok(PendingSnapshot {
            files,
            target: *target,
            kind,
        })
    }

    fn create_resident(&mut self, target: &SnapshotRef, slot: SlotIndex, kind: WriteKind) -> Result<SnapshotFiles, StorageError> {
        let fresh = || -> Result<SnapshotFiles, StorageError> {
            Ok(SnapshotFiles {
                tags: memfd(c"pagemapstate").map_err(|e| StorageError::io("memfd_create", target, e))?,
                content: memfd(c"pagesstate").map_err(|e| StorageError::io("memfd_create", target, e))?,
            })
        };
        match (kind, self.table.get(slot)) {
            (WriteKind::Overwrite, Some((tags, content))) => {
                let mut files = SnapshotFiles {
                    tags: dup(tags).map_err(|e| StorageError::io("dup", target, e))?,
                    content: dup(content).map_err(|e| StorageError::io("dup", target, e))?,
                };
                for file in [&mut files.tags, &mut files.content] {
                    file.set_len(0).map_err(|e| StorageError::io("truncate", target, e))?;
                    file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io("seek", target, e))?;
                }
                Ok(files)
            }
            (WriteKind::Overwrite | WriteKind::Fresh, _) => {
                let files = fresh()?;
                let pair = (
                    dup(files.tags.as_raw_fd()).map_err(|e| StorageError::io("dup", target, e))?.into_raw_fd(),
                    dup(files.content.as_raw_fd()).map_err(|e| StorageError::io("dup", target, e))?.into_raw_fd(),
                );
                if let Some((tags, content)) = self.table.replace(slot, pair) {
                    close(tags);
                    close(content);
                }
                Ok(files)
            }
            (WriteKind::Staged, _) => fresh(),
        }
    }

    fn create_persistent(target: &SnapshotRef, stem: &SnapshotPath, kind: WriteKind) -> Result<SnapshotFiles, StorageError> {
        let (tags_suffix, content_suffix) = match kind {
            WriteKind::Staged => (TEMP_TAGS_SUFFIX, TEMP_CONTENT_SUFFIX),
            WriteKind::Overwrite | WriteKind::Fresh => (TAGS_SUFFIX, CONTENT_SUFFIX),
        };
        if kind != WriteKind::Fresh {
            // A reader of the old pair keeps its inode.
            unlink(stem, tags_suffix);
            unlink(stem, content_suffix);
        }
        Ok(SnapshotFiles {
            tags: open_path(stem, tags_suffix, CREATE).map_err(|e| StorageError::io("create", target, e))?,
            content: open_path(stem, content_suffix, CREATE).map_err(|e| StorageError::io("create", target, e))?,
        })
    }

    /// Make a finished snapshot visible under its target identity.
    pub fn commit(&mut self, pending: PendingSnapshot) -> Result<(), StorageError> {
        let PendingSnapshot { files, target, kind } = pending;
        if kind != WriteKind::Staged {
            return Ok(());
        }
        match &target {
            SnapshotRef::None => Err(StorageError::NoTarget),
            SnapshotRef::Slot(slot) => {
                let pair = (files.tags.into_raw_fd(), files.content.into_raw_fd());
                if let Some((tags, content)) = self.table.replace(*slot, pair) {
                    close(tags);
                    close(content);
                }
                Ok(())
            }
            SnapshotRef::Path(stem) => {
                drop(files);
                rename(stem, TEMP_TAGS_SUFFIX, TAGS_SUFFIX).map_err(|e| StorageError::io("rename", &target, e))?;
                rename(stem, TEMP_CONTENT_SUFFIX, CONTENT_SUFFIX).map_err(|e| StorageError::io("rename", &target, e))?;
                Ok(())
            }
        }
    }

    /// Drop a resident snapshot.
    pub fn forget(&mut self, slot: SlotIndex) {
        if Self::check_slot(slot).is_ok() {
            if let Some((tags, content)) = self.table.replace(slot, (-1, -1)) {
                close(tags);
                close(content);
            }
        }
    }
}
