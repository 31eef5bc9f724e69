//! Snapshot format versioning and compatibility.

/// Magic bytes opening every page-tag stream.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SSPM";

/// Current on-disk snapshot format version.
///
/// Bumped whenever the header, area record, or tag layout changes.
/// Snapshots are process-local, so only an exact match is accepted.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Check if a snapshot written with `version` can be loaded.
pub fn is_compatible(version: u32) -> bool {
    version == SNAPSHOT_FORMAT_VERSION
}
