//! Savestate common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the savestate crates:
//! - Slot and thread identity newtypes
//! - Snapshot format versioning
//! - Common error types
//! - Output formats

pub mod error;
pub mod id;
pub mod output;
pub mod schema;

pub use error::{Error, Result};
pub use id::{LogicalThreadId, SlotIndex, ThreadHandle};
pub use output::OutputFormat;
pub use schema::SNAPSHOT_FORMAT_VERSION;
