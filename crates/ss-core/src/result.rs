//! Result codes reported to the host.
//!
//! Save and restore never raise errors across the signal boundary. Outcomes
//! the host can act on are reported as one of these codes; everything else
//! terminates the process.

use serde::Serialize;

/// Outcome of a checkpoint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum SaveStateResult {
    /// Completed, or nothing stood in the way.
    Ok = 0,

    /// No snapshot is stored for the requested slot.
    NoState = 1,

    /// The snapshot directory lacks room for the estimated save.
    NotEnoughSpace = 2,

    /// The live threads differ from the ones recorded in the snapshot.
    ThreadMismatch = 3,
}

impl SaveStateResult {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            0 => SaveStateResult::Ok,
            1 => SaveStateResult::NoState,
            2 => SaveStateResult::NotEnoughSpace,
            3 => SaveStateResult::ThreadMismatch,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == SaveStateResult::Ok
    }
}

impl From<SaveStateResult> for i32 {
    fn from(result: SaveStateResult) -> Self {
        result as i32
    }
}
