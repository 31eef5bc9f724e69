//! Error types for the savestate engine.

use thiserror::Error;

/// Result type alias for savestate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for savestate tooling.
///
/// The engine crates carry their own narrower error enums; this type is what
/// they collapse into at the tool boundary.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    // Format errors (30-39)
    #[error("snapshot format error: {0}")]
    Format(String),

    #[error("incompatible snapshot format: found version {found}, expected {expected}")]
    IncompatibleFormat { found: u32, expected: u32 },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidSettings(_) => 11,
            Error::Format(_) => 30,
            Error::IncompatibleFormat { .. } => 31,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped_by_category() {
        assert_eq!(Error::Config("x".into()).code(), 10);
        assert_eq!(Error::InvalidSettings("x".into()).code(), 11);
        assert_eq!(Error::Format("x".into()).code(), 30);
        assert_eq!(Error::IncompatibleFormat { found: 9, expected: 1 }.code(), 31);
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(Error::from(io).code(), 60);
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::IncompatibleFormat { found: 9, expected: 1 };
        assert_eq!(
            err.to_string(),
            "incompatible snapshot format: found version 9, expected 1"
        );
        assert_eq!(
            Error::Format("bad tag".into()).to_string(),
            "snapshot format error: bad tag"
        );
    }
}
