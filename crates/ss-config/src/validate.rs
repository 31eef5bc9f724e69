//! Semantic validation of settings combinations.

use crate::settings::{SavestateSettings, Strictness};
use crate::MAX_SLOT_COUNT;
use std::fmt;

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcome of validating a settings value.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All errors joined on one line.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn error(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field,
            message: message.into(),
        });
    }
}

/// Validate settings.
pub fn validate_settings(settings: &SavestateSettings) -> ValidationResult {
    let mut result = ValidationResult::default();

    if settings.slot_count < 2 {
        result.error("slot_count", "need at least one user slot plus the base slot");
    }
    if settings.slot_count > MAX_SLOT_COUNT {
        result.error(
            "slot_count",
            format!("at most {} slots fit the resident table", MAX_SLOT_COUNT),
        );
    }
    if settings.fork_to_save && settings.in_ram {
        result.error(
            "fork_to_save",
            "a forked save cannot publish memory descriptors back to the parent",
        );
    }
    if settings.fork_to_save && settings.incremental {
        result.error(
            "fork_to_save",
            "a forked save cannot advance the incremental chain of the parent",
        );
    }

    if settings.incremental && settings.strictness == Strictness::Trusting {
        result
            .warnings
            .push("incremental saves will trust soft-dirty bits without verification".to_string());
    }
    if settings.incremental && !settings.present_tracking {
        result
            .warnings
            .push("present tracking is off; untouched pages will be stored".to_string());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let result = validate_settings(&SavestateSettings::default());
        assert!(result.is_valid(), "{}", result.summary());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn slot_count_bounds() {
        let mut s = SavestateSettings::default();
        s.slot_count = 1;
        assert!(!validate_settings(&s).is_valid());
        s.slot_count = MAX_SLOT_COUNT + 1;
        assert!(!validate_settings(&s).is_valid());
        s.slot_count = MAX_SLOT_COUNT;
        assert!(validate_settings(&s).is_valid());
    }

    #[test]
    fn fork_conflicts() {
        let s = SavestateSettings::default()
            .with_fork_to_save(true)
            .with_in_ram(true)
            .with_incremental(true);
        let result = validate_settings(&s);
        assert_eq!(result.errors.len(), 2);
        assert!(result.summary().contains("fork_to_save"));
    }

    #[test]
    fn trusting_incremental_warns() {
        let s = SavestateSettings::default()
            .with_incremental(true)
            .with_strictness(Strictness::Trusting);
        let result = validate_settings(&s);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
