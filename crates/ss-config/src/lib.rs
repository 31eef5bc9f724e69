//! Savestate engine configuration loading and validation.
//!
//! This crate provides:
//! - Typed settings for the checkpoint engine (`SavestateSettings`)
//! - Settings resolution (explicit file → env file → env overrides → defaults)
//! - Semantic validation of option combinations

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{resolve_settings, resolve_settings_with, ConfigError, ResolvedSettings, SettingsSource};
pub use settings::{LogSettings, SavestateSettings, Strictness};
pub use validate::{validate_settings, ValidationError, ValidationResult};

/// Largest resident slot table the reserved region can hold.
pub const MAX_SLOT_COUNT: usize = 32;
