//! Settings resolution.
//!
//! Order of precedence:
//! 1. An explicit settings file passed by the caller
//! 2. The file named by `SAVESTATE_CONFIG`
//! 3. Built-in defaults
//!
//! Individual `SAVESTATE_*` variables are then applied on top of whichever
//! base was chosen.

use crate::settings::SavestateSettings;
use crate::validate::validate_settings;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_CONFIG: &str = "SAVESTATE_CONFIG";
pub const ENV_INCREMENTAL: &str = "SAVESTATE_INCREMENTAL";
pub const ENV_IN_RAM: &str = "SAVESTATE_IN_RAM";
pub const ENV_COMPRESSED: &str = "SAVESTATE_COMPRESSED";
pub const ENV_DIR: &str = "SAVESTATE_DIR";

const DIR_NAME: &str = "savestate";

/// Errors from settings resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ss_common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(msg) => ss_common::Error::InvalidSettings(msg),
            other => ss_common::Error::Config(other.to_string()),
        }
    }
}

/// Where the resolved settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    Explicit(PathBuf),
    Environment(PathBuf),
    Defaults,
}

/// Settings plus provenance.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub settings: SavestateSettings,
    pub source: SettingsSource,
}

/// Resolve settings from the process environment.
pub fn resolve_settings(explicit: Option<&Path>) -> Result<ResolvedSettings, ConfigError> {
    resolve_settings_with(explicit, |key| std::env::var(key).ok())
}

/// Resolve settings with an injectable environment lookup.
pub fn resolve_settings_with<F>(explicit: Option<&Path>, env: F) -> Result<ResolvedSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (mut settings, source) = if let Some(path) = explicit {
        (load_settings_file(path)?, SettingsSource::Explicit(path.to_path_buf()))
    } else if let Some(path) = env(ENV_CONFIG).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        (load_settings_file(&path)?, SettingsSource::Environment(path))
    } else {
        (SavestateSettings::default(), SettingsSource::Defaults)
    };

    if let Some(value) = env(ENV_INCREMENTAL) {
        settings.incremental = parse_bool(ENV_INCREMENTAL, &value)?;
    }
    if let Some(value) = env(ENV_IN_RAM) {
        settings.in_ram = parse_bool(ENV_IN_RAM, &value)?;
    }
    if let Some(value) = env(ENV_COMPRESSED) {
        settings.compressed = parse_bool(ENV_COMPRESSED, &value)?;
    }
    if let Some(dir) = env(ENV_DIR).filter(|d| !d.is_empty()) {
        settings.savestate_dir = Some(PathBuf::from(dir));
    }

    let validation = validate_settings(&settings);
    if !validation.is_valid() {
        return Err(ConfigError::Invalid(validation.summary()));
    }

    Ok(ResolvedSettings { settings, source })
}

/// Load a JSON settings file.
pub fn load_settings_file(path: &Path) -> Result<SavestateSettings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Platform default directory for path-mode snapshots.
pub fn default_savestate_dir() -> PathBuf {
    match dirs::cache_dir() {
        Some(base) => base.join(DIR_NAME),
        None => std::env::temp_dir().join(DIR_NAME),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let resolved = resolve_settings_with(None, env_of(&[])).unwrap();
        assert_eq!(resolved.source, SettingsSource::Defaults);
        assert_eq!(resolved.settings, SavestateSettings::default());
    }

    #[test]
    fn explicit_file_wins_over_env_file() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("explicit.json");
        let from_env = tmp.path().join("env.json");
        std::fs::write(&explicit, r#"{"slot_count": 5}"#).unwrap();
        std::fs::write(&from_env, r#"{"slot_count": 7}"#).unwrap();

        let env = env_of(&[(ENV_CONFIG, from_env.to_str().unwrap())]);
        let resolved = resolve_settings_with(Some(explicit.as_path()), env).unwrap();
        assert_eq!(resolved.settings.slot_count, 5);
        assert_eq!(resolved.source, SettingsSource::Explicit(explicit));
    }

    #[test]
    fn env_file_then_overrides() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("s.json");
        std::fs::write(&file, r#"{"incremental": false, "compressed": true}"#).unwrap();

        let env = env_of(&[
            (ENV_CONFIG, file.to_str().unwrap()),
            (ENV_INCREMENTAL, "yes"),
            (ENV_COMPRESSED, "0"),
            (ENV_DIR, "/var/tmp/states"),
        ]);
        let resolved = resolve_settings_with(None, env).unwrap();
        assert!(resolved.settings.incremental);
        assert!(!resolved.settings.compressed);
        assert_eq!(
            resolved.settings.savestate_dir.as_deref(),
            Some(Path::new("/var/tmp/states"))
        );
        assert_eq!(resolved.source, SettingsSource::Environment(file));
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let err = resolve_settings_with(None, env_of(&[(ENV_IN_RAM, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: ENV_IN_RAM, .. }));
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("s.json");
        std::fs::write(&file, r#"{"fork_to_save": true, "in_ram": true}"#).unwrap();
        let err = resolve_settings_with(Some(file.as_path()), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = resolve_settings_with(Some(Path::new("/nonexistent/s.json")), env_of(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/s.json"));
    }
}
