//! Config file discovery and layered loading.
//!
//! Implements the `HostConfig::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge the user config (`{config_dir}/tessera/tessera.toml`)
//! 3. Merge the explicit config file, if any
//! 4. Apply env var fallbacks for fields no file set
//! 5. Deserialize merged tree → `HostConfig`
//! 6. Validate

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::types::HostConfig;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Maximum allowed config file size (1 MiB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Inputs to a layered load.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files merged over the defaults, lowest precedence first.
    /// Missing files are skipped.
    pub files: Vec<PathBuf>,
    /// Environment variables consulted for fallbacks.
    pub env: HashMap<String, String>,
}

impl ConfigSources {
    /// Standard sources: the user config file, then `file`, with the
    /// process environment.
    #[must_use]
    pub fn discover(file: Option<&Path>) -> Self {
        let mut files = Vec::new();
        if let Some(user) = user_config_path() {
            files.push(user);
        }
        if let Some(file) = file {
            files.push(file.to_path_buf());
        }
        Self {
            files,
            env: collect_env_vars(),
        }
    }
}

/// Path of the per-user config file, if the platform has a config dir.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "tessera").map(|d| d.config_dir().join(CONFIG_FILE_NAME))
}

/// Load the host configuration from `sources`.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is unreadable, oversized
/// or malformed, or if the merged configuration fails validation.
pub fn load(sources: &ConfigSources) -> ConfigResult<HostConfig> {
    // 1. Parse embedded defaults.
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    // 2-3. File layers.
    let mut set_fields = HashSet::new();
    for path in &sources.files {
        if let Some(overlay) = try_load_file(path)? {
            record_fields(&overlay, "", &mut set_fields);
            deep_merge(&mut merged, &overlay);
            info!(path = %path.display(), "loaded config file");
        }
    }

    // 4. Env var fallbacks.
    let env_count = apply_env_fallbacks(&mut merged, &set_fields, &sources.env);
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    // 5. Deserialize.
    let config: HostConfig =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    // 6. Validate.
    validate::validate(&config)?;
    Ok(config)
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<HostConfig> {
    let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: HostConfig = overlay
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Try to load a file, returning `None` if the file doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    // Checked after reading so the size and the content agree.
    let size = u64::try_from(content.len()).unwrap_or(u64::MAX);
    if size > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {size} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(Some(value))
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; anything
/// else is replaced.
fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Record the dotted path of every leaf in `val`.
fn record_fields(val: &toml::Value, prefix: &str, fields: &mut HashSet<String>) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            record_fields(child, &path, fields);
        }
    } else {
        fields.insert(prefix.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(files: Vec<PathBuf>, env: &[(&str, &str)]) -> ConfigSources {
        ConfigSources {
            files,
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    #[test]
    fn test_defaults_deserialize_to_config() {
        let config: HostConfig = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_load_without_files() {
        let config = load(&sources(Vec::new(), &[])).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_file_layers_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("tessera.toml");
        std::fs::write(
            &user,
            r#"
            [modules]
            roots = ["/srv/modules"]
            load_on_start = false
            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        std::fs::write(&project, "[logging]\nlevel = \"debug\"\n").unwrap();

        let files = vec![user, project, dir.path().join("missing.toml")];
        let config = load(&sources(files, &[])).unwrap();
        assert_eq!(config.modules.roots, vec![PathBuf::from("/srv/modules")]);
        assert!(!config.modules.load_on_start);
        assert!(config.modules.scan_on_start);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_env_fills_only_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tessera.toml");
        std::fs::write(&file, "[logging]\nlevel = \"warn\"\n").unwrap();

        let config = load(&sources(
            vec![file],
            &[("TESSERA_LOG_LEVEL", "trace"), ("TESSERA_LOG_FORMAT", "pretty")],
        ))
        .unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_invalid_env_value_fails_validation() {
        let result = load(&sources(Vec::new(), &[("TESSERA_LOG_FORMAT", "xml")]));
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_load_file_nonexistent() {
        let result = load_file(Path::new("/nonexistent/tessera.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tessera.toml");
        std::fs::write(&file, "[modules\nroots = ").unwrap();
        assert!(matches!(
            load(&sources(vec![file], &[])),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_wrong_type_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tessera.toml");
        std::fs::write(&file, "[events]\nchannel_capacity = \"many\"\n").unwrap();
        assert!(matches!(load_file(&file), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(
            matches!(result, Err(ConfigError::ValidationError { .. })),
            "Expected ValidationError for oversized config, got: {result:?}"
        );
    }

    #[test]
    fn test_record_fields() {
        let val: toml::Value = toml::from_str(
            r#"
            [modules]
            roots = ["a"]
            [logging]
            level = "info"
            "#,
        )
        .unwrap();
        let mut fields = HashSet::new();
        record_fields(&val, "", &mut fields);
        assert!(fields.contains("modules.roots"));
        assert!(fields.contains("logging.level"));
        assert_eq!(fields.len(), 2);
    }
}
