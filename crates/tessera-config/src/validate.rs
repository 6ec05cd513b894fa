//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::HostConfig;

/// Largest accepted event channel capacity.
const MAX_CHANNEL_CAPACITY: usize = 65_536;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &HostConfig) -> ConfigResult<()> {
    validate_modules(config)?;
    validate_events(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_modules(config: &HostConfig) -> ConfigResult<()> {
    for (index, root) in config.modules.roots.iter().enumerate() {
        if root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError {
                field: format!("modules.roots[{index}]"),
                message: "module root must not be empty".to_owned(),
            });
        }
    }

    if config.modules.load_on_start && !config.modules.scan_on_start {
        return Err(ConfigError::ValidationError {
            field: "modules.load_on_start".to_owned(),
            message: "load_on_start requires scan_on_start".to_owned(),
        });
    }

    Ok(())
}

fn validate_events(config: &HostConfig) -> ConfigResult<()> {
    let capacity = config.events.channel_capacity;
    if capacity == 0 || capacity > MAX_CHANNEL_CAPACITY {
        return Err(ConfigError::ValidationError {
            field: "events.channel_capacity".to_owned(),
            message: format!("channel_capacity must be between 1 and {MAX_CHANNEL_CAPACITY}"),
        });
    }
    Ok(())
}

fn validate_logging(config: &HostConfig) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        });
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&HostConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_root_rejected() {
        let mut config = HostConfig::default();
        config.modules.roots = vec![PathBuf::from("/srv/modules"), PathBuf::new()];
        let err = validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ValidationError { ref field, .. } if field == "modules.roots[1]"
        ));
    }

    #[test]
    fn test_load_without_scan_rejected() {
        let mut config = HostConfig::default();
        config.modules.scan_on_start = false;
        assert!(validate(&config).is_err());
        config.modules.load_on_start = false;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_channel_capacity_bounds() {
        let mut config = HostConfig::default();
        config.events.channel_capacity = 0;
        assert!(validate(&config).is_err());
        config.events.channel_capacity = MAX_CHANNEL_CAPACITY;
        assert!(validate(&config).is_ok());
        config.events.channel_capacity = MAX_CHANNEL_CAPACITY.saturating_add(1);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = HostConfig::default();
        config.logging.level = "verbose".to_owned();
        assert!(validate(&config).is_err());
    }
}
