#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Layered configuration for a Tessera host.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tessera_config::HostConfig;
//!
//! let config = HostConfig::load(Some(std::path::Path::new("tessera.toml"))).unwrap();
//! for root in &config.modules.roots {
//!     println!("module root: {}", root.display());
//! }
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Explicit file** passed to [`HostConfig::load`]
//! 2. **User** (`{config_dir}/tessera/tessera.toml`)
//! 3. **Environment variables** (`TESSERA_*`), fallback only
//! 4. **Embedded defaults** (`defaults.toml` compiled into binary)
//!
//! # Environment
//!
//! | variable | field |
//! |---|---|
//! | `TESSERA_MODULE_ROOTS` | `modules.roots`, split on the platform path separator |
//! | `TESSERA_LOG_LEVEL` | `logging.level` |
//! | `TESSERA_LOG_FORMAT` | `logging.format` |

/// Environment variable fallbacks.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_FILE_NAME, ConfigSources};
pub use types::*;

impl HostConfig {
    /// Load configuration with the full precedence chain.
    ///
    /// See [`loader::load`] for the algorithm.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(file: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(&ConfigSources::discover(file))
    }

    /// Load configuration from explicit sources.
    ///
    /// # Errors
    ///
    /// Same as [`HostConfig::load`].
    pub fn load_from(sources: &ConfigSources) -> ConfigResult<Self> {
        loader::load(sources)
    }

    /// Load configuration from a single file (no layering).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
