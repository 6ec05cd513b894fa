//! Configuration types for the Tessera host.
//!
//! Every struct implements [`Default`] with the values from the embedded
//! defaults, so a bare `[section]` header in TOML produces a working
//! configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for a modular host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Module roots and startup behaviour.
    pub modules: ModulesSection,
    /// Lifecycle event delivery.
    pub events: EventsSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

/// Where modules live and what to do with them at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesSection {
    /// Directories whose immediate subdirectories are modules.
    pub roots: Vec<PathBuf>,
    /// Scan the roots while the host is built.
    pub scan_on_start: bool,
    /// Load every loadable module after the initial scan.
    pub load_on_start: bool,
}

impl Default for ModulesSection {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            scan_on_start: true,
            load_on_start: true,
        }
    }
}

/// Lifecycle event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Capacity of the broadcast channel. Slow subscribers that fall this
    /// far behind skip events.
    pub channel_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["tessera_modules=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
