//! Host error types.

use thiserror::Error;

/// Errors raised while building or shutting down a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// Configuration could not be loaded.
    #[error("host configuration failed: {0}")]
    Config(#[from] tessera_config::ConfigError),

    /// Logging could not be set up.
    #[error("host logging setup failed: {0}")]
    Telemetry(#[from] tessera_telemetry::TelemetryError),

    /// A module operation failed.
    #[error("module operation failed: {0}")]
    Module(#[from] tessera_modules::ModuleError),

    /// The root service provider failed.
    #[error("host services failed: {0}")]
    Services(#[from] tessera_di::DiError),
}

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;
