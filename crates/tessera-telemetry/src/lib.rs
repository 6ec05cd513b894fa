//! Tessera Telemetry - logging setup for modular hosts.
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), tessera_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("tessera_modules=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("Host starting");
//! # Ok(())
//! # }
//! ```
//!
//! With the `config` feature, a [`LogConfig`] can be built from the
//! `logging` section of a `tessera_config::HostConfig`.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
