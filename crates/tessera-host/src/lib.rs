#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tessera Host - bootstrap for applications that host modules.
//!
//! [`ModularHost`] builds the root service container, constructs a
//! [`ModuleLoader`](tessera_modules::ModuleLoader), registers it as a
//! singleton in that container, and runs the initial scan and load.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tessera_di::ResolverExt;
//! use tessera_host::ModularHost;
//! use tessera_modules::ModuleLoader;
//!
//! struct Clock;
//!
//! # async fn run() -> Result<(), tessera_host::HostError> {
//! let host = ModularHost::builder()
//!     .with_root("/srv/modules")
//!     .with_services(|services| {
//!         services.add_instance(Arc::new(Clock));
//!     })
//!     .with_logging()
//!     .build()
//!     .await?;
//!
//! let loader = host.services().require::<ModuleLoader>()?;
//! println!("{} module(s) loaded", loader.loaded_count());
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod host;

pub use error::{HostError, HostResult};
pub use host::{ModularHost, ModularHostBuilder, StartupReport};
