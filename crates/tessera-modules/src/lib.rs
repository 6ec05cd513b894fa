//! Tessera Modules - Discovery, dependency ordering and lifecycle of
//! dynamically hosted modules.
//!
//! This crate provides:
//! - [`ModuleDescriptor`]: the `module.json` record each module directory
//!   carries, with tolerant version parsing and localized metadata
//! - [`ModuleLoader`]: scans root directories, links modules into a
//!   dependency graph and loads or unloads them in dependency order
//! - [`ModuleContext`]: per-module state machine with guarded, cancellable
//!   load and unload that always clean up after failure
//! - [`IsolationBoundary`]: a reclaimable home for a module's private
//!   artifacts with deterministic reference resolution and leak detection
//! - [`HierarchicalResolver`]: service lookup across a module, its
//!   dependencies and the host
//! - [`ModuleEventBus`]: best-effort lifecycle notifications
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tessera_di::{Resolver, ServiceCollection};
//! use tessera_modules::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Default)]
//! struct Clock;
//!
//! #[async_trait]
//! impl ModuleMain for Clock {
//!     async fn register_services(
//!         &self,
//!         _services: &mut ServiceCollection,
//!         _cancel: &CancellationToken,
//!     ) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn configure(
//!         &self,
//!         _resolver: Arc<dyn Resolver>,
//!         _cancel: &CancellationToken,
//!     ) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let loader = ModuleLoader::builder().build();
//! let id = ModuleId::random();
//! loader
//!     .register_managed(ModuleDescriptor::new(id, "clock"), EntryType::of::<Clock>())
//!     .await
//!     .unwrap();
//!
//! loader.load_all(&CancellationToken::new()).await.unwrap();
//! assert_eq!(loader.state(id), Some(ModuleState::Loaded));
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod artifact;
mod boundary;
mod context;
mod descriptor;
mod entry;
mod error;
mod events;
mod graph;
mod hierarchy;
mod id;
mod loader;

pub use artifact::{
    ArtifactLoader, CodeArtifact, ExportedType, LinkedArtifact, LinkedArtifactLoader, TypeKind,
};
pub use boundary::{
    BoundaryView, DependencyManifest, HostBoundary, IsolationBoundary, LoadedArtifact,
};
pub use context::{ModuleContext, ModuleHandle, ModuleState};
pub use descriptor::{
    BuildInformation, DESCRIPTOR_FILE_NAME, DependencyRequirement, GeneralInformation,
    LicenseInformation, LoadedDescriptor, LocalizedInformation, MAX_DESCRIPTOR_SIZE,
    ModuleDescriptor, parse_version,
};
pub use entry::{EntryType, ModuleMain};
pub use error::{
    BoundaryError, BoundaryResult, BulkOperation, ConfigFailure, HookStage, ModuleError,
    ModuleFailure, ModuleResult, UnresolvedModule, UnresolvedReason,
};
pub use events::{
    DEFAULT_CHANNEL_CAPACITY, LifecycleObserver, ModuleEvent, ModuleEventBus, ModuleEventKind,
    ModuleEventReceiver,
};
pub use hierarchy::{HierarchicalResolver, HierarchicalScope};
pub use id::ModuleId;
pub use loader::{BulkReport, ModuleLoader, ModuleLoaderBuilder, ScanReport};
