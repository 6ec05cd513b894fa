//! Tessera Test - Shared test utilities for the Tessera module host.
//!
//! This crate provides on-disk module trees, an artifact catalog, probe
//! entry types and recording observers that integration tests across the
//! workspace build on.
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! tessera-test.workspace = true
//! ```
//!
//! Then use in your tests:
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn loads_a_module() {
//!     let tree = ModuleTree::new();
//!     let catalog = TestCatalog::new();
//!     let log = ProbeLog::new();
//!
//!     tree.module("greeter", &test_descriptor(1, "greeter.module"));
//!     catalog.entry("greeter", ProbeModule::new("greeter", &log).entry_type("Greeter"));
//!
//!     let loader = tree.loader(&catalog);
//!     loader.scan().await.unwrap();
//!     loader.load_all(&CancellationToken::new()).await.unwrap();
//!     assert_eq!(log.entries(), ["greeter:register", "greeter:configure"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod catalog;
pub mod fixtures;
pub mod mocks;
pub mod probes;

pub use catalog::*;
pub use fixtures::*;
pub use mocks::*;
pub use probes::*;
