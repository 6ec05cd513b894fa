//! Tessera DI - Typed service container for the Tessera module host.
//!
//! This crate provides:
//! - [`ServiceCollection`]: ordered registrations of instances, factories and
//!   constructor-described types with singleton, scoped or transient lifetimes
//! - [`ServiceProvider`] and [`ServiceScope`]: concrete resolution with
//!   per-lifetime caching and disposal hooks
//! - [`Constructor`]: explicit parameter descriptions used in place of
//!   runtime type inspection
//! - [`Resolver`] and [`ServiceContainer`]: the object-safe seams composite
//!   resolvers are built from
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_di::prelude::*;
//!
//! struct Greeting(String);
//! struct Greeter {
//!     greeting: Arc<Greeting>,
//! }
//!
//! let mut services = ServiceCollection::new();
//! services.add_instance(Arc::new(Greeting("hello".into())));
//! services.add_type::<Greeter>(
//!     Lifetime::Transient,
//!     Constructor::new("Greeter", |args| {
//!         Ok(Arc::new(Greeter { greeting: args.required::<Greeting>(0)? }))
//!     })
//!     .param::<Greeting>(),
//! );
//!
//! let provider = services.build();
//! let greeter = provider.require::<Greeter>().unwrap();
//! assert_eq!(greeter.greeting.0, "hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod collection;
mod constructor;
mod error;
mod key;
mod provider;
mod resolver;

pub use collection::{
    Disposer, FactoryFn, Implementation, Lifetime, ServiceCollection, ServiceDescriptor,
};
pub use constructor::{Arguments, Constructor, Parameter, resolve_arguments, select_constructor};
pub use error::{DiError, DiResult, UnresolvedParameter, format_parameters};
pub use key::{ServiceInstance, ServiceKey};
pub use provider::{ServiceProvider, ServiceScope};
pub use resolver::{Resolver, ResolverExt, ScopedResolver, ServiceContainer, create_type};
