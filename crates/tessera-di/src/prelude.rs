//! Prelude module - commonly used types for convenient import.
//!
//! Use `use tessera_di::prelude::*;` to import all essential types.

pub use crate::{
    Constructor, DiError, DiResult, Lifetime, Resolver, ResolverExt, ScopedResolver,
    ServiceCollection, ServiceInstance, ServiceKey, ServiceProvider,
};
