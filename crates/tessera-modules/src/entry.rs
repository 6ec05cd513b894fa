//! The entry-object contract and entry type descriptions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_di::{Constructor, Resolver, ServiceCollection};
use tokio_util::sync::CancellationToken;

use crate::artifact::{ExportedType, TypeKind};
use crate::error::{ModuleError, ModuleResult};
use crate::id::ModuleId;

/// The object a module exposes to its host.
///
/// `register_services` always runs before `configure`. `teardown` runs at
/// most once, and only after both hooks succeeded. A module whose load
/// fails is dropped without `teardown`.
#[async_trait]
pub trait ModuleMain: Send + Sync + 'static {
    /// Register the services this module provides.
    async fn register_services(
        &self,
        services: &mut ServiceCollection,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Configure the module with the fully composed resolver.
    async fn configure(
        &self,
        resolver: Arc<dyn Resolver>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Release resources before the module is unloaded.
    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type DefaultFn = Arc<dyn Fn() -> Box<dyn ModuleMain> + Send + Sync>;

/// How to build a module's entry object.
///
/// At most one explicit constructor is allowed. Without one, the implicit
/// default constructor is used if present.
#[derive(Clone)]
pub struct EntryType {
    type_name: String,
    constructors: Vec<Constructor<Box<dyn ModuleMain>>>,
    default: Option<DefaultFn>,
}

/// The constructor chosen for an entry type.
pub(crate) enum EntryConstructor<'a> {
    Explicit(&'a Constructor<Box<dyn ModuleMain>>),
    Default(&'a DefaultFn),
}

impl EntryType {
    /// An entry type with no constructors yet.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            constructors: Vec::new(),
            default: None,
        }
    }

    /// An entry type built with `M::default()`.
    #[must_use]
    pub fn of<M: ModuleMain + Default>() -> Self {
        Self::new(std::any::type_name::<M>()).with_default::<M>()
    }

    /// An entry type built by `constructor`.
    #[must_use]
    pub fn constructed<M: ModuleMain>(constructor: Constructor<M>) -> Self {
        Self::new(constructor.type_name()).with_constructor(constructor)
    }

    /// Set the implicit default constructor.
    #[must_use]
    pub fn with_default<M: ModuleMain + Default>(mut self) -> Self {
        self.default = Some(Arc::new(|| Box::new(M::default()) as Box<dyn ModuleMain>));
        self
    }

    /// Add an explicit constructor.
    #[must_use]
    pub fn with_constructor<M: ModuleMain>(mut self, constructor: Constructor<M>) -> Self {
        self.constructors
            .push(constructor.map(|main| Box::new(main) as Box<dyn ModuleMain>));
        self
    }

    /// Name of the entry type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Number of explicit constructors.
    #[must_use]
    pub fn constructor_count(&self) -> usize {
        self.constructors.len()
    }

    pub(crate) fn select(&self, id: ModuleId) -> ModuleResult<EntryConstructor<'_>> {
        match (self.constructors.as_slice(), &self.default) {
            ([only], _) => Ok(EntryConstructor::Explicit(only)),
            ([], Some(default)) => Ok(EntryConstructor::Default(default)),
            ([], None) => Err(ModuleError::NoConstructor {
                id,
                type_name: self.type_name.clone(),
            }),
            (many, _) => Err(ModuleError::MultipleConstructors {
                id,
                type_name: self.type_name.clone(),
                count: many.len(),
            }),
        }
    }
}

impl fmt::Debug for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryType")
            .field("type_name", &self.type_name)
            .field("constructors", &self.constructors.len())
            .field("default", &self.default.is_some())
            .finish()
    }
}

/// Find the single usable entry type among an artifact's exports.
pub(crate) fn discover_entry_type(
    id: ModuleId,
    library: &str,
    exports: &[ExportedType],
) -> ModuleResult<EntryType> {
    let candidates: Vec<&ExportedType> = exports
        .iter()
        .filter(|t| t.entry_type().is_some() && t.kind() != TypeKind::Abstract)
        .collect();

    match candidates.as_slice() {
        [] => Err(ModuleError::NoEntryType {
            id,
            library: library.to_string(),
        }),
        [only] if only.kind() == TypeKind::Generic => Err(ModuleError::EntryTypeIsGeneric {
            id,
            type_name: only.name().to_string(),
        }),
        [only] => only.entry_type().cloned().ok_or_else(|| ModuleError::NoEntryType {
            id,
            library: library.to_string(),
        }),
        many => Err(ModuleError::MultipleEntryTypes {
            id,
            candidates: many.iter().map(|t| t.name().to_string()).collect(),
        }),
    }
}
