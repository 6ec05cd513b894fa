//! Hierarchical service resolution across module boundaries.
//!
//! Lookup order is fixed: the module's own provider (once spliced in),
//! every dependency's links flattened in declaration order, then the host
//! root. When a link has a registration but cannot build it from its own
//! registrations alone, the link is asked to construct it again with
//! parameters resolved through the whole hierarchy.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tessera_di::{
    DiError, DiResult, Resolver, ScopedResolver, ServiceContainer, ServiceInstance, ServiceKey,
};
use tracing::trace;

/// A single lookup surface over a module, its dependencies and the host.
pub struct HierarchicalResolver {
    own: OnceLock<Arc<dyn ServiceContainer>>,
    links: Vec<Arc<dyn ServiceContainer>>,
}

impl HierarchicalResolver {
    /// Compose a resolver over `dependencies` and the host `root`.
    ///
    /// Dependency chains are flattened, each container appearing once,
    /// and the root always comes last.
    #[must_use]
    pub fn new(
        dependencies: &[Arc<HierarchicalResolver>],
        root: Arc<dyn ServiceContainer>,
    ) -> Self {
        let mut links: Vec<Arc<dyn ServiceContainer>> = Vec::new();
        for dependency in dependencies {
            for link in dependency.chain() {
                let seen = Arc::ptr_eq(link, &root) || links.iter().any(|l| Arc::ptr_eq(l, link));
                if !seen {
                    links.push(Arc::clone(link));
                }
            }
        }
        links.push(root);
        Self {
            own: OnceLock::new(),
            links,
        }
    }

    fn from_links(
        own: Option<Arc<dyn ServiceContainer>>,
        links: Vec<Arc<dyn ServiceContainer>>,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(own) = own {
            let _ = cell.set(own);
        }
        Self { own: cell, links }
    }

    /// Splice in the module's own provider.
    ///
    /// Returns `false` if a provider was already attached.
    pub fn attach(&self, own: Arc<dyn ServiceContainer>) -> bool {
        self.own.set(own).is_ok()
    }

    /// Whether the module's own provider is attached.
    #[must_use]
    pub fn has_own(&self) -> bool {
        self.own.get().is_some()
    }

    /// Number of containers consulted, own provider included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chain().count()
    }

    /// Containers in lookup order.
    pub fn chain(&self) -> impl Iterator<Item = &Arc<dyn ServiceContainer>> {
        self.own.get().into_iter().chain(self.links.iter())
    }
}

/// Resolve through `chain`, falling back to construction with `outer`.
fn resolve_through<'a>(
    chain: impl Iterator<Item = &'a Arc<dyn ServiceContainer>>,
    key: &ServiceKey,
    outer: &dyn Resolver,
) -> DiResult<Option<ServiceInstance>> {
    for link in chain {
        match link.resolve_own(key) {
            Ok(Some(instance)) => return Ok(Some(instance)),
            Ok(None) => {},
            Err(e) if e.is_unresolvable() => {
                trace!(service = %key, error = %e, "Falling back to hierarchical construction");
                if let Some(instance) = link.construct_with(key, outer)? {
                    return Ok(Some(instance));
                }
            },
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Create a child scope of every container, disposing the ones already
/// created if any fails.
fn fan_out<'a>(
    chain: impl Iterator<Item = &'a Arc<dyn ServiceContainer>>,
) -> DiResult<Vec<Arc<dyn ServiceContainer>>> {
    let mut children = Vec::new();
    for link in chain {
        match link.create_child() {
            Ok(child) => children.push(child),
            Err(e) => {
                for child in &children {
                    if let Err(dispose_error) = child.dispose() {
                        trace!(error = %dispose_error, "Partial scope disposal failed");
                    }
                }
                return Err(e);
            },
        }
    }
    Ok(children)
}

impl Resolver for HierarchicalResolver {
    fn resolve(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        resolve_through(self.chain(), key, self)
    }

    fn create_scope(&self) -> DiResult<Arc<dyn ScopedResolver>> {
        let mut children = fan_out(self.chain())?;
        let own = if self.has_own() && !children.is_empty() {
            Some(children.remove(0))
        } else {
            None
        };
        Ok(Arc::new(HierarchicalScope {
            resolver: Self::from_links(own, children),
        }))
    }
}

impl fmt::Debug for HierarchicalResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchicalResolver")
            .field("has_own", &self.has_own())
            .field("links", &self.links.len())
            .finish()
    }
}

/// A scope spanning every container of a [`HierarchicalResolver`].
pub struct HierarchicalScope {
    resolver: HierarchicalResolver,
}

impl HierarchicalScope {
    /// Number of child scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resolver.depth()
    }

    /// Whether the scope spans no containers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Resolver for HierarchicalScope {
    fn resolve(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        self.resolver.resolve(key)
    }

    fn create_scope(&self) -> DiResult<Arc<dyn ScopedResolver>> {
        self.resolver.create_scope()
    }
}

impl ScopedResolver for HierarchicalScope {
    fn dispose(&self) -> DiResult<()> {
        let mut failures = Vec::new();
        for child in self.resolver.chain() {
            match child.dispose() {
                Ok(()) => {},
                Err(DiError::Disposal { failures: inner }) => failures.extend(inner),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DiError::Disposal { failures })
        }
    }
}

impl fmt::Debug for HierarchicalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchicalScope")
            .field("children", &self.len())
            .finish()
    }
}
