//! Concrete provider and scopes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::collection::{Disposer, Implementation, Lifetime, ServiceCollection, ServiceDescriptor};
use crate::constructor::{resolve_arguments, select_constructor};
use crate::error::{DiError, DiResult};
use crate::key::{ServiceInstance, ServiceKey};
use crate::resolver::{Resolver, ScopedResolver, ServiceContainer};

/// Instance cache plus the disposers owed to its instances.
#[derive(Default)]
struct InstanceCache {
    instances: Mutex<HashMap<ServiceKey, ServiceInstance>>,
    tracked: Mutex<Vec<(ServiceInstance, Disposer)>>,
    disposed: AtomicBool,
}

impl InstanceCache {
    fn ensure_live(&self) -> DiResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DiError::Disposed);
        }
        Ok(())
    }

    fn get_or_create<F>(
        &self,
        key: ServiceKey,
        disposer: Option<&Disposer>,
        create: F,
    ) -> DiResult<ServiceInstance>
    where
        F: FnOnce() -> DiResult<ServiceInstance>,
    {
        if let Some(found) = self.lock_instances().get(&key) {
            return Ok(found.clone());
        }

        // Built outside the lock: constructors may resolve other cached services.
        let created = create()?;

        let mut instances = self.lock_instances();
        if let Some(existing) = instances.get(&key) {
            return Ok(existing.clone());
        }
        instances.insert(key, created.clone());
        drop(instances);

        if let Some(disposer) = disposer {
            self.track(created.clone(), Arc::clone(disposer));
        }
        Ok(created)
    }

    fn track(&self, instance: ServiceInstance, disposer: Disposer) {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((instance, disposer));
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceKey, ServiceInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run every disposer in reverse creation order, collecting failures.
    fn dispose(&self) -> DiResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let tracked = std::mem::take(
            &mut *self.tracked.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut failures = Vec::new();
        for (instance, disposer) in tracked.iter().rev() {
            if let Err(e) = disposer(instance) {
                debug!(service = %instance.key(), error = %e, "Service disposer failed");
                failures.push(format!("{}: {e:#}", instance.key()));
            }
        }
        self.lock_instances().clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DiError::Disposal { failures })
        }
    }
}

struct ProviderInner {
    registrations: HashMap<ServiceKey, ServiceDescriptor>,
    root: InstanceCache,
}

/// A built, immutable set of registrations with a singleton cache.
///
/// Cloning is cheap and shares the cache.
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<ProviderInner>,
}

impl ServiceProvider {
    pub(crate) fn new(collection: ServiceCollection) -> Self {
        let mut registrations = HashMap::new();
        let mut root = InstanceCache::default();
        for descriptor in collection {
            registrations.insert(descriptor.key(), descriptor);
        }

        // Pre-built instances are owned by the provider from the start, so
        // their disposers run with the provider's.
        let tracked = root.tracked.get_mut().unwrap_or_else(PoisonError::into_inner);
        for descriptor in registrations.values() {
            if let (Implementation::Instance(instance), Some(disposer)) =
                (descriptor.implementation(), descriptor.disposer())
            {
                tracked.push((instance.clone(), Arc::clone(disposer)));
            }
        }

        trace!(registrations = registrations.len(), "Built service provider");
        Self {
            inner: Arc::new(ProviderInner {
                registrations,
                root,
            }),
        }
    }

    /// Number of effective registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.registrations.len()
    }

    /// Whether the provider has no registrations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.registrations.is_empty()
    }

    /// The registration for `key`, if any.
    #[must_use]
    pub fn registration(&self, key: &ServiceKey) -> Option<&ServiceDescriptor> {
        self.inner.registrations.get(key)
    }

    /// Whether this and `other` are the same provider.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open a concrete scope.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Disposed`] once the provider is disposed.
    pub fn scope(&self) -> DiResult<ServiceScope> {
        self.inner.root.ensure_live()?;
        Ok(ServiceScope {
            provider: self.clone(),
            cache: InstanceCache::default(),
        })
    }

    /// Dispose singletons and registered instances.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Disposal`] if any disposer failed.
    pub fn dispose(&self) -> DiResult<()> {
        self.inner.root.dispose()
    }

    /// Resolve `key`, caching according to its lifetime.
    ///
    /// `scope` holds scoped and transient instances when resolving from a
    /// scope. `params` resolves constructor parameters and feeds factories.
    fn resolve_in(
        &self,
        key: &ServiceKey,
        scope: Option<&InstanceCache>,
        params: &dyn Resolver,
    ) -> DiResult<Option<ServiceInstance>> {
        self.inner.root.ensure_live()?;
        if let Some(scope) = scope {
            scope.ensure_live()?;
        }
        let Some(descriptor) = self.inner.registrations.get(key) else {
            return Ok(None);
        };

        // Pre-built instances were tracked when the provider was built.
        let disposer = match descriptor.implementation() {
            Implementation::Instance(_) => None,
            _ => descriptor.disposer(),
        };
        let instance = match descriptor.lifetime() {
            Lifetime::Singleton => {
                self.inner
                    .root
                    .get_or_create(*key, disposer, || activate(descriptor, params))?
            },
            Lifetime::Scoped => scope.unwrap_or(&self.inner.root).get_or_create(
                *key,
                disposer,
                || activate(descriptor, params),
            )?,
            Lifetime::Transient => {
                let created = activate(descriptor, params)?;
                if let Some(disposer) = disposer {
                    scope
                        .unwrap_or(&self.inner.root)
                        .track(created.clone(), Arc::clone(disposer));
                }
                created
            },
        };
        Ok(Some(instance))
    }

    /// Fallback construction shared by the provider and its scopes.
    fn construct_in(
        &self,
        key: &ServiceKey,
        scope: Option<&InstanceCache>,
        outer: &dyn Resolver,
    ) -> DiResult<Option<ServiceInstance>> {
        match self.inner.registrations.get(key) {
            None => Ok(None),
            Some(descriptor)
                if matches!(descriptor.implementation(), Implementation::Type { .. }) =>
            {
                self.resolve_in(key, scope, outer)
            },
            Some(_) => self.resolve_in(key, scope, &Own { provider: self, scope }),
        }
    }
}

thread_local! {
    /// Registrations being activated on this thread, outermost first.
    static ACTIVATING: RefCell<Vec<ServiceKey>> = const { RefCell::new(Vec::new()) };
}

/// Marks a registration as under construction until dropped.
///
/// Resolution is synchronous, so a key already on this thread's stack
/// means the registration needs itself.
struct Activation;

impl Activation {
    fn enter(key: ServiceKey) -> DiResult<Self> {
        ACTIVATING.with_borrow_mut(|active| {
            if let Some(start) = active.iter().position(|k| *k == key) {
                let chain = active[start..]
                    .iter()
                    .chain(std::iter::once(&key))
                    .map(ServiceKey::type_name)
                    .collect();
                return Err(DiError::CircularDependency { chain });
            }
            active.push(key);
            Ok(Self)
        })
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        ACTIVATING.with_borrow_mut(|active| {
            active.pop();
        });
    }
}

/// Build one instance from a registration.
fn activate(descriptor: &ServiceDescriptor, params: &dyn Resolver) -> DiResult<ServiceInstance> {
    let _active = Activation::enter(descriptor.key())?;
    match descriptor.implementation() {
        Implementation::Instance(instance) => Ok(instance.clone()),
        Implementation::Factory(factory) => factory(params).map_err(|source| DiError::Factory {
            service: descriptor.key().type_name(),
            source,
        }),
        Implementation::Type {
            type_name,
            constructors,
        } => {
            let constructor = select_constructor(type_name, constructors)?;
            let arguments = resolve_arguments(constructor, |_, parameter| {
                params.resolve(&parameter.key())
            })?;
            constructor.invoke(&arguments)
        },
    }
}

/// Resolves against a provider's own registrations within an optional scope.
struct Own<'a> {
    provider: &'a ServiceProvider,
    scope: Option<&'a InstanceCache>,
}

impl Resolver for Own<'_> {
    fn resolve(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        self.provider.resolve_in(key, self.scope, self)
    }

    fn create_scope(&self) -> DiResult<Arc<dyn ScopedResolver>> {
        Ok(Arc::new(self.provider.scope()?))
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("registrations", &self.inner.registrations.len())
            .field("disposed", &self.inner.root.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Resolver for ServiceProvider {
    fn resolve(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        self.resolve_in(key, None, self)
    }

    fn create_scope(&self) -> DiResult<Arc<dyn ScopedResolver>> {
        Ok(Arc::new(self.scope()?))
    }
}

impl ServiceContainer for ServiceProvider {
    fn contains(&self, key: &ServiceKey) -> bool {
        self.inner.registrations.contains_key(key)
    }

    fn resolve_own(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        self.resolve_in(key, None, self)
    }

    fn construct_with(
        &self,
        key: &ServiceKey,
        outer: &dyn Resolver,
    ) -> DiResult<Option<ServiceInstance>> {
        self.construct_in(key, None, outer)
    }

    fn create_child(&self) -> DiResult<Arc<dyn ServiceContainer>> {
        Ok(Arc::new(self.scope()?))
    }

    fn dispose(&self) -> DiResult<()> {
        ServiceProvider::dispose(self)
    }
}

/// A scope over a [`ServiceProvider`].
///
/// Scoped registrations get one instance per scope. Transient instances
/// with disposers created through the scope are disposed with it.
pub struct ServiceScope {
    provider: ServiceProvider,
    cache: InstanceCache,
}

impl ServiceScope {
    /// The provider this scope was opened from.
    #[must_use]
    pub fn provider(&self) -> &ServiceProvider {
        &self.provider
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("provider", &self.provider)
            .field("disposed", &self.cache.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Resolver for ServiceScope {
    fn resolve(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        self.provider.resolve_in(key, Some(&self.cache), self)
    }

    fn create_scope(&self) -> DiResult<Arc<dyn ScopedResolver>> {
        Ok(Arc::new(self.provider.scope()?))
    }
}

impl ScopedResolver for ServiceScope {
    fn dispose(&self) -> DiResult<()> {
        self.cache.dispose()
    }
}

impl ServiceContainer for ServiceScope {
    fn contains(&self, key: &ServiceKey) -> bool {
        self.provider.contains(key)
    }

    fn resolve_own(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>> {
        self.provider.resolve_in(key, Some(&self.cache), self)
    }

    fn construct_with(
        &self,
        key: &ServiceKey,
        outer: &dyn Resolver,
    ) -> DiResult<Option<ServiceInstance>> {
        self.provider.construct_in(key, Some(&self.cache), outer)
    }

    fn create_child(&self) -> DiResult<Arc<dyn ServiceContainer>> {
        Ok(Arc::new(self.provider.scope()?))
    }

    fn dispose(&self) -> DiResult<()> {
        self.cache.dispose()
    }
}
