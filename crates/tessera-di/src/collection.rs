//! Service registrations.

use std::fmt;
use std::sync::Arc;

use crate::constructor::Constructor;
use crate::key::{ServiceInstance, ServiceKey};
use crate::provider::ServiceProvider;
use crate::resolver::Resolver;

/// How long a resolved instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// One instance per provider.
    Singleton,
    /// One instance per scope. Resolved from a root provider it behaves like
    /// a singleton.
    Scoped,
    /// A new instance for every resolution.
    Transient,
}

/// Factory producing a service from the resolver that requested it.
pub type FactoryFn = Arc<dyn Fn(&dyn Resolver) -> anyhow::Result<ServiceInstance> + Send + Sync>;

/// Hook run on an instance when its owning provider or scope is disposed.
pub type Disposer = Arc<dyn Fn(&ServiceInstance) -> anyhow::Result<()> + Send + Sync>;

/// What a registration produces.
#[derive(Clone)]
pub enum Implementation {
    /// A pre-built instance.
    Instance(ServiceInstance),
    /// A factory closure.
    Factory(FactoryFn),
    /// A type described by its constructors.
    Type {
        /// Name of the implementing type.
        type_name: &'static str,
        /// Candidate constructors.
        constructors: Vec<Constructor<ServiceInstance>>,
    },
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(instance) => f.debug_tuple("Instance").field(instance).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
            Self::Type {
                type_name,
                constructors,
            } => f
                .debug_struct("Type")
                .field("type_name", type_name)
                .field("constructors", &constructors.len())
                .finish(),
        }
    }
}

/// A single registration.
#[derive(Clone)]
pub struct ServiceDescriptor {
    key: ServiceKey,
    lifetime: Lifetime,
    implementation: Implementation,
    disposer: Option<Disposer>,
}

impl ServiceDescriptor {
    /// Create a registration.
    #[must_use]
    pub fn new(key: ServiceKey, lifetime: Lifetime, implementation: Implementation) -> Self {
        Self {
            key,
            lifetime,
            implementation,
            disposer: None,
        }
    }

    /// Service key.
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        self.key
    }

    /// Instance lifetime.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// What the registration produces.
    #[must_use]
    pub fn implementation(&self) -> &Implementation {
        &self.implementation
    }

    /// Disposal hook, if any.
    #[must_use]
    pub fn disposer(&self) -> Option<&Disposer> {
        self.disposer.as_ref()
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("implementation", &self.implementation)
            .field("disposer", &self.disposer.is_some())
            .finish()
    }
}

/// An ordered, mutable list of registrations.
///
/// When a service is registered more than once, the last registration wins.
#[derive(Debug, Clone, Default)]
pub struct ServiceCollection {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Iterate registrations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.iter()
    }

    /// Add a raw registration.
    pub fn add(&mut self, descriptor: ServiceDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Register a pre-built singleton instance.
    pub fn add_instance<T: ?Sized + Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.add(ServiceDescriptor::new(
            ServiceKey::of::<T>(),
            Lifetime::Singleton,
            Implementation::Instance(ServiceInstance::new(value)),
        ))
    }

    /// Register a singleton factory.
    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.add_factory(Lifetime::Singleton, factory)
    }

    /// Register a scoped factory.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.add_factory(Lifetime::Scoped, factory)
    }

    /// Register a transient factory.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.add_factory(Lifetime::Transient, factory)
    }

    /// Register a factory with an explicit lifetime.
    pub fn add_factory<T, F>(&mut self, lifetime: Lifetime, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let factory: FactoryFn = Arc::new(move |resolver: &dyn Resolver| {
            factory(resolver).map(ServiceInstance::new)
        });
        self.add(ServiceDescriptor::new(
            ServiceKey::of::<T>(),
            lifetime,
            Implementation::Factory(factory),
        ))
    }

    /// Register an implementing type with a single constructor.
    pub fn add_type<T>(&mut self, lifetime: Lifetime, constructor: Constructor<Arc<T>>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let type_name = constructor.type_name();
        self.add_type_with(lifetime, type_name, vec![constructor])
    }

    /// Register an implementing type with several candidate constructors.
    ///
    /// At resolution time one of them must be marked preferred.
    pub fn add_type_with<T>(
        &mut self,
        lifetime: Lifetime,
        type_name: &'static str,
        constructors: Vec<Constructor<Arc<T>>>,
    ) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let constructors = constructors
            .into_iter()
            .map(|c| c.map(ServiceInstance::new))
            .collect();
        self.add(ServiceDescriptor::new(
            ServiceKey::of::<T>(),
            lifetime,
            Implementation::Type {
                type_name,
                constructors,
            },
        ))
    }

    /// Attach a disposal hook to the most recent registration of `T`.
    ///
    /// Does nothing if `T` is not registered.
    pub fn dispose_with<T, F>(&mut self, disposer: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        if let Some(descriptor) = self.descriptors.iter_mut().rev().find(|d| d.key == key) {
            descriptor.disposer = Some(Arc::new(move |instance: &ServiceInstance| {
                let value = instance.expect_type::<T>()?;
                disposer(value)
            }));
        } else {
            tracing::debug!(service = %key, "dispose hook ignored, service not registered");
        }
        self
    }

    /// The effective (last) registration for `key`.
    #[must_use]
    pub fn find(&self, key: &ServiceKey) -> Option<&ServiceDescriptor> {
        self.descriptors.iter().rev().find(|d| d.key == *key)
    }

    /// Whether `T` is registered.
    #[must_use]
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.find(&ServiceKey::of::<T>()).is_some()
    }

    /// Freeze the registrations into a provider.
    #[must_use]
    pub fn build(self) -> ServiceProvider {
        ServiceProvider::new(self)
    }
}

impl Extend<ServiceDescriptor> for ServiceCollection {
    fn extend<I: IntoIterator<Item = ServiceDescriptor>>(&mut self, iter: I) {
        self.descriptors.extend(iter);
    }
}

impl IntoIterator for ServiceCollection {
    type Item = ServiceDescriptor;
    type IntoIter = std::vec::IntoIter<ServiceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_registration_wins() {
        let mut services = ServiceCollection::new();
        services
            .add_instance(Arc::new(1_u32))
            .add_instance(Arc::new(2_u32));

        assert_eq!(services.len(), 2);
        let found = services.find(&ServiceKey::of::<u32>()).unwrap();
        match found.implementation() {
            Implementation::Instance(instance) => {
                assert_eq!(*instance.downcast::<u32>().unwrap(), 2);
            },
            other => panic!("unexpected implementation: {other:?}"),
        }
    }

    #[test]
    fn dispose_hook_attaches_to_latest() {
        let mut services = ServiceCollection::new();
        services
            .add_singleton::<String, _>(|_| Ok(Arc::new("a".to_string())))
            .dispose_with::<String, _>(|_| Ok(()))
            .dispose_with::<u8, _>(|_| Ok(()));

        assert!(services.find(&ServiceKey::of::<String>()).unwrap().disposer().is_some());
        assert!(!services.contains::<u8>());
    }

    #[test]
    fn type_registration_keeps_constructors() {
        let mut services = ServiceCollection::new();
        services.add_type::<String>(
            Lifetime::Transient,
            Constructor::new("Text", |_| Ok(Arc::new(String::new()))).param::<u32>(),
        );

        let descriptor = services.find(&ServiceKey::of::<String>()).unwrap();
        assert_eq!(descriptor.lifetime(), Lifetime::Transient);
        match descriptor.implementation() {
            Implementation::Type {
                type_name,
                constructors,
            } => {
                assert_eq!(*type_name, "Text");
                assert_eq!(constructors[0].parameters().len(), 1);
            },
            other => panic!("unexpected implementation: {other:?}"),
        }
    }
}
