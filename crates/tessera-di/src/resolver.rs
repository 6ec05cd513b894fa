//! Lookup traits.
//!
//! [`Resolver`] is the object-safe surface handed to user code.
//! [`ServiceContainer`] is the lower-level link abstraction that composite
//! resolvers chain together: it separates a container's own resolution from
//! construction with parameters supplied by an outer resolver.

use std::sync::Arc;

use crate::constructor::{Constructor, resolve_arguments};
use crate::error::{DiError, DiResult};
use crate::key::{ServiceInstance, ServiceKey};

/// Resolve services by key.
pub trait Resolver: Send + Sync {
    /// Resolve `key`, returning `None` when nothing is registered for it.
    ///
    /// # Errors
    ///
    /// Returns an error if a registration exists but cannot be built.
    fn resolve(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>>;

    /// Open a child scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver has been disposed.
    fn create_scope(&self) -> DiResult<Arc<dyn ScopedResolver>>;
}

/// A resolver owning scoped instances until disposed.
pub trait ScopedResolver: Resolver {
    /// Dispose every instance owned by the scope.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Disposal`] listing failed disposers. All disposers
    /// run regardless of earlier failures.
    fn dispose(&self) -> DiResult<()>;
}

/// Typed helpers over any [`Resolver`].
pub trait ResolverExt {
    /// Resolve `T` if registered.
    ///
    /// # Errors
    ///
    /// Propagates construction failures.
    fn get<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Option<Arc<T>>>;

    /// Resolve `T`, failing if it is not registered.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::NotRegistered`] when nothing provides `T`.
    fn require<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Arc<T>>;
}

impl<R: Resolver + ?Sized> ResolverExt for R {
    fn get<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Option<Arc<T>>> {
        self.resolve(&ServiceKey::of::<T>())?
            .map(|instance| instance.expect_type::<T>())
            .transpose()
    }

    fn require<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.get::<T>()?.ok_or(DiError::NotRegistered {
            service: std::any::type_name::<T>(),
        })
    }
}

/// A link in a composite resolver chain.
pub trait ServiceContainer: Send + Sync {
    /// Whether this container has a registration for `key`.
    fn contains(&self, key: &ServiceKey) -> bool;

    /// Resolve `key` using only this container's own registrations.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Unresolvable`] when a constructor parameter is not
    /// registered here, or any other construction failure.
    fn resolve_own(&self, key: &ServiceKey) -> DiResult<Option<ServiceInstance>>;

    /// Build `key` from this container's registration, resolving
    /// constructor parameters through `outer`.
    ///
    /// Lifetime caching follows the registration. Only type registrations
    /// are rebuilt; instances and factories resolve as in
    /// [`resolve_own`](Self::resolve_own).
    ///
    /// # Errors
    ///
    /// Returns constructor-shape, resolution or construction failures.
    fn construct_with(
        &self,
        key: &ServiceKey,
        outer: &dyn Resolver,
    ) -> DiResult<Option<ServiceInstance>>;

    /// Create a child scope of this container.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Disposed`] once disposed.
    fn create_child(&self) -> DiResult<Arc<dyn ServiceContainer>>;

    /// Dispose instances owned by this container.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Disposal`] if any disposer failed.
    fn dispose(&self) -> DiResult<()>;
}

/// Construct an unregistered type through `resolver`.
///
/// `extras` supply values ahead of the resolver: a parameter whose key
/// matches an unused extra takes that extra, in order.
///
/// # Errors
///
/// Returns [`DiError::Unresolvable`] listing every missing required
/// parameter, or the constructor's own failure.
pub fn create_type<T: 'static>(
    resolver: &dyn Resolver,
    constructor: &Constructor<T>,
    extras: &[ServiceInstance],
) -> DiResult<T> {
    let mut used = vec![false; extras.len()];
    let arguments = resolve_arguments(constructor, |_, parameter| {
        let extra = extras
            .iter()
            .enumerate()
            .find(|(index, extra)| !used[*index] && extra.key() == parameter.key());
        if let Some((index, extra)) = extra {
            used[index] = true;
            return Ok(Some(extra.clone()));
        }
        resolver.resolve(&parameter.key())
    })?;
    constructor.invoke(&arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::ServiceCollection;

    struct Report {
        title: Arc<String>,
        pages: Arc<u32>,
    }

    #[test]
    fn create_type_prefers_extras() {
        let mut services = ServiceCollection::new();
        services
            .add_instance(Arc::new("from container".to_string()))
            .add_instance(Arc::new(10_u32));
        let provider = services.build();

        let ctor = Constructor::new("Report", |args| {
            Ok(Report {
                title: args.required::<String>(0)?,
                pages: args.required::<u32>(1)?,
            })
        })
        .param::<String>()
        .param::<u32>();

        let report = create_type(
            &provider,
            &ctor,
            &[ServiceInstance::new(Arc::new("extra".to_string()))],
        )
        .unwrap();
        assert_eq!(report.title.as_str(), "extra");
        assert_eq!(*report.pages, 10);
    }

    #[test]
    fn require_reports_missing_service() {
        let provider = ServiceCollection::new().build();
        let err = provider.require::<String>().unwrap_err();
        assert!(matches!(err, DiError::NotRegistered { .. }));
        assert!(provider.get::<String>().unwrap().is_none());
    }
}
