//! Service keys and type-erased instances.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{DiError, DiResult};

/// Identifies a service by type.
///
/// Keys work for unsized types, so `dyn Trait` services are keyed the same
/// way as concrete ones. Equality and hashing use the [`TypeId`] only.
#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// Key for the service type `T`.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying type id.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Human-readable type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.name
    }

    /// Whether this key identifies `T`.
    #[must_use]
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceKey").field(&self.name).finish()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A type-erased, cheaply cloneable service instance.
///
/// Holds an `Arc<T>` behind `dyn Any`, so `T` may itself be a trait object.
#[derive(Clone)]
pub struct ServiceInstance {
    key: ServiceKey,
    value: Arc<dyn Any + Send + Sync>,
}

impl ServiceInstance {
    /// Wrap a shared value.
    #[must_use]
    pub fn new<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            key: ServiceKey::of::<T>(),
            value: Arc::new(value),
        }
    }

    /// Key of the stored type.
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        self.key
    }

    /// Get the stored value as `Arc<T>` if it holds a `T`.
    #[must_use]
    pub fn downcast<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.downcast_ref::<Arc<T>>().cloned()
    }

    /// Like [`downcast`](Self::downcast) but reports a mismatch as an error.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::TypeMismatch`] if the instance does not hold a `T`.
    pub fn expect_type<T: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.downcast::<T>().ok_or(DiError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: self.key.type_name(),
        })
    }

    /// Whether two instances share the same allocation.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("type", &self.key.type_name())
            .finish_non_exhaustive()
    }
}
