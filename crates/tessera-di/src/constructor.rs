//! Explicit constructor descriptions.
//!
//! A [`Constructor`] lists its parameters by [`ServiceKey`] and carries a
//! closure that builds the value from resolved [`Arguments`]. Containers use
//! the description to resolve parameters without runtime type inspection.

use std::fmt;
use std::sync::Arc;

use crate::error::{DiError, DiResult, UnresolvedParameter};
use crate::key::{ServiceInstance, ServiceKey};

/// One constructor parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    key: ServiceKey,
    optional: bool,
}

impl Parameter {
    /// A parameter that must resolve.
    #[must_use]
    pub fn required<T: ?Sized + 'static>() -> Self {
        Self {
            key: ServiceKey::of::<T>(),
            optional: false,
        }
    }

    /// A parameter that may resolve to nothing.
    #[must_use]
    pub fn optional<T: ?Sized + 'static>() -> Self {
        Self {
            key: ServiceKey::of::<T>(),
            optional: true,
        }
    }

    /// Service key of the parameter.
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        self.key
    }

    /// Whether an absent value is acceptable.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Resolved values handed to a constructor, in parameter order.
pub struct Arguments {
    type_name: &'static str,
    values: Vec<Option<ServiceInstance>>,
}

impl Arguments {
    /// Build an argument list directly.
    #[must_use]
    pub fn new(type_name: &'static str, values: Vec<Option<ServiceInstance>>) -> Self {
        Self { type_name, values }
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fetch a required argument.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::ArgumentMismatch`] if the position is out of range,
    /// holds nothing, or holds another type.
    pub fn required<T: ?Sized + Send + Sync + 'static>(&self, position: usize) -> DiResult<Arc<T>> {
        self.optional::<T>(position)?.ok_or_else(|| self.mismatch::<T>(position))
    }

    /// Fetch an optional argument.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::ArgumentMismatch`] if the position is out of range or
    /// holds another type.
    pub fn optional<T: ?Sized + Send + Sync + 'static>(
        &self,
        position: usize,
    ) -> DiResult<Option<Arc<T>>> {
        match self.values.get(position) {
            None => Err(self.mismatch::<T>(position)),
            Some(None) => Ok(None),
            Some(Some(instance)) => instance
                .downcast::<T>()
                .map(Some)
                .ok_or_else(|| self.mismatch::<T>(position)),
        }
    }

    fn mismatch<T: ?Sized>(&self, position: usize) -> DiError {
        DiError::ArgumentMismatch {
            type_name: self.type_name,
            position,
            expected: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("type_name", &self.type_name)
            .field("values", &self.values)
            .finish()
    }
}

type Invoke<T> = Arc<dyn Fn(&Arguments) -> anyhow::Result<T> + Send + Sync>;

/// Describes how to build a `T` from resolved parameters.
pub struct Constructor<T> {
    type_name: &'static str,
    parameters: Vec<Parameter>,
    preferred: bool,
    invoke: Invoke<T>,
}

impl<T> Clone for Constructor<T> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name,
            parameters: self.parameters.clone(),
            preferred: self.preferred,
            invoke: Arc::clone(&self.invoke),
        }
    }
}

impl<T> fmt::Debug for Constructor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constructor")
            .field("type_name", &self.type_name)
            .field("parameters", &self.parameters)
            .field("preferred", &self.preferred)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Constructor<T> {
    /// Create a constructor with no parameters yet.
    ///
    /// Add parameters with [`param`](Self::param) and
    /// [`optional_param`](Self::optional_param) in the order the closure
    /// reads them.
    pub fn new<F>(type_name: &'static str, invoke: F) -> Self
    where
        F: Fn(&Arguments) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            type_name,
            parameters: Vec::new(),
            preferred: false,
            invoke: Arc::new(invoke),
        }
    }

    /// Append a required parameter of type `P`.
    #[must_use]
    pub fn param<P: ?Sized + 'static>(mut self) -> Self {
        self.parameters.push(Parameter::required::<P>());
        self
    }

    /// Append an optional parameter of type `P`.
    #[must_use]
    pub fn optional_param<P: ?Sized + 'static>(mut self) -> Self {
        self.parameters.push(Parameter::optional::<P>());
        self
    }

    /// Mark this constructor as the one to use when a type has several.
    #[must_use]
    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    /// Name of the constructed type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Declared parameters, in order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Whether this constructor is marked preferred.
    #[must_use]
    pub fn is_preferred(&self) -> bool {
        self.preferred
    }

    /// Run the constructor.
    ///
    /// # Errors
    ///
    /// Returns [`DiError::Construction`] if the closure fails.
    pub fn invoke(&self, arguments: &Arguments) -> DiResult<T> {
        (self.invoke)(arguments).map_err(|source| DiError::Construction {
            type_name: self.type_name,
            source,
        })
    }

    /// Transform the produced value, keeping the parameter description.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Constructor<U>
    where
        F: Fn(T) -> U + Send + Sync + 'static,
        U: 'static,
    {
        let invoke = self.invoke;
        Constructor {
            type_name: self.type_name,
            parameters: self.parameters,
            preferred: self.preferred,
            invoke: Arc::new(move |args: &Arguments| invoke(args).map(&f)),
        }
    }
}

/// Pick the constructor to use for a type.
///
/// A single constructor is always used. With several, exactly one must be
/// marked preferred.
///
/// # Errors
///
/// Returns [`DiError::NoConstructor`] for an empty list and
/// [`DiError::MultipleConstructors`] when the choice is ambiguous.
pub fn select_constructor<'a, T>(
    type_name: &'static str,
    constructors: &'a [Constructor<T>],
) -> DiResult<&'a Constructor<T>> {
    match constructors {
        [] => Err(DiError::NoConstructor { type_name }),
        [only] => Ok(only),
        many => {
            let mut preferred = many.iter().filter(|c| c.preferred);
            match (preferred.next(), preferred.next()) {
                (Some(chosen), None) => Ok(chosen),
                _ => Err(DiError::MultipleConstructors {
                    type_name,
                    count: many.len(),
                }),
            }
        },
    }
}

/// Resolve every parameter of `constructor` with `resolve`.
///
/// Absent required parameters are collected, so the error lists all of them
/// rather than the first. Any other resolution error is returned as is.
///
/// # Errors
///
/// Returns [`DiError::Unresolvable`] naming every missing required parameter,
/// or the first hard error raised by `resolve`.
pub fn resolve_arguments<T, F>(constructor: &Constructor<T>, mut resolve: F) -> DiResult<Arguments>
where
    F: FnMut(usize, &Parameter) -> DiResult<Option<ServiceInstance>>,
{
    let mut values = Vec::with_capacity(constructor.parameters.len());
    let mut missing = Vec::new();

    for (position, parameter) in constructor.parameters.iter().enumerate() {
        let value = resolve(position, parameter)?;
        if value.is_none() && !parameter.optional {
            missing.push(UnresolvedParameter {
                position,
                type_name: parameter.key.type_name(),
            });
        }
        values.push(value);
    }

    if !missing.is_empty() {
        return Err(DiError::Unresolvable {
            service: constructor.type_name,
            parameters: missing,
        });
    }

    Ok(Arguments::new(constructor.type_name, values))
}
