//! Container error types.

use std::fmt;

use thiserror::Error;

/// A constructor parameter that could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedParameter {
    /// Zero-based position of the parameter in the constructor.
    pub position: usize,
    /// Type name of the parameter.
    pub type_name: &'static str,
}

impl fmt::Display for UnresolvedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.position, self.type_name)
    }
}

/// Render a parameter list as `#0 A, #2 B`.
#[must_use]
pub fn format_parameters(parameters: &[UnresolvedParameter]) -> String {
    parameters
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while resolving or constructing services.
#[derive(Debug, Error)]
pub enum DiError {
    /// No registration exists for the requested service.
    #[error("no registration for service {service}")]
    NotRegistered {
        /// Requested service type.
        service: &'static str,
    },

    /// Required constructor parameters could not be resolved.
    #[error(
        "cannot construct {service}: unresolved parameters [{}]",
        format_parameters(.parameters)
    )]
    Unresolvable {
        /// The type being constructed.
        service: &'static str,
        /// Every required parameter that resolved to nothing.
        parameters: Vec<UnresolvedParameter>,
    },

    /// A type offers several constructors and none is marked preferred.
    #[error("type {type_name} has {count} constructors and no single preferred one")]
    MultipleConstructors {
        /// The type with ambiguous constructors.
        type_name: &'static str,
        /// Number of candidate constructors.
        count: usize,
    },

    /// A type registration carries no constructor at all.
    #[error("type {type_name} has no constructor")]
    NoConstructor {
        /// The type without a constructor.
        type_name: &'static str,
    },

    /// A constructor closure returned an error.
    #[error("constructor of {type_name} failed")]
    Construction {
        /// The type being constructed.
        type_name: &'static str,
        /// Failure raised by the constructor.
        #[source]
        source: anyhow::Error,
    },

    /// A factory registration returned an error.
    #[error("factory for {service} failed")]
    Factory {
        /// The service produced by the factory.
        service: &'static str,
        /// Failure raised by the factory.
        #[source]
        source: anyhow::Error,
    },

    /// A resolved instance did not hold the requested type.
    #[error("service type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type requested by the caller.
        expected: &'static str,
        /// Type actually stored.
        found: &'static str,
    },

    /// A constructor read an argument with a type or position it did not declare.
    #[error("argument #{position} of {type_name} is not a {expected}")]
    ArgumentMismatch {
        /// The type being constructed.
        type_name: &'static str,
        /// Argument position.
        position: usize,
        /// Type the constructor asked for.
        expected: &'static str,
    },

    /// A service needs itself, directly or through other services.
    #[error("circular dependency: {}", .chain.join(" -> "))]
    CircularDependency {
        /// Services on the cycle, starting and ending with the repeated one.
        chain: Vec<&'static str>,
    },

    /// The provider or scope has already been disposed.
    #[error("service provider has been disposed")]
    Disposed,

    /// One or more disposers failed. Every disposer was attempted.
    #[error("{} disposal failure(s): {}", .failures.len(), .failures.join("; "))]
    Disposal {
        /// Failure messages, one per failing disposer.
        failures: Vec<String>,
    },
}

impl DiError {
    /// Whether this error means a constructor's parameters were unavailable
    /// in the container that tried to build it.
    #[must_use]
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, Self::Unresolvable { .. })
    }
}

/// Result type for container operations.
pub type DiResult<T> = Result<T, DiError>;
