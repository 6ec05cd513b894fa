//! Module error types.
//!
//! Each variant belongs to exactly one family: configuration, graph,
//! entry-type discovery, constructor shape, dependency injection, lifecycle
//! guard, boundary, entry hooks, or bulk aggregation.

use std::fmt;
use std::path::PathBuf;

use semver::Version;
use tessera_di::{DiError, UnresolvedParameter, format_parameters};
use thiserror::Error;

use crate::id::ModuleId;

/// Errors raised by an isolation boundary.
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// The artifact file does not exist.
    #[error("artifact not found at {path}")]
    ArtifactNotFound {
        /// Expected artifact location.
        path: PathBuf,
    },

    /// The file exists but no loader knows how to provide it.
    #[error("artifact {name} at {path} is not provided by the artifact loader")]
    ArtifactUnavailable {
        /// Artifact file name.
        name: String,
        /// Artifact location.
        path: PathBuf,
    },

    /// A loader failed for another reason.
    #[error("failed to load artifact at {path}")]
    ArtifactLoad {
        /// Artifact location.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// A library reference could not be satisfied by any search location.
    #[error("artifact {artifact} references {reference}, which no boundary provides")]
    UnresolvedReference {
        /// Artifact holding the reference.
        artifact: String,
        /// The missing library.
        reference: String,
    },

    /// Handles into the boundary are still alive at unload.
    #[error("boundary {boundary} still has outstanding references to: {}", .artifacts.join(", "))]
    StillReferenced {
        /// Boundary name.
        boundary: String,
        /// Artifacts with live handles outside the boundary.
        artifacts: Vec<String>,
    },

    /// The boundary was created non-collectible.
    #[error("boundary {boundary} is not collectible")]
    NotCollectible {
        /// Boundary name.
        boundary: String,
    },

    /// The dependency manifest next to the entry library is invalid.
    #[error("invalid dependency manifest at {path}: {message}")]
    Manifest {
        /// Manifest location.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },
}

/// Result type for boundary operations.
pub type BoundaryResult<T> = Result<T, BoundaryError>;

/// Entry-object stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Running the entry constructor.
    Construct,
    /// The `register_services` hook.
    RegisterServices,
    /// The `configure` hook.
    Configure,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Construct => "construct",
            Self::RegisterServices => "register_services",
            Self::Configure => "configure",
        })
    }
}

/// Bulk operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    /// `load_all`.
    Load,
    /// `unload_all`.
    Unload,
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Unload => "unload",
        })
    }
}

/// Why a module could not become loadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// No discovered module has the dependency's id.
    Missing {
        /// The declared dependency.
        dependency: ModuleId,
    },
    /// The dependency exists but its version is below the minimum.
    VersionTooLow {
        /// The declared dependency.
        dependency: ModuleId,
        /// Minimum version declared.
        required: Version,
        /// Version discovered.
        found: Version,
    },
    /// The module sits on a dependency cycle.
    Cycle,
    /// A dependency never reached `Loaded`.
    Blocked {
        /// The dependency that did not load.
        dependency: ModuleId,
    },
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { dependency } => write!(f, "dependency {dependency} not found"),
            Self::VersionTooLow {
                dependency,
                required,
                found,
            } => write!(
                f,
                "dependency {dependency} has version {found}, requires >= {required}"
            ),
            Self::Cycle => f.write_str("dependency cycle"),
            Self::Blocked { dependency } => write!(f, "dependency {dependency} not loaded"),
        }
    }
}

/// A module stuck outside `Loaded`, with the reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedModule {
    /// The stuck module.
    pub id: ModuleId,
    /// Every reason found.
    pub reasons: Vec<UnresolvedReason>,
}

impl fmt::Display for UnresolvedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reasons = self
            .reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{} ({reasons})", self.id)
    }
}

/// A descriptor failure for one directory during a scan.
#[derive(Debug)]
pub struct ConfigFailure {
    /// Directory that failed.
    pub directory: PathBuf,
    /// What went wrong.
    pub error: ModuleError,
}

impl fmt::Display for ConfigFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.directory.display(), self.error)
    }
}

/// A per-module failure inside a bulk operation.
#[derive(Debug)]
pub struct ModuleFailure {
    /// Module that failed.
    pub id: ModuleId,
    /// Its individual cause.
    pub error: ModuleError,
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.error)
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from module discovery and lifecycle operations.
#[derive(Debug, Error)]
pub enum ModuleError {
    // ---- configuration ----
    /// A module id string is not a valid, non-nil UUID.
    #[error("invalid module id '{0}'")]
    InvalidId(String),

    /// The descriptor could not be read.
    #[error("failed to read module descriptor at {path}")]
    ConfigRead {
        /// Descriptor path.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The descriptor is not valid JSON or misses required fields.
    #[error("failed to parse module descriptor at {path}: {message}")]
    ConfigParse {
        /// Descriptor path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A descriptor field holds an unacceptable value.
    #[error("invalid module descriptor at {path}: {field}: {message}")]
    ConfigInvalid {
        /// Descriptor path.
        path: PathBuf,
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// The descriptor exceeds the size limit.
    #[error("module descriptor at {path} is {size} bytes, exceeding the {limit} byte limit")]
    ConfigTooLarge {
        /// Descriptor path.
        path: PathBuf,
        /// Actual size.
        size: u64,
        /// Allowed size.
        limit: u64,
    },

    /// A module root could not be listed.
    #[error("failed to read module root {path}")]
    RootUnreadable {
        /// Root directory.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Two directories declare the same module id.
    #[error("module id {id} in {directory} is already provided by {existing}")]
    DuplicateId {
        /// The duplicated id.
        id: ModuleId,
        /// Directory that was skipped.
        directory: PathBuf,
        /// Where the id was first seen.
        existing: String,
    },

    /// A rescanned descriptor changed its id.
    #[error("module id in {directory} changed from {old} to {new}")]
    IdChanged {
        /// Module directory.
        directory: PathBuf,
        /// Id before the rescan.
        old: ModuleId,
        /// Id found by the rescan.
        new: ModuleId,
    },

    /// A module that has loaded changed its entry library.
    #[error("entry library of module {0} cannot change")]
    EntryLibraryChanged(ModuleId),

    /// A module that has loaded changed its unload policy.
    #[error("unload policy of module {0} cannot change")]
    UnloadPolicyChanged(ModuleId),

    /// A loaded module changed its dependency list.
    #[error("dependencies of loaded module {0} cannot change")]
    DependenciesChanged(ModuleId),

    /// A loaded module changed its version.
    #[error("version of loaded module {id} cannot change from {old} to {new}")]
    VersionChanged {
        /// The module.
        id: ModuleId,
        /// Loaded version.
        old: Version,
        /// Version found by the rescan.
        new: Version,
    },

    /// Every descriptor failure of a scan.
    #[error("{} module descriptor(s) failed: {}", .failures.len(), join_display(.failures))]
    Configuration {
        /// One entry per failed directory.
        failures: Vec<ConfigFailure>,
    },

    // ---- graph ----
    /// Modules that can never be admitted.
    #[error("could not resolve {} module(s): {}", .modules.len(), join_display(.modules))]
    Unresolved {
        /// Every stuck module with its reasons.
        modules: Vec<UnresolvedModule>,
    },

    // ---- entry-type discovery ----
    /// The entry library exports no entry type.
    #[error("module {id}: no entry type found in {library}")]
    NoEntryType {
        /// The module.
        id: ModuleId,
        /// Entry library.
        library: String,
    },

    /// The entry library exports more than one entry type.
    #[error("module {id}: multiple entry types found: {}", .candidates.join(", "))]
    MultipleEntryTypes {
        /// The module.
        id: ModuleId,
        /// Names of every candidate.
        candidates: Vec<String>,
    },

    /// The only entry type is generic.
    #[error("module {id}: entry type {type_name} is generic")]
    EntryTypeIsGeneric {
        /// The module.
        id: ModuleId,
        /// The generic type.
        type_name: String,
    },

    // ---- constructor shape ----
    /// A type offers more than one constructor.
    #[error("module {id}: type {type_name} has {count} constructors")]
    MultipleConstructors {
        /// The module.
        id: ModuleId,
        /// The ambiguous type.
        type_name: String,
        /// Number of constructors.
        count: usize,
    },

    /// A type offers no way to be constructed.
    #[error("module {id}: type {type_name} has no constructor")]
    NoConstructor {
        /// The module.
        id: ModuleId,
        /// The type.
        type_name: String,
    },

    // ---- dependency injection ----
    /// Required constructor parameters were not resolvable.
    #[error(
        "module {id}: cannot resolve parameters of {type_name}: {}",
        format_parameters(.parameters)
    )]
    UnresolvedParameters {
        /// The module.
        id: ModuleId,
        /// Type being constructed.
        type_name: String,
        /// Every failing parameter.
        parameters: Vec<UnresolvedParameter>,
    },

    /// Any other container failure during construction.
    #[error("module {id}: dependency injection failed")]
    Injection {
        /// The module.
        id: ModuleId,
        /// Container failure.
        #[source]
        source: DiError,
    },

    // ---- lifecycle guards ----
    /// Load requested for a loaded module.
    #[error("module {0} is already loaded")]
    AlreadyLoaded(ModuleId),

    /// Load requested while the module is loading.
    #[error("module {0} is already loading")]
    AlreadyLoading(ModuleId),

    /// Unload requested for a module that is not loaded.
    #[error("module {0} is not loaded")]
    NotLoaded(ModuleId),

    /// Unload requested while a load or unload is still running.
    #[error("module {0} has not finished changing its load state")]
    LoadingNotFinished(ModuleId),

    /// Unload requested while dependants are loaded.
    #[error("module {id} has loaded dependants: {}", join_display(.dependants))]
    DependantsNotUnloaded {
        /// The module.
        id: ModuleId,
        /// Loaded dependants.
        dependants: Vec<ModuleId>,
    },

    /// Load requested while dependencies are not loaded.
    #[error("module {id} has dependencies that are not loaded: {}", join_display(.dependencies))]
    DependenciesNotLoaded {
        /// The module.
        id: ModuleId,
        /// Dependencies not in `Loaded`.
        dependencies: Vec<ModuleId>,
    },

    /// Load requested for a module whose dependencies are unresolved.
    #[error("module {0} has unresolved dependencies")]
    DependenciesUnresolved(ModuleId),

    /// Unload requested for a module with `unload_disabled`.
    #[error("module {0} has unloading disabled")]
    UnloadDisabled(ModuleId),

    /// Disposal requested while loaded.
    #[error("module {0} is still loaded")]
    StillLoaded(ModuleId),

    /// No discovered module has this id.
    #[error("module {0} not found")]
    NotFound(ModuleId),

    // ---- boundary ----
    /// Creating or tearing down the isolation boundary failed.
    #[error("module {id}: isolation boundary failure")]
    Boundary {
        /// The module.
        id: ModuleId,
        /// Boundary failure.
        #[source]
        source: BoundaryError,
    },

    /// A load failed and the rollback could not reclaim the boundary.
    #[error("module {id}: load failed ({load}) and boundary teardown failed ({teardown})")]
    LoadRollbackFailed {
        /// The module.
        id: ModuleId,
        /// Original load failure.
        load: Box<ModuleError>,
        /// Teardown failure.
        teardown: BoundaryError,
    },

    // ---- entry hooks ----
    /// The entry object failed in one of its hooks.
    #[error("module {id}: {stage} failed")]
    EntryHook {
        /// The module.
        id: ModuleId,
        /// Stage that failed.
        stage: HookStage,
        /// Failure raised by the module.
        #[source]
        source: anyhow::Error,
    },

    /// The load was cancelled.
    #[error("module {0}: load cancelled")]
    Cancelled(ModuleId),

    // ---- bulk ----
    /// A bulk operation finished with per-module failures.
    #[error(
        "bulk {operation} finished with {} failure(s): {}; {} module(s) left behind",
        .failures.len(),
        join_display(.failures),
        .unresolved.len()
    )]
    Bulk {
        /// Which bulk operation.
        operation: BulkOperation,
        /// Per-module failures with causes.
        failures: Vec<ModuleFailure>,
        /// Modules that never reached the target state.
        unresolved: Vec<ModuleId>,
    },
}

impl ModuleError {
    /// The module an error is about, where there is exactly one.
    #[must_use]
    pub fn module_id(&self) -> Option<ModuleId> {
        match self {
            Self::DuplicateId { id, .. }
            | Self::VersionChanged { id, .. }
            | Self::NoEntryType { id, .. }
            | Self::MultipleEntryTypes { id, .. }
            | Self::EntryTypeIsGeneric { id, .. }
            | Self::MultipleConstructors { id, .. }
            | Self::NoConstructor { id, .. }
            | Self::UnresolvedParameters { id, .. }
            | Self::Injection { id, .. }
            | Self::DependantsNotUnloaded { id, .. }
            | Self::DependenciesNotLoaded { id, .. }
            | Self::Boundary { id, .. }
            | Self::LoadRollbackFailed { id, .. }
            | Self::EntryHook { id, .. } => Some(*id),
            Self::IdChanged { old, .. } => Some(*old),
            Self::EntryLibraryChanged(id)
            | Self::UnloadPolicyChanged(id)
            | Self::DependenciesChanged(id)
            | Self::AlreadyLoaded(id)
            | Self::AlreadyLoading(id)
            | Self::NotLoaded(id)
            | Self::LoadingNotFinished(id)
            | Self::DependenciesUnresolved(id)
            | Self::UnloadDisabled(id)
            | Self::StillLoaded(id)
            | Self::NotFound(id)
            | Self::Cancelled(id) => Some(*id),
            Self::InvalidId(_)
            | Self::ConfigRead { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigInvalid { .. }
            | Self::ConfigTooLarge { .. }
            | Self::RootUnreadable { .. }
            | Self::Configuration { .. }
            | Self::Unresolved { .. }
            | Self::Bulk { .. } => None,
        }
    }
}

/// Result type for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_messages_list_members() {
        let a = ModuleId::from_u128(1);
        let b = ModuleId::from_u128(2);
        let err = ModuleError::Unresolved {
            modules: vec![
                UnresolvedModule {
                    id: a,
                    reasons: vec![UnresolvedReason::Missing { dependency: b }],
                },
                UnresolvedModule {
                    id: b,
                    reasons: vec![UnresolvedReason::Cycle],
                },
            ],
        };
        let message = err.to_string();
        assert!(message.starts_with("could not resolve 2 module(s)"));
        assert!(message.contains(&format!("dependency {b} not found")));
        assert!(message.contains("dependency cycle"));
    }

    #[test]
    fn multiple_entry_types_names_candidates() {
        let err = ModuleError::MultipleEntryTypes {
            id: ModuleId::from_u128(7),
            candidates: vec!["first::Main".into(), "second::Main".into()],
        };
        let message = err.to_string();
        assert!(message.contains("first::Main"));
        assert!(message.contains("second::Main"));
        assert_eq!(err.module_id(), Some(ModuleId::from_u128(7)));
    }
}
