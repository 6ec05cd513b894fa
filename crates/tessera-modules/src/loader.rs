//! Module discovery and lifecycle orchestration.
//!
//! The loader owns the dependency graph behind a single async mutex, the
//! admission guard. Scans, graph rebuilds and every load or unload take
//! it, so admission decisions never race. Status queries read a snapshot
//! of the discovered contexts instead and never wait on the guard.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tessera_di::{ServiceCollection, ServiceContainer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactLoader, LinkedArtifactLoader};
use crate::boundary::HostBoundary;
use crate::context::{LoadEnvironment, ModuleContext, ModuleState};
use crate::descriptor::ModuleDescriptor;
use crate::entry::EntryType;
use crate::error::{
    BulkOperation, ConfigFailure, ModuleError, ModuleFailure, ModuleResult, UnresolvedModule,
    UnresolvedReason,
};
use crate::events::{
    DEFAULT_CHANNEL_CAPACITY, LifecycleObserver, ModuleEvent, ModuleEventBus, ModuleEventKind,
    ModuleEventReceiver,
};
use crate::graph::ModuleGraph;
use crate::hierarchy::HierarchicalResolver;
use crate::id::ModuleId;

/// Outcome of a [`ModuleLoader::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Modules seen for the first time.
    pub discovered: Vec<ModuleId>,
    /// Known modules whose descriptor changed.
    pub updated: Vec<ModuleId>,
    /// Modules whose directory no longer holds a descriptor.
    pub removed: Vec<ModuleId>,
    /// Modules whose dependencies could not be satisfied.
    pub unresolved: Vec<UnresolvedModule>,
}

/// Outcome of a successful bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// Modules loaded or unloaded, in order.
    pub processed: Vec<ModuleId>,
    /// Modules left loaded because unloading is disabled for them or for
    /// a module that depends on them.
    pub pinned: Vec<ModuleId>,
}

/// Builder for [`ModuleLoader`].
pub struct ModuleLoaderBuilder {
    roots: Vec<PathBuf>,
    artifacts: Option<Arc<dyn ArtifactLoader>>,
    host_boundary: Option<Arc<HostBoundary>>,
    host_services: Option<Arc<dyn ServiceContainer>>,
    event_capacity: usize,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl Default for ModuleLoaderBuilder {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            artifacts: None,
            host_boundary: None,
            host_services: None,
            event_capacity: DEFAULT_CHANNEL_CAPACITY,
            observers: Vec::new(),
        }
    }
}

impl ModuleLoaderBuilder {
    /// Add a root directory to scan.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Set how library files become artifacts.
    #[must_use]
    pub fn with_artifact_loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self {
        self.artifacts = Some(loader);
        self
    }

    /// Set the artifacts shared from the host.
    #[must_use]
    pub fn with_host_boundary(mut self, host: Arc<HostBoundary>) -> Self {
        self.host_boundary = Some(host);
        self
    }

    /// Set the host's root service container.
    #[must_use]
    pub fn with_host_services(mut self, services: Arc<dyn ServiceContainer>) -> Self {
        self.host_services = Some(services);
        self
    }

    /// Set the broadcast capacity of the event bus.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Register a lifecycle observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the loader. Nothing is scanned yet.
    #[must_use]
    pub fn build(self) -> Arc<ModuleLoader> {
        let events = ModuleEventBus::with_capacity(self.event_capacity);
        for observer in self.observers {
            events.add_observer(observer);
        }
        Arc::new(ModuleLoader {
            graph: tokio::sync::Mutex::new(ModuleGraph::new()),
            snapshot: RwLock::new(Arc::from(Vec::new())),
            roots: RwLock::new(self.roots),
            artifacts: self
                .artifacts
                .unwrap_or_else(|| Arc::new(LinkedArtifactLoader::new())),
            host_boundary: self
                .host_boundary
                .unwrap_or_else(|| Arc::new(HostBoundary::new())),
            host_services: self
                .host_services
                .unwrap_or_else(|| Arc::new(ServiceCollection::new().build())),
            events,
        })
    }
}

impl fmt::Debug for ModuleLoaderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoaderBuilder")
            .field("roots", &self.roots)
            .field("event_capacity", &self.event_capacity)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

/// Discovers modules under root directories and drives their lifecycle.
pub struct ModuleLoader {
    graph: tokio::sync::Mutex<ModuleGraph>,
    snapshot: RwLock<Arc<[Arc<ModuleContext>]>>,
    roots: RwLock<Vec<PathBuf>>,
    artifacts: Arc<dyn ArtifactLoader>,
    host_boundary: Arc<HostBoundary>,
    host_services: Arc<dyn ServiceContainer>,
    events: ModuleEventBus,
}

impl ModuleLoader {
    /// Start building a loader.
    #[must_use]
    pub fn builder() -> ModuleLoaderBuilder {
        ModuleLoaderBuilder::default()
    }

    /// Add a root directory for later scans.
    pub fn add_root(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        let mut roots = self.roots.write().unwrap_or_else(PoisonError::into_inner);
        if !roots.contains(&root) {
            debug!(root = %root.display(), "Module root added");
            roots.push(root);
        }
    }

    /// Configured root directories.
    #[must_use]
    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The lifecycle event bus.
    #[must_use]
    pub fn events(&self) -> &ModuleEventBus {
        &self.events
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> ModuleEventReceiver {
        self.events.subscribe()
    }

    // ---- discovery ----

    /// Scan every root for module directories and rebuild the graph.
    ///
    /// Each immediate subdirectory holding a `module.json` is a module.
    /// New directories become contexts, known ones have their descriptor
    /// updated, and unloaded modules whose descriptor disappeared are
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Configuration`] listing every directory that
    /// failed. Directories that succeeded are applied regardless.
    pub async fn scan(&self) -> ModuleResult<ScanReport> {
        let mut graph = self.graph.lock().await;
        let mut report = ScanReport::default();
        let mut failures = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut unreadable: Vec<PathBuf> = Vec::new();
        let mut fresh = Vec::new();

        for root in self.roots() {
            let directories = match list_directories(&root).await {
                Ok(directories) => directories,
                Err(source) => {
                    warn!(root = %root.display(), error = %source, "Failed to read module root");
                    failures.push(ConfigFailure {
                        directory: root.clone(),
                        error: ModuleError::RootUnreadable {
                            path: root.clone(),
                            source,
                        },
                    });
                    unreadable.push(root);
                    continue;
                },
            };
            info!(root = %root.display(), candidates = directories.len(), "Scanning module root");

            for directory in directories {
                if let Err(error) =
                    scan_directory(&mut graph, &directory, &mut seen, &mut report, &mut fresh)
                        .await
                {
                    warn!(
                        directory = %directory.display(),
                        error = %error,
                        "Module directory rejected"
                    );
                    failures.push(ConfigFailure { directory, error });
                }
            }
        }

        // Reverse so removal keeps the remaining indices valid.
        for index in (0..graph.len()).rev() {
            let Some(context) = graph.context(index) else {
                continue;
            };
            let Some(directory) = context.directory() else {
                continue;
            };
            if seen.contains(directory) || unreadable.iter().any(|r| directory.starts_with(r)) {
                continue;
            }
            if context.state().is_resident() {
                warn!(
                    module_id = %context.id(),
                    directory = %directory.display(),
                    "Descriptor of a loaded module disappeared; keeping it until unloaded"
                );
                continue;
            }
            if let Some(context) = graph.remove(index) {
                if let Err(e) = context.dispose() {
                    warn!(
                        module_id = %context.id(),
                        error = %e,
                        "Failed to dispose removed module"
                    );
                }
                info!(module_id = %context.id(), "Module removed");
                report.removed.push(context.id());
            }
        }

        graph.rebuild();
        report.unresolved = graph.unresolved();
        self.refresh_snapshot(&graph);
        drop(graph);

        for module in &report.unresolved {
            warn!(module_id = %module.id, reasons = %module, "Module has unresolved dependencies");
        }
        info!(
            discovered = report.discovered.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            unresolved = report.unresolved.len(),
            failed = failures.len(),
            "Module scan complete"
        );
        for context in fresh {
            self.events
                .publish(ModuleEvent::new(ModuleEventKind::Discovered, context))
                .await;
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ModuleError::Configuration { failures })
        }
    }

    /// Add a module whose entry type is linked into the host.
    ///
    /// The module joins the graph like a discovered one and is loaded by
    /// the next [`load_all`](Self::load_all).
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigInvalid`] for an invalid descriptor
    /// and [`ModuleError::DuplicateId`] if the id is taken.
    pub async fn register_managed(
        &self,
        descriptor: ModuleDescriptor,
        entry: EntryType,
    ) -> ModuleResult<Arc<ModuleContext>> {
        let id = descriptor.id;
        let origin = PathBuf::from(format!("managed:{id}"));
        descriptor.validate(&origin)?;

        let mut graph = self.graph.lock().await;
        if let Some(existing) = graph.position_of(id).and_then(|i| graph.context(i)) {
            return Err(ModuleError::DuplicateId {
                id,
                directory: origin,
                existing: describe_origin(existing),
            });
        }
        let context = ModuleContext::managed(descriptor, entry);
        graph.insert(Arc::clone(&context));
        graph.rebuild();
        self.refresh_snapshot(&graph);
        drop(graph);

        info!(module_id = %id, "Managed module registered");
        self.events
            .publish(ModuleEvent::new(ModuleEventKind::Discovered, Arc::clone(&context)))
            .await;
        Ok(context)
    }

    // ---- bulk lifecycle ----

    /// Load every loadable module in dependency order.
    ///
    /// Repeats passes in discovery order until a pass loads nothing new.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Bulk`] if any load failed, or
    /// [`ModuleError::Unresolved`] if modules remain that can never load.
    pub async fn load_all(&self, cancel: &CancellationToken) -> ModuleResult<BulkReport> {
        let graph = self.graph.lock().await;
        let mut report = BulkReport::default();
        let mut failures = Vec::new();
        let mut failed: HashSet<usize> = HashSet::new();

        loop {
            let before = report.processed.len();
            for index in 0..graph.len() {
                let Some(context) = graph.context(index) else {
                    continue;
                };
                if failed.contains(&index) || context.state() != ModuleState::Loadable {
                    continue;
                }
                let ready = graph
                    .dependencies(index)
                    .iter()
                    .filter_map(|&d| graph.context(d))
                    .all(|d| d.state() == ModuleState::Loaded);
                if !ready {
                    continue;
                }

                let id = context.id();
                match self.load_in(&graph, id, cancel).await {
                    Ok(()) => report.processed.push(id),
                    Err(error) => {
                        failed.insert(index);
                        failures.push(ModuleFailure { id, error });
                    },
                }
            }
            if report.processed.len() == before {
                break;
            }
        }

        let stuck: Vec<UnresolvedModule> = (0..graph.len())
            .filter(|index| !failed.contains(index))
            .filter_map(|index| stuck_module(&graph, index))
            .collect();
        drop(graph);

        info!(
            loaded = report.processed.len(),
            failed = failures.len(),
            stuck = stuck.len(),
            "Bulk load finished"
        );
        if !failures.is_empty() {
            return Err(ModuleError::Bulk {
                operation: BulkOperation::Load,
                failures,
                unresolved: stuck.into_iter().map(|m| m.id).collect(),
            });
        }
        if !stuck.is_empty() {
            return Err(ModuleError::Unresolved { modules: stuck });
        }
        Ok(report)
    }

    /// Unload every loaded module, dependants first.
    ///
    /// Modules with unloading disabled stay loaded, as do their transitive
    /// dependencies. They are reported as pinned.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Bulk`] if any unload failed.
    pub async fn unload_all(&self) -> ModuleResult<BulkReport> {
        let graph = self.graph.lock().await;
        let pinned = pinned_modules(&graph);
        let mut pinned_order: Vec<usize> = pinned.iter().copied().collect();
        pinned_order.sort_unstable();
        let mut report = BulkReport {
            processed: Vec::new(),
            pinned: pinned_order
                .into_iter()
                .filter_map(|i| graph.context(i).map(|c| c.id()))
                .collect(),
        };
        let mut failures = Vec::new();
        let mut failed: HashSet<usize> = HashSet::new();

        loop {
            let before = report.processed.len();
            for index in (0..graph.len()).rev() {
                let Some(context) = graph.context(index) else {
                    continue;
                };
                if pinned.contains(&index)
                    || failed.contains(&index)
                    || context.state() != ModuleState::Loaded
                {
                    continue;
                }
                let blocked = graph
                    .dependants(index)
                    .iter()
                    .filter_map(|&d| graph.context(d))
                    .any(|d| d.state() == ModuleState::Loaded);
                if blocked {
                    continue;
                }

                let id = context.id();
                match context.unload(&self.events).await {
                    Ok(()) => report.processed.push(id),
                    Err(error) => {
                        failed.insert(index);
                        failures.push(ModuleFailure { id, error });
                    },
                }
            }
            if report.processed.len() == before {
                break;
            }
        }

        let left: Vec<ModuleId> = graph
            .contexts()
            .enumerate()
            .filter(|(i, c)| !pinned.contains(i) && c.state() == ModuleState::Loaded)
            .map(|(_, c)| c.id())
            .collect();
        drop(graph);

        if !report.pinned.is_empty() {
            info!(pinned = ?report.pinned, "Modules left loaded because unloading is disabled");
        }
        info!(
            unloaded = report.processed.len(),
            failed = failures.len(),
            "Bulk unload finished"
        );
        if failures.is_empty() && left.is_empty() {
            Ok(report)
        } else {
            Err(ModuleError::Bulk {
                operation: BulkOperation::Unload,
                failures,
                unresolved: left,
            })
        }
    }

    /// Unload everything and forget every module that is no longer loaded.
    ///
    /// # Errors
    ///
    /// Returns the [`unload_all`](Self::unload_all) error, after removing
    /// whatever could be removed.
    pub async fn shutdown(&self) -> ModuleResult<BulkReport> {
        info!("Shutting down module loader");
        let result = self.unload_all().await;

        let mut graph = self.graph.lock().await;
        for index in (0..graph.len()).rev() {
            let resident = graph
                .context(index)
                .is_some_and(|c| c.state().is_resident());
            if resident {
                if let Some(context) = graph.context(index) {
                    warn!(module_id = %context.id(), "Module stays resident after shutdown");
                }
                continue;
            }
            if let Some(context) = graph.remove(index)
                && let Err(e) = context.dispose()
            {
                warn!(module_id = %context.id(), error = %e, "Failed to dispose module");
            }
        }
        graph.rebuild();
        self.refresh_snapshot(&graph);
        result
    }

    // ---- single-module lifecycle ----

    /// Load one module whose dependencies are loaded.
    ///
    /// # Errors
    ///
    /// Returns a guard error if the module is not in `Loadable` or a
    /// dependency is not loaded, otherwise whatever the load raised.
    pub async fn load_module(&self, id: ModuleId, cancel: &CancellationToken) -> ModuleResult<()> {
        let context = self.module(id).ok_or(ModuleError::NotFound(id))?;
        context.check_loadable()?;

        let graph = self.graph.lock().await;
        self.load_in(&graph, id, cancel).await
    }

    /// Unload one module whose dependants are unloaded.
    ///
    /// # Errors
    ///
    /// Returns a guard error if the module is not `Loaded`, has loaded
    /// dependants or has unloading disabled, otherwise whatever the
    /// unload raised.
    pub async fn unload_module(&self, id: ModuleId) -> ModuleResult<()> {
        let context = self.module(id).ok_or(ModuleError::NotFound(id))?;
        context.check_unloadable()?;

        let graph = self.graph.lock().await;
        let index = graph.position_of(id).ok_or(ModuleError::NotFound(id))?;
        let dependants: Vec<ModuleId> = graph
            .dependants(index)
            .iter()
            .filter_map(|&d| graph.context(d))
            .filter(|d| d.state() == ModuleState::Loaded)
            .map(|d| d.id())
            .collect();
        if !dependants.is_empty() {
            return Err(ModuleError::DependantsNotUnloaded { id, dependants });
        }
        context.unload(&self.events).await
    }

    async fn load_in(
        &self,
        graph: &ModuleGraph,
        id: ModuleId,
        cancel: &CancellationToken,
    ) -> ModuleResult<()> {
        let index = graph.position_of(id).ok_or(ModuleError::NotFound(id))?;
        let context = graph.context(index).ok_or(ModuleError::NotFound(id))?;
        context.check_loadable()?;

        let dependencies: Vec<&Arc<ModuleContext>> = graph
            .dependencies(index)
            .iter()
            .filter_map(|&d| graph.context(d))
            .collect();
        let not_loaded: Vec<ModuleId> = dependencies
            .iter()
            .filter(|d| d.state() != ModuleState::Loaded)
            .map(|d| d.id())
            .collect();
        if !not_loaded.is_empty() {
            return Err(ModuleError::DependenciesNotLoaded {
                id,
                dependencies: not_loaded,
            });
        }

        let env = LoadEnvironment {
            artifacts: self.artifacts.as_ref(),
            host_boundary: &self.host_boundary,
            host_services: &self.host_services,
            dependency_resolvers: dependencies.iter().filter_map(|d| d.resolver()).collect(),
            dependency_boundaries: graph
                .boundary_order(index)
                .into_iter()
                .filter_map(|d| graph.context(d).and_then(|c| c.boundary_view()))
                .collect(),
            events: &self.events,
        };
        context.load(env, cancel).await
    }

    fn refresh_snapshot(&self, graph: &ModuleGraph) {
        let contexts: Arc<[Arc<ModuleContext>]> = graph.contexts().cloned().collect();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = contexts;
    }

    // ---- queries ----

    /// Every discovered module in discovery order.
    #[must_use]
    pub fn modules(&self) -> Vec<Arc<ModuleContext>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }

    /// A module by id.
    #[must_use]
    pub fn module(&self, id: ModuleId) -> Option<Arc<ModuleContext>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// State of a module.
    #[must_use]
    pub fn state(&self, id: ModuleId) -> Option<ModuleState> {
        self.module(id).map(|c| c.state())
    }

    /// Ids of a module's linked dependencies.
    #[must_use]
    pub fn dependencies_of(&self, id: ModuleId) -> Vec<ModuleId> {
        self.module(id)
            .map(|c| c.dependencies().iter().map(|d| d.id()).collect())
            .unwrap_or_default()
    }

    /// Ids of the modules linked as depending on a module.
    #[must_use]
    pub fn dependants_of(&self, id: ModuleId) -> Vec<ModuleId> {
        self.module(id)
            .map(|c| c.dependants().iter().map(|d| d.id()).collect())
            .unwrap_or_default()
    }

    /// Resolver of a loaded module.
    #[must_use]
    pub fn resolver(&self, id: ModuleId) -> Option<Arc<HierarchicalResolver>> {
        self.module(id).and_then(|c| c.resolver())
    }

    /// Number of loaded modules.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.state() == ModuleState::Loaded)
            .count()
    }

    /// Number of isolation boundaries currently resident.
    #[must_use]
    pub fn resident_boundaries(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.has_boundary())
            .count()
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("roots", &self.roots())
            .field("modules", &self.modules().len())
            .field("loaded", &self.loaded_count())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Immediate subdirectories of `root`, sorted by path.
async fn list_directories(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut directories = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            directories.push(entry.path());
        }
    }
    directories.sort();
    Ok(directories)
}

async fn scan_directory(
    graph: &mut ModuleGraph,
    directory: &Path,
    seen: &mut HashSet<PathBuf>,
    report: &mut ScanReport,
    fresh: &mut Vec<Arc<ModuleContext>>,
) -> ModuleResult<()> {
    if let Some(index) = graph.position_of_dir(directory) {
        // Known directory: keep it even if the new descriptor is rejected.
        let Some(loaded) = ModuleDescriptor::try_load(directory).await.inspect_err(|_| {
            seen.insert(directory.to_path_buf());
        })?
        else {
            return Ok(());
        };
        seen.insert(directory.to_path_buf());
        loaded.descriptor.validate(&loaded.path)?;
        if let Some(context) = graph.context(index)
            && context.update_descriptor(loaded)?
        {
            info!(module_id = %context.id(), "Module descriptor changed");
            report.updated.push(context.id());
        }
        return Ok(());
    }

    let Some(loaded) = ModuleDescriptor::try_load(directory).await? else {
        debug!(directory = %directory.display(), "No module descriptor, skipping");
        return Ok(());
    };
    loaded.descriptor.validate(&loaded.path)?;

    let id = loaded.descriptor.id;
    if let Some(existing) = graph.position_of(id).and_then(|i| graph.context(i)) {
        return Err(ModuleError::DuplicateId {
            id,
            directory: directory.to_path_buf(),
            existing: describe_origin(existing),
        });
    }

    seen.insert(directory.to_path_buf());
    let context = ModuleContext::from_directory(directory.to_path_buf(), loaded);
    info!(
        module_id = %id,
        directory = %directory.display(),
        name = context.descriptor().display_name(None),
        "Module discovered"
    );
    graph.insert(Arc::clone(&context));
    report.discovered.push(id);
    fresh.push(context);
    Ok(())
}

fn describe_origin(context: &ModuleContext) -> String {
    context.directory().map_or_else(
        || format!("managed module {}", context.id()),
        |d| d.display().to_string(),
    )
}

/// Every loaded module that must stay loaded: those with unloading
/// disabled and everything they depend on.
fn pinned_modules(graph: &ModuleGraph) -> HashSet<usize> {
    let mut pinned = HashSet::new();
    let mut stack: Vec<usize> = graph
        .contexts()
        .enumerate()
        .filter(|(_, c)| c.state().is_resident() && c.descriptor().unload_disabled)
        .map(|(i, _)| i)
        .collect();
    while let Some(index) = stack.pop() {
        if pinned.insert(index) {
            stack.extend_from_slice(graph.dependencies(index));
        }
    }
    pinned
}

/// Why a module that is not loaded could not be loaded, if it is stuck.
fn stuck_module(graph: &ModuleGraph, index: usize) -> Option<UnresolvedModule> {
    let context = graph.context(index)?;
    if context.state() == ModuleState::Loaded {
        return None;
    }
    let mut reasons = graph.reasons(index).to_vec();
    reasons.extend(
        graph
            .dependencies(index)
            .iter()
            .filter_map(|&d| graph.context(d))
            .filter(|d| d.state() != ModuleState::Loaded)
            .map(|d| UnresolvedReason::Blocked { dependency: d.id() }),
    );
    Some(UnresolvedModule {
        id: context.id(),
        reasons,
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use semver::Version;
    use tessera_di::{Resolver, ResolverExt};

    use super::*;
    use crate::entry::ModuleMain;

    struct Greeting(&'static str);

    #[derive(Default)]
    struct Provider;

    #[async_trait]
    impl ModuleMain for Provider {
        async fn register_services(
            &self,
            services: &mut ServiceCollection,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            services.add_instance(Arc::new(Greeting("hello")));
            Ok(())
        }

        async fn configure(
            &self,
            _resolver: Arc<dyn Resolver>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Consumer;

    #[async_trait]
    impl ModuleMain for Consumer {
        async fn register_services(
            &self,
            _services: &mut ServiceCollection,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn configure(
            &self,
            resolver: Arc<dyn Resolver>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            anyhow::ensure!(resolver.require::<Greeting>()?.0 == "hello");
            Ok(())
        }
    }

    fn id(n: u128) -> ModuleId {
        ModuleId::from_u128(n)
    }

    fn descriptor(n: u128) -> ModuleDescriptor {
        ModuleDescriptor::new(id(n), format!("m{n}")).with_version(Version::new(1, 0, 0))
    }

    #[tokio::test]
    async fn managed_modules_load_in_dependency_order() {
        let loader = ModuleLoader::builder().build();
        loader
            .register_managed(
                descriptor(1).with_dependency(id(2), Version::new(1, 0, 0)),
                EntryType::of::<Consumer>(),
            )
            .await
            .unwrap();
        loader
            .register_managed(descriptor(2), EntryType::of::<Provider>())
            .await
            .unwrap();
        assert!(matches!(
            loader.register_managed(descriptor(2), EntryType::of::<Provider>()).await,
            Err(ModuleError::DuplicateId { .. })
        ));

        let report = loader.load_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.processed, vec![id(2), id(1)]);
        assert_eq!(loader.loaded_count(), 2);
        assert_eq!(loader.dependencies_of(id(1)), vec![id(2)]);
        assert_eq!(loader.dependants_of(id(2)), vec![id(1)]);
        assert_eq!(loader.resolver(id(1)).unwrap().require::<Greeting>().unwrap().0, "hello");

        assert!(matches!(
            loader.unload_module(id(2)).await,
            Err(ModuleError::DependantsNotUnloaded { .. })
        ));
        let report = loader.unload_all().await.unwrap();
        assert_eq!(report.processed, vec![id(1), id(2)]);
        assert_eq!(loader.loaded_count(), 0);
    }

    #[tokio::test]
    async fn stuck_modules_are_reported_not_looped() {
        let loader = ModuleLoader::builder().build();
        loader
            .register_managed(
                descriptor(1).with_dependency(id(2), Version::new(1, 0, 0)),
                EntryType::of::<Provider>(),
            )
            .await
            .unwrap();
        loader
            .register_managed(
                descriptor(2).with_dependency(id(1), Version::new(1, 0, 0)),
                EntryType::of::<Provider>(),
            )
            .await
            .unwrap();

        match loader.load_all(&CancellationToken::new()).await {
            Err(ModuleError::Unresolved { modules }) => {
                assert_eq!(modules.len(), 2);
                assert!(modules.iter().all(|m| m.reasons.contains(&UnresolvedReason::Cycle)));
            },
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            loader.load_module(id(1), &CancellationToken::new()).await,
            Err(ModuleError::DependenciesUnresolved(_))
        ));
        assert!(matches!(
            loader.load_module(id(9), &CancellationToken::new()).await,
            Err(ModuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_forgets_unloaded_modules() {
        let loader = ModuleLoader::builder().build();
        loader
            .register_managed(descriptor(1), EntryType::of::<Provider>())
            .await
            .unwrap();
        loader
            .register_managed(descriptor(2).with_unload_disabled(true), EntryType::of::<Provider>())
            .await
            .unwrap();
        loader.load_all(&CancellationToken::new()).await.unwrap();

        let report = loader.shutdown().await.unwrap();
        assert_eq!(report.processed, vec![id(1)]);
        assert_eq!(report.pinned, vec![id(2)]);
        let remaining: Vec<ModuleId> = loader.modules().iter().map(|c| c.id()).collect();
        assert_eq!(remaining, vec![id(2)]);
        assert_eq!(loader.state(id(2)), Some(ModuleState::Loaded));
    }
}
