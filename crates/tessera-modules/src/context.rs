//! Per-module state and the single-module load and unload procedures.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::SystemTime;

use tessera_di::{
    DiError, Resolver, ServiceCollection, ServiceContainer, ServiceInstance, ServiceProvider,
    resolve_arguments,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactLoader;
use crate::boundary::{BoundaryView, HostBoundary, IsolationBoundary, LoadedArtifact};
use crate::descriptor::{LoadedDescriptor, ModuleDescriptor};
use crate::entry::{EntryConstructor, EntryType, ModuleMain, discover_entry_type};
use crate::error::{HookStage, ModuleError, ModuleResult};
use crate::events::{ModuleEvent, ModuleEventBus, ModuleEventKind};
use crate::hierarchy::HierarchicalResolver;
use crate::id::ModuleId;

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    /// Found, dependencies not yet computed.
    Discovered,
    /// Dependency edges are being computed.
    Resolving,
    /// Every dependency resolved; may be loaded.
    Loadable,
    /// Some dependency is missing, too old, or cyclic.
    Unresolved,
    /// A load is in progress.
    Loading,
    /// Fully loaded.
    Loaded,
    /// An unload is in progress.
    Unloading,
}

impl ModuleState {
    /// Whether a load or unload is in progress.
    #[must_use]
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Loading | Self::Unloading)
    }

    /// Whether the module holds loaded code, including mid-transition.
    #[must_use]
    pub fn is_resident(self) -> bool {
        matches!(self, Self::Loading | Self::Loaded | Self::Unloading)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovered => "discovered",
            Self::Resolving => "resolving",
            Self::Loadable => "loadable",
            Self::Unresolved => "unresolved",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
        })
    }
}

/// Where a module's code comes from.
#[derive(Debug)]
enum ModuleSource {
    Directory(PathBuf),
    Managed(EntryType),
}

/// Everything a loaded module owns.
struct LoadedModule {
    instance: Box<dyn ModuleMain>,
    provider: ServiceProvider,
    resolver: Arc<HierarchicalResolver>,
    entry: Option<Arc<LoadedArtifact>>,
    boundary: Option<IsolationBoundary>,
}

impl LoadedModule {
    /// Drop every handle into the boundary, then reclaim it.
    async fn teardown(self, id: ModuleId) -> ModuleResult<()> {
        let Self {
            instance,
            provider,
            resolver,
            entry,
            boundary,
        } = self;

        if let Err(e) = instance.teardown().await {
            warn!(module_id = %id, error = %e, "Module teardown hook failed");
        }
        drop(instance);
        if let Err(e) = provider.dispose() {
            warn!(module_id = %id, error = %e, "Module services failed to dispose");
        }
        drop(resolver);
        drop(entry);

        match boundary {
            Some(boundary) => boundary
                .unload()
                .map_err(|source| ModuleError::Boundary { id, source }),
            None => Ok(()),
        }
    }
}

/// Pieces of a load in progress that need explicit cleanup on failure.
#[derive(Default)]
struct Staging {
    boundary: Option<IsolationBoundary>,
    provider: Option<ServiceProvider>,
}

/// What a load needs from the loader.
pub(crate) struct LoadEnvironment<'a> {
    pub(crate) artifacts: &'a dyn ArtifactLoader,
    pub(crate) host_boundary: &'a Arc<HostBoundary>,
    pub(crate) host_services: &'a Arc<dyn ServiceContainer>,
    pub(crate) dependency_resolvers: Vec<Arc<HierarchicalResolver>>,
    pub(crate) dependency_boundaries: Vec<Arc<BoundaryView>>,
    pub(crate) events: &'a ModuleEventBus,
}

/// State visible to other modules while this one is loaded.
struct Published {
    resolver: Arc<HierarchicalResolver>,
    boundary: Option<Arc<BoundaryView>>,
}

/// Non-owning graph links, refreshed on every rebuild.
#[derive(Default)]
struct Links {
    dependencies: Vec<Weak<ModuleContext>>,
    dependants: Vec<Weak<ModuleContext>>,
}

/// One discovered module.
pub struct ModuleContext {
    source: ModuleSource,
    descriptor: RwLock<Arc<ModuleDescriptor>>,
    descriptor_modified: RwLock<Option<SystemTime>>,
    state: RwLock<ModuleState>,
    resolved: AtomicBool,
    ever_loaded: AtomicBool,
    disposed: AtomicBool,
    links: RwLock<Links>,
    published: RwLock<Option<Published>>,
    guard: tokio::sync::Mutex<Option<LoadedModule>>,
    this: Weak<ModuleContext>,
}

impl ModuleContext {
    fn create(
        source: ModuleSource,
        descriptor: ModuleDescriptor,
        modified: Option<SystemTime>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            source,
            descriptor: RwLock::new(Arc::new(descriptor)),
            descriptor_modified: RwLock::new(modified),
            state: RwLock::new(ModuleState::Discovered),
            resolved: AtomicBool::new(false),
            ever_loaded: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            links: RwLock::new(Links::default()),
            published: RwLock::new(None),
            guard: tokio::sync::Mutex::new(None),
            this: this.clone(),
        })
    }

    pub(crate) fn from_directory(directory: PathBuf, loaded: LoadedDescriptor) -> Arc<Self> {
        Self::create(
            ModuleSource::Directory(directory),
            loaded.descriptor,
            loaded.modified,
        )
    }

    pub(crate) fn managed(descriptor: ModuleDescriptor, entry: EntryType) -> Arc<Self> {
        Self::create(ModuleSource::Managed(entry), descriptor, None)
    }

    /// Module id.
    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.descriptor().id
    }

    /// Current descriptor.
    #[must_use]
    pub fn descriptor(&self) -> Arc<ModuleDescriptor> {
        Arc::clone(&self.descriptor.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Modification time of the descriptor file when it was last read.
    #[must_use]
    pub fn descriptor_modified(&self) -> Option<SystemTime> {
        *self
            .descriptor_modified
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Module directory; `None` for managed modules.
    #[must_use]
    pub fn directory(&self) -> Option<&Path> {
        match &self.source {
            ModuleSource::Directory(directory) => Some(directory),
            ModuleSource::Managed(_) => None,
        }
    }

    /// Whether the module was registered in-process.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        matches!(self.source, ModuleSource::Managed(_))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ModuleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Whether every declared dependency is linked.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub(crate) fn set_resolved(&self, resolved: bool) {
        self.resolved.store(resolved, Ordering::Release);
    }

    /// Whether the module completed a load at least once.
    #[must_use]
    pub fn has_ever_loaded(&self) -> bool {
        self.ever_loaded.load(Ordering::Acquire)
    }

    /// Whether the context was permanently removed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether an entry object is alive.
    #[must_use]
    pub fn has_instance(&self) -> bool {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether an isolation boundary is resident.
    #[must_use]
    pub fn has_boundary(&self) -> bool {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| p.boundary.is_some())
    }

    /// The module's resolver while loaded.
    #[must_use]
    pub fn resolver(&self) -> Option<Arc<HierarchicalResolver>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| Arc::clone(&p.resolver))
    }

    pub(crate) fn boundary_view(&self) -> Option<Arc<BoundaryView>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|p| p.boundary.clone())
    }

    /// A weak handle to this context.
    #[must_use]
    pub fn handle(&self) -> ModuleHandle {
        ModuleHandle {
            id: self.id(),
            context: self.this.clone(),
        }
    }

    /// Linked dependencies that are still alive.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Arc<ModuleContext>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dependencies
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Linked dependants that are still alive.
    #[must_use]
    pub fn dependants(&self) -> Vec<Arc<ModuleContext>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dependants
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn set_links(
        &self,
        dependencies: Vec<Weak<ModuleContext>>,
        dependants: Vec<Weak<ModuleContext>>,
    ) {
        *self.links.write().unwrap_or_else(PoisonError::into_inner) = Links {
            dependencies,
            dependants,
        };
    }

    /// Whether a load would currently be admitted.
    #[must_use]
    pub fn can_load(&self) -> bool {
        self.state() == ModuleState::Loadable
            && self.is_resolved()
            && self
                .dependencies()
                .iter()
                .all(|d| d.state() == ModuleState::Loaded)
    }

    /// Whether an unload would currently be admitted.
    #[must_use]
    pub fn can_unload(&self) -> bool {
        self.state() == ModuleState::Loaded
            && !self.descriptor().unload_disabled
            && self
                .dependants()
                .iter()
                .all(|d| d.state() != ModuleState::Loaded)
    }

    /// Apply a rescanned descriptor.
    ///
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the update breaks an
    /// immutability rule: the id never changes, the entry library and
    /// unload policy are fixed once the module has loaded, and dependencies
    /// and version are fixed while it is resident. The current descriptor
    /// is kept in that case.
    pub fn update_descriptor(&self, loaded: LoadedDescriptor) -> ModuleResult<bool> {
        let current = self.descriptor();
        let next = loaded.descriptor;
        let id = current.id;

        if next.id != id {
            return Err(ModuleError::IdChanged {
                directory: self.directory().map(Path::to_path_buf).unwrap_or_default(),
                old: id,
                new: next.id,
            });
        }
        if self.has_ever_loaded() {
            if next.entry_library != current.entry_library {
                return Err(ModuleError::EntryLibraryChanged(id));
            }
            if next.unload_disabled != current.unload_disabled {
                return Err(ModuleError::UnloadPolicyChanged(id));
            }
        }
        if self.state().is_resident() {
            if !next.same_dependencies(&current) {
                return Err(ModuleError::DependenciesChanged(id));
            }
            if next.version != current.version {
                return Err(ModuleError::VersionChanged {
                    id,
                    old: current.version.clone(),
                    new: next.version,
                });
            }
        }

        *self
            .descriptor_modified
            .write()
            .unwrap_or_else(PoisonError::into_inner) = loaded.modified;
        if *current == next {
            return Ok(false);
        }
        *self.descriptor.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        debug!(module_id = %id, "Module descriptor updated");
        Ok(true)
    }

    /// Mark the context as permanently removed.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::StillLoaded`] while code is resident.
    pub fn dispose(&self) -> ModuleResult<()> {
        if self.state().is_resident() {
            return Err(ModuleError::StillLoaded(self.id()));
        }
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.set_links(Vec::new(), Vec::new());
            debug!(module_id = %self.id(), "Module context disposed");
        }
        Ok(())
    }

    /// Reject a load that cannot start from the current state.
    pub(crate) fn check_loadable(&self) -> ModuleResult<()> {
        let id = self.id();
        if self.is_disposed() {
            return Err(ModuleError::NotFound(id));
        }
        match self.state() {
            ModuleState::Loadable => Ok(()),
            ModuleState::Loaded => Err(ModuleError::AlreadyLoaded(id)),
            ModuleState::Loading => Err(ModuleError::AlreadyLoading(id)),
            ModuleState::Unloading => Err(ModuleError::LoadingNotFinished(id)),
            ModuleState::Discovered | ModuleState::Resolving | ModuleState::Unresolved => {
                Err(ModuleError::DependenciesUnresolved(id))
            },
        }
    }

    /// Reject an unload that cannot start from the current state.
    pub(crate) fn check_unloadable(&self) -> ModuleResult<()> {
        let id = self.id();
        match self.state() {
            ModuleState::Loaded => {},
            ModuleState::Loading | ModuleState::Unloading => {
                return Err(ModuleError::LoadingNotFinished(id));
            },
            _ => return Err(ModuleError::NotLoaded(id)),
        }
        if self.descriptor().unload_disabled {
            return Err(ModuleError::UnloadDisabled(id));
        }
        Ok(())
    }

    async fn emit(&self, events: &ModuleEventBus, kind: ModuleEventKind, artifact: Option<&str>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut event = ModuleEvent::new(kind, this);
        if let Some(artifact) = artifact {
            event = event.with_artifact(artifact);
        }
        events.publish(event).await;
    }

    /// Load the module. Callers must have verified its dependencies.
    pub(crate) async fn load(
        &self,
        env: LoadEnvironment<'_>,
        cancel: &CancellationToken,
    ) -> ModuleResult<()> {
        let id = self.id();
        self.check_loadable()?;
        let Ok(mut guard) = self.guard.try_lock() else {
            return Err(ModuleError::AlreadyLoading(id));
        };
        self.check_loadable()?;
        if guard.is_some() {
            return Err(ModuleError::AlreadyLoaded(id));
        }

        let descriptor = self.descriptor();
        self.set_state(ModuleState::Loading);
        info!(module_id = %id, version = %descriptor.version, "Loading module");
        self.emit(env.events, ModuleEventKind::Loading, None).await;

        let mut staging = Staging::default();
        match self.load_steps(&env, cancel, &descriptor, &mut staging).await {
            Ok(loaded) => {
                *self.published.write().unwrap_or_else(PoisonError::into_inner) = Some(Published {
                    resolver: Arc::clone(&loaded.resolver),
                    boundary: loaded.boundary.as_ref().map(IsolationBoundary::view),
                });
                *guard = Some(loaded);
                self.ever_loaded.store(true, Ordering::Release);
                self.set_state(ModuleState::Loaded);
                drop(guard);

                info!(module_id = %id, "Module loaded");
                self.emit(env.events, ModuleEventKind::Loaded, None).await;
                Ok(())
            },
            Err(error) => {
                let error = Self::rollback(id, staging, error);
                self.set_state(ModuleState::Loadable);
                drop(guard);
                warn!(module_id = %id, error = %error, "Module load failed");
                Err(error)
            },
        }
    }

    async fn load_steps(
        &self,
        env: &LoadEnvironment<'_>,
        cancel: &CancellationToken,
        descriptor: &ModuleDescriptor,
        staging: &mut Staging,
    ) -> ModuleResult<LoadedModule> {
        let id = descriptor.id;
        ensure_live(cancel, id)?;

        let (entry_type, entry) = match &self.source {
            ModuleSource::Directory(directory) => {
                let boundary = IsolationBoundary::create(
                    descriptor,
                    directory,
                    env.dependency_boundaries.clone(),
                    Arc::clone(env.host_boundary),
                )
                .await
                .map_err(|source| ModuleError::Boundary { id, source })?;
                let boundary = staging.boundary.insert(boundary);
                ensure_live(cancel, id)?;

                let entry = boundary
                    .load_entry(&descriptor.entry_library, env.artifacts)
                    .await
                    .map_err(|source| ModuleError::Boundary { id, source })?;
                self.emit(env.events, ModuleEventKind::AssemblyLoaded, Some(entry.file_name()))
                    .await;
                let entry_type =
                    discover_entry_type(id, &descriptor.entry_library, entry.exports())?;
                (entry_type, Some(entry))
            },
            ModuleSource::Managed(entry_type) => (entry_type.clone(), None),
        };
        ensure_live(cancel, id)?;

        let resolver = Arc::new(HierarchicalResolver::new(
            &env.dependency_resolvers,
            Arc::clone(env.host_services),
        ));
        let instance = self.construct(id, &entry_type, &resolver)?;
        debug!(module_id = %id, entry_type = entry_type.type_name(), "Entry object constructed");

        let mut services = ServiceCollection::new();
        run_hook(
            id,
            HookStage::RegisterServices,
            cancel,
            instance.register_services(&mut services, cancel),
        )
        .await?;

        let provider = services.build();
        staging.provider = Some(provider.clone());
        resolver.attach(Arc::new(provider.clone()));

        run_hook(
            id,
            HookStage::Configure,
            cancel,
            instance.configure(Arc::clone(&resolver) as Arc<dyn Resolver>, cancel),
        )
        .await?;

        Ok(LoadedModule {
            instance,
            provider,
            resolver,
            entry,
            boundary: staging.boundary.take(),
        })
    }

    fn construct(
        &self,
        id: ModuleId,
        entry_type: &EntryType,
        resolver: &HierarchicalResolver,
    ) -> ModuleResult<Box<dyn ModuleMain>> {
        let constructor = match entry_type.select(id)? {
            EntryConstructor::Default(make) => return Ok(make()),
            EntryConstructor::Explicit(constructor) => constructor,
        };

        let module_id = ServiceInstance::new(Arc::new(id));
        let handle = ServiceInstance::new(Arc::new(self.handle()));
        let to_module_error = |error: DiError| match error {
            DiError::Unresolvable { parameters, .. } => ModuleError::UnresolvedParameters {
                id,
                type_name: entry_type.type_name().to_string(),
                parameters,
            },
            DiError::Construction { source, .. } => ModuleError::EntryHook {
                id,
                stage: HookStage::Construct,
                source,
            },
            other => ModuleError::Injection { id, source: other },
        };

        let arguments = resolve_arguments(constructor, |_, parameter| {
            let key = parameter.key();
            if key.is::<ModuleId>() {
                Ok(Some(module_id.clone()))
            } else if key.is::<ModuleHandle>() {
                Ok(Some(handle.clone()))
            } else {
                resolver.resolve(&key)
            }
        })
        .map_err(to_module_error)?;
        constructor.invoke(&arguments).map_err(to_module_error)
    }

    fn rollback(id: ModuleId, staging: Staging, error: ModuleError) -> ModuleError {
        if let Some(provider) = staging.provider
            && let Err(e) = provider.dispose()
        {
            warn!(module_id = %id, error = %e, "Services of a failed load failed to dispose");
        }
        match staging.boundary {
            Some(boundary) => match boundary.release() {
                Ok(()) => error,
                Err(teardown) => ModuleError::LoadRollbackFailed {
                    id,
                    load: Box::new(error),
                    teardown,
                },
            },
            None => error,
        }
    }

    /// Unload the module. Callers must have verified its dependants.
    pub(crate) async fn unload(&self, events: &ModuleEventBus) -> ModuleResult<()> {
        let id = self.id();
        self.check_unloadable()?;
        let Ok(mut guard) = self.guard.try_lock() else {
            return Err(ModuleError::LoadingNotFinished(id));
        };
        self.check_unloadable()?;
        let Some(loaded) = guard.take() else {
            return Err(ModuleError::NotLoaded(id));
        };

        self.set_state(ModuleState::Unloading);
        info!(module_id = %id, "Unloading module");
        self.emit(events, ModuleEventKind::Unloading, None).await;

        *self.published.write().unwrap_or_else(PoisonError::into_inner) = None;
        let result = loaded.teardown(id).await;
        self.set_state(ModuleState::Loadable);
        drop(guard);

        match &result {
            Ok(()) => {
                info!(module_id = %id, "Module unloaded");
                self.emit(events, ModuleEventKind::Unloaded, None).await;
            },
            Err(e) => warn!(module_id = %id, error = %e, "Module unload left resources behind"),
        }
        result
    }
}

fn ensure_live(cancel: &CancellationToken, id: ModuleId) -> ModuleResult<()> {
    if cancel.is_cancelled() {
        return Err(ModuleError::Cancelled(id));
    }
    Ok(())
}

async fn run_hook<F>(
    id: ModuleId,
    stage: HookStage,
    cancel: &CancellationToken,
    hook: F,
) -> ModuleResult<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    ensure_live(cancel, id)?;
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ModuleError::Cancelled(id)),
        result = hook => result.map_err(|source| ModuleError::EntryHook { id, stage, source }),
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("id", &self.id())
            .field("source", &self.source)
            .field("state", &self.state())
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

/// A weak, cloneable reference to a module.
///
/// Entry constructors may declare a `ModuleHandle` parameter to receive
/// their own module.
#[derive(Clone)]
pub struct ModuleHandle {
    id: ModuleId,
    context: Weak<ModuleContext>,
}

impl ModuleHandle {
    /// Module id.
    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// The context, if it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<ModuleContext>> {
        self.context.upgrade()
    }

    /// Current state, if the context still exists.
    #[must_use]
    pub fn state(&self) -> Option<ModuleState> {
        self.upgrade().map(|c| c.state())
    }

    /// Current descriptor, if the context still exists.
    #[must_use]
    pub fn descriptor(&self) -> Option<Arc<ModuleDescriptor>> {
        self.upgrade().map(|c| c.descriptor())
    }

    /// Module directory, if the context still exists and has one.
    #[must_use]
    pub fn directory(&self) -> Option<PathBuf> {
        self.upgrade()
            .and_then(|c| c.directory().map(Path::to_path_buf))
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.id)
            .field("alive", &(self.context.strong_count() > 0))
            .finish()
    }
}
