//! Isolation boundaries.
//!
//! A boundary owns every artifact privately loaded for one module. Handles
//! are `Arc<LoadedArtifact>`; the boundary keeps the only long-lived strong
//! reference to each of its own artifacts, so unloading can verify that
//! every outside handle has been released first.
//!
//! Library references resolve in this order:
//!
//! 1. boundaries of loaded dependency modules, deepest dependency first
//! 2. the host boundary
//! 3. the `<entry-stem>.deps.json` manifest next to the entry library
//! 4. a same-named file in the module directory

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use tracing::{debug, info, trace, warn};

use crate::artifact::{ArtifactLoader, CodeArtifact, ExportedType};
use crate::descriptor::ModuleDescriptor;
use crate::error::{BoundaryError, BoundaryResult};

/// An artifact admitted into a boundary.
pub struct LoadedArtifact {
    file_name: String,
    path: PathBuf,
    artifact: Arc<dyn CodeArtifact>,
}

impl LoadedArtifact {
    /// File name the artifact was loaded from.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Full path the artifact was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The export table.
    #[must_use]
    pub fn artifact(&self) -> &dyn CodeArtifact {
        self.artifact.as_ref()
    }

    /// Exported types.
    #[must_use]
    pub fn exports(&self) -> &[ExportedType] {
        self.artifact.exports()
    }
}

impl fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedArtifact")
            .field("file_name", &self.file_name)
            .field("path", &self.path)
            .field("artifact", &self.artifact.name())
            .finish()
    }
}

/// The searchable side of a boundary, shared with dependant boundaries.
#[derive(Debug)]
pub struct BoundaryView {
    name: String,
    artifacts: RwLock<Vec<Arc<LoadedArtifact>>>,
}

impl BoundaryView {
    fn new(name: String) -> Self {
        Self {
            name,
            artifacts: RwLock::new(Vec::new()),
        }
    }

    /// Boundary name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Find an artifact by file name.
    #[must_use]
    pub fn find(&self, file_name: &str) -> Option<Arc<LoadedArtifact>> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.file_name == file_name)
            .cloned()
    }

    /// Number of artifacts owned by the boundary.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the boundary owns nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn admit(&self, artifact: Arc<LoadedArtifact>) {
        self.artifacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(artifact);
    }
}

/// Libraries the host itself provides to every module.
#[derive(Debug, Default)]
pub struct HostBoundary {
    artifacts: Vec<Arc<LoadedArtifact>>,
}

impl HostBoundary {
    /// An empty host boundary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide `artifact` under `file_name`.
    #[must_use]
    pub fn with_artifact(
        mut self,
        file_name: impl Into<String>,
        artifact: Arc<dyn CodeArtifact>,
    ) -> Self {
        let file_name = file_name.into();
        self.artifacts.push(Arc::new(LoadedArtifact {
            path: PathBuf::from(&file_name),
            file_name,
            artifact,
        }));
        self
    }

    /// Find a host library by file name.
    #[must_use]
    pub fn find(&self, file_name: &str) -> Option<Arc<LoadedArtifact>> {
        self.artifacts
            .iter()
            .find(|a| a.file_name == file_name)
            .cloned()
    }
}

/// Optional `<entry-stem>.deps.json` mapping library names to files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DependencyManifest {
    /// Managed libraries, relative to the module directory.
    #[serde(default)]
    pub libraries: HashMap<String, PathBuf>,
    /// Native libraries, relative to the module directory.
    #[serde(default)]
    pub native: HashMap<String, PathBuf>,
}

impl DependencyManifest {
    /// Manifest path for `entry_library` inside `directory`.
    #[must_use]
    pub fn path_for(directory: &Path, entry_library: &str) -> PathBuf {
        let entry = directory.join(entry_library);
        let stem = entry
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(entry_library)
            .to_string();
        entry.with_file_name(format!("{stem}.deps.json"))
    }

    /// Read the manifest at `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError::Manifest`] if the file cannot be read, is
    /// not valid JSON, or maps a name outside the module directory.
    pub async fn try_load(path: &Path) -> BoundaryResult<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BoundaryError::Manifest {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            },
        };
        let manifest: Self = serde_json::from_str(&content).map_err(|e| BoundaryError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        for relative in manifest.libraries.values().chain(manifest.native.values()) {
            let contained = relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !contained {
                return Err(BoundaryError::Manifest {
                    path: path.to_path_buf(),
                    message: format!("{} escapes the module directory", relative.display()),
                });
            }
        }
        Ok(Some(manifest))
    }

    /// Relative path of a managed library.
    #[must_use]
    pub fn library(&self, name: &str) -> Option<&Path> {
        self.libraries.get(name).map(PathBuf::as_path)
    }

    /// Relative path of a native library.
    #[must_use]
    pub fn native_library(&self, name: &str) -> Option<&Path> {
        self.native.get(name).map(PathBuf::as_path)
    }
}

enum Resolution {
    Shared(Arc<LoadedArtifact>),
    File(PathBuf),
    Unresolved,
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// A reclaimable unit holding one module's private artifacts.
pub struct IsolationBoundary {
    view: Arc<BoundaryView>,
    directory: PathBuf,
    collectible: bool,
    manifest: Option<DependencyManifest>,
    dependencies: Vec<Arc<BoundaryView>>,
    host: Arc<HostBoundary>,
    borrowed: Vec<Arc<LoadedArtifact>>,
    native_libraries: Vec<PathBuf>,
}

impl IsolationBoundary {
    /// Create an empty boundary for a module.
    ///
    /// `dependencies` must be ordered deepest dependency first.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError::Manifest`] if the dependency manifest is
    /// invalid.
    pub async fn create(
        descriptor: &ModuleDescriptor,
        directory: &Path,
        dependencies: Vec<Arc<BoundaryView>>,
        host: Arc<HostBoundary>,
    ) -> BoundaryResult<Self> {
        let name = format!("{}-{}", descriptor.entry_stem(), descriptor.id);
        let manifest_path = DependencyManifest::path_for(directory, &descriptor.entry_library);
        let manifest = DependencyManifest::try_load(&manifest_path).await?;

        debug!(
            boundary = %name,
            collectible = !descriptor.unload_disabled,
            manifest = manifest.is_some(),
            "Created isolation boundary"
        );
        Ok(Self {
            view: Arc::new(BoundaryView::new(name)),
            directory: directory.to_path_buf(),
            collectible: !descriptor.unload_disabled,
            manifest,
            dependencies,
            host,
            borrowed: Vec::new(),
            native_libraries: Vec::new(),
        })
    }

    /// Boundary name, `{entry-stem}-{module-id}`.
    #[must_use]
    pub fn name(&self) -> &str {
        self.view.name()
    }

    /// Whether [`unload`](Self::unload) may reclaim the boundary.
    #[must_use]
    pub fn is_collectible(&self) -> bool {
        self.collectible
    }

    /// Shared, searchable view of the boundary's own artifacts.
    #[must_use]
    pub fn view(&self) -> Arc<BoundaryView> {
        Arc::clone(&self.view)
    }

    /// Number of artifacts loaded privately into this boundary.
    #[must_use]
    pub fn artifact_count(&self) -> usize {
        self.view.len()
    }

    /// Number of artifacts borrowed from dependency or host boundaries.
    #[must_use]
    pub fn borrowed_count(&self) -> usize {
        self.borrowed.len()
    }

    /// Native libraries resolved through the manifest.
    #[must_use]
    pub fn native_libraries(&self) -> &[PathBuf] {
        &self.native_libraries
    }

    /// Load the entry library and everything it references.
    ///
    /// # Errors
    ///
    /// Returns the first artifact load failure or unresolvable reference.
    pub async fn load_entry(
        &mut self,
        entry_library: &str,
        loader: &dyn ArtifactLoader,
    ) -> BoundaryResult<Arc<LoadedArtifact>> {
        let path = self.directory.join(entry_library);
        let entry = self.load_file(&path, loader).await?;

        let mut pending = vec![Arc::clone(&entry)];
        while let Some(current) = pending.pop() {
            for reference in current.artifact().references() {
                if self.find_local(reference).is_some() {
                    continue;
                }
                match self.resolve_reference(reference).await {
                    Resolution::Shared(handle) => {
                        trace!(
                            boundary = %self.name(),
                            reference = %reference,
                            "Borrowed shared artifact"
                        );
                        self.borrowed.push(handle);
                    },
                    Resolution::File(path) => {
                        pending.push(self.load_file(&path, loader).await?);
                    },
                    Resolution::Unresolved => {
                        return Err(BoundaryError::UnresolvedReference {
                            artifact: current.file_name.clone(),
                            reference: reference.clone(),
                        });
                    },
                }
            }
            self.resolve_native(current.artifact().native_references()).await;
        }

        info!(
            boundary = %self.name(),
            owned = self.view.len(),
            borrowed = self.borrowed.len(),
            "Entry library loaded"
        );
        Ok(entry)
    }

    async fn load_file(
        &self,
        path: &Path,
        loader: &dyn ArtifactLoader,
    ) -> BoundaryResult<Arc<LoadedArtifact>> {
        let artifact = loader.load(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| artifact.name())
            .to_string();
        let handle = Arc::new(LoadedArtifact {
            file_name,
            path: path.to_path_buf(),
            artifact,
        });
        self.view.admit(Arc::clone(&handle));
        debug!(boundary = %self.name(), path = %path.display(), "Artifact admitted");
        Ok(handle)
    }

    fn find_local(&self, file_name: &str) -> Option<Arc<LoadedArtifact>> {
        self.view.find(file_name).or_else(|| {
            self.borrowed
                .iter()
                .find(|a| a.file_name == file_name)
                .cloned()
        })
    }

    async fn resolve_reference(&self, file_name: &str) -> Resolution {
        for dependency in &self.dependencies {
            if let Some(found) = dependency.find(file_name) {
                return Resolution::Shared(found);
            }
        }
        if let Some(found) = self.host.find(file_name) {
            return Resolution::Shared(found);
        }
        if let Some(relative) = self.manifest.as_ref().and_then(|m| m.library(file_name)) {
            let path = self.directory.join(relative);
            if file_exists(&path).await {
                return Resolution::File(path);
            }
            debug!(
                boundary = %self.name(),
                path = %path.display(),
                "Manifest entry points at a missing file"
            );
        }
        let probe = self.directory.join(file_name);
        if file_exists(&probe).await {
            return Resolution::File(probe);
        }
        Resolution::Unresolved
    }

    async fn resolve_native(&mut self, names: &[String]) {
        for name in names {
            let Some(relative) = self.manifest.as_ref().and_then(|m| m.native_library(name)) else {
                debug!(
                    boundary = %self.name(),
                    library = %name,
                    "Native library left to the platform loader"
                );
                continue;
            };
            let path = self.directory.join(relative);
            if !file_exists(&path).await {
                debug!(boundary = %self.name(), path = %path.display(), "Native library missing");
                continue;
            }
            if !self.native_libraries.contains(&path) {
                self.native_libraries.push(path);
            }
        }
    }

    /// Reclaim the boundary.
    ///
    /// A non-collectible boundary refuses and stays resident for the rest
    /// of the process.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError::NotCollectible`] for pinned boundaries and
    /// [`BoundaryError::StillReferenced`] when handles outlive the boundary.
    pub fn unload(self) -> BoundaryResult<()> {
        if !self.collectible {
            let boundary = self.name().to_string();
            warn!(boundary = %boundary, "Refusing to unload a non-collectible boundary");
            std::mem::forget(self);
            return Err(BoundaryError::NotCollectible { boundary });
        }
        self.release()
    }

    /// Reclaim the boundary regardless of its unload policy.
    pub(crate) fn release(self) -> BoundaryResult<()> {
        let Self { view, borrowed, .. } = self;
        drop(borrowed);

        let owned = std::mem::take(
            &mut *view
                .artifacts
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let leaked: Vec<String> = owned
            .iter()
            .filter(|a| Arc::strong_count(a) > 1)
            .map(|a| a.file_name.clone())
            .collect();
        let released = owned.len();
        drop(owned);

        if leaked.is_empty() {
            debug!(boundary = %view.name, released, "Isolation boundary released");
            Ok(())
        } else {
            warn!(
                boundary = %view.name,
                leaked = ?leaked,
                "Artifact handles outlived their boundary"
            );
            Err(BoundaryError::StillReferenced {
                boundary: view.name.clone(),
                artifacts: leaked,
            })
        }
    }
}

impl fmt::Debug for IsolationBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationBoundary")
            .field("name", &self.view.name)
            .field("directory", &self.directory)
            .field("collectible", &self.collectible)
            .field("owned", &self.view.len())
            .field("borrowed", &self.borrowed.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{LinkedArtifact, LinkedArtifactLoader};
    use crate::id::ModuleId;

    fn descriptor(entry: &str) -> ModuleDescriptor {
        ModuleDescriptor::new(ModuleId::from_u128(9), entry)
    }

    fn touch(dir: &Path, relative: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
    }

    #[tokio::test]
    async fn resolves_manifest_probe_and_host() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "main.module");
        touch(dir.path(), "libs/vendored.lib");
        touch(dir.path(), "probed.lib");
        touch(dir.path(), "native/fast.so");
        std::fs::write(
            dir.path().join("main.deps.json"),
            r#"{
                "libraries": {"vendored.lib": "libs/vendored.lib"},
                "native": {"fast.so": "native/fast.so"}
            }"#,
        )
        .unwrap();

        let loader = LinkedArtifactLoader::new()
            .with_artifact(
                LinkedArtifact::new("main")
                    .reference("vendored.lib")
                    .reference("probed.lib")
                    .reference("runtime.lib")
                    .native_reference("fast.so"),
            )
            .with_artifact(LinkedArtifact::new("vendored"))
            .with_artifact(LinkedArtifact::new("probed"));
        let host = Arc::new(
            HostBoundary::new()
                .with_artifact("runtime.lib", Arc::new(LinkedArtifact::new("runtime"))),
        );

        let mut boundary =
            IsolationBoundary::create(&descriptor("main.module"), dir.path(), Vec::new(), host)
                .await
                .unwrap();
        assert_eq!(boundary.name(), format!("main-{}", ModuleId::from_u128(9)));

        let entry = boundary.load_entry("main.module", &loader).await.unwrap();
        assert_eq!(entry.file_name(), "main.module");
        assert_eq!(boundary.artifact_count(), 3);
        assert_eq!(boundary.borrowed_count(), 1);
        assert_eq!(boundary.native_libraries(), [dir.path().join("native/fast.so")]);

        drop(entry);
        boundary.unload().unwrap();
    }

    #[tokio::test]
    async fn dependency_boundaries_take_priority() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "base/base.module");
        touch(dir.path(), "base/shared.lib");
        touch(dir.path(), "top/top.module");
        touch(dir.path(), "top/shared.lib");

        let loader = LinkedArtifactLoader::new()
            .with_artifact(LinkedArtifact::new("base").reference("shared.lib"))
            .with_artifact(LinkedArtifact::new("top").reference("shared.lib"))
            .with_artifact(LinkedArtifact::new("shared"));
        let host = Arc::new(HostBoundary::new());

        let mut base = IsolationBoundary::create(
            &descriptor("base.module"),
            &dir.path().join("base"),
            Vec::new(),
            Arc::clone(&host),
        )
        .await
        .unwrap();
        drop(base.load_entry("base.module", &loader).await.unwrap());

        let mut top = IsolationBoundary::create(
            &descriptor("top.module"),
            &dir.path().join("top"),
            vec![base.view()],
            host,
        )
        .await
        .unwrap();
        drop(top.load_entry("top.module", &loader).await.unwrap());
        assert_eq!(top.artifact_count(), 1);
        assert_eq!(top.borrowed_count(), 1);

        // The dependant still borrows from the base boundary.
        let err = base.release().unwrap_err();
        assert!(matches!(
            err,
            BoundaryError::StillReferenced { ref artifacts, .. }
                if artifacts == &["shared.lib".to_string()]
        ));
        top.unload().unwrap();
    }

    #[tokio::test]
    async fn missing_reference_and_leaks_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "main.module");
        let loader = LinkedArtifactLoader::new()
            .with_artifact(LinkedArtifact::new("main").reference("absent.lib"));

        let mut boundary = IsolationBoundary::create(
            &descriptor("main.module"),
            dir.path(),
            Vec::new(),
            Arc::new(HostBoundary::new()),
        )
        .await
        .unwrap();
        let err = boundary.load_entry("main.module", &loader).await.unwrap_err();
        assert!(matches!(
            err,
            BoundaryError::UnresolvedReference { ref reference, .. } if reference == "absent.lib"
        ));

        let leaked = boundary.view().find("main.module").unwrap();
        let err = boundary.release().unwrap_err();
        assert!(matches!(err, BoundaryError::StillReferenced { .. }));
        drop(leaked);
    }

    #[tokio::test]
    async fn pinned_boundary_refuses_unload() {
        let dir = tempfile::tempdir().unwrap();
        let boundary = IsolationBoundary::create(
            &descriptor("main.module").with_unload_disabled(true),
            dir.path(),
            Vec::new(),
            Arc::new(HostBoundary::new()),
        )
        .await
        .unwrap();
        assert!(!boundary.is_collectible());
        assert!(matches!(boundary.unload(), Err(BoundaryError::NotCollectible { .. })));
    }

    #[tokio::test]
    async fn manifest_paths_must_stay_inside() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.deps.json"),
            r#"{"libraries":{"x.lib":"../x.lib"}}"#,
        )
        .unwrap();
        let err = IsolationBoundary::create(
            &descriptor("main.module"),
            dir.path(),
            Vec::new(),
            Arc::new(HostBoundary::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BoundaryError::Manifest { .. }));
    }
}
