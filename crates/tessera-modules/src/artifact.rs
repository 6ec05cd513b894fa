//! Code artifacts and the loaders that provide them.
//!
//! An artifact is a library file inside a module directory. The loader
//! maps a path to an export table: the types the library exports and the
//! libraries it references. [`LinkedArtifactLoader`] serves export tables
//! compiled into the host binary, keyed by library file stem, and only
//! hands one out when the file is actually present on disk.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::entry::EntryType;
use crate::error::{BoundaryError, BoundaryResult};

/// Shape of an exported type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Instantiable.
    Concrete,
    /// Cannot be instantiated.
    Abstract,
    /// Has unbound type parameters.
    Generic,
}

/// One type exported by an artifact.
#[derive(Debug, Clone)]
pub struct ExportedType {
    name: String,
    kind: TypeKind,
    entry: Option<EntryType>,
}

impl ExportedType {
    /// A concrete type implementing the entry contract.
    #[must_use]
    pub fn entry(entry: EntryType) -> Self {
        Self {
            name: entry.type_name().to_string(),
            kind: TypeKind::Concrete,
            entry: Some(entry),
        }
    }

    /// A type that does not implement the entry contract.
    #[must_use]
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Concrete,
            entry: None,
        }
    }

    /// Override the type shape.
    #[must_use]
    pub fn with_kind(mut self, kind: TypeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type shape.
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Entry description, if the type implements the entry contract.
    #[must_use]
    pub fn entry_type(&self) -> Option<&EntryType> {
        self.entry.as_ref()
    }
}

/// A loaded library's export table.
pub trait CodeArtifact: Send + Sync {
    /// Library name.
    fn name(&self) -> &str;

    /// Exported types.
    fn exports(&self) -> &[ExportedType];

    /// File names of managed libraries this one references.
    fn references(&self) -> &[String] {
        &[]
    }

    /// File names of native libraries this one references.
    fn native_references(&self) -> &[String] {
        &[]
    }
}

/// Loads artifacts from disk.
#[async_trait]
pub trait ArtifactLoader: Send + Sync {
    /// Load the artifact at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`BoundaryError`] if the file is missing or cannot be
    /// turned into an artifact.
    async fn load(&self, path: &Path) -> BoundaryResult<Arc<dyn CodeArtifact>>;
}

/// An export table linked into the host binary.
#[derive(Debug, Clone)]
pub struct LinkedArtifact {
    name: String,
    exports: Vec<ExportedType>,
    references: Vec<String>,
    native_references: Vec<String>,
}

impl LinkedArtifact {
    /// An empty table for the library with file stem `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exports: Vec::new(),
            references: Vec::new(),
            native_references: Vec::new(),
        }
    }

    /// Export a type.
    #[must_use]
    pub fn export(mut self, exported: ExportedType) -> Self {
        self.exports.push(exported);
        self
    }

    /// Export an entry type.
    #[must_use]
    pub fn entry(self, entry: EntryType) -> Self {
        self.export(ExportedType::entry(entry))
    }

    /// Reference another managed library by file name.
    #[must_use]
    pub fn reference(mut self, file_name: impl Into<String>) -> Self {
        self.references.push(file_name.into());
        self
    }

    /// Reference a native library by file name.
    #[must_use]
    pub fn native_reference(mut self, file_name: impl Into<String>) -> Self {
        self.native_references.push(file_name.into());
        self
    }
}

impl CodeArtifact for LinkedArtifact {
    fn name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> &[ExportedType] {
        &self.exports
    }

    fn references(&self) -> &[String] {
        &self.references
    }

    fn native_references(&self) -> &[String] {
        &self.native_references
    }
}

/// Serves [`LinkedArtifact`]s for library files that exist on disk.
#[derive(Default)]
pub struct LinkedArtifactLoader {
    catalog: RwLock<HashMap<String, Arc<LinkedArtifact>>>,
}

impl LinkedArtifactLoader {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact, returning any previous one with the same name.
    pub fn register(&self, artifact: LinkedArtifact) -> Option<Arc<LinkedArtifact>> {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact.name.clone(), Arc::new(artifact))
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_artifact(self, artifact: LinkedArtifact) -> Self {
        self.register(artifact);
        self
    }

    /// Whether an artifact with file stem `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Number of registered artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LinkedArtifactLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = catalog.keys().collect();
        names.sort();
        f.debug_struct("LinkedArtifactLoader")
            .field("artifacts", &names)
            .finish()
    }
}

#[async_trait]
impl ArtifactLoader for LinkedArtifactLoader {
    async fn load(&self, path: &Path) -> BoundaryResult<Arc<dyn CodeArtifact>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {},
            Ok(_) => {
                return Err(BoundaryError::ArtifactNotFound {
                    path: path.to_path_buf(),
                });
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BoundaryError::ArtifactNotFound {
                    path: path.to_path_buf(),
                });
            },
            Err(e) => {
                return Err(BoundaryError::ArtifactLoad {
                    path: path.to_path_buf(),
                    source: e.into(),
                });
            },
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let found = self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stem)
            .cloned();

        match found {
            Some(artifact) => {
                debug!(path = %path.display(), artifact = stem, "Linked artifact loaded");
                Ok(artifact as Arc<dyn CodeArtifact>)
            },
            None => Err(BoundaryError::ArtifactUnavailable {
                name: stem.to_string(),
                path: path.to_path_buf(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_requires_file_and_registration() {
        let dir = tempfile::tempdir().unwrap();
        let loader = LinkedArtifactLoader::new()
            .with_artifact(LinkedArtifact::new("present").reference("shared.lib"));
        assert!(loader.contains("present"));
        assert_eq!(loader.len(), 1);

        let missing = loader.load(&dir.path().join("present.module")).await;
        assert!(matches!(missing, Err(BoundaryError::ArtifactNotFound { .. })));

        std::fs::write(dir.path().join("present.module"), b"").unwrap();
        let artifact = loader.load(&dir.path().join("present.module")).await.unwrap();
        assert_eq!(artifact.name(), "present");
        assert_eq!(artifact.references(), ["shared.lib".to_string()]);

        std::fs::write(dir.path().join("stranger.module"), b"").unwrap();
        let unknown = loader.load(&dir.path().join("stranger.module")).await;
        assert!(matches!(
            unknown,
            Err(BoundaryError::ArtifactUnavailable { name, .. }) if name == "stranger"
        ));
    }
}
