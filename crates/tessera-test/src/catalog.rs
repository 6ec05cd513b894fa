//! Artifact catalog for module trees.

use std::sync::Arc;

use tessera_modules::{ArtifactLoader, EntryType, LinkedArtifact, LinkedArtifactLoader};

/// A shared [`LinkedArtifactLoader`] filled in as tests go.
///
/// Clones share the same catalog.
#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    loader: Arc<LinkedArtifactLoader>,
}

impl TestCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an artifact.
    pub fn artifact(&self, artifact: LinkedArtifact) -> &Self {
        self.loader.register(artifact);
        self
    }

    /// Register a library with file stem `stem` exporting one entry type.
    pub fn entry(&self, stem: &str, entry: EntryType) -> &Self {
        self.artifact(LinkedArtifact::new(stem).entry(entry))
    }

    /// Register a library with no exports.
    pub fn library(&self, stem: &str) -> &Self {
        self.artifact(LinkedArtifact::new(stem))
    }

    /// The loader to hand to a [`ModuleLoader`](tessera_modules::ModuleLoader).
    #[must_use]
    pub fn loader(&self) -> Arc<dyn ArtifactLoader> {
        Arc::clone(&self.loader) as Arc<dyn ArtifactLoader>
    }
}
