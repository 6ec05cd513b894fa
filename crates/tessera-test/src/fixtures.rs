//! Module trees on disk and common identifiers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use semver::Version;
use tempfile::TempDir;
use tessera_modules::{
    DESCRIPTOR_FILE_NAME, ModuleDescriptor, ModuleId, ModuleLoader, ModuleLoaderBuilder,
};
use tracing_subscriber::EnvFilter;

use crate::catalog::TestCatalog;

/// Deterministic module id for test number `n`.
///
/// # Panics
///
/// Panics if `n` is zero, since the nil id is not a valid module id.
#[must_use]
pub fn test_module_id(n: u128) -> ModuleId {
    assert!(n != 0, "module ids must not be nil");
    ModuleId::from_u128(n)
}

/// Descriptor for test module `n` at version 1.0.0.
#[must_use]
pub fn test_descriptor(n: u128, entry_library: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(test_module_id(n), entry_library).with_version(Version::new(1, 0, 0))
}

/// Install a test subscriber once per process, honouring `RUST_LOG`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A temporary module root populated one directory at a time.
///
/// Panics on I/O failure; it exists only for tests.
#[derive(Debug)]
pub struct ModuleTree {
    dir: TempDir,
}

impl ModuleTree {
    /// An empty root.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create module root"),
        }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory of module `name`.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    /// Create module directory `name` holding `descriptor` and an empty
    /// entry library file.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub fn module(&self, name: &str, descriptor: &ModuleDescriptor) -> PathBuf {
        let directory = self.write_descriptor(name, descriptor);
        self.library(name, &descriptor.entry_library);
        directory
    }

    /// Write `module.json` for `name`, replacing any previous one.
    ///
    /// # Panics
    ///
    /// Panics on I/O or serialization failure.
    pub fn write_descriptor(&self, name: &str, descriptor: &ModuleDescriptor) -> PathBuf {
        let json = serde_json::to_string_pretty(descriptor).expect("descriptor serializes");
        self.write(name, DESCRIPTOR_FILE_NAME, json.as_bytes())
    }

    /// Write raw `module.json` text for `name`.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub fn write_raw_descriptor(&self, name: &str, json: &str) -> PathBuf {
        self.write(name, DESCRIPTOR_FILE_NAME, json.as_bytes())
    }

    /// Create an empty library file in module `name`.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub fn library(&self, name: &str, file: &str) -> PathBuf {
        self.write(name, file, b"")
    }

    /// Write any file inside module `name`.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub fn write(&self, name: &str, file: &str, contents: &[u8]) -> PathBuf {
        let directory = self.path(name);
        let path = directory.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create module directory");
        }
        std::fs::write(&path, contents).expect("failed to write module file");
        directory
    }

    /// Delete the descriptor of module `name`, leaving the directory.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub fn remove_descriptor(&self, name: &str) {
        std::fs::remove_file(self.path(name).join(DESCRIPTOR_FILE_NAME))
            .expect("failed to remove descriptor");
    }

    /// A loader builder rooted here and serving `catalog`.
    #[must_use]
    pub fn builder(&self, catalog: &TestCatalog) -> ModuleLoaderBuilder {
        ModuleLoader::builder()
            .with_root(self.root())
            .with_artifact_loader(catalog.loader())
    }

    /// A loader rooted here and serving `catalog`.
    #[must_use]
    pub fn loader(&self, catalog: &TestCatalog) -> Arc<ModuleLoader> {
        self.builder(catalog).build()
    }
}

impl Default for ModuleTree {
    fn default() -> Self {
        Self::new()
    }
}
