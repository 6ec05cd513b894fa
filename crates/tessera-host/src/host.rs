//! The modular host and its builder.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use tessera_config::HostConfig;
use tessera_di::{ResolverExt, ServiceCollection, ServiceContainer, ServiceProvider};
use tessera_modules::{
    ArtifactLoader, BulkReport, LifecycleObserver, ModuleError, ModuleLoader, ScanReport,
};
use tessera_telemetry::{LogConfig, TelemetryError, setup_logging};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HostResult;

/// What the host did while starting.
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Result of the initial scan, if one ran and every directory was
    /// accepted.
    pub scan: Option<ScanReport>,
    /// Result of the initial bulk load, if one ran and fully succeeded.
    pub load: Option<BulkReport>,
    /// Scan and load failures. Startup continues past them.
    pub errors: Vec<ModuleError>,
}

impl StartupReport {
    /// Whether startup raised no module errors.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Builder for [`ModularHost`].
pub struct ModularHostBuilder {
    config: HostConfig,
    roots: Vec<PathBuf>,
    services: ServiceCollection,
    artifacts: Option<Arc<dyn ArtifactLoader>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    logging: bool,
}

impl ModularHostBuilder {
    fn new() -> Self {
        Self {
            config: HostConfig::default(),
            roots: Vec::new(),
            services: ServiceCollection::new(),
            artifacts: None,
            observers: Vec::new(),
            logging: false,
        }
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn with_config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a module root on top of the configured ones.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Register host services visible to every module.
    #[must_use]
    pub fn with_services(mut self, register: impl FnOnce(&mut ServiceCollection)) -> Self {
        register(&mut self.services);
        self
    }

    /// Load entry libraries through `loader`.
    #[must_use]
    pub fn with_artifact_loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self {
        self.artifacts = Some(loader);
        self
    }

    /// Register a lifecycle observer before the first scan.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Install a global subscriber from the `logging` section.
    ///
    /// An already installed subscriber is left in place.
    #[must_use]
    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    /// Build the host, then scan and load as configured.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`](crate::HostError) if logging cannot be configured or the loader
    /// cannot be registered. Scan and load failures do not fail the
    /// build; they are collected in [`ModularHost::startup`].
    pub async fn build(self) -> HostResult<ModularHost> {
        let Self {
            config,
            roots,
            mut services,
            artifacts,
            observers,
            logging,
        } = self;

        if logging {
            match setup_logging(&LogConfig::try_from(&config.logging)?) {
                Ok(()) => {},
                Err(TelemetryError::InitError(reason)) => {
                    debug!(reason, "Global subscriber already installed, keeping it");
                },
                Err(e) => return Err(e.into()),
            }
        }

        // The loader holds the provider, so the provider only gets a weak
        // link back. Disposal clears the cached singleton.
        let slot: Arc<OnceLock<Weak<ModuleLoader>>> = Arc::new(OnceLock::new());
        let factory_slot = Arc::clone(&slot);
        services.add_singleton::<ModuleLoader, _>(move |_| {
            factory_slot
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| anyhow::anyhow!("module loader is not available"))
        });
        let provider = services.build();

        let mut builder = ModuleLoader::builder()
            .with_host_services(Arc::new(provider.clone()) as Arc<dyn ServiceContainer>)
            .with_event_capacity(config.events.channel_capacity);
        for root in config.modules.roots.iter().chain(&roots) {
            builder = builder.with_root(root.clone());
        }
        if let Some(artifacts) = artifacts {
            builder = builder.with_artifact_loader(artifacts);
        }
        for observer in observers {
            builder = builder.with_observer(observer);
        }
        let loader = builder.build();
        if slot.set(Arc::downgrade(&loader)).is_err() {
            warn!("Module loader slot was already filled");
        }

        // Resolve once so the singleton is cached in the root provider.
        let registered = provider.require::<ModuleLoader>()?;
        debug_assert!(Arc::ptr_eq(&registered, &loader));

        let mut host = ModularHost {
            provider,
            loader,
            config,
            cancel: CancellationToken::new(),
            startup: StartupReport::default(),
        };
        host.start().await;
        Ok(host)
    }
}

impl fmt::Debug for ModularHostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModularHostBuilder")
            .field("config", &self.config)
            .field("roots", &self.roots)
            .field("services", &self.services.len())
            .field("observers", &self.observers.len())
            .field("logging", &self.logging)
            .finish_non_exhaustive()
    }
}

/// A running modular host.
///
/// Owns the root [`ServiceProvider`], in which `Arc<ModuleLoader>`
/// resolves as a singleton.
pub struct ModularHost {
    provider: ServiceProvider,
    loader: Arc<ModuleLoader>,
    config: HostConfig,
    cancel: CancellationToken,
    startup: StartupReport,
}

impl ModularHost {
    /// Start building a host.
    #[must_use]
    pub fn builder() -> ModularHostBuilder {
        ModularHostBuilder::new()
    }

    async fn start(&mut self) {
        if !self.config.modules.scan_on_start {
            info!("Module scan on start disabled");
            return;
        }

        match self.loader.scan().await {
            Ok(report) => self.startup.scan = Some(report),
            Err(e) => {
                warn!(error = %e, "Initial module scan reported failures");
                self.startup.errors.push(e);
            },
        }

        if self.config.modules.load_on_start {
            match self.loader.load_all(&self.cancel).await {
                Ok(report) => self.startup.load = Some(report),
                Err(e) => {
                    warn!(error = %e, "Initial module load reported failures");
                    self.startup.errors.push(e);
                },
            }
        }
        info!(
            modules = self.loader.modules().len(),
            loaded = self.loader.loaded_count(),
            "Modular host started"
        );
    }

    /// The root service provider.
    #[must_use]
    pub fn services(&self) -> &ServiceProvider {
        &self.provider
    }

    /// The module loader.
    #[must_use]
    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    /// The configuration the host was built with.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// What happened during startup.
    #[must_use]
    pub fn startup(&self) -> &StartupReport {
        &self.startup
    }

    /// Token that cancels loads started by the host.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Rescan roots and load whatever became loadable.
    ///
    /// # Errors
    ///
    /// Returns the first scan or load error. A scan error does not stop
    /// the load.
    pub async fn refresh(&self) -> HostResult<BulkReport> {
        let scanned = self.loader.scan().await;
        let loaded = self.loader.load_all(&self.cancel).await;
        scanned?;
        Ok(loaded?)
    }

    /// Cancel pending loads, unload every module and dispose host services.
    ///
    /// # Errors
    ///
    /// Returns the unload error if modules could not be unloaded, otherwise
    /// a disposal error from the root provider.
    pub async fn shutdown(self) -> HostResult<BulkReport> {
        info!("Shutting down modular host");
        self.cancel.cancel();
        let unloaded = self.loader.shutdown().await;
        let disposed = self.provider.dispose();
        let report = unloaded?;
        disposed?;
        Ok(report)
    }
}

impl fmt::Debug for ModularHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModularHost")
            .field("loader", &self.loader)
            .field("config", &self.config)
            .field("startup", &self.startup)
            .finish_non_exhaustive()
    }
}
