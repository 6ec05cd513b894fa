//! Probe entry types that record what the host did to them.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tessera_di::{Constructor, Resolver, ResolverExt, ServiceCollection};
use tessera_modules::{EntryType, HookStage, ModuleHandle, ModuleId, ModuleMain};
use tokio_util::sync::CancellationToken;

/// A service probes register and consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting(pub String);

/// Ordered record of probe activity, shared between probes.
#[derive(Debug, Clone, Default)]
pub struct ProbeLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ProbeLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Every entry so far.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries that start with `label:`.
    #[must_use]
    pub fn entries_for(&self, label: &str) -> Vec<String> {
        let prefix = format!("{label}:");
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(&prefix))
            .collect()
    }

    /// Whether `entry` was recorded.
    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A configurable entry type.
///
/// Every hook logs `"{label}:{hook}"` to the shared [`ProbeLog`]. Built
/// instances also log `"{label}:construct"` and `"{label}:drop"`.
#[derive(Clone)]
pub struct ProbeModule {
    label: String,
    log: ProbeLog,
    provides: Option<String>,
    expects: Option<String>,
    fail_at: Option<HookStage>,
    stall: bool,
    live: Arc<AtomicUsize>,
}

impl ProbeModule {
    /// A probe that does nothing but log.
    #[must_use]
    pub fn new(label: impl Into<String>, log: &ProbeLog) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
            provides: None,
            expects: None,
            fail_at: None,
            stall: false,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a [`Greeting`] with `text`.
    #[must_use]
    pub fn providing(mut self, text: impl Into<String>) -> Self {
        self.provides = Some(text.into());
        self
    }

    /// Require a [`Greeting`] with `text` during `configure`.
    #[must_use]
    pub fn expecting(mut self, text: impl Into<String>) -> Self {
        self.expects = Some(text.into());
        self
    }

    /// Fail at `stage`.
    #[must_use]
    pub fn failing_at(mut self, stage: HookStage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Never finish `configure`.
    #[must_use]
    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Number of instances currently alive.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Entry type named `type_name` with a parameterless constructor.
    #[must_use]
    pub fn entry_type(&self, type_name: impl Into<String>) -> EntryType {
        let probe = self.clone();
        EntryType::new(type_name)
            .with_constructor(Constructor::new("ProbeModule", move |_| probe.instantiate()))
    }

    /// Entry type whose constructor takes the module id and handle, and
    /// logs `"{label}:id={id}"`.
    #[must_use]
    pub fn injected_entry_type(&self, type_name: impl Into<String>) -> EntryType {
        let probe = self.clone();
        EntryType::new(type_name).with_constructor(
            Constructor::new("ProbeModule", move |args| {
                let id = args.required::<ModuleId>(0)?;
                let handle = args.required::<ModuleHandle>(1)?;
                anyhow::ensure!(handle.id() == *id, "handle does not match module id");
                probe.log.push(format!("{}:id={id}", probe.label));
                probe.instantiate()
            })
            .param::<ModuleId>()
            .param::<ModuleHandle>(),
        )
    }

    /// Entry type whose constructor requires a `T` and a [`Greeting`].
    #[must_use]
    pub fn requiring<T: Send + Sync + 'static>(&self, type_name: impl Into<String>) -> EntryType {
        let probe = self.clone();
        EntryType::new(type_name).with_constructor(
            Constructor::new("ProbeModule", move |args| {
                args.required::<T>(0)?;
                let greeting = args.required::<Greeting>(1)?;
                probe.log.push(format!("{}:greeted={}", probe.label, greeting.0));
                probe.instantiate()
            })
            .param::<T>()
            .param::<Greeting>(),
        )
    }

    fn instantiate(&self) -> anyhow::Result<ProbeInstance> {
        if self.fail_at == Some(HookStage::Construct) {
            anyhow::bail!("{} refused to construct", self.label);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("{}:construct", self.label));
        Ok(ProbeInstance {
            probe: self.clone(),
        })
    }
}

impl fmt::Debug for ProbeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeModule")
            .field("label", &self.label)
            .field("fail_at", &self.fail_at)
            .field("stall", &self.stall)
            .field("live", &self.live_instances())
            .finish_non_exhaustive()
    }
}

/// An entry object built from a [`ProbeModule`].
pub struct ProbeInstance {
    probe: ProbeModule,
}

impl ProbeInstance {
    fn record(&self, hook: &str) {
        self.probe.log.push(format!("{}:{hook}", self.probe.label));
    }
}

#[async_trait]
impl ModuleMain for ProbeInstance {
    async fn register_services(
        &self,
        services: &mut ServiceCollection,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.record("register");
        if self.probe.fail_at == Some(HookStage::RegisterServices) {
            anyhow::bail!("{} refused to register services", self.probe.label);
        }
        if let Some(text) = &self.probe.provides {
            services.add_instance(Arc::new(Greeting(text.clone())));
        }
        Ok(())
    }

    async fn configure(
        &self,
        resolver: Arc<dyn Resolver>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.record("configure");
        if self.probe.stall {
            std::future::pending::<()>().await;
        }
        if self.probe.fail_at == Some(HookStage::Configure) {
            anyhow::bail!("{} refused to configure", self.probe.label);
        }
        if let Some(expected) = &self.probe.expects {
            let greeting = resolver.require::<Greeting>()?;
            anyhow::ensure!(
                greeting.0 == *expected,
                "expected greeting '{expected}', got '{}'",
                greeting.0
            );
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.record("teardown");
        Ok(())
    }
}

impl Drop for ProbeInstance {
    fn drop(&mut self) {
        self.record("drop");
        self.probe.live.fetch_sub(1, Ordering::SeqCst);
    }
}
