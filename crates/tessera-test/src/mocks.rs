//! Mock lifecycle observers.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tessera_modules::{LifecycleObserver, ModuleEvent, ModuleEventKind, ModuleId};

/// One event as seen by a [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Event kind.
    pub kind: ModuleEventKind,
    /// Affected module.
    pub module_id: ModuleId,
    /// Artifact file name, for assembly-loaded events.
    pub artifact: Option<String>,
}

/// Records every event it observes.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingObserver {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorder as a shareable observer.
    #[must_use]
    pub fn observer(&self) -> Arc<dyn LifecycleObserver> {
        Arc::new(self.clone())
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Kinds of the events raised for `id`, in order.
    #[must_use]
    pub fn kinds_for(&self, id: ModuleId) -> Vec<ModuleEventKind> {
        self.events()
            .into_iter()
            .filter(|e| e.module_id == id)
            .map(|e| e.kind)
            .collect()
    }

    /// Ids of the modules that raised `kind`, in order.
    #[must_use]
    pub fn modules_with(&self, kind: ModuleEventKind) -> Vec<ModuleId> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.module_id)
            .collect()
    }

    /// Forget every event.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl LifecycleObserver for RecordingObserver {
    async fn on_event(&self, event: &ModuleEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                kind: event.kind(),
                module_id: event.module_id(),
                artifact: event.artifact().map(ToString::to_string),
            });
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Fails on every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingObserver;

#[async_trait]
impl LifecycleObserver for FailingObserver {
    async fn on_event(&self, event: &ModuleEvent) -> anyhow::Result<()> {
        anyhow::bail!("refusing {} event", event.kind())
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Panics on every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingObserver;

#[async_trait]
impl LifecycleObserver for PanickingObserver {
    async fn on_event(&self, event: &ModuleEvent) -> anyhow::Result<()> {
        panic!("observer panicked on {} event", event.kind())
    }

    fn name(&self) -> &str {
        "panicking"
    }
}
