//! Lifecycle notifications.
//!
//! Events go out on two channels: a broadcast channel for async receivers
//! and an ordered list of [`LifecycleObserver`]s awaited in registration
//! order. Both are best-effort. Observer errors and panics are logged and
//! never reach the operation that raised the event.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::context::ModuleContext;
use crate::id::ModuleId;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Which lifecycle step an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleEventKind {
    /// A new module directory or managed module was found.
    Discovered,
    /// A load started.
    Loading,
    /// The entry library was loaded into the boundary.
    AssemblyLoaded,
    /// A load finished.
    Loaded,
    /// An unload started.
    Unloading,
    /// An unload finished.
    Unloaded,
}

impl fmt::Display for ModuleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::AssemblyLoaded => "assembly_loaded",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
        })
    }
}

/// A lifecycle notification.
#[derive(Clone)]
pub struct ModuleEvent {
    kind: ModuleEventKind,
    module: Arc<ModuleContext>,
    artifact: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ModuleEvent {
    pub(crate) fn new(kind: ModuleEventKind, module: Arc<ModuleContext>) -> Self {
        Self {
            kind,
            module,
            artifact: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Event kind.
    #[must_use]
    pub fn kind(&self) -> ModuleEventKind {
        self.kind
    }

    /// The affected module.
    #[must_use]
    pub fn module(&self) -> &Arc<ModuleContext> {
        &self.module
    }

    /// Id of the affected module.
    #[must_use]
    pub fn module_id(&self) -> ModuleId {
        self.module.id()
    }

    /// Artifact file name, for [`ModuleEventKind::AssemblyLoaded`].
    #[must_use]
    pub fn artifact(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    /// When the event was raised.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl fmt::Debug for ModuleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEvent")
            .field("kind", &self.kind)
            .field("module_id", &self.module.id())
            .field("artifact", &self.artifact)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Receives lifecycle events in order.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// Handle one event. Errors are logged and otherwise ignored.
    async fn on_event(&self, event: &ModuleEvent) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Fan-out point for lifecycle events.
///
/// Clones share the channel and the observer list.
#[derive(Clone)]
pub struct ModuleEventBus {
    sender: broadcast::Sender<Arc<ModuleEvent>>,
    observers: Arc<RwLock<Vec<Arc<dyn LifecycleObserver>>>>,
    capacity: usize,
}

impl ModuleEventBus {
    /// A bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// A bus with the given broadcast capacity (at least 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            observers: Arc::new(RwLock::new(Vec::new())),
            capacity,
        }
    }

    /// Register an observer.
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        debug!(observer = observer.name(), "Lifecycle observer registered");
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Subscribe to the broadcast channel.
    #[must_use]
    pub fn subscribe(&self) -> ModuleEventReceiver {
        ModuleEventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Broadcast capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliver an event to receivers and observers.
    ///
    /// Returns the number of broadcast receivers reached.
    pub async fn publish(&self, event: ModuleEvent) -> usize {
        let event = Arc::new(event);
        trace!(event = %event.kind(), module_id = %event.module_id(), "Publishing module event");

        let count = self.sender.send(Arc::clone(&event)).unwrap_or(0);

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            match AssertUnwindSafe(observer.on_event(&event)).catch_unwind().await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(
                    observer = observer.name(),
                    event = %event.kind(),
                    module_id = %event.module_id(),
                    error = %e,
                    "Lifecycle observer failed"
                ),
                Err(_) => warn!(
                    observer = observer.name(),
                    event = %event.kind(),
                    module_id = %event.module_id(),
                    "Lifecycle observer panicked"
                ),
            }
        }
        count
    }
}

impl Default for ModuleEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEventBus")
            .field("capacity", &self.capacity)
            .field("receivers", &self.sender.receiver_count())
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Receiving end of the broadcast channel.
pub struct ModuleEventReceiver {
    receiver: broadcast::Receiver<Arc<ModuleEvent>>,
}

impl ModuleEventReceiver {
    /// Wait for the next event, skipping over any dropped by lag.
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<ModuleEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Module event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<ModuleEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Module event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

impl fmt::Debug for ModuleEventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEventReceiver")
            .field("pending", &self.receiver.len())
            .finish()
    }
}
