//! Prelude module - commonly used types for convenient import.
//!
//! Use `use tessera_modules::prelude::*;` to import all essential types.

pub use crate::{
    BulkReport, EntryType, LifecycleObserver, ModuleContext, ModuleDescriptor, ModuleError,
    ModuleEvent, ModuleEventKind, ModuleId, ModuleLoader, ModuleMain, ModuleResult, ModuleState,
    ScanReport,
};
