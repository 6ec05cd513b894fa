//! Prelude module - commonly used test utilities.
//!
//! Use `use tessera_test::prelude::*;` in integration tests.

pub use crate::{
    Greeting, ModuleTree, ProbeLog, ProbeModule, RecordingObserver, TestCatalog, init_test_logging,
    test_descriptor, test_module_id,
};
