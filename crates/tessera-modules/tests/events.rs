//! Lifecycle notifications and managed modules.

use std::sync::Arc;

use semver::Version;
use tessera_di::ResolverExt;
use tessera_modules::{EntryType, ModuleEventKind, ModuleState};
use tessera_test::prelude::*;
use tessera_test::{FailingObserver, PanickingObserver};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn observers_see_the_full_lifecycle_in_order() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let recorder = RecordingObserver::new();
    tree.module("watched", &test_descriptor(1, "watched.module"));
    catalog.entry("watched", ProbeModule::new("watched", &log).entry_type("Watched"));

    let loader = tree
        .builder(&catalog)
        .with_observer(Arc::new(FailingObserver))
        .with_observer(Arc::new(PanickingObserver))
        .with_observer(recorder.observer())
        .build();
    assert_eq!(loader.events().observer_count(), 3);

    let id = test_module_id(1);
    loader.scan().await.unwrap();
    loader.load_all(&CancellationToken::new()).await.unwrap();
    loader.unload_all().await.unwrap();

    assert_eq!(
        recorder.kinds_for(id),
        [
            ModuleEventKind::Discovered,
            ModuleEventKind::Loading,
            ModuleEventKind::AssemblyLoaded,
            ModuleEventKind::Loaded,
            ModuleEventKind::Unloading,
            ModuleEventKind::Unloaded,
        ]
    );
    let assembly = recorder
        .events()
        .into_iter()
        .find(|e| e.kind == ModuleEventKind::AssemblyLoaded)
        .unwrap();
    assert_eq!(assembly.artifact.as_deref(), Some("watched.module"));
}

#[tokio::test]
async fn failed_loads_raise_no_loaded_event() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let recorder = RecordingObserver::new();
    tree.module("bad", &test_descriptor(1, "bad.module"));
    catalog.entry(
        "bad",
        ProbeModule::new("bad", &log)
            .failing_at(tessera_modules::HookStage::RegisterServices)
            .entry_type("Bad"),
    );

    let loader = tree.builder(&catalog).with_observer(recorder.observer()).build();
    loader.scan().await.unwrap();
    assert!(loader.load_all(&CancellationToken::new()).await.is_err());
    assert_eq!(
        recorder.kinds_for(test_module_id(1)),
        [
            ModuleEventKind::Discovered,
            ModuleEventKind::Loading,
            ModuleEventKind::AssemblyLoaded,
        ]
    );
}

#[tokio::test]
async fn subscribers_receive_events() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    tree.module("sub", &test_descriptor(1, "sub.module"));
    catalog.entry("sub", ProbeModule::new("sub", &log).entry_type("Sub"));

    let loader = tree.builder(&catalog).with_event_capacity(16).build();
    let mut receiver = loader.subscribe();
    loader.scan().await.unwrap();
    loader.load_all(&CancellationToken::new()).await.unwrap();

    let mut kinds = Vec::new();
    while let Some(event) = receiver.try_recv() {
        assert_eq!(event.module_id(), test_module_id(1));
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        [
            ModuleEventKind::Discovered,
            ModuleEventKind::Loading,
            ModuleEventKind::AssemblyLoaded,
            ModuleEventKind::Loaded,
        ]
    );
}

#[tokio::test]
async fn managed_modules_mix_with_directory_modules() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let recorder = RecordingObserver::new();

    tree.module(
        "plugin",
        &test_descriptor(2, "plugin.module")
            .with_dependency(test_module_id(1), Version::new(1, 0, 0)),
    );
    catalog.entry(
        "plugin",
        ProbeModule::new("plugin", &log).expecting("built in").entry_type("Plugin"),
    );

    let loader = tree.builder(&catalog).with_observer(recorder.observer()).build();
    loader.scan().await.unwrap();
    assert_eq!(loader.state(test_module_id(2)), Some(ModuleState::Unresolved));

    let builtin: EntryType = ProbeModule::new("builtin", &log)
        .providing("built in")
        .entry_type("Builtin");
    let context = loader
        .register_managed(test_descriptor(1, "builtin.module"), builtin)
        .await
        .unwrap();
    assert!(context.is_managed());
    assert!(context.directory().is_none());
    assert_eq!(loader.state(test_module_id(2)), Some(ModuleState::Loadable));

    let duplicate = loader
        .register_managed(
            test_descriptor(1, "builtin.module"),
            ProbeModule::new("again", &log).entry_type("Again"),
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(tessera_modules::ModuleError::DuplicateId { .. })
    ));

    let report = loader.load_all(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, vec![test_module_id(1), test_module_id(2)]);
    assert!(!context.has_boundary());
    assert_eq!(loader.resident_boundaries(), 1);
    assert_eq!(
        recorder.kinds_for(test_module_id(1)),
        [
            ModuleEventKind::Discovered,
            ModuleEventKind::Loading,
            ModuleEventKind::Loaded,
        ]
    );
    let greeting = loader
        .resolver(test_module_id(2))
        .unwrap()
        .require::<Greeting>()
        .unwrap();
    assert_eq!(greeting.0, "built in");

    // Managed modules survive rescans of the roots.
    loader.scan().await.unwrap();
    assert_eq!(loader.state(test_module_id(1)), Some(ModuleState::Loaded));
}

#[tokio::test]
async fn handles_track_their_module() {
    let log = ProbeLog::new();
    let loader = tessera_modules::ModuleLoader::builder().build();
    let context = loader
        .register_managed(
            test_descriptor(1, "solo.module"),
            ProbeModule::new("solo", &log).entry_type("Solo"),
        )
        .await
        .unwrap();
    let handle = context.handle();
    assert_eq!(handle.id(), test_module_id(1));
    assert_eq!(handle.state(), Some(ModuleState::Loadable));

    loader.load_all(&CancellationToken::new()).await.unwrap();
    assert_eq!(handle.state(), Some(ModuleState::Loaded));

    loader.shutdown().await.unwrap();
    drop(context);
    assert!(handle.upgrade().is_none());
    assert_eq!(handle.state(), None);
}
