//! Scanning module roots and reacting to descriptor changes.

use semver::Version;
use tessera_modules::{ModuleError, ModuleState};
use tessera_test::prelude::*;
use tokio_util::sync::CancellationToken;

fn configuration_failures(
    result: Result<tessera_modules::ScanReport, ModuleError>,
) -> Vec<ModuleError> {
    match result {
        Err(ModuleError::Configuration { failures }) => {
            failures.into_iter().map(|f| f.error).collect()
        },
        other => panic!("expected configuration failure, got {other:?}"),
    }
}

#[tokio::test]
async fn scan_skips_directories_without_descriptor() {
    init_test_logging();
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.module("real", &test_descriptor(1, "real.module"));
    tree.write("assets", "readme.txt", b"not a module");
    std::fs::write(tree.root().join("loose.json"), "{}").unwrap();

    let loader = tree.loader(&catalog);
    let report = loader.scan().await.unwrap();
    assert_eq!(report.discovered, vec![test_module_id(1)]);
    assert_eq!(loader.modules().len(), 1);

    let context = loader.module(test_module_id(1)).unwrap();
    assert_eq!(context.state(), ModuleState::Loadable);
    assert_eq!(context.directory(), Some(tree.path("real").as_path()));
    assert!(context.descriptor_modified().is_some());

    // A second scan with nothing changed reports nothing.
    let again = loader.scan().await.unwrap();
    assert!(again.discovered.is_empty());
    assert!(again.updated.is_empty());
    assert!(again.removed.is_empty());
}

#[tokio::test]
async fn broken_descriptors_do_not_stop_the_scan() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.module("good", &test_descriptor(1, "good.module"));
    tree.write_raw_descriptor("garbled", "{ not json");
    tree.write_raw_descriptor(
        "nil-id",
        r#"{
            "id": "00000000-0000-0000-0000-000000000000",
            "entry_library": "x.module",
            "dependencies": []
        }"#,
    );
    tree.write_raw_descriptor(
        "escape",
        &format!(
            r#"{{"id": "{}", "entry_library": "../outside.module", "dependencies": []}}"#,
            test_module_id(4)
        ),
    );
    tree.write_raw_descriptor(
        "four-part",
        &format!(
            r#"{{
                "id": "{}",
                "entry_library": "v.module",
                "dependencies": [],
                "version": "1.2.3.4"
            }}"#,
            test_module_id(5)
        ),
    );

    let loader = tree.loader(&catalog);
    let errors = configuration_failures(loader.scan().await);
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|e| matches!(
        e,
        ModuleError::ConfigParse { .. } | ModuleError::ConfigInvalid { .. }
    )));
    assert!(errors.iter().any(|e| matches!(
        e,
        ModuleError::ConfigInvalid { field: "entry_library", .. }
    )));

    assert_eq!(loader.modules().len(), 1);
    assert_eq!(loader.state(test_module_id(1)), Some(ModuleState::Loadable));
}

#[tokio::test]
async fn short_versions_are_padded() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.write_raw_descriptor(
        "short",
        &format!(
            r#"{{"id": "{}", "entry_library": "s.module", "dependencies": [], "version": "2.1"}}"#,
            test_module_id(1)
        ),
    );

    let loader = tree.loader(&catalog);
    loader.scan().await.unwrap();
    let context = loader.module(test_module_id(1)).unwrap();
    assert_eq!(context.descriptor().version, Version::new(2, 1, 0));
}

#[tokio::test]
async fn duplicate_ids_keep_the_first_directory() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.module("first", &test_descriptor(1, "first.module"));
    tree.module("second", &test_descriptor(1, "second.module"));

    let loader = tree.loader(&catalog);
    let errors = configuration_failures(loader.scan().await);
    match errors.as_slice() {
        [ModuleError::DuplicateId { id, directory, .. }] => {
            assert_eq!(*id, test_module_id(1));
            assert_eq!(directory, &tree.path("second"));
        },
        other => panic!("unexpected failures: {other:?}"),
    }
    let context = loader.module(test_module_id(1)).unwrap();
    assert_eq!(context.directory(), Some(tree.path("first").as_path()));
}

#[tokio::test]
async fn several_roots_are_scanned() {
    let first = ModuleTree::new();
    let second = ModuleTree::new();
    let catalog = TestCatalog::new();
    first.module("one", &test_descriptor(1, "one.module"));
    second.module(
        "two",
        &test_descriptor(2, "two.module").with_dependency(test_module_id(1), Version::new(1, 0, 0)),
    );

    let loader = first.loader(&catalog);
    loader.add_root(second.root());
    loader.add_root(second.root());
    assert_eq!(loader.roots().len(), 2);

    let report = loader.scan().await.unwrap();
    assert_eq!(report.discovered.len(), 2);
    assert_eq!(loader.dependencies_of(test_module_id(2)), vec![test_module_id(1)]);
    assert_eq!(loader.dependants_of(test_module_id(1)), vec![test_module_id(2)]);
}

#[tokio::test]
async fn unreadable_root_keeps_its_modules() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.module("kept", &test_descriptor(1, "kept.module"));
    let loader = tree.loader(&catalog);
    loader.add_root(tree.root().join("does-not-exist"));

    let errors = configuration_failures(loader.scan().await);
    assert!(matches!(errors.as_slice(), [ModuleError::RootUnreadable { .. }]));
    assert!(loader.module(test_module_id(1)).is_some());
}

#[tokio::test]
async fn rescan_applies_changes_to_unloaded_modules() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.module("mod", &test_descriptor(1, "mod.module"));
    let loader = tree.loader(&catalog);
    loader.scan().await.unwrap();

    // Never loaded, so everything but the id may change.
    tree.module(
        "mod",
        &test_descriptor(1, "renamed.module")
            .with_version(Version::new(1, 1, 0))
            .with_unload_disabled(true),
    );
    let report = loader.scan().await.unwrap();
    assert_eq!(report.updated, vec![test_module_id(1)]);
    let descriptor = loader.module(test_module_id(1)).unwrap().descriptor();
    assert_eq!(descriptor.entry_library, "renamed.module");
    assert_eq!(descriptor.version, Version::new(1, 1, 0));

    tree.write_descriptor("mod", &test_descriptor(9, "renamed.module"));
    let errors = configuration_failures(loader.scan().await);
    assert!(matches!(errors.as_slice(), [ModuleError::IdChanged { .. }]));
    assert!(loader.module(test_module_id(1)).is_some());
    assert!(loader.module(test_module_id(9)).is_none());
}

#[tokio::test]
async fn rescan_rejects_changes_to_loaded_modules() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    tree.module("base", &test_descriptor(1, "base.module"));
    tree.module("live", &test_descriptor(2, "live.module"));
    catalog.entry("base", ProbeModule::new("base", &log).entry_type("Base"));
    catalog.entry("live", ProbeModule::new("live", &log).entry_type("Live"));

    let loader = tree.loader(&catalog);
    loader.scan().await.unwrap();
    loader.load_all(&CancellationToken::new()).await.unwrap();
    let id = test_module_id(2);

    tree.write_descriptor(
        "live",
        &test_descriptor(2, "live.module").with_version(Version::new(2, 0, 0)),
    );
    let errors = configuration_failures(loader.scan().await);
    assert!(matches!(
        errors.as_slice(),
        [ModuleError::VersionChanged { old, new, .. }]
            if *old == Version::new(1, 0, 0) && *new == Version::new(2, 0, 0)
    ));

    tree.write_descriptor(
        "live",
        &test_descriptor(2, "live.module")
            .with_dependency(test_module_id(1), Version::new(1, 0, 0)),
    );
    let errors = configuration_failures(loader.scan().await);
    assert!(matches!(errors.as_slice(), [ModuleError::DependenciesChanged(_)]));
    assert_eq!(loader.module(id).unwrap().descriptor().version, Version::new(1, 0, 0));

    // Once unloaded, version and dependencies may move again, but the
    // entry library is fixed for good.
    loader.unload_module(id).await.unwrap();
    tree.write_descriptor("live", &test_descriptor(2, "other.module"));
    let errors = configuration_failures(loader.scan().await);
    assert!(matches!(errors.as_slice(), [ModuleError::EntryLibraryChanged(_)]));

    tree.write_descriptor(
        "live",
        &test_descriptor(2, "live.module").with_version(Version::new(2, 0, 0)),
    );
    let report = loader.scan().await.unwrap();
    assert_eq!(report.updated, vec![id]);
    loader.load_module(id, &CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn removed_directories_drop_unloaded_modules_only() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    tree.module("gone", &test_descriptor(1, "gone.module"));
    tree.module("busy", &test_descriptor(2, "busy.module"));
    catalog.entry("busy", ProbeModule::new("busy", &log).entry_type("Busy"));

    let loader = tree.loader(&catalog);
    loader.scan().await.unwrap();
    let gone = loader.module(test_module_id(1)).unwrap();
    loader
        .load_module(test_module_id(2), &CancellationToken::new())
        .await
        .unwrap();

    tree.remove_descriptor("gone");
    tree.remove_descriptor("busy");
    let report = loader.scan().await.unwrap();
    assert_eq!(report.removed, vec![test_module_id(1)]);
    assert!(gone.is_disposed());
    assert!(loader.module(test_module_id(1)).is_none());
    assert_eq!(loader.state(test_module_id(2)), Some(ModuleState::Loaded));

    // Directory is back with a new descriptor: a fresh context.
    tree.write_descriptor("gone", &test_descriptor(1, "gone.module"));
    let report = loader.scan().await.unwrap();
    assert_eq!(report.discovered, vec![test_module_id(1)]);
    assert!(!loader.module(test_module_id(1)).unwrap().is_disposed());
}

#[tokio::test]
async fn dependants_become_unresolved_when_a_dependency_disappears() {
    let tree = ModuleTree::new();
    let catalog = TestCatalog::new();
    tree.module("lib", &test_descriptor(1, "lib.module"));
    tree.module(
        "app",
        &test_descriptor(2, "app.module").with_dependency(test_module_id(1), Version::new(1, 0, 0)),
    );
    let loader = tree.loader(&catalog);
    loader.scan().await.unwrap();
    assert_eq!(loader.state(test_module_id(2)), Some(ModuleState::Loadable));

    tree.remove_descriptor("lib");
    let report = loader.scan().await.unwrap();
    assert_eq!(report.removed, vec![test_module_id(1)]);
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(loader.state(test_module_id(2)), Some(ModuleState::Unresolved));

    tree.write_descriptor("lib", &test_descriptor(1, "lib.module"));
    let report = loader.scan().await.unwrap();
    assert!(report.unresolved.is_empty());
    assert_eq!(loader.state(test_module_id(2)), Some(ModuleState::Loadable));
}
