//! Host bootstrap over a temporary module tree.

use std::sync::Arc;

use semver::Version;
use tessera_config::HostConfig;
use tessera_di::{DiError, ResolverExt};
use tessera_host::ModularHost;
use tessera_modules::{ModuleError, ModuleLoader, ModuleState};
use tessera_test::prelude::*;

struct Clock;

fn tree_with_chain(catalog: &TestCatalog, log: &ProbeLog) -> ModuleTree {
    let tree = ModuleTree::new();
    tree.module("core", &test_descriptor(1, "core.module"));
    tree.module(
        "app",
        &test_descriptor(2, "app.module")
            .with_dependency(test_module_id(1), Version::new(1, 0, 0)),
    );
    catalog.entry(
        "core",
        ProbeModule::new("core", log)
            .providing("hello")
            .entry_type("Core"),
    );
    catalog.entry("app", ProbeModule::new("app", log).requiring::<Clock>("App"));
    tree
}

#[tokio::test]
async fn loader_resolves_from_root_provider() {
    init_test_logging();
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let tree = tree_with_chain(&catalog, &log);

    let host = ModularHost::builder()
        .with_root(tree.root())
        .with_artifact_loader(catalog.loader())
        .with_services(|services| {
            services.add_instance(Arc::new(Clock));
        })
        .build()
        .await
        .unwrap();

    assert!(host.startup().is_clean(), "{:?}", host.startup().errors);
    let resolved = host.services().require::<ModuleLoader>().unwrap();
    assert!(Arc::ptr_eq(&resolved, host.loader()));
    assert!(Arc::ptr_eq(
        &resolved,
        &host.services().require::<ModuleLoader>().unwrap()
    ));

    assert_eq!(
        host.startup().load.as_ref().unwrap().processed,
        vec![test_module_id(1), test_module_id(2)]
    );
    assert!(log.contains("app:greeted=hello"));
    drop(resolved);

    let services = host.services().clone();
    let loader = Arc::downgrade(host.loader());
    let report = host.shutdown().await.unwrap();
    assert_eq!(report.processed, vec![test_module_id(2), test_module_id(1)]);
    assert!(log.contains("core:teardown"));

    // Nothing keeps the loader alive once the host is gone.
    assert!(loader.upgrade().is_none());
    assert!(matches!(
        services.require::<ModuleLoader>(),
        Err(DiError::Disposed)
    ));
}

#[tokio::test]
async fn modules_can_resolve_the_loader_itself() {
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let tree = ModuleTree::new();
    tree.module("admin", &test_descriptor(1, "admin.module"));
    catalog.entry(
        "admin",
        ProbeModule::new("admin", &log).requiring::<ModuleLoader>("Admin"),
    );
    tree.module("greeter", &test_descriptor(2, "greeter.module"));
    catalog.entry(
        "greeter",
        ProbeModule::new("greeter", &log)
            .providing("hi")
            .entry_type("Greeter"),
    );

    let host = ModularHost::builder()
        .with_root(tree.root())
        .with_artifact_loader(catalog.loader())
        .build()
        .await
        .unwrap();

    // Admin needs a Greeting it does not depend on, so only the loader resolves.
    match host.startup().errors.as_slice() {
        [ModuleError::Bulk { failures, .. }] => {
            assert_eq!(failures.len(), 1);
            match &failures[0].error {
                ModuleError::UnresolvedParameters { parameters, .. } => {
                    let positions: Vec<usize> = parameters.iter().map(|p| p.position).collect();
                    assert_eq!(positions, vec![1]);
                },
                other => panic!("unexpected error: {other}"),
            }
        },
        other => panic!("unexpected startup errors: {other:?}"),
    }
    assert_eq!(host.loader().state(test_module_id(2)), Some(ModuleState::Loaded));
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn config_controls_startup() {
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let tree = tree_with_chain(&catalog, &log);

    let mut config = HostConfig::default();
    config.modules.roots = vec![tree.root().to_path_buf()];
    config.modules.load_on_start = false;
    config.events.channel_capacity = 8;

    let host = ModularHost::builder()
        .with_config(config)
        .with_artifact_loader(catalog.loader())
        .with_services(|services| {
            services.add_instance(Arc::new(Clock));
        })
        .build()
        .await
        .unwrap();

    assert_eq!(host.startup().scan.as_ref().unwrap().discovered.len(), 2);
    assert!(host.startup().load.is_none());
    assert_eq!(host.loader().loaded_count(), 0);
    assert_eq!(host.loader().events().capacity(), 8);

    let report = host.refresh().await.unwrap();
    assert_eq!(report.processed.len(), 2);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn scan_disabled_leaves_roots_untouched() {
    let catalog = TestCatalog::new();
    let log = ProbeLog::new();
    let tree = tree_with_chain(&catalog, &log);

    let mut config = HostConfig::default();
    config.modules.scan_on_start = false;
    config.modules.load_on_start = false;

    let host = ModularHost::builder()
        .with_config(config)
        .with_root(tree.root())
        .with_artifact_loader(catalog.loader())
        .build()
        .await
        .unwrap();
    assert!(host.startup().scan.is_none());
    assert!(host.loader().modules().is_empty());
    assert_eq!(host.loader().roots(), vec![tree.root().to_path_buf()]);
}

#[tokio::test]
async fn broken_modules_do_not_stop_the_host() {
    let catalog = TestCatalog::new();
    let tree = ModuleTree::new();
    tree.write_raw_descriptor("broken", "{");

    let host = ModularHost::builder()
        .with_root(tree.root())
        .with_artifact_loader(catalog.loader())
        .build()
        .await
        .unwrap();
    assert!(matches!(
        host.startup().errors.as_slice(),
        [ModuleError::Configuration { .. }]
    ));
    assert!(host.startup().load.is_some());
}
