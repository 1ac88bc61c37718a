use crate::common::{config, project, write, CountingStage};
use kiln::core::interfaces::LiveUpdateMessage;
use kiln::infrastructure::HmrBroadcaster;
use kiln::plugins::default_registry;
use kiln::{BuildConfig, Bundler, ChangeEvent, Contents, CoordinatorState, RebuildCoordinator, RebuildOutcome};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const GRAPH: &[(&str, &str)] = &[
    ("main.js", "require('./a');\nrequire('./z');\n"),
    ("a.js", "module.exports = require('./b');\n"),
    ("b.js", "module.exports = 1;\n"),
    ("z.js", "module.exports = 'z';\n"),
];

fn coordinator(build_config: BuildConfig, stage: &Arc<CountingStage>) -> RebuildCoordinator {
    let mut registry = default_registry(&build_config).unwrap();
    registry.register(stage.component()).unwrap();
    RebuildCoordinator::new(Arc::new(Bundler::new(build_config, registry).unwrap()))
}

fn text(root: &Path, coordinator: &RebuildCoordinator, path: &str) -> Contents {
    coordinator.last_good().unwrap().files[&root.join(path)].contents.clone()
}

#[tokio::test]
async fn test_modified_file_rebuilds_only_its_dependents() {
    let (_dir, root) = project(GRAPH);
    let stage = Arc::new(CountingStage::default());
    let broadcaster = HmrBroadcaster::new(64);
    let mut updates = broadcaster.subscribe();
    let coordinator = coordinator(config(&root), &stage).with_channel(Arc::new(broadcaster.clone()));

    coordinator.initial_build().await.unwrap();
    write(&root, "b.js", "module.exports = 2;\n");
    let outcome = coordinator.notify(vec![ChangeEvent::modify(root.join("b.js"))]).await.unwrap();

    let RebuildOutcome::Rebuilt(change_set) = outcome else {
        panic!("expected a rebuild, got {:?}", outcome);
    };
    assert_eq!(change_set.changed_paths, vec![root.join("b.js")]);

    // b is transformed again, a is invalidated but served from the cache,
    // z is never touched
    assert_eq!(stage.runs_for(&root, "b.js"), 2);
    assert_eq!(stage.runs_for(&root, "a.js"), 1);
    assert_eq!(stage.runs_for(&root, "z.js"), 1);
    let stats = coordinator.last_good().unwrap().stats.clone();
    assert_eq!(stats.transformed, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.cache_hits, 2);

    assert_eq!(
        updates.recv().await.unwrap(),
        LiveUpdateMessage::Changed {
            changed_paths: vec![root.join("b.js")]
        }
    );
    assert_eq!(
        updates.recv().await.unwrap(),
        LiveUpdateMessage::Update {
            file_path: root.join("b.js"),
            contents: "module.exports = 2;\n".to_string(),
        }
    );
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn test_events_during_a_rebuild_are_coalesced() {
    let (_dir, root) = project(GRAPH);
    let stage = Arc::new(CountingStage::slow(Duration::from_millis(100)));
    let coordinator = coordinator(config(&root).with_cache_enabled(false), &stage);
    coordinator.initial_build().await.unwrap();

    write(&root, "b.js", "module.exports = 2;\n");
    let (first, second, third) = tokio::join!(
        coordinator.notify(vec![ChangeEvent::modify(root.join("b.js"))]),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            write(&root, "z.js", "module.exports = 'zz';\n");
            coordinator.notify(vec![ChangeEvent::modify(root.join("z.js"))]).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            coordinator.notify(vec![ChangeEvent::modify(root.join("z.js"))]).await
        },
    );

    assert_eq!(second.unwrap(), RebuildOutcome::Coalesced);
    assert_eq!(third.unwrap(), RebuildOutcome::Coalesced);
    let RebuildOutcome::Rebuilt(change_set) = first.unwrap() else {
        panic!("the first notify should run the rebuilds");
    };
    assert_eq!(change_set.changed_paths, vec![root.join("b.js"), root.join("z.js")]);

    // both queued events were applied in one follow-up rebuild
    assert_eq!(coordinator.rebuild_count(), 2);
    assert_eq!(stage.runs_for(&root, "z.js"), 2);
    assert_eq!(text(&root, &coordinator, "z.js"), Contents::from("module.exports = 'zz';\n"));
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_output() {
    let (_dir, root) = project(GRAPH);
    let stage = Arc::new(CountingStage::default());
    let broadcaster = HmrBroadcaster::new(64);
    let mut updates = broadcaster.subscribe();
    let coordinator = coordinator(config(&root), &stage).with_channel(Arc::new(broadcaster.clone()));
    coordinator.initial_build().await.unwrap();

    write(&root, "b.js", "module.exports = require('./nope');\n");
    let result = coordinator.notify(vec![ChangeEvent::modify(root.join("b.js"))]).await;

    assert!(result.is_err());
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert!(coordinator.last_error().is_some());
    assert_eq!(text(&root, &coordinator, "b.js"), Contents::from("module.exports = 1;\n"));
    assert!(matches!(updates.recv().await.unwrap(), LiveUpdateMessage::Error { .. }));

    // an unrelated event still rebuilds b: the failed invalidation carries over
    write(&root, "b.js", "module.exports = 3;\n");
    write(&root, "z.js", "module.exports = 'z2';\n");
    let outcome = coordinator.notify(vec![ChangeEvent::modify(root.join("z.js"))]).await.unwrap();

    assert!(matches!(outcome, RebuildOutcome::Rebuilt(_)));
    assert!(coordinator.last_error().is_none());
    assert_eq!(text(&root, &coordinator, "b.js"), Contents::from("module.exports = 3;\n"));
}

#[tokio::test]
async fn test_fix_saved_during_a_failing_rebuild_is_applied() {
    let (_dir, root) = project(GRAPH);
    let stage = Arc::new(CountingStage::slow(Duration::from_millis(100)));
    let coordinator = coordinator(config(&root).with_cache_enabled(false), &stage);
    coordinator.initial_build().await.unwrap();

    write(&root, "b.js", "module.exports = require('./nope');\n");
    let (first, second) = tokio::join!(
        coordinator.notify(vec![ChangeEvent::modify(root.join("b.js"))]),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            write(&root, "b.js", "module.exports = 3;\n");
            coordinator.notify(vec![ChangeEvent::modify(root.join("b.js"))]).await
        },
    );

    assert_eq!(second.unwrap(), RebuildOutcome::Coalesced);
    let RebuildOutcome::Rebuilt(change_set) = first.unwrap() else {
        panic!("the queued fix should be rebuilt after the failure");
    };
    assert_eq!(change_set.changed_paths, vec![root.join("b.js")]);

    assert_eq!(coordinator.rebuild_count(), 2);
    assert!(coordinator.last_error().is_none());
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(text(&root, &coordinator, "b.js"), Contents::from("module.exports = 3;\n"));
}

#[tokio::test]
async fn test_rename_is_delete_then_add() {
    let (_dir, root) = project(GRAPH);
    let stage = Arc::new(CountingStage::default());
    let coordinator = coordinator(config(&root), &stage);
    coordinator.initial_build().await.unwrap();

    std::fs::rename(root.join("b.js"), root.join("c.js")).unwrap();
    write(&root, "a.js", "module.exports = require('./c');\n");
    let outcome = coordinator
        .notify(vec![
            ChangeEvent::rename(root.join("b.js"), root.join("c.js")),
            ChangeEvent::modify(root.join("a.js")),
        ])
        .await
        .unwrap();

    let RebuildOutcome::Rebuilt(change_set) = outcome else {
        panic!("expected a rebuild");
    };
    assert_eq!(
        change_set.changed_paths,
        vec![root.join("a.js"), root.join("b.js"), root.join("c.js")]
    );
    let files = &coordinator.last_good().unwrap().files;
    assert!(files.contains_key(&root.join("c.js")));
    assert!(!files.contains_key(&root.join("b.js")));
}

#[tokio::test]
async fn test_unrelated_add_is_skipped() {
    let (_dir, root) = project(GRAPH);
    let stage = Arc::new(CountingStage::default());
    let coordinator = coordinator(config(&root), &stage);
    coordinator.initial_build().await.unwrap();

    write(&root, "notes.js", "module.exports = 0;\n");
    let outcome = coordinator.notify(vec![ChangeEvent::add(root.join("notes.js"))]).await.unwrap();

    assert_eq!(outcome, RebuildOutcome::Skipped);
    assert_eq!(coordinator.rebuild_count(), 0);
}
