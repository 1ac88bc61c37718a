use crate::common::{config, project, write, CountingStage};
use kiln::infrastructure::import_scanners;
use kiln::plugins::{default_registry, StatsPlugin};
use kiln::{Bundler, ChunkKind, ComponentRegistry, Contents, FailurePolicy, KilnError};
use std::sync::Arc;

const APP: &[(&str, &str)] = &[
    ("main.js", "const b = require('./b');\nrequire('./app.css');\nimport('./lazy');\n"),
    ("b.js", "module.exports = 'b';\n"),
    ("lazy.js", "const b = require('./b');\nmodule.exports = b + '!';\n"),
    ("app.css", "@import './theme.css';\nbody { background: url('./logo.png'); }\n"),
    ("theme.css", ":root { --accent: red; }\n"),
    ("logo.png", "PNG"),
];

#[tokio::test]
async fn test_app_build_with_defaults() {
    let (_dir, root) = project(APP);
    let bundler = Bundler::with_defaults(config(&root).with_outdir(root.join("dist"))).unwrap();

    let output = bundler.build().await.expect("build should succeed");

    assert_eq!(output.entries, vec![root.join("main.js")]);
    assert_eq!(output.stats.files, 6);
    assert!(output.issues.is_empty());

    // main and lazy both pull in b, which moves to a shared chunk
    let kinds: Vec<ChunkKind> = output.chunks.chunks.iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&ChunkKind::Entry));
    assert!(kinds.contains(&ChunkKind::Async));
    let shared = output
        .chunks
        .chunks
        .iter()
        .find(|c| c.kind == ChunkKind::Shared)
        .expect("b.js should be shared");
    assert!(shared.contains(&root.join("b.js")));
    assert_eq!(output.chunks.chunks_containing(&root.join("b.js")).count(), 1);

    // every chunk comes after the chunks it imports
    for (index, chunk) in output.chunks.chunks.iter().enumerate() {
        for import in &chunk.imports {
            assert!(output.chunks.position(import).unwrap() < index);
        }
    }

    let main_js = root.join("dist/main.js");
    let text = std::fs::read_to_string(&main_js).unwrap();
    assert!(text.contains("// kiln module loader runtime"));
    assert!(text.contains(r#"__kiln.register("main.js""#));
    assert!(root.join("dist/main.js.map").exists());
    assert!(root.join("dist/lazy.js").exists());
    assert!(root.join("dist/main.css").exists());
    assert_eq!(std::fs::read(root.join("dist/assets/logo.png")).unwrap(), b"PNG");

    let css = std::fs::read_to_string(root.join("dist/main.css")).unwrap();
    assert!(css.contains("--accent: red"));
}

#[tokio::test]
async fn test_warm_cache_skips_transforms_and_is_deterministic() {
    let (_dir, root) = project(APP);

    let first = {
        let bundler = Bundler::with_defaults(config(&root)).unwrap();
        let output = bundler.build().await.unwrap();
        assert!(bundler.stage_runs() > 0);
        bundler.flush_cache().unwrap();
        output
    };

    let bundler = Bundler::with_defaults(config(&root)).unwrap();
    assert!(bundler.cache().is_enabled());
    let second = bundler.build().await.unwrap();

    assert_eq!(bundler.stage_runs(), 0);
    assert_eq!(second.stats.cache_hits, second.stats.files);
    assert_eq!(
        serde_json::to_string(&first.chunks).unwrap(),
        serde_json::to_string(&second.chunks).unwrap()
    );
    assert_eq!(first.artifacts, second.artifacts);
}

#[tokio::test]
async fn test_content_change_misses_cache_for_that_file_only() {
    let (_dir, root) = project(APP);
    let stage = Arc::new(CountingStage::default());
    let build_config = config(&root);
    let mut registry = default_registry(&build_config).unwrap();
    registry.register(stage.component()).unwrap();
    let bundler = Bundler::new(build_config, registry).unwrap();

    bundler.build().await.unwrap();
    write(&root, "b.js", "module.exports = 'B';\n");
    let output = bundler.build().await.unwrap();

    assert_eq!(stage.runs_for(&root, "b.js"), 2);
    assert_eq!(stage.runs_for(&root, "main.js"), 1);
    assert_eq!(stage.runs_for(&root, "lazy.js"), 1);
    assert_eq!(output.stats.transformed, 1);
    assert_eq!(
        output.files[&root.join("b.js")].contents,
        Contents::Text("module.exports = 'B';\n".to_string())
    );
}

#[tokio::test]
async fn test_unresolvable_import_fails_build_and_reaches_reporters() {
    let (_dir, root) = project(&[("main.js", "require('./missing');\n")]);
    let stats = Arc::new(StatsPlugin::new(false));
    let mut registry = ComponentRegistry::new();
    for component in import_scanners().into_iter().chain(StatsPlugin::components(&stats)) {
        registry.register(component).unwrap();
    }
    let bundler = Bundler::new(config(&root).with_cache_enabled(false), registry).unwrap();

    let err = bundler.build().await.unwrap_err();

    assert!(matches!(err, KilnError::Resolution { ref request, .. } if request == "./missing"));
    assert_eq!(err.file_path(), Some(root.join("main.js").as_path()));
    assert_eq!(stats.error_count(), 1);
}

#[tokio::test]
async fn test_isolated_lazy_failure_keeps_entry_chunk() {
    let (_dir, root) = project(&[
        ("main.js", "require('./b');\nimport('./lazy');\n"),
        ("b.js", "module.exports = 1;\n"),
        ("lazy.js", "require('./gone');\n"),
    ]);
    let build_config = config(&root)
        .with_cache_enabled(false)
        .with_failure_policy(FailurePolicy::IsolateChunks);
    let bundler = Bundler::with_defaults(build_config).unwrap();

    let output = bundler.build().await.unwrap();

    assert_eq!(output.issues.len(), 1);
    assert_eq!(output.issues[0].error.file_path(), Some(root.join("lazy.js").as_path()));
    assert_eq!(output.chunks.len(), 1);
    assert!(output.chunks.chunks[0].contains(&root.join("b.js")));
}
