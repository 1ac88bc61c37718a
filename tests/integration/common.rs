use async_trait::async_trait;
use dashmap::DashMap;
use kiln::core::plugin::{ComponentHook, StageEffects, TransformHook, TransformInput, TransformOutput};
use kiln::{BuildConfig, Component, ComponentContext, Outcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Lay out a project; returns the temp dir and its canonical root
pub fn project(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    for (path, contents) in files {
        write(&root, path, contents);
    }
    (dir, root)
}

pub fn write(root: &Path, path: &str, contents: &str) {
    let target = root.join(path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(target, contents).unwrap();
}

pub fn config(root: &Path) -> BuildConfig {
    BuildConfig::new(root).with_entry("./main.js")
}

/// Counts transform invocations per path, optionally sleeping in each one
#[derive(Default)]
pub struct CountingStage {
    pub runs: DashMap<PathBuf, usize>,
    pub delay: Option<Duration>,
}

impl CountingStage {
    pub fn slow(delay: Duration) -> Self {
        Self {
            runs: DashMap::new(),
            delay: Some(delay),
        }
    }

    pub fn runs_for(&self, root: &Path, path: &str) -> usize {
        self.runs.get(&root.join(path)).map(|count| *count).unwrap_or(0)
    }

    pub fn component(self: &Arc<Self>) -> Component {
        Component::new("counting", "1.0.0", ComponentHook::Transform(self.clone()))
            .with_priority(500)
            .with_formats(&["script"])
    }
}

#[async_trait]
impl TransformHook for CountingStage {
    async fn transform(
        &self,
        input: TransformInput<'_>,
        _effects: &mut StageEffects,
        _ctx: &ComponentContext,
    ) -> Outcome<TransformOutput> {
        *self.runs.entry(input.path.to_path_buf()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Outcome::Skipped
    }
}
