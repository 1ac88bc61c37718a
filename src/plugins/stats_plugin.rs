// Stats Plugin: Collects reported issues and logs artifact summaries

use crate::core::models::{Artifact, Issue, Severity};
use crate::core::plugin::{Component, ComponentContext, ComponentHook, Outcome, PostGenerateHook, ReportHook};
use crate::utils::Logger;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

pub const STATS: &str = "stats";

/// Records every reported issue and, after generation, the size of each
/// artifact. One instance backs two components (report and post-generate)
/// that share its state.
///
/// # Example
/// ```
/// use kiln::plugins::StatsPlugin;
/// use kiln::core::plugin::ComponentRegistry;
/// use std::sync::Arc;
///
/// let stats = Arc::new(StatsPlugin::new(true)); // verbose = true
/// let mut registry = ComponentRegistry::new();
/// for component in StatsPlugin::components(&stats) {
///     registry.register(component).unwrap();
/// }
/// ```
pub struct StatsPlugin {
    verbose: bool,
    issues: Mutex<Vec<Issue>>,
    artifact_bytes: Mutex<Vec<(String, usize)>>,
}

impl StatsPlugin {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            issues: Mutex::new(Vec::new()),
            artifact_bytes: Mutex::new(Vec::new()),
        }
    }

    pub fn components(plugin: &Arc<Self>) -> Vec<Component> {
        vec![
            Component::new(STATS, env!("CARGO_PKG_VERSION"), ComponentHook::Report(plugin.clone())),
            // after every other post-generate step so sizes are final
            Component::new(STATS, env!("CARGO_PKG_VERSION"), ComponentHook::PostGenerate(plugin.clone()))
                .with_priority(i32::MAX),
        ]
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.issues.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .lock()
            .iter()
            .filter(|issue| issue.severity == Severity::Error)
            .count()
    }

    /// Artifact path and byte size from the most recent build
    pub fn artifact_sizes(&self) -> Vec<(String, usize)> {
        self.artifact_bytes.lock().clone()
    }

    pub fn clear(&self) {
        self.issues.lock().clear();
        self.artifact_bytes.lock().clear();
    }
}

impl ReportHook for StatsPlugin {
    fn report(&self, issue: &Issue) {
        if self.verbose {
            Logger::debug(&format!("📊 Stats Plugin: {:?} recorded", issue.severity));
        }
        self.issues.lock().push(issue.clone());
    }
}

#[async_trait]
impl PostGenerateHook for StatsPlugin {
    async fn post_generate(&self, artifacts: &mut Vec<Artifact>, _ctx: &ComponentContext) -> Outcome<()> {
        let sizes: Vec<(String, usize)> = artifacts
            .iter()
            .map(|artifact| (artifact.path.display().to_string(), artifact.contents.len()))
            .collect();
        let total: usize = sizes.iter().map(|(_, size)| size).sum();

        Logger::info("📊 Stats Plugin: Build Statistics");
        Logger::info(&format!("  📂 Output files: {}", sizes.len()));
        Logger::info(&format!("  📦 Total size: {} bytes", total));
        if self.verbose {
            for (i, (path, size)) in sizes.iter().enumerate() {
                Logger::info(&format!("     {}. {} ({} bytes)", i + 1, path, size));
            }
        }

        *self.artifact_bytes.lock() = sizes;
        Outcome::Skipped
    }
}
