// Watch mode for kiln
// Turns filesystem notifications into debounced batches of change events

use crate::config::BuildConfig;
use crate::incremental::{ChangeEvent, RebuildCoordinator, RebuildOutcome};
use crate::utils::{KilnError, Logger, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for watch mode
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Paths to watch for changes
    pub watch_paths: Vec<PathBuf>,
    /// Quiet period that closes a batch of events
    pub debounce_ms: u64,
    /// Directories whose contents never trigger a rebuild
    pub ignored: Vec<PathBuf>,
    pub verbose: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watch_paths: vec![PathBuf::from(".")],
            debounce_ms: 100,
            ignored: Vec::new(),
            verbose: false,
        }
    }
}

impl WatchConfig {
    /// Watch the project root, skipping VCS data, installed packages and
    /// everything the build writes itself
    pub fn for_build(config: &BuildConfig) -> Self {
        let root = canonical(&config.root);
        Self {
            watch_paths: vec![root.clone()],
            ignored: vec![
                root.join(".git"),
                root.join("node_modules"),
                canonical(&config.outdir),
                canonical(&config.cache_dir()),
            ],
            ..Self::default()
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }
        // editor scratch files
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        name.ends_with('~') || name.ends_with(".swp") || name.ends_with(".tmp")
    }

    fn events_for(&self, event: &Event) -> Vec<ChangeEvent> {
        to_change_events(event)
            .into_iter()
            .filter(|change| !self.is_ignored(&change.path))
            .map(|mut change| {
                change.path = canonical(&change.path);
                change.previous_path = change.previous_path.as_deref().map(canonical);
                change
            })
            .collect()
    }
}

/// Map one notify event to change events. Metadata and access events map
/// to nothing.
pub fn to_change_events(event: &Event) -> Vec<ChangeEvent> {
    let paths = &event.paths;
    match &event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(ChangeEvent::add).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(ChangeEvent::delete).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            vec![ChangeEvent::rename(paths[0].clone(), paths[1].clone())]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(ChangeEvent::delete).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths.iter().cloned().map(ChangeEvent::add).collect(),
        // platforms that do not say which side of a rename this is
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .cloned()
            .map(|path| {
                if path.exists() {
                    ChangeEvent::add(path)
                } else {
                    ChangeEvent::delete(path)
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths.iter().cloned().map(ChangeEvent::modify).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Watch until the watcher shuts down, feeding each debounced batch into the
/// coordinator. Events arriving during a rebuild wait in the channel and form
/// the next batch.
pub async fn watch(coordinator: Arc<RebuildCoordinator>, config: WatchConfig) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(1000);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| KilnError::build(format!("Failed to create watcher: {}", e)))?;

    for path in &config.watch_paths {
        if path.exists() {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| KilnError::build(format!("Failed to watch {}: {}", path.display(), e)))?;
        }
    }

    Logger::info("👀 Watch mode started - monitoring for changes...");
    Logger::info(&format!(
        "   Watching: {}",
        config
            .watch_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ));

    if coordinator.last_good().is_none() {
        if let Err(e) = coordinator.initial_build().await {
            Logger::error(&format!("❌ Initial build failed: {}", e));
        }
    }

    while let Some(batch) = next_batch(&mut rx, &config).await {
        if config.verbose {
            for event in &batch {
                Logger::debug(&format!("  • {:?} {}", event.kind, event.path.display()));
            }
        }
        match coordinator.notify(batch).await {
            Ok(RebuildOutcome::Rebuilt(change_set)) => {
                Logger::debug(&format!("{} paths changed", change_set.changed_paths.len()))
            }
            Ok(_) => {}
            Err(e) => Logger::error(&format!("❌ Rebuild failed: {}", e)),
        }
    }

    drop(watcher);
    Logger::warn("Watch channel disconnected");
    Ok(())
}

/// Wait for the first relevant event, then keep collecting until the channel
/// has been quiet for the debounce period. `None` once the channel is closed.
pub async fn next_batch(rx: &mut mpsc::Receiver<Event>, config: &WatchConfig) -> Option<Vec<ChangeEvent>> {
    let debounce = Duration::from_millis(config.debounce_ms);
    let mut batch = Vec::new();

    while batch.is_empty() {
        let event = rx.recv().await?;
        batch.extend(config.events_for(&event));
    }

    loop {
        match tokio::time::timeout(debounce, rx.recv()).await {
            Ok(Some(event)) => batch.extend(config.events_for(&event)),
            Ok(None) | Err(_) => return Some(batch),
        }
    }
}

/// Canonical form of a path that may no longer exist
fn canonical(path: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(path) {
        return path;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
