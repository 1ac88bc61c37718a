// Incremental rebuild coordinator
// Turns change events into invalidation sets and re-enters the bundler,
// never running two rebuilds at once

use crate::core::interfaces::{LiveUpdateChannel, LiveUpdateMessage};
use crate::core::models::{BuildOutput, Contents, File};
use crate::core::services::Bundler;
use crate::utils::{KilnError, Logger, Result, Timer};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// One filesystem change as delivered by a watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Set for renames: the path the file had before
    pub previous_path: Option<PathBuf>,
}

impl ChangeEvent {
    pub fn add(path: impl Into<PathBuf>) -> Self {
        Self::new(ChangeKind::Add, path)
    }

    pub fn modify(path: impl Into<PathBuf>) -> Self {
        Self::new(ChangeKind::Modify, path)
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self::new(ChangeKind::Delete, path)
    }

    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Add,
            path: to.into(),
            previous_path: Some(from.into()),
        }
    }

    fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            previous_path: None,
        }
    }

    /// A rename is a delete of the old path followed by an add of the new one
    pub fn expand(self) -> Vec<ChangeEvent> {
        match self.previous_path {
            Some(previous) => vec![ChangeEvent::delete(previous), ChangeEvent::add(self.path)],
            None => vec![self],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Building,
    Failed,
}

/// Paths whose output differs between two builds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub changed_paths: Vec<PathBuf>,
}

impl ChangeSet {
    /// Added, removed and re-transformed files, sorted by path
    pub fn between(previous: &BTreeMap<PathBuf, File>, current: &BTreeMap<PathBuf, File>) -> Self {
        let mut changed: BTreeSet<PathBuf> = current
            .iter()
            .filter(|(path, file)| match previous.get(*path) {
                Some(old) => old.fingerprint != file.fingerprint || old.contents != file.contents,
                None => true,
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(previous.keys().filter(|path| !current.contains_key(*path)).cloned());

        Self {
            changed_paths: changed.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed_paths.is_empty()
    }

    pub fn merge(&mut self, other: ChangeSet) {
        let merged: BTreeSet<PathBuf> = self.changed_paths.drain(..).chain(other.changed_paths).collect();
        self.changed_paths = merged.into_iter().collect();
    }

    /// One `update` record per changed path that still exists
    pub fn updates(&self, files: &BTreeMap<PathBuf, File>) -> Vec<LiveUpdateMessage> {
        self.changed_paths
            .iter()
            .filter_map(|path| files.get(path))
            .map(|file| LiveUpdateMessage::Update {
                file_path: file.path.clone(),
                contents: match &file.contents {
                    Contents::Text(text) => text.clone(),
                    Contents::Bytes(bytes) => BASE64.encode(bytes),
                },
            })
            .collect()
    }
}

/// What a call to [`RebuildCoordinator::notify`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// A rebuild was already running; the events were queued for it
    Coalesced,
    /// Nothing the last good build depends on was touched
    Skipped,
    Rebuilt(ChangeSet),
}

/// Drives incremental rebuilds of one project.
///
/// State moves `Idle -> Building -> Idle`, or through `Failed` back to `Idle`
/// when a rebuild errors; a failure never discards the last good output.
pub struct RebuildCoordinator {
    bundler: Arc<Bundler>,
    channel: Option<Arc<dyn LiveUpdateChannel>>,
    pending: Mutex<Vec<ChangeEvent>>,
    /// Held for the whole of a build; one build at a time
    job_lock: tokio::sync::Mutex<()>,
    last_good: RwLock<Option<Arc<BuildOutput>>>,
    /// Invalidations of failed rebuilds, re-applied until a build succeeds
    dirty: Mutex<BTreeSet<PathBuf>>,
    state: RwLock<CoordinatorState>,
    last_error: RwLock<Option<KilnError>>,
    rebuilds: AtomicUsize,
}

impl RebuildCoordinator {
    pub fn new(bundler: Arc<Bundler>) -> Self {
        Self {
            bundler,
            channel: None,
            pending: Mutex::new(Vec::new()),
            job_lock: tokio::sync::Mutex::new(()),
            last_good: RwLock::new(None),
            dirty: Mutex::new(BTreeSet::new()),
            state: RwLock::new(CoordinatorState::Idle),
            last_error: RwLock::new(None),
            rebuilds: AtomicUsize::new(0),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn LiveUpdateChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn bundler(&self) -> &Arc<Bundler> {
        &self.bundler
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn last_good(&self) -> Option<Arc<BuildOutput>> {
        self.last_good.read().clone()
    }

    pub fn last_error(&self) -> Option<KilnError> {
        self.last_error.read().clone()
    }

    /// Rebuilds started by `notify`, successful or not
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    pub async fn initial_build(&self) -> Result<Arc<BuildOutput>> {
        let _guard = self.job_lock.lock().await;
        self.set_state(CoordinatorState::Building);

        match self.bundler.build().await {
            Ok(output) => {
                let output = Arc::new(output);
                *self.last_good.write() = Some(output.clone());
                *self.last_error.write() = None;
                self.set_state(CoordinatorState::Idle);
                Ok(output)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Queue change events and rebuild. When a rebuild is already running
    /// the events are left for it and this call returns immediately. The
    /// caller that drains the queue reports the outcome of its last rebuild.
    pub async fn notify(&self, events: Vec<ChangeEvent>) -> Result<RebuildOutcome> {
        self.pending
            .lock()
            .extend(events.into_iter().flat_map(ChangeEvent::expand));

        let mut result: Option<ChangeSet> = None;
        // only the outcome of the last rebuild counts; a later batch may fix
        // what an earlier one broke
        let mut last_error: Option<KilnError> = None;
        loop {
            let Ok(guard) = self.job_lock.try_lock() else {
                if let Some(err) = last_error {
                    return Err(err);
                }
                return Ok(result.map_or(RebuildOutcome::Coalesced, RebuildOutcome::Rebuilt));
            };

            loop {
                let batch = std::mem::take(&mut *self.pending.lock());
                if batch.is_empty() {
                    break;
                }
                match self.rebuild(batch).await {
                    Ok(Some(change_set)) => {
                        result.get_or_insert_with(ChangeSet::default).merge(change_set);
                        last_error = None;
                    }
                    Ok(None) => {}
                    Err(err) => last_error = Some(err),
                }
            }
            drop(guard);

            // events that arrived between the last drain and the unlock
            if self.pending.lock().is_empty() {
                break;
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(result.map_or(RebuildOutcome::Skipped, RebuildOutcome::Rebuilt)),
        }
    }

    /// Must be called with `job_lock` held
    async fn rebuild(&self, events: Vec<ChangeEvent>) -> Result<Option<ChangeSet>> {
        let previous = self.last_good();
        let previous_files = previous
            .as_ref()
            .map(|output| Arc::new(output.files.clone()))
            .unwrap_or_default();

        let mut seeds: BTreeSet<PathBuf> = events
            .iter()
            .filter(|event| matches!(event.kind, ChangeKind::Modify | ChangeKind::Delete))
            .map(|event| event.path.clone())
            .collect();
        seeds.extend(self.dirty.lock().iter().cloned());
        let invalidated = affected_files(&previous_files, &seeds);

        let last_failed = self.last_error.read().is_some();
        let touches_graph = invalidated.iter().any(|path| previous_files.contains_key(path));
        if previous.is_some() && !last_failed && !touches_graph {
            Logger::debug(&format!("Ignoring {} change events outside the build graph", events.len()));
            return Ok(None);
        }

        let timer = Timer::start("rebuild");
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        self.set_state(CoordinatorState::Building);
        Logger::rebuild_start(events.len(), invalidated.len());

        if let Some(output) = &previous {
            let stale_chunks = output
                .chunks
                .chunks
                .iter()
                .filter(|chunk| chunk.files.iter().any(|path| invalidated.contains(path)))
                .count();
            Logger::debug(&format!("{} chunks contain invalidated files", stale_chunks));
        }

        let result = match previous {
            Some(_) => self.bundler.rebuild(previous_files.clone(), invalidated.clone()).await,
            None => self.bundler.build().await,
        };

        match result {
            Ok(output) => {
                let change_set = ChangeSet::between(&previous_files, &output.files);
                self.publish(LiveUpdateMessage::Changed {
                    changed_paths: change_set.changed_paths.clone(),
                });
                for update in change_set.updates(&output.files) {
                    self.publish(update);
                }

                *self.last_good.write() = Some(Arc::new(output));
                *self.last_error.write() = None;
                self.dirty.lock().clear();
                self.set_state(CoordinatorState::Idle);
                Logger::rebuild_complete(change_set.changed_paths.len(), timer.elapsed());
                Ok(Some(change_set))
            }
            Err(err) => {
                self.dirty.lock().extend(invalidated);
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn fail(&self, err: &KilnError) {
        self.set_state(CoordinatorState::Failed);
        *self.last_error.write() = Some(err.clone());
        self.publish(LiveUpdateMessage::Error {
            message: err.to_string(),
        });
        Logger::warn("Rebuild failed; keeping the previous build");
        self.set_state(CoordinatorState::Idle);
    }

    fn publish(&self, message: LiveUpdateMessage) {
        if let Some(channel) = &self.channel {
            channel.publish(message);
        }
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.write() = state;
    }
}

/// The changed paths plus every file that transitively imports one of them
pub fn affected_files(files: &BTreeMap<PathBuf, File>, changed: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    let mut affected = BTreeSet::new();
    let mut to_process: Vec<&Path> = changed.iter().map(PathBuf::as_path).collect();

    while let Some(path) = to_process.pop() {
        if !affected.insert(path.to_path_buf()) {
            continue;
        }
        if let Some(file) = files.get(path) {
            to_process.extend(
                file.parents
                    .iter()
                    .filter(|parent| !affected.contains(*parent))
                    .map(PathBuf::as_path),
            );
        }
    }

    affected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, parents: &[&str], text: &str) -> File {
        let mut file = File::new(PathBuf::from(path), "script", text.into());
        file.fingerprint = format!("fp-{}", text);
        file.parents = parents.iter().map(PathBuf::from).collect();
        file
    }

    fn files(list: Vec<File>) -> BTreeMap<PathBuf, File> {
        list.into_iter().map(|file| (file.path.clone(), file)).collect()
    }

    #[test]
    fn test_rename_expands_to_delete_then_add() {
        let events = ChangeEvent::rename("/p/old.js", "/p/new.js").expand();
        assert_eq!(events, vec![ChangeEvent::delete("/p/old.js"), ChangeEvent::add("/p/new.js")]);
        assert_eq!(ChangeEvent::modify("/p/a.js").expand().len(), 1);
    }

    #[test]
    fn test_affected_files_walks_parents_transitively() {
        let graph = files(vec![
            file("/p/main.js", &[], "m"),
            file("/p/a.js", &["/p/main.js"], "a"),
            file("/p/b.js", &["/p/a.js"], "b"),
            file("/p/z.js", &["/p/main.js"], "z"),
        ]);
        let changed = BTreeSet::from([PathBuf::from("/p/b.js")]);

        let affected = affected_files(&graph, &changed);
        assert_eq!(
            affected,
            ["/p/a.js", "/p/b.js", "/p/main.js"].iter().map(PathBuf::from).collect()
        );
    }

    #[test]
    fn test_change_set_between_builds() {
        let before = files(vec![file("/p/a.js", &[], "a"), file("/p/b.js", &[], "b"), file("/p/gone.js", &[], "g")]);
        let after = files(vec![file("/p/a.js", &[], "a"), file("/p/b.js", &[], "b2"), file("/p/new.js", &[], "n")]);

        let change_set = ChangeSet::between(&before, &after);
        assert_eq!(
            change_set.changed_paths,
            vec![PathBuf::from("/p/b.js"), PathBuf::from("/p/gone.js"), PathBuf::from("/p/new.js")]
        );

        let updates = change_set.updates(&after);
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[0],
            LiveUpdateMessage::Update {
                file_path: PathBuf::from("/p/b.js"),
                contents: "b2".to_string(),
            }
        );
    }

    #[test]
    fn test_binary_updates_are_base64() {
        let mut logo = File::new(PathBuf::from("/p/logo.png"), "static", Contents::Bytes(vec![1, 2, 3]));
        logo.fingerprint = "x".to_string();
        let after = files(vec![logo]);
        let updates = ChangeSet::between(&BTreeMap::new(), &after).updates(&after);

        assert_eq!(
            updates,
            vec![LiveUpdateMessage::Update {
                file_path: PathBuf::from("/p/logo.png"),
                contents: "AQID".to_string(),
            }]
        );
    }
}
