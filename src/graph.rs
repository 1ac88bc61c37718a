use crate::config::FailurePolicy;
use crate::core::models::{File, FileImport, FileOutcome, Job, LockTable};
use crate::core::plugin::Resolution;
use crate::pipeline::FilePipeline;
use crate::resolver::Resolver;
use crate::utils::{KilnError, Logger, Result};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub transformed: usize,
    pub cache_hits: usize,
    pub reused: usize,
}

#[derive(Debug, Default)]
struct Counters {
    transformed: AtomicUsize,
    cache_hits: AtomicUsize,
    reused: AtomicUsize,
}

/// State shared by every in-flight request of one graph build
pub struct JobScope {
    locks: Arc<LockTable>,
    previous: Arc<BTreeMap<PathBuf, File>>,
    invalidated: Arc<BTreeSet<PathBuf>>,
    resolutions: DashMap<PathBuf, Resolution>,
    counters: Counters,
}

impl JobScope {
    pub fn new(job: &Job) -> Self {
        Self {
            locks: job.locks.clone(),
            previous: job.previous_files.clone(),
            invalidated: job.invalidated.clone(),
            resolutions: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            transformed: self.counters.transformed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
        }
    }

    fn resolution_for(&self, import: &FileImport, target: &Path) -> Resolution {
        if let Some(known) = self.resolutions.get(target) {
            return known.clone();
        }
        Resolution {
            path: target.to_path_buf(),
            format: import.format.clone().unwrap_or_else(|| "static".to_string()),
            package_root: self.previous.get(target).and_then(|file| file.package_root.clone()),
        }
    }
}

/// Discovers the closed file graph from the configured entries.
///
/// The driver loop is the only writer of `Job::files`; per-file work runs
/// concurrently and is deduplicated through the job's lock table.
pub struct GraphBuilder {
    resolver: Arc<Resolver>,
    pipeline: Arc<FilePipeline>,
    limiter: Arc<Semaphore>,
    policy: FailurePolicy,
}

impl GraphBuilder {
    pub fn new(resolver: Arc<Resolver>, pipeline: Arc<FilePipeline>, max_concurrency: usize, policy: FailurePolicy) -> Self {
        Self {
            resolver,
            pipeline,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy,
        }
    }

    pub async fn build(&self, job: &mut Job, entries: &[String]) -> Result<GraphStats> {
        if entries.is_empty() {
            return Err(KilnError::config("no entries configured"));
        }

        let scope = JobScope::new(job);

        let mut seeds = Vec::new();
        for request in entries {
            let resolution = self.resolver.resolve(request, None).await?;
            if !job.is_entry(&resolution.path) {
                job.entries.push(resolution.path.clone());
                seeds.push(resolution);
            }
        }

        // a path is marked visited before its imports are traversed, so a
        // back-edge never enqueues it a second time
        let mut visited: HashSet<PathBuf> = seeds.iter().map(|seed| seed.path.clone()).collect();
        let mut in_flight = FuturesUnordered::new();
        for seed in seeds {
            in_flight.push(self.tracked(&scope, seed));
        }

        while let Some((path, outcome)) = in_flight.next().await {
            match outcome {
                Ok(file) => {
                    for import in &file.imports {
                        let Some(target) = import.resolved_path.as_deref() else {
                            continue;
                        };
                        if visited.insert(target.to_path_buf()) {
                            in_flight.push(self.tracked(&scope, scope.resolution_for(import, target)));
                        }
                    }
                    job.files.insert(path, File::clone(&file));
                }
                Err(err) => self.on_failure(job, path, err)?,
            }
        }
        drop(in_flight);

        link_parents(&mut job.files);
        let stats = scope.stats();
        Logger::graph_closed(job.files.len(), stats.transformed, stats.cache_hits, stats.reused);
        Ok(stats)
    }

    async fn tracked(&self, scope: &JobScope, resolution: Resolution) -> (PathBuf, FileOutcome) {
        let path = resolution.path.clone();
        let outcome = self.request(scope, resolution).await;
        (path, outcome)
    }

    /// Request one file. Concurrent requests for the same path share a single
    /// pipeline run and all observe the same `Arc<File>` or the same error.
    pub async fn request(&self, scope: &JobScope, resolution: Resolution) -> FileOutcome {
        let cell = scope
            .locks
            .entry(resolution.path.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_init(|| self.process(scope, resolution)).await.clone()
    }

    async fn process(&self, scope: &JobScope, resolution: Resolution) -> FileOutcome {
        let Resolution {
            path,
            format,
            package_root,
        } = resolution;

        if !scope.invalidated.contains(&path) {
            if let Some(previous) = scope.previous.get(&path) {
                debug!("♻️  Reusing {}", path.display());
                scope.counters.reused.fetch_add(1, Ordering::Relaxed);
                let mut file = previous.clone();
                file.parents.clear();
                return Ok(Arc::new(file));
            }
        }

        let processed = {
            let _permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| KilnError::build("graph builder is shutting down"))?;
            Logger::processing_file(&path, &format);
            self.pipeline.process(&path, &format).await?
        };

        let counter = if processed.cache_hit {
            &scope.counters.cache_hits
        } else {
            &scope.counters.transformed
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut file = File::new(path, format, processed.contents);
        file.source_map = processed.source_map;
        file.fingerprint = processed.fingerprint;
        file.chunk_memberships = processed.chunk_memberships;
        file.package_root = package_root;

        // an unresolvable import fails the importing file
        for request in processed.imports {
            let mut import = FileImport::unresolved(request);
            let target = self.resolver.resolve(&import.request, Some(&file.path)).await?;
            import.resolved_path = Some(target.path.clone());
            import.format = Some(target.format.clone());
            scope.resolutions.entry(target.path.clone()).or_insert(target);
            file.imports.push(import);
        }

        Ok(Arc::new(file))
    }

    fn on_failure(&self, job: &mut Job, path: PathBuf, err: KilnError) -> Result<()> {
        match self.policy {
            FailurePolicy::AbortBuild => Err(err),
            FailurePolicy::IsolateChunks if job.is_entry(&path) => Err(err),
            FailurePolicy::IsolateChunks => {
                Logger::warn(&format!("Isolating {}: {}", path.display(), err));
                job.failures.insert(path, err);
                Ok(())
            }
        }
    }
}

/// Recompute every file's back-references from the import edges
pub fn link_parents(files: &mut BTreeMap<PathBuf, File>) {
    let edges: Vec<(PathBuf, PathBuf)> = files
        .values()
        .flat_map(|file| {
            file.imports
                .iter()
                .filter_map(|import| import.resolved_path.clone())
                .map(move |target| (target, file.path.clone()))
        })
        .collect();

    for file in files.values_mut() {
        file.parents.clear();
    }
    for (target, parent) in edges {
        if let Some(file) = files.get_mut(&target) {
            file.parents.insert(parent);
        }
    }
}
