use crate::cache::TransformCache;
use crate::chunks::ChunkBuilder;
use crate::config::BuildConfig;
use crate::core::interfaces::FileSystemService;
use crate::core::models::{Artifact, BuildOutput, BuildStats, ChunkGraph, File, Issue, Job, Severity};
use crate::core::plugin::{Capability, ComponentContexts, ComponentHook, ComponentRegistry, Outcome};
use crate::graph::GraphBuilder;
use crate::infrastructure::TokioFileSystemService;
use crate::pipeline::FilePipeline;
use crate::resolver::{FileSystemResolver, Resolver, FS_RESOLVER};
use crate::utils::{Logger, Result, Timer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// One project's build service. Every `build`/`rebuild` call runs on its own
/// fresh `Job`; the registry, resolver and cache are shared between calls.
pub struct Bundler {
    config: BuildConfig,
    registry: Arc<ComponentRegistry>,
    contexts: Arc<ComponentContexts>,
    fs_service: Arc<dyn FileSystemService>,
    pipeline: Arc<FilePipeline>,
    graph: GraphBuilder,
    chunks: ChunkBuilder,
}

impl Bundler {
    pub fn new(config: BuildConfig, registry: ComponentRegistry) -> Result<Self> {
        Self::with_file_system(config, registry, Arc::new(TokioFileSystemService))
    }

    /// A bundler with every built-in component registered
    pub fn with_defaults(config: BuildConfig) -> Result<Self> {
        let registry = crate::plugins::default_registry(&config)?;
        Self::new(config, registry)
    }

    pub fn with_file_system(
        config: BuildConfig,
        mut registry: ComponentRegistry,
        fs_service: Arc<dyn FileSystemService>,
    ) -> Result<Self> {
        let has_fs_resolver = registry
            .by_capability(Capability::Resolve)
            .any(|component| component.name == FS_RESOLVER);
        if !has_fs_resolver {
            let resolver = FileSystemResolver::new(fs_service.clone(), config.resolve.clone(), config.root.clone());
            registry.register(resolver.into_component())?;
        }

        let registry = Arc::new(registry);
        let contexts = Arc::new(ComponentContexts::new(&registry, &config.root, &config.component_options));
        let cache = TransformCache::open(&config);

        let resolver = Arc::new(Resolver::new(registry.clone(), contexts.clone()));
        let pipeline = Arc::new(FilePipeline::new(
            registry.clone(),
            contexts.clone(),
            fs_service.clone(),
            cache,
        ));
        let graph = GraphBuilder::new(resolver, pipeline.clone(), config.max_concurrency, config.failure_policy);
        let chunks = ChunkBuilder::new(&config, registry.clone(), contexts.clone());

        Ok(Self {
            config,
            registry,
            contexts,
            fs_service,
            pipeline,
            graph,
            chunks,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &TransformCache {
        self.pipeline.cache()
    }

    /// Drain buffered cache writes; call before process exit for durability
    pub fn flush_cache(&self) -> Result<()> {
        self.pipeline.cache().flush()
    }

    /// Transform-stage invocations over this bundler's lifetime
    pub fn stage_runs(&self) -> usize {
        self.pipeline.stage_runs()
    }

    pub async fn build(&self) -> Result<BuildOutput> {
        self.run(Job::new()).await
    }

    /// Build again, serving every file of `previous` not in `invalidated`
    /// without re-resolving or re-transforming it
    pub async fn rebuild(
        &self,
        previous: Arc<BTreeMap<PathBuf, File>>,
        invalidated: BTreeSet<PathBuf>,
    ) -> Result<BuildOutput> {
        self.run(Job::from_previous(previous, invalidated)).await
    }

    async fn run(&self, mut job: Job) -> Result<BuildOutput> {
        let span = info_span!("build", root = %self.config.root.display());
        let result = self.execute(&mut job).instrument(span).await;

        if let Err(err) = &result {
            self.report(&Issue::error(err.clone()));
        }
        result
    }

    async fn execute(&self, job: &mut Job) -> Result<BuildOutput> {
        let timer = Timer::start("build");
        Logger::build_start(&self.config.root, self.config.entries.len());

        let graph_stats = self.graph.build(job, &self.config.entries).await?;

        let issues: Vec<Issue> = job.failures.values().cloned().map(Issue::error).collect();
        for issue in &issues {
            self.report(issue);
        }

        let chunk_graph = self.chunks.build(job).await?;
        job.chunks = chunk_graph.chunks.clone();

        let mut artifacts = self.generate(&chunk_graph, &job.files).await?;
        self.post_generate(&mut artifacts).await?;
        if self.config.write_output {
            self.write_artifacts(&artifacts).await?;
        }

        let stats = BuildStats {
            files: job.files.len(),
            transformed: graph_stats.transformed,
            cache_hits: graph_stats.cache_hits,
            reused: graph_stats.reused,
            chunks: chunk_graph.len(),
            artifacts: artifacts.len(),
            build_time: timer.elapsed(),
        };
        Logger::build_complete(stats.files, stats.chunks, stats.artifacts, stats.build_time);

        Ok(BuildOutput {
            entries: job.entries.clone(),
            files: std::mem::take(&mut job.files),
            chunks: chunk_graph,
            artifacts,
            issues,
            stats,
        })
    }

    /// The first generator to handle the chunk graph wins
    async fn generate(&self, graph: &ChunkGraph, files: &BTreeMap<PathBuf, File>) -> Result<Vec<Artifact>> {
        let _timer = Timer::start("generate");

        for component in self.registry.by_capability(Capability::Generate) {
            let ComponentHook::Generate(hook) = &component.hook else {
                continue;
            };
            match hook.generate(&graph.chunks, files, self.contexts.get(component)).await {
                Outcome::Handled(artifacts) => return Ok(artifacts),
                Outcome::Skipped => continue,
                Outcome::Failed(err) => return Err(err),
            }
        }

        Logger::debug("No generator registered; emitting no artifacts");
        Ok(Vec::new())
    }

    async fn post_generate(&self, artifacts: &mut Vec<Artifact>) -> Result<()> {
        for component in self.registry.by_capability(Capability::PostGenerate) {
            let ComponentHook::PostGenerate(hook) = &component.hook else {
                continue;
            };
            if let Outcome::Failed(err) = hook.post_generate(artifacts, self.contexts.get(component)).await {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn write_artifacts(&self, artifacts: &[Artifact]) -> Result<()> {
        let _timer = Timer::start("Writing output files");

        for artifact in artifacts {
            let target = self.config.outdir.join(&artifact.path);
            self.fs_service.write_bytes(&target, artifact.contents.as_bytes()).await?;

            if let Some(map) = &artifact.source_map {
                let mut map_path = target.into_os_string();
                map_path.push(".map");
                self.fs_service.write_bytes(&PathBuf::from(map_path), map.as_bytes()).await?;
            }
        }
        Ok(())
    }

    /// Every issue goes to the console and to each report component
    pub fn report(&self, issue: &Issue) {
        match issue.severity {
            Severity::Error => Logger::error(&issue.error.format_detailed()),
            Severity::Warning => Logger::warn(&issue.error.format_detailed()),
        }

        for component in self.registry.by_capability(Capability::Report) {
            if let ComponentHook::Report(hook) = &component.hook {
                hook.report(issue);
            }
        }
    }
}
