// Chunk graph construction
// materialize per entry / dynamic boundary, lift shared files, link, order

use crate::config::{BuildConfig, FailurePolicy};
use crate::core::models::{Chunk, ChunkGraph, ChunkKind, File, Job};
use crate::core::plugin::{Capability, ComponentContexts, ComponentHook, ComponentRegistry, Outcome};
use crate::utils::{KilnError, Logger, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A chunk under construction, remembering the first failed file its
/// closure ran into
struct Draft {
    chunk: Chunk,
    failed: Option<PathBuf>,
}

pub struct ChunkBuilder {
    root: PathBuf,
    extract_shared: bool,
    policy: FailurePolicy,
    registry: Arc<ComponentRegistry>,
    contexts: Arc<ComponentContexts>,
}

impl ChunkBuilder {
    pub fn new(config: &BuildConfig, registry: Arc<ComponentRegistry>, contexts: Arc<ComponentContexts>) -> Self {
        Self {
            root: config.root.clone(),
            extract_shared: config.extract_shared,
            policy: config.failure_policy,
            registry,
            contexts,
        }
    }

    /// Runs only after the graph is closed; never interleaved with resolution
    pub async fn build(&self, job: &Job) -> Result<ChunkGraph> {
        let mut drafts = self.materialize(job);
        self.attach_explicit(&mut drafts, job);
        let mut chunks = self.isolate(drafts, job)?;

        if self.extract_shared {
            extract_shared(&mut chunks, &job.files);
        }
        link(&mut chunks, &job.files);

        for component in self.registry.by_capability(Capability::ChunkTransform) {
            let ComponentHook::ChunkTransform(hook) = &component.hook else {
                continue;
            };
            match hook.transform_chunks(&mut chunks, &job.files, self.contexts.get(component)).await {
                Outcome::Handled(()) | Outcome::Skipped => {}
                Outcome::Failed(err) => return Err(err),
            }
        }

        let chunks = topological_order(chunks)?;
        let shared = chunks.iter().filter(|c| c.kind == ChunkKind::Shared).count();
        Logger::chunks_built(chunks.len(), shared);
        Ok(ChunkGraph { chunks })
    }

    /// One chunk per entry (config order), then one per dynamic import target
    fn materialize(&self, job: &Job) -> Vec<Draft> {
        let mut seeds: Vec<(PathBuf, ChunkKind)> =
            job.entries.iter().map(|entry| (entry.clone(), ChunkKind::Entry)).collect();

        let dynamic_targets: BTreeSet<PathBuf> = job
            .files
            .values()
            .flat_map(|file| file.dynamic_dependencies().map(Path::to_path_buf))
            .collect();
        seeds.extend(
            dynamic_targets
                .into_iter()
                .filter(|target| !job.is_entry(target))
                .map(|target| (target, ChunkKind::Async)),
        );

        let closures: Vec<(BTreeSet<PathBuf>, Option<PathBuf>)> = seeds
            .par_iter()
            .map(|(seed, _)| sync_closure(seed, job))
            .collect();

        let mut ids = HashSet::new();
        seeds
            .into_iter()
            .zip(closures)
            .map(|((seed, kind), (files, failed))| {
                let id = unique_id(&mut ids, chunk_id(&self.root, &seed));
                let format = job
                    .files
                    .get(&seed)
                    .map_or_else(|| "static".to_string(), |file| file.format.clone());
                debug!("🧩 {:?} chunk '{}' with {} files", kind, id, files.len());

                let mut chunk = Chunk::new(id, kind, format, Some(seed));
                chunk.files = files;
                Draft { chunk, failed }
            })
            .collect()
    }

    /// Files with explicit memberships join the named chunk, creating it when
    /// nothing else did
    fn attach_explicit(&self, drafts: &mut Vec<Draft>, job: &Job) {
        for file in job.files.values() {
            for id in &file.chunk_memberships {
                let (files, failed) = sync_closure(&file.path, job);
                let index = match drafts.iter().position(|draft| draft.chunk.id == *id) {
                    Some(index) => index,
                    None => {
                        let chunk = Chunk::new(id.clone(), ChunkKind::Explicit, file.format.clone(), None);
                        drafts.push(Draft { chunk, failed: None });
                        drafts.len() - 1
                    }
                };

                let draft = &mut drafts[index];
                draft.chunk.files.extend(files);
                if draft.failed.is_none() {
                    draft.failed = failed;
                }
            }
        }
    }

    /// Drop chunks whose closure reached a failed file. Losing an entry chunk
    /// fails the build with that file's error.
    fn isolate(&self, drafts: Vec<Draft>, job: &Job) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(drafts.len());

        for Draft { chunk, failed } in drafts {
            let Some(failed) = failed else {
                chunks.push(chunk);
                continue;
            };

            let err = job
                .failures
                .get(&failed)
                .cloned()
                .unwrap_or_else(|| KilnError::build(format!("{} failed", failed.display())));

            if self.policy == FailurePolicy::AbortBuild || chunk.kind == ChunkKind::Entry {
                return Err(err);
            }
            Logger::warn(&format!("Dropping chunk '{}': {}", chunk.id, err));
        }

        Ok(chunks)
    }
}

/// Members reachable from `seed` over synchronous imports
fn sync_closure(seed: &Path, job: &Job) -> (BTreeSet<PathBuf>, Option<PathBuf>) {
    let mut members = BTreeSet::new();
    let mut failed = None;
    let mut stack = vec![seed.to_path_buf()];
    let mut seen = HashSet::new();

    while let Some(path) = stack.pop() {
        if !seen.insert(path.clone()) {
            continue;
        }
        if job.failures.contains_key(&path) {
            failed.get_or_insert(path);
            continue;
        }
        let Some(file) = job.files.get(&path) else {
            continue;
        };
        stack.extend(file.sync_dependencies().map(Path::to_path_buf));
        members.insert(path);
    }

    (members, failed)
}

/// Single sweep: files owned by two or more chunks move into one shared chunk
/// per distinct owner set, whatever their formats. Moving a file never
/// creates new sharing.
fn extract_shared(chunks: &mut Vec<Chunk>, files: &BTreeMap<PathBuf, File>) {
    let mut owners: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();
    for chunk in chunks.iter() {
        for path in &chunk.files {
            owners.entry(path.clone()).or_default().insert(chunk.id.clone());
        }
    }

    let mut groups: BTreeMap<BTreeSet<String>, BTreeSet<PathBuf>> = BTreeMap::new();
    for (path, owner_ids) in owners {
        if owner_ids.len() >= 2 {
            groups.entry(owner_ids).or_default().insert(path);
        }
    }

    for (owner_ids, members) in groups {
        for chunk in chunks.iter_mut().filter(|chunk| owner_ids.contains(&chunk.id)) {
            chunk.files.retain(|path| !members.contains(path));
        }

        let id = shared_chunk_id(&owner_ids);
        debug!("🧩 Shared chunk '{}' lifts {} files from {:?}", id, members.len(), owner_ids);
        let mut shared = Chunk::new(id, ChunkKind::Shared, dominant_format(&members, files), None);
        shared.files = members;
        chunks.push(shared);
    }
}

/// Most common member format; ties go to the first name
fn dominant_format(members: &BTreeSet<PathBuf>, files: &BTreeMap<PathBuf, File>) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for path in members {
        let format = files.get(path).map_or("static", |file| file.format.as_str());
        *counts.entry(format).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map_or_else(|| "static".to_string(), |(format, _)| format.to_string())
}

/// Recompute inter-chunk edges: a chunk imports every chunk that owns a
/// synchronous dependency (or its seed) it does not hold itself, and
/// async-imports the chunk seeded by each dynamic import target
fn link(chunks: &mut [Chunk], files: &BTreeMap<PathBuf, File>) {
    let mut owned_by: HashMap<PathBuf, Vec<String>> = HashMap::new();
    let mut seeded_by: HashMap<PathBuf, String> = HashMap::new();
    for chunk in chunks.iter() {
        for path in &chunk.files {
            owned_by.entry(path.clone()).or_default().push(chunk.id.clone());
        }
        if let (Some(entry), ChunkKind::Entry | ChunkKind::Async) = (&chunk.entry, chunk.kind) {
            seeded_by.insert(entry.clone(), chunk.id.clone());
        }
    }

    for chunk in chunks.iter_mut() {
        let mut required: Vec<&Path> = Vec::new();
        if let Some(entry) = chunk.entry.as_deref() {
            if !chunk.files.contains(entry) {
                required.push(entry);
            }
        }

        let mut async_imports = BTreeSet::new();
        for file in chunk.files.iter().filter_map(|path| files.get(path)) {
            required.extend(file.sync_dependencies().filter(|dep| !chunk.files.contains(*dep)));
            async_imports.extend(file.dynamic_dependencies().filter_map(|dep| seeded_by.get(dep).cloned()));
        }

        let imports: BTreeSet<String> = required
            .into_iter()
            .filter_map(|path| owned_by.get(path))
            .flatten()
            .filter(|owner| **owner != chunk.id)
            .cloned()
            .collect();

        async_imports.remove(&chunk.id);
        chunk.imports = imports;
        chunk.async_imports = async_imports;
    }
}

/// Reverse topological sort of `(chunk → imported chunk)` edges. A synthetic
/// sink keeps chunks without imports in the graph.
fn topological_order(chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
    let mut graph: DiGraph<Option<usize>, ()> = DiGraph::new();
    let sink = graph.add_node(None);
    let nodes: Vec<NodeIndex> = (0..chunks.len()).map(|i| graph.add_node(Some(i))).collect();
    let index: HashMap<&str, usize> = chunks.iter().enumerate().map(|(i, c)| (c.id.as_str(), i)).collect();

    for (i, chunk) in chunks.iter().enumerate() {
        let mut linked = false;
        for import in &chunk.imports {
            if let Some(&j) = index.get(import.as_str()) {
                if j != i {
                    graph.add_edge(nodes[i], nodes[j], ());
                    linked = true;
                }
            }
        }
        if !linked {
            graph.add_edge(nodes[i], sink, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| KilnError::ChunkCycle {
        chunk: graph[cycle.node_id()]
            .map(|i| chunks[i].id.clone())
            .unwrap_or_default(),
    })?;

    let mut slots: Vec<Option<Chunk>> = chunks.into_iter().map(Some).collect();
    Ok(sorted
        .into_iter()
        .rev()
        .filter_map(|node| graph[node])
        .filter_map(|i| slots[i].take())
        .collect())
}

/// Path relative to the root, without extension, `/`-separated
fn chunk_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    relative
        .components()
        .filter_map(|component| match component {
            PathComponent::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn unique_id(taken: &mut HashSet<String>, id: String) -> String {
    if taken.insert(id.clone()) {
        return id;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", id, n);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn shared_chunk_id(owners: &BTreeSet<String>) -> String {
    let key = owners.iter().cloned().collect::<Vec<_>>().join("\n");
    let hex = blake3::hash(key.as_bytes()).to_hex();
    format!("shared-{}", &hex.as_str()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{FileImport, ImportKind};
    use crate::core::plugin::{ChunkTransformHook, Component, ComponentContext};
    use async_trait::async_trait;

    const ROOT: &str = "/p";

    fn p(name: &str) -> PathBuf {
        Path::new(ROOT).join(name)
    }

    fn file(name: &str, sync: &[&str], dynamic: &[&str]) -> File {
        let mut file = File::new(p(name), "script", "".into());
        let edges = sync
            .iter()
            .map(|d| (d, ImportKind::Sync))
            .chain(dynamic.iter().map(|d| (d, ImportKind::Dynamic)));
        for (dep, kind) in edges {
            file.imports.push(FileImport {
                request: format!("./{}", dep),
                kind,
                resolved_path: Some(p(dep)),
                format: Some("script".to_string()),
            });
        }
        file
    }

    fn job(entries: &[&str], files: Vec<File>) -> Job {
        let mut job = Job::new();
        job.entries = entries.iter().map(|e| p(e)).collect();
        job.files = files.into_iter().map(|f| (f.path.clone(), f)).collect();
        job
    }

    fn builder_with(config: BuildConfig, registry: ComponentRegistry) -> ChunkBuilder {
        let contexts = ComponentContexts::new(&registry, Path::new(ROOT), &HashMap::new());
        ChunkBuilder::new(&config, Arc::new(registry), Arc::new(contexts))
    }

    fn builder() -> ChunkBuilder {
        builder_with(BuildConfig::new(ROOT), ComponentRegistry::new())
    }

    fn members(graph: &ChunkGraph, id: &str) -> Vec<PathBuf> {
        graph.get(id).unwrap().files.iter().cloned().collect()
    }

    fn assert_dependency_order(graph: &ChunkGraph) {
        for (position, chunk) in graph.chunks.iter().enumerate() {
            for import in &chunk.imports {
                let dep = graph.position(import).unwrap();
                assert!(dep < position, "'{}' must come before '{}'", import, chunk.id);
            }
        }
    }

    #[tokio::test]
    async fn test_entry_chunk_is_sync_closure() {
        let job = job(
            &["a.js"],
            vec![file("a.js", &["b.js"], &[]), file("b.js", &["c.js"], &[]), file("c.js", &[], &[])],
        );
        let graph = builder().build(&job).await.unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(members(&graph, "a"), vec![p("a.js"), p("b.js"), p("c.js")]);
        assert_eq!(graph.chunks[0].kind, ChunkKind::Entry);
    }

    #[tokio::test]
    async fn test_dynamic_import_starts_new_chunk() {
        let job = job(
            &["a.js"],
            vec![file("a.js", &[], &["b.js"]), file("b.js", &["c.js"], &[]), file("c.js", &[], &[])],
        );
        let graph = builder().build(&job).await.unwrap();

        assert_eq!(members(&graph, "a"), vec![p("a.js")]);
        assert_eq!(members(&graph, "b"), vec![p("b.js"), p("c.js")]);
        assert_eq!(graph.get("b").unwrap().kind, ChunkKind::Async);
        assert!(graph.get("a").unwrap().async_imports.contains("b"));
        assert!(graph.get("a").unwrap().imports.is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_and_sync_importers_share_chunk() {
        // a loads b lazily, c needs b up front
        let job = job(
            &["a.js", "c.js"],
            vec![file("a.js", &[], &["b.js"]), file("b.js", &[], &[]), file("c.js", &["b.js"], &[])],
        );
        let graph = builder().build(&job).await.unwrap();

        let shared: Vec<_> = graph.chunks.iter().filter(|c| c.kind == ChunkKind::Shared).collect();
        assert_eq!(shared.len(), 1);
        let shared_id = shared[0].id.clone();
        assert!(shared_id.starts_with("shared-"));
        assert_eq!(members(&graph, &shared_id), vec![p("b.js")]);

        let async_b = graph.get("b").unwrap();
        assert!(async_b.files.is_empty());
        assert!(async_b.imports.contains(&shared_id));
        assert!(graph.get("c").unwrap().imports.contains(&shared_id));
        assert!(graph.get("a").unwrap().async_imports.contains("b"));

        let mut seen = HashSet::new();
        for chunk in &graph.chunks {
            for path in &chunk.files {
                assert!(seen.insert(path.clone()), "{} is in two chunks", path.display());
            }
        }
        assert_dependency_order(&graph);
    }

    #[tokio::test]
    async fn test_nested_sharing_is_ordered() {
        let job = job(
            &["x.js", "y.js", "z.js"],
            vec![
                file("x.js", &["common.js"], &[]),
                file("y.js", &["common.js", "pair.js"], &[]),
                file("z.js", &["pair.js"], &[]),
                file("common.js", &["util.js"], &[]),
                file("pair.js", &["util.js"], &[]),
                file("util.js", &[], &[]),
            ],
        );
        let graph = builder().build(&job).await.unwrap();

        assert_eq!(graph.chunks.iter().filter(|c| c.kind == ChunkKind::Shared).count(), 3);
        assert_eq!(members(&graph, "x"), vec![p("x.js")]);
        assert_dependency_order(&graph);
    }

    #[tokio::test]
    async fn test_shared_cycle_across_formats_stays_in_one_chunk() {
        // widget.js and widget.css import each other and both entries use them
        let mut style = file("widget.css", &["widget.js"], &[]);
        style.format = "style".to_string();
        let job = job(
            &["a.js", "b.js"],
            vec![
                file("a.js", &["widget.js"], &[]),
                file("b.js", &["widget.js"], &[]),
                file("widget.js", &["widget.css"], &[]),
                style,
            ],
        );
        let graph = builder().build(&job).await.unwrap();

        let shared: Vec<_> = graph.chunks.iter().filter(|c| c.kind == ChunkKind::Shared).collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].format, "script");
        assert_eq!(members(&graph, &shared[0].id), vec![p("widget.css"), p("widget.js")]);
        assert!(shared[0].imports.is_empty());
        assert_dependency_order(&graph);
    }

    #[tokio::test]
    async fn test_without_extraction_files_may_repeat() {
        let job = job(
            &["a.js", "c.js"],
            vec![file("a.js", &["b.js"], &[]), file("b.js", &[], &[]), file("c.js", &["b.js"], &[])],
        );
        let builder = builder_with(BuildConfig::new(ROOT).with_shared_extraction(false), ComponentRegistry::new());
        let graph = builder.build(&job).await.unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.get("a").unwrap().contains(&p("b.js")));
        assert!(graph.get("c").unwrap().contains(&p("b.js")));
    }

    #[tokio::test]
    async fn test_explicit_membership_creates_chunk() {
        let mut asset = file("logo.js", &[], &[]);
        asset.chunk_memberships.insert("assets".to_string());
        let job = job(&["a.js"], vec![file("a.js", &[], &[]), asset]);

        let graph = builder().build(&job).await.unwrap();
        let assets = graph.get("assets").unwrap();
        assert_eq!(assets.kind, ChunkKind::Explicit);
        assert_eq!(assets.entry, None);
        assert!(assets.contains(&p("logo.js")));
    }

    #[tokio::test]
    async fn test_isolated_failure_drops_only_affected_chunk() {
        let mut job = job(
            &["a.js"],
            vec![file("a.js", &[], &["lazy.js"]), file("lazy.js", &["broken.js"], &[])],
        );
        job.failures.insert(p("broken.js"), KilnError::build("boom"));

        let isolating = builder_with(
            BuildConfig::new(ROOT).with_failure_policy(FailurePolicy::IsolateChunks),
            ComponentRegistry::new(),
        );
        let graph = isolating.build(&job).await.unwrap();
        assert!(graph.get("a").is_some());
        assert!(graph.get("lazy").is_none());
        assert!(graph.get("a").unwrap().async_imports.is_empty());
    }

    #[tokio::test]
    async fn test_failure_in_entry_closure_fails_build() {
        let mut job = job(&["a.js"], vec![file("a.js", &["broken.js"], &[])]);
        job.failures.insert(p("broken.js"), KilnError::build("boom"));

        let isolating = builder_with(
            BuildConfig::new(ROOT).with_failure_policy(FailurePolicy::IsolateChunks),
            ComponentRegistry::new(),
        );
        assert_eq!(isolating.build(&job).await.unwrap_err(), KilnError::build("boom"));
    }

    struct Tangle;

    #[async_trait]
    impl ChunkTransformHook for Tangle {
        async fn transform_chunks(
            &self,
            chunks: &mut Vec<Chunk>,
            _files: &BTreeMap<PathBuf, File>,
            _ctx: &ComponentContext,
        ) -> Outcome<()> {
            let id0 = chunks[0].id.clone();
            let id1 = chunks[1].id.clone();
            chunks[0].imports.insert(id1);
            chunks[1].imports.insert(id0);
            Outcome::Handled(())
        }
    }

    #[tokio::test]
    async fn test_chunk_cycle_is_reported() {
        let job = job(&["a.js", "b.js"], vec![file("a.js", &[], &[]), file("b.js", &[], &[])]);
        let mut registry = ComponentRegistry::new();
        registry
            .register(Component::new("tangle", "1.0.0", ComponentHook::ChunkTransform(Arc::new(Tangle))))
            .unwrap();

        let err = builder_with(BuildConfig::new(ROOT), registry).build(&job).await.unwrap_err();
        assert!(matches!(err, KilnError::ChunkCycle { .. }));
    }

    #[tokio::test]
    async fn test_rebuild_is_byte_identical() {
        let make = || {
            job(
                &["a.js", "c.js"],
                vec![file("a.js", &["d.js"], &["b.js"]), file("b.js", &["d.js"], &[]), file("c.js", &["b.js"], &[]), file("d.js", &[], &[])],
            )
        };
        let first = builder().build(&make()).await.unwrap();
        let second = builder().build(&make()).await.unwrap();
        assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());
    }

    #[test]
    fn test_chunk_ids() {
        assert_eq!(chunk_id(Path::new("/p"), Path::new("/p/src/main.tsx")), "src/main");
        assert_eq!(chunk_id(Path::new("/p"), Path::new("/elsewhere/x.js")), "elsewhere/x");

        let mut taken = HashSet::new();
        assert_eq!(unique_id(&mut taken, "a".to_string()), "a");
        assert_eq!(unique_id(&mut taken, "a".to_string()), "a-2");
    }
}
