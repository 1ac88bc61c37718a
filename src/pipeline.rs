use crate::cache::{CacheEntry, TransformCache};
use crate::core::interfaces::FileSystemService;
use crate::core::models::{Contents, ImportRequest};
use crate::core::plugin::{
    Capability, Component, ComponentContexts, ComponentHook, ComponentRegistry, Outcome, StageEffects, TransformInput,
};
use crate::utils::{KilnError, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Formats loaded as raw bytes instead of text
const BINARY_FORMATS: &[&str] = &["static"];

/// Result of running one file through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub contents: Contents,
    pub source_map: Option<String>,
    pub imports: Vec<ImportRequest>,
    pub chunk_memberships: BTreeSet<String>,
    pub fingerprint: String,
    pub cache_hit: bool,
}

/// Load → fingerprint → cache lookup → transform stages in ascending priority
pub struct FilePipeline {
    registry: Arc<ComponentRegistry>,
    contexts: Arc<ComponentContexts>,
    fs: Arc<dyn FileSystemService>,
    cache: TransformCache,
    stage_runs: AtomicUsize,
}

impl FilePipeline {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        contexts: Arc<ComponentContexts>,
        fs: Arc<dyn FileSystemService>,
        cache: TransformCache,
    ) -> Self {
        Self {
            registry,
            contexts,
            fs,
            cache,
            stage_runs: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    /// Total transform-stage invocations since this pipeline was created
    pub fn stage_runs(&self) -> usize {
        self.stage_runs.load(Ordering::Relaxed)
    }

    pub async fn process(&self, path: &Path, format: &str) -> Result<Processed> {
        let loaders = self.registry.matching(Capability::Load, path, format);
        let stages = self.registry.matching(Capability::Transform, path, format);

        let raw = self.load(path, format, &loaders).await?;
        let fingerprint = self.fingerprint(path, format, &raw, loaders.iter().chain(stages.iter()).copied());

        if let Some(hit) = self.cache.get(&fingerprint) {
            debug!("💾 Cache hit: {}", path.display());
            return Ok(Processed {
                contents: hit.contents,
                source_map: hit.source_map,
                imports: hit.imports,
                chunk_memberships: hit.chunk_memberships,
                fingerprint,
                cache_hit: true,
            });
        }

        let mut contents = raw;
        let mut source_map: Option<String> = None;
        let mut effects = StageEffects::default();

        for component in stages {
            let ComponentHook::Transform(hook) = &component.hook else {
                continue;
            };

            let input = TransformInput {
                path,
                format,
                contents: &contents,
                source_map: source_map.as_deref(),
            };
            self.stage_runs.fetch_add(1, Ordering::Relaxed);
            let outcome = hook.transform(input, &mut effects, self.contexts.get(component)).await;

            match outcome {
                Outcome::Handled(output) => {
                    contents = output.contents;
                    source_map = output.source_map;
                }
                Outcome::Skipped => {}
                Outcome::Failed(err) => return Err(attribute(err, component, path)),
            }
        }

        let entry = CacheEntry {
            contents,
            source_map,
            imports: effects.imports,
            chunk_memberships: effects.chunk_memberships,
        };
        self.cache.set(fingerprint.clone(), entry.clone());

        Ok(Processed {
            contents: entry.contents,
            source_map: entry.source_map,
            imports: entry.imports,
            chunk_memberships: entry.chunk_memberships,
            fingerprint,
            cache_hit: false,
        })
    }

    async fn load(&self, path: &Path, format: &str, loaders: &[&Component]) -> Result<Contents> {
        for component in loaders {
            let ComponentHook::Load(hook) = &component.hook else {
                continue;
            };
            match hook.load(path, format, self.contexts.get(component)).await {
                Outcome::Handled(contents) => return Ok(contents),
                Outcome::Skipped => continue,
                Outcome::Failed(err) => return Err(attribute(err, component, path)),
            }
        }

        let bytes = self.fs.read_bytes(path).await?;
        Ok(Contents::from_raw(bytes, BINARY_FORMATS.contains(&format)))
    }

    /// blake3 over the raw contents plus name, version and effective options
    /// of every component that will touch the file
    fn fingerprint<'a>(
        &self,
        path: &Path,
        format: &str,
        raw: &Contents,
        components: impl Iterator<Item = &'a Component>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(format.as_bytes());
        hasher.update(&[0]);
        hasher.update(raw.as_bytes());

        for component in components {
            hasher.update(&[0]);
            hasher.update(component.name.as_bytes());
            hasher.update(b"@");
            hasher.update(component.version.as_bytes());
            hasher.update(self.contexts.get(component).options.to_string().as_bytes());
        }

        hasher.finalize().to_hex().to_string()
    }
}

/// Every stage failure surfaces as a `Transform` error naming the file
fn attribute(err: KilnError, component: &Component, path: &Path) -> KilnError {
    match err {
        KilnError::Transform { .. } => err.with_file(path),
        other => KilnError::transform(&component.name, path, other.to_string()),
    }
}
