// Component registry for kiln
// Pluggable units tagged with one capability, dispatched in priority order

use crate::core::models::{Artifact, Chunk, Contents, File, ImportKind, ImportRequest, Issue};
use crate::utils::{KilnError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tagged result of a component callback.
///
/// `Skipped` means "not applicable to this input", which is distinct from
/// `Handled` with an empty value.
#[derive(Debug)]
pub enum Outcome<T> {
    Handled(T),
    Skipped,
    Failed(KilnError),
}

impl<T> Outcome<T> {
    pub fn failed_with(component: &str, path: &Path, err: impl fmt::Display) -> Self {
        Outcome::Failed(KilnError::transform(component, path, err.to_string()))
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled(_))
    }
}

impl<T> From<Result<Option<T>>> for Outcome<T> {
    fn from(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Outcome::Handled(value),
            Ok(None) => Outcome::Skipped,
            Err(err) => Outcome::Failed(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Resolve,
    Load,
    Transform,
    ChunkTransform,
    Generate,
    PostGenerate,
    Report,
}

/// What a resolver hands back for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub format: String,
    pub package_root: Option<PathBuf>,
}

/// Per-invocation data handed to every callback
#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub root: PathBuf,
    /// Default options merged with the build's overrides
    pub options: Value,
}

/// Current state of a file as seen by a transform stage
#[derive(Debug, Clone)]
pub struct TransformInput<'a> {
    pub path: &'a Path,
    pub format: &'a str,
    pub contents: &'a Contents,
    pub source_map: Option<&'a str>,
}

/// Replacement contents produced by a transform stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub contents: Contents,
    pub source_map: Option<String>,
}

impl TransformOutput {
    pub fn new(contents: impl Into<Contents>) -> Self {
        Self {
            contents: contents.into(),
            source_map: None,
        }
    }

    pub fn with_source_map(mut self, source_map: String) -> Self {
        self.source_map = Some(source_map);
        self
    }
}

/// Side effects a transform stage may register. Accumulated across stages,
/// never overwritten.
#[derive(Debug, Default, Clone)]
pub struct StageEffects {
    pub imports: Vec<ImportRequest>,
    pub chunk_memberships: BTreeSet<String>,
}

impl StageEffects {
    pub fn add_import(&mut self, request: impl Into<String>, kind: ImportKind) {
        let request = ImportRequest {
            request: request.into(),
            kind,
        };
        if !self.imports.contains(&request) {
            self.imports.push(request);
        }
    }

    pub fn add_chunk_membership(&mut self, chunk: impl Into<String>) {
        self.chunk_memberships.insert(chunk.into());
    }
}

#[async_trait]
pub trait ResolveHook: Send + Sync {
    async fn resolve(&self, request: &str, from: Option<&Path>, ctx: &ComponentContext) -> Outcome<Resolution>;
}

#[async_trait]
pub trait LoadHook: Send + Sync {
    async fn load(&self, path: &Path, format: &str, ctx: &ComponentContext) -> Outcome<Contents>;
}

#[async_trait]
pub trait TransformHook: Send + Sync {
    async fn transform(
        &self,
        input: TransformInput<'_>,
        effects: &mut StageEffects,
        ctx: &ComponentContext,
    ) -> Outcome<TransformOutput>;
}

#[async_trait]
pub trait ChunkTransformHook: Send + Sync {
    async fn transform_chunks(
        &self,
        chunks: &mut Vec<Chunk>,
        files: &BTreeMap<PathBuf, File>,
        ctx: &ComponentContext,
    ) -> Outcome<()>;
}

#[async_trait]
pub trait GenerateHook: Send + Sync {
    async fn generate(
        &self,
        chunks: &[Chunk],
        files: &BTreeMap<PathBuf, File>,
        ctx: &ComponentContext,
    ) -> Outcome<Vec<Artifact>>;
}

#[async_trait]
pub trait PostGenerateHook: Send + Sync {
    async fn post_generate(&self, artifacts: &mut Vec<Artifact>, ctx: &ComponentContext) -> Outcome<()>;
}

pub trait ReportHook: Send + Sync {
    fn report(&self, issue: &Issue);
}

/// The callback of a component. The variant is the component's capability.
#[derive(Clone)]
pub enum ComponentHook {
    Resolve(Arc<dyn ResolveHook>),
    Load(Arc<dyn LoadHook>),
    Transform(Arc<dyn TransformHook>),
    ChunkTransform(Arc<dyn ChunkTransformHook>),
    Generate(Arc<dyn GenerateHook>),
    PostGenerate(Arc<dyn PostGenerateHook>),
    Report(Arc<dyn ReportHook>),
}

impl ComponentHook {
    pub fn capability(&self) -> Capability {
        match self {
            ComponentHook::Resolve(_) => Capability::Resolve,
            ComponentHook::Load(_) => Capability::Load,
            ComponentHook::Transform(_) => Capability::Transform,
            ComponentHook::ChunkTransform(_) => Capability::ChunkTransform,
            ComponentHook::Generate(_) => Capability::Generate,
            ComponentHook::PostGenerate(_) => Capability::PostGenerate,
            ComponentHook::Report(_) => Capability::Report,
        }
    }
}

/// Which files a load/transform component applies to
#[derive(Debug, Clone, Default)]
pub struct ComponentFilter {
    /// Empty means every format
    pub formats: Vec<String>,
    pub path_pattern: Option<Regex>,
}

impl ComponentFilter {
    pub fn matches(&self, path: &Path, format: &str) -> bool {
        let format_ok = self.formats.is_empty() || self.formats.iter().any(|f| f == format);
        let path_ok = self
            .path_pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(&path.to_string_lossy()));
        format_ok && path_ok
    }
}

/// An immutable component descriptor
#[derive(Clone)]
pub struct Component {
    pub name: String,
    pub version: String,
    pub priority: i32,
    pub default_options: Value,
    pub filter: ComponentFilter,
    pub hook: ComponentHook,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("capability", &self.capability())
            .field("priority", &self.priority)
            .finish()
    }
}

impl Component {
    pub fn new(name: impl Into<String>, version: impl Into<String>, hook: ComponentHook) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            priority: 0,
            default_options: Value::Object(Default::default()),
            filter: ComponentFilter::default(),
            hook,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_default_options(mut self, options: Value) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_formats(mut self, formats: &[&str]) -> Self {
        self.filter.formats = formats.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_path_pattern(mut self, pattern: &str) -> Result<Self> {
        self.filter.path_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn capability(&self) -> Capability {
        self.hook.capability()
    }

    pub fn applies_to(&self, path: &Path, format: &str) -> bool {
        self.filter.matches(path, format)
    }

    /// Default options shallow-merged with the override object, if any
    pub fn effective_options(&self, overrides: Option<&Value>) -> Value {
        match (&self.default_options, overrides) {
            (Value::Object(defaults), Some(Value::Object(custom))) => {
                let mut merged = defaults.clone();
                for (key, value) in custom {
                    merged.insert(key.clone(), value.clone());
                }
                Value::Object(merged)
            }
            (_, Some(custom)) => custom.clone(),
            (defaults, None) => defaults.clone(),
        }
    }
}

/// Ordered set of components.
///
/// Components run in ascending priority; equal priorities keep registration
/// order. The registry is passed explicitly into each build, never global.
#[derive(Debug, Default, Clone)]
pub struct ComponentRegistry {
    components: Vec<Component>,
    by_capability: HashMap<Capability, Vec<usize>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Names must be unique within a capability.
    pub fn register(&mut self, component: Component) -> Result<()> {
        let capability = component.capability();
        if self
            .components
            .iter()
            .any(|existing| existing.capability() == capability && existing.name == component.name)
        {
            return Err(KilnError::config(format!(
                "component '{}' is already registered for {:?}",
                component.name, capability
            )));
        }

        self.components.push(component);
        self.reindex();
        Ok(())
    }

    pub fn with(mut self, component: Component) -> Result<Self> {
        self.register(component)?;
        Ok(self)
    }

    fn reindex(&mut self) {
        self.by_capability.clear();
        for (index, component) in self.components.iter().enumerate() {
            self.by_capability
                .entry(component.capability())
                .or_default()
                .push(index);
        }
        for indices in self.by_capability.values_mut() {
            // stable: ties keep registration order
            indices.sort_by_key(|&index| self.components[index].priority);
        }
    }

    /// Components of one capability, in dispatch order
    pub fn by_capability(&self, capability: Capability) -> impl Iterator<Item = &Component> {
        self.by_capability
            .get(&capability)
            .into_iter()
            .flatten()
            .map(move |&index| &self.components[index])
    }

    /// Load/transform components that apply to a file, in dispatch order
    pub fn matching(&self, capability: Capability, path: &Path, format: &str) -> Vec<&Component> {
        self.by_capability(capability)
            .filter(|component| component.applies_to(path, format))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|component| component.name == name)
    }
}

/// Effective callback contexts for one build, computed once from the registry
#[derive(Debug, Clone)]
pub struct ComponentContexts {
    by_component: HashMap<(Capability, String), ComponentContext>,
    fallback: ComponentContext,
}

impl ComponentContexts {
    pub fn new(registry: &ComponentRegistry, root: &Path, overrides: &HashMap<String, Value>) -> Self {
        let by_component = registry
            .components
            .iter()
            .map(|component| {
                let ctx = ComponentContext {
                    root: root.to_path_buf(),
                    options: component.effective_options(overrides.get(&component.name)),
                };
                ((component.capability(), component.name.clone()), ctx)
            })
            .collect();

        Self {
            by_component,
            fallback: ComponentContext {
                root: root.to_path_buf(),
                options: Value::Object(Default::default()),
            },
        }
    }

    pub fn get(&self, component: &Component) -> &ComponentContext {
        self.by_component
            .get(&(component.capability(), component.name.clone()))
            .unwrap_or(&self.fallback)
    }
}
