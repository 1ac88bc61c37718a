use crate::utils::KilnError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// File contents after loading or transformation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Contents {
    Text(String),
    Bytes(Vec<u8>),
}

impl Contents {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Contents::Text(text) => text.as_bytes(),
            Contents::Bytes(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Contents::Text(text) => Some(text),
            Contents::Bytes(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text stays text; bytes become text only when they are valid UTF-8
    pub fn from_raw(bytes: Vec<u8>, binary: bool) -> Self {
        if binary {
            return Contents::Bytes(bytes);
        }
        match String::from_utf8(bytes) {
            Ok(text) => Contents::Text(text),
            Err(err) => Contents::Bytes(err.into_bytes()),
        }
    }
}

impl From<&str> for Contents {
    fn from(text: &str) -> Self {
        Contents::Text(text.to_string())
    }
}

impl From<String> for Contents {
    fn from(text: String) -> Self {
        Contents::Text(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImportKind {
    /// Loaded together with the importer; never crosses a chunk boundary
    Sync,
    /// Deferred to runtime; the target seeds its own chunk
    Dynamic,
}

/// An import as registered by a pipeline stage, before resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportRequest {
    pub request: String,
    pub kind: ImportKind,
}

/// An import edge of a [`File`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImport {
    pub request: String,
    pub kind: ImportKind,
    /// `None` until the resolver has mapped the request
    pub resolved_path: Option<PathBuf>,
    pub format: Option<String>,
}

impl FileImport {
    pub fn unresolved(request: ImportRequest) -> Self {
        Self {
            request: request.request,
            kind: request.kind,
            resolved_path: None,
            format: None,
        }
    }
}

/// One resolved, transformed source unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: PathBuf,
    pub format: String,
    pub contents: Contents,
    /// Source map JSON, when a stage produced one
    pub source_map: Option<String>,
    pub imports: Vec<FileImport>,
    pub chunk_memberships: BTreeSet<String>,
    /// Back-references only; never an ownership edge
    pub parents: BTreeSet<PathBuf>,
    pub fingerprint: String,
    pub package_root: Option<PathBuf>,
}

impl File {
    pub fn new(path: PathBuf, format: impl Into<String>, contents: Contents) -> Self {
        Self {
            path,
            format: format.into(),
            contents,
            source_map: None,
            imports: Vec::new(),
            chunk_memberships: BTreeSet::new(),
            parents: BTreeSet::new(),
            fingerprint: String::new(),
            package_root: None,
        }
    }

    /// Resolved targets of synchronous imports
    pub fn sync_dependencies(&self) -> impl Iterator<Item = &Path> {
        self.imports
            .iter()
            .filter(|import| import.kind == ImportKind::Sync)
            .filter_map(|import| import.resolved_path.as_deref())
    }

    /// Resolved targets of dynamic imports
    pub fn dynamic_dependencies(&self) -> impl Iterator<Item = &Path> {
        self.imports
            .iter()
            .filter(|import| import.kind == ImportKind::Dynamic)
            .filter_map(|import| import.resolved_path.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Seeded by a configured entry
    Entry,
    /// Seeded by a dynamic import target
    Async,
    /// Synthesized by shared-module extraction
    Shared,
    /// Created by an explicit chunk membership with no matching chunk
    Explicit,
}

/// One cohesive output unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub kind: ChunkKind,
    pub format: String,
    pub entry: Option<PathBuf>,
    /// Member paths; the `File` values live in the job's file map
    pub files: BTreeSet<PathBuf>,
    /// Chunks that must be loaded before this one
    pub imports: BTreeSet<String>,
    /// Chunks this one may load at runtime
    pub async_imports: BTreeSet<String>,
}

impl Chunk {
    pub fn new(id: impl Into<String>, kind: ChunkKind, format: impl Into<String>, entry: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind,
            format: format.into(),
            entry,
            files: BTreeSet::new(),
            imports: BTreeSet::new(),
            async_imports: BTreeSet::new(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains(path)
    }
}

/// Chunks in dependency order: every chunk comes after the chunks it imports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGraph {
    pub chunks: Vec<Chunk>,
}

impl ChunkGraph {
    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.chunks.iter().position(|chunk| chunk.id == id)
    }

    /// Chunks that list `path` as a member
    pub fn chunks_containing<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks.iter().filter(move |chunk| chunk.contains(path))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Outcome of one deduplicated file request, shared by every requester
pub type FileOutcome = Result<Arc<File>, KilnError>;

/// In-flight work keyed by path: at most one pipeline run per path per job
pub type LockTable = DashMap<PathBuf, Arc<OnceCell<FileOutcome>>>;

/// One build session's mutable state. Owned by exactly one build invocation.
#[derive(Debug, Default)]
pub struct Job {
    pub entries: Vec<PathBuf>,
    pub files: BTreeMap<PathBuf, File>,
    pub chunks: Vec<Chunk>,
    pub locks: Arc<LockTable>,
    /// Snapshot from the prior successful build
    pub previous_files: Arc<BTreeMap<PathBuf, File>>,
    /// Paths in `previous_files` that must not be reused
    pub invalidated: Arc<BTreeSet<PathBuf>>,
    /// Files that failed, kept for chunk isolation and reporting
    pub failures: BTreeMap<PathBuf, KilnError>,
}

impl Job {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job from a previous build, reusing every file not invalidated
    pub fn from_previous(previous: Arc<BTreeMap<PathBuf, File>>, invalidated: BTreeSet<PathBuf>) -> Self {
        Self {
            previous_files: previous,
            invalidated: Arc::new(invalidated),
            ..Self::default()
        }
    }

    pub fn is_entry(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| entry == path)
    }
}

/// One output unit produced by a generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Relative to the output directory
    pub path: PathBuf,
    pub chunk: Option<String>,
    pub format: String,
    pub contents: Contents,
    pub source_map: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// A reported problem; every failure passes through the reporter as one of these
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub severity: Severity,
    pub error: KilnError,
}

impl Issue {
    pub fn error(error: KilnError) -> Self {
        Self { severity: Severity::Error, error }
    }

    pub fn warning(error: KilnError) -> Self {
        Self { severity: Severity::Warning, error }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub files: usize,
    pub transformed: usize,
    pub cache_hits: usize,
    pub reused: usize,
    pub chunks: usize,
    pub artifacts: usize,
    pub build_time: Duration,
}

/// Everything a finished build hands back
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub entries: Vec<PathBuf>,
    pub files: BTreeMap<PathBuf, File>,
    pub chunks: ChunkGraph,
    pub artifacts: Vec<Artifact>,
    pub issues: Vec<Issue>,
    pub stats: BuildStats,
}
