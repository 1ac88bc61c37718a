// kiln - build graph engine for a module bundler
// Resolution, transform pipeline, chunk graph and incremental rebuilds

pub mod cache;
pub mod chunks;
pub mod config;
pub mod core;
pub mod graph;
pub mod incremental;
pub mod infrastructure;
pub mod pipeline;
pub mod plugins;
pub mod resolver;
pub mod runtime;
pub mod utils;

pub use crate::config::{BuildConfig, CacheConfig, FailurePolicy, FormatRule, ResolveConfig};
pub use crate::core::models::{
    Artifact, BuildOutput, BuildStats, Chunk, ChunkGraph, ChunkKind, Contents, File, FileImport, ImportKind, Issue,
    Severity,
};
pub use crate::core::plugin::{Capability, Component, ComponentContext, ComponentRegistry, Outcome};
pub use crate::core::services::Bundler;
pub use crate::incremental::{ChangeEvent, ChangeKind, ChangeSet, CoordinatorState, RebuildCoordinator, RebuildOutcome};
pub use crate::utils::{KilnError, Result};
