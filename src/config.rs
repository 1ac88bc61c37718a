use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps a format tag to the file extensions that carry it.
/// Order matters: extension inference tries rules top to bottom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRule {
    pub format: String,
    pub extensions: Vec<String>,
}

impl FormatRule {
    pub fn new(format: &str, extensions: &[&str]) -> Self {
        Self {
            format: format.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConfig {
    #[serde(default = "default_formats")]
    pub formats: Vec<FormatRule>,
    #[serde(default)]
    pub alias: HashMap<String, String>,
    /// File whose presence marks a directory as a package root
    #[serde(default = "default_package_marker")]
    pub package_marker: String,
    #[serde(default = "default_main_fields")]
    pub main_fields: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            alias: HashMap::new(),
            package_marker: default_package_marker(),
            main_fields: default_main_fields(),
        }
    }
}

impl ResolveConfig {
    /// Format tag for a path, by extension
    pub fn format_for(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.formats
            .iter()
            .find(|rule| rule.extensions.iter().any(|e| *e == ext))
            .map(|rule| rule.format.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `<root>/.kiln-cache` when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            flush_debounce_ms: default_flush_debounce_ms(),
        }
    }
}

/// What happens to the build when a single file fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any file failure fails the whole build
    #[default]
    AbortBuild,
    /// Only chunks that would contain the failed file are dropped; an entry
    /// chunk being dropped still fails the build
    IsolateChunks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub root: PathBuf,
    /// Entry requests, resolved against `root`
    #[serde(default)]
    pub entries: Vec<String>,
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,
    #[serde(default)]
    pub write_output: bool,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub resolve: ResolveConfig,
    #[serde(default = "default_true")]
    pub extract_shared: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    /// Per-component option overrides, keyed by component name
    #[serde(default)]
    pub component_options: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub source_maps: bool,
}

impl BuildConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            outdir: root.join(default_outdir()),
            root,
            entries: Vec::new(),
            write_output: false,
            cache: CacheConfig::default(),
            resolve: ResolveConfig::default(),
            extract_shared: true,
            failure_policy: FailurePolicy::default(),
            max_concurrency: default_concurrency(),
            component_options: HashMap::new(),
            source_maps: true,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entries.push(entry.into());
        self
    }

    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = outdir.into();
        self.write_output = true;
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache.enabled = enabled;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = Some(dir.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.resolve.alias.insert(alias.into(), target.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_shared_extraction(mut self, enabled: bool) -> Self {
        self.extract_shared = enabled;
        self
    }

    pub fn with_component_options(mut self, component: impl Into<String>, options: serde_json::Value) -> Self {
        self.component_options.insert(component.into(), options);
        self
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.root.join(".kiln-cache"))
    }
}

fn default_formats() -> Vec<FormatRule> {
    vec![
        FormatRule::new("script", &["js", "mjs", "cjs", "jsx", "ts", "tsx"]),
        FormatRule::new("style", &["css"]),
        FormatRule::new("markup", &["html", "htm"]),
        FormatRule::new("json", &["json"]),
        FormatRule::new(
            "static",
            &["png", "jpg", "jpeg", "gif", "svg", "webp", "woff", "woff2", "ttf", "wasm", "txt"],
        ),
    ]
}

fn default_package_marker() -> String {
    "package.json".to_string()
}

fn default_main_fields() -> Vec<String> {
    vec!["module".to_string(), "main".to_string()]
}

fn default_outdir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_true() -> bool {
    true
}

fn default_flush_debounce_ms() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    num_cpus::get().max(1) * 2
}
