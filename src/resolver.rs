use crate::config::ResolveConfig;
use crate::core::interfaces::FileSystemService;
use crate::core::plugin::{
    Capability, Component, ComponentContext, ComponentContexts, ComponentHook, ComponentRegistry, Outcome,
    Resolution, ResolveHook,
};
use crate::utils::{KilnError, PathAliasResolver, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Name the built-in filesystem resolver registers under
pub const FS_RESOLVER: &str = "fs-resolver";

/// Dispatches a request over every resolve component in priority order.
/// The first `Handled` wins; `Skipped` means "not mine", not "not found".
pub struct Resolver {
    registry: Arc<ComponentRegistry>,
    contexts: Arc<ComponentContexts>,
}

impl Resolver {
    pub fn new(registry: Arc<ComponentRegistry>, contexts: Arc<ComponentContexts>) -> Self {
        Self { registry, contexts }
    }

    pub async fn resolve(&self, request: &str, from: Option<&Path>) -> Result<Resolution> {
        for component in self.registry.by_capability(Capability::Resolve) {
            let ComponentHook::Resolve(hook) = &component.hook else {
                continue;
            };

            match hook.resolve(request, from, self.contexts.get(component)).await {
                Outcome::Handled(resolution) => {
                    debug!(
                        "🔎 {} resolved '{}' → {} ({})",
                        component.name,
                        request,
                        resolution.path.display(),
                        resolution.format
                    );
                    return Ok(resolution);
                }
                Outcome::Skipped => continue,
                Outcome::Failed(err) => return Err(err),
            }
        }

        Err(KilnError::resolution(request, from, "no resolver handled the request"))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    module: Option<String>,
}

/// Built-in resolver over the real filesystem: aliases, relative and
/// absolute paths, bare packages under `node_modules`, extension inference
/// from the format table, directory indexes and package-root detection.
pub struct FileSystemResolver {
    fs: Arc<dyn FileSystemService>,
    config: ResolveConfig,
    root: PathBuf,
    aliases: PathAliasResolver,
    manifests: DashMap<PathBuf, Option<PackageManifest>>,
    package_roots: DashMap<PathBuf, Option<PathBuf>>,
}

impl FileSystemResolver {
    pub fn new(fs: Arc<dyn FileSystemService>, config: ResolveConfig, root: PathBuf) -> Self {
        let aliases = PathAliasResolver::new(&config.alias, &root);
        Self {
            fs,
            config,
            root,
            aliases,
            manifests: DashMap::new(),
            package_roots: DashMap::new(),
        }
    }

    /// Wrap as the `fs-resolver` component. It runs last so custom resolvers
    /// get the first look at every request.
    pub fn into_component(self) -> Component {
        Component::new(FS_RESOLVER, env!("CARGO_PKG_VERSION"), ComponentHook::Resolve(Arc::new(self))).with_priority(1000)
    }

    async fn lookup(&self, request: &str, from: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(rewritten) = self.aliases.rewrite(request) {
            return self.resolve_file_or_directory(&rewritten).await.map(Some);
        }

        if is_relative_request(request) {
            let base = from.and_then(Path::parent).unwrap_or(&self.root);
            return self.resolve_file_or_directory(&base.join(request)).await.map(Some);
        }

        let as_path = Path::new(request);
        if as_path.is_absolute() {
            if self.fs.is_file(as_path).await || self.fs.is_dir(as_path).await {
                return self.resolve_file_or_directory(as_path).await.map(Some);
            }
            let rooted = self.root.join(request.trim_start_matches('/'));
            return self.resolve_file_or_directory(&rooted).await.map(Some);
        }

        self.resolve_bare(request, from).await
    }

    async fn resolve_bare(&self, request: &str, from: Option<&Path>) -> Result<Option<PathBuf>> {
        let (package_name, subpath) = split_package_specifier(request);
        let mut current = from.and_then(Path::parent).unwrap_or(&self.root).to_path_buf();

        loop {
            let package_dir = current.join("node_modules").join(package_name);
            if self.fs.is_dir(&package_dir).await {
                let target = match subpath {
                    Some(subpath) => self.resolve_file_or_directory(&package_dir.join(subpath)).await?,
                    None => self.resolve_file_or_directory(&package_dir).await?,
                };
                return Ok(Some(target));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok(None),
            }
        }
    }

    async fn resolve_file_or_directory(&self, candidate: &Path) -> Result<PathBuf> {
        if self.fs.is_file(candidate).await {
            return Ok(candidate.to_path_buf());
        }

        if let Some(found) = self.with_inferred_extension(candidate).await {
            return Ok(found);
        }

        if self.fs.is_dir(candidate).await {
            if let Some(manifest) = self.manifest(candidate).await {
                for field in &self.config.main_fields {
                    let entry = match field.as_str() {
                        "module" => manifest.module.as_deref(),
                        "main" => manifest.main.as_deref(),
                        _ => None,
                    };
                    if let Some(entry) = entry {
                        let target = candidate.join(entry);
                        if self.fs.is_file(&target).await {
                            return Ok(target);
                        }
                        if let Some(found) = self.with_inferred_extension(&target).await {
                            return Ok(found);
                        }
                    }
                }
            }

            if let Some(found) = self.with_inferred_extension(&candidate.join("index")).await {
                return Ok(found);
            }
        }

        Err(KilnError::resolution(
            candidate.display().to_string(),
            None,
            "no matching file",
        ))
    }

    /// Try `candidate.<ext>` for every extension of every format, in table order
    async fn with_inferred_extension(&self, candidate: &Path) -> Option<PathBuf> {
        for rule in &self.config.formats {
            for ext in &rule.extensions {
                let mut with_ext = candidate.as_os_str().to_owned();
                with_ext.push(".");
                with_ext.push(ext);
                let with_ext = PathBuf::from(with_ext);
                if self.fs.is_file(&with_ext).await {
                    return Some(with_ext);
                }
            }
        }
        None
    }

    async fn manifest(&self, dir: &Path) -> Option<PackageManifest> {
        if let Some(cached) = self.manifests.get(dir) {
            return cached.clone();
        }

        let manifest = match self.fs.read_bytes(&dir.join(&self.config.package_marker)).await {
            Ok(bytes) => serde_json::from_slice::<PackageManifest>(&bytes).ok(),
            Err(_) => None,
        };
        self.manifests.insert(dir.to_path_buf(), manifest.clone());
        manifest
    }

    /// Nearest ancestor directory holding the package marker file
    async fn package_root(&self, file: &Path) -> Option<PathBuf> {
        let start = file.parent()?.to_path_buf();
        let mut visited = Vec::new();
        let mut current = Some(start.as_path());
        let mut found = None;

        while let Some(dir) = current {
            if let Some(cached) = self.package_roots.get(dir) {
                found = cached.clone();
                break;
            }
            visited.push(dir.to_path_buf());
            if self.fs.is_file(&dir.join(&self.config.package_marker)).await {
                found = Some(dir.to_path_buf());
                break;
            }
            current = dir.parent();
        }

        for dir in visited {
            self.package_roots.insert(dir, found.clone());
        }
        found
    }
}

#[async_trait]
impl ResolveHook for FileSystemResolver {
    async fn resolve(&self, request: &str, from: Option<&Path>, _ctx: &ComponentContext) -> Outcome<Resolution> {
        let path = match self.lookup(request, from).await {
            Ok(Some(path)) => path,
            Ok(None) => return Outcome::Skipped,
            Err(KilnError::Resolution { reason, .. }) => {
                return Outcome::Failed(KilnError::resolution(request, from, reason));
            }
            Err(err) => return Outcome::Failed(err),
        };

        let path = match self.fs.canonicalize(&path).await {
            Ok(canonical) => canonical,
            Err(_) => normalize(&path),
        };
        let format = self.config.format_for(&path).unwrap_or("static").to_string();
        let package_root = self.package_root(&path).await;

        Outcome::Handled(Resolution {
            path,
            format,
            package_root,
        })
    }
}

fn is_relative_request(request: &str) -> bool {
    request == "." || request == ".." || request.starts_with("./") || request.starts_with("../")
}

/// `@scope/pkg/sub/path` → (`@scope/pkg`, `Some("sub/path")`)
fn split_package_specifier(request: &str) -> (&str, Option<&str>) {
    let split_at = if request.starts_with('@') {
        request.match_indices('/').nth(1).map(|(i, _)| i)
    } else {
        request.find('/')
    };

    match split_at {
        Some(i) => (&request[..i], Some(&request[i + 1..])),
        None => (request, None),
    }
}

/// Lexical cleanup of `.` and `..` for paths that could not be canonicalized
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            PathComponent::CurDir => {}
            PathComponent::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::TokioFileSystemService;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn resolver_for(root: &Path, config: ResolveConfig, extra: Vec<Component>) -> Resolver {
        let mut registry = ComponentRegistry::new();
        for component in extra {
            registry.register(component).unwrap();
        }
        let fs_resolver = FileSystemResolver::new(Arc::new(TokioFileSystemService), config, root.to_path_buf());
        registry.register(fs_resolver.into_component()).unwrap();
        let contexts = ComponentContexts::new(&registry, root, &HashMap::new());
        Resolver::new(Arc::new(registry), Arc::new(contexts))
    }

    fn project() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src/components")).unwrap();
        fs::write(root.join("src/main.js"), "import './util'").unwrap();
        fs::write(root.join("src/util.ts"), "export {}").unwrap();
        fs::write(root.join("src/style.css"), "body {}").unwrap();
        fs::write(root.join("src/components/index.jsx"), "export {}").unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn test_relative_request_with_extension_inference() {
        let (_dir, root) = project();
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![]);

        let resolved = resolver.resolve("./util", Some(&root.join("src/main.js"))).await.unwrap();
        assert_eq!(resolved.path, root.join("src/util.ts"));
        assert_eq!(resolved.format, "script");

        let css = resolver.resolve("./style.css", Some(&root.join("src/main.js"))).await.unwrap();
        assert_eq!(css.format, "style");
    }

    #[tokio::test]
    async fn test_directory_index() {
        let (_dir, root) = project();
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![]);

        let resolved = resolver
            .resolve("./components", Some(&root.join("src/main.js")))
            .await
            .unwrap();
        assert_eq!(resolved.path, root.join("src/components/index.jsx"));
    }

    #[tokio::test]
    async fn test_entry_without_importer_resolves_from_root() {
        let (_dir, root) = project();
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![]);

        let resolved = resolver.resolve("./src/main", None).await.unwrap();
        assert_eq!(resolved.path, root.join("src/main.js"));
    }

    #[tokio::test]
    async fn test_alias_rewrite() {
        let (_dir, root) = project();
        let mut config = ResolveConfig::default();
        config.alias.insert("@".to_string(), "./src".to_string());
        let resolver = resolver_for(&root, config, vec![]);

        let resolved = resolver.resolve("@/components", Some(&root.join("src/main.js"))).await.unwrap();
        assert_eq!(resolved.path, root.join("src/components/index.jsx"));
    }

    #[tokio::test]
    async fn test_bare_package_and_package_root() {
        let (_dir, root) = project();
        let pkg = root.join("node_modules/@scope/lib");
        fs::create_dir_all(pkg.join("dist")).unwrap();
        fs::write(pkg.join("package.json"), r#"{ "name": "@scope/lib", "module": "dist/lib.mjs" }"#).unwrap();
        fs::write(pkg.join("dist/lib.mjs"), "export {}").unwrap();
        fs::write(pkg.join("dist/extra.js"), "export {}").unwrap();
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![]);

        let from = root.join("src/main.js");
        let resolved = resolver.resolve("@scope/lib", Some(&from)).await.unwrap();
        assert_eq!(resolved.path, pkg.join("dist/lib.mjs"));
        assert_eq!(resolved.package_root, Some(pkg.clone()));

        let sub = resolver.resolve("@scope/lib/dist/extra", Some(&from)).await.unwrap();
        assert_eq!(sub.path, pkg.join("dist/extra.js"));
    }

    #[tokio::test]
    async fn test_missing_relative_file_is_resolution_error() {
        let (_dir, root) = project();
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![]);

        let err = resolver
            .resolve("./nope", Some(&root.join("src/main.js")))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Resolution { ref request, .. } if request == "./nope"));
    }

    #[tokio::test]
    async fn test_unknown_bare_package_is_unhandled() {
        let (_dir, root) = project();
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![]);

        let err = resolver.resolve("left-pad", Some(&root.join("src/main.js"))).await.unwrap_err();
        assert!(err.to_string().contains("no resolver handled"));
    }

    struct Virtual;

    #[async_trait]
    impl ResolveHook for Virtual {
        async fn resolve(&self, request: &str, _from: Option<&Path>, _ctx: &ComponentContext) -> Outcome<Resolution> {
            if request.starts_with("virtual:") {
                Outcome::Handled(Resolution {
                    path: PathBuf::from(format!("/{}", request)),
                    format: "script".to_string(),
                    package_root: None,
                })
            } else {
                Outcome::Skipped
            }
        }
    }

    #[tokio::test]
    async fn test_custom_resolver_runs_first_and_skips_fall_through() {
        let (_dir, root) = project();
        let custom = Component::new("virtual", "1.0.0", ComponentHook::Resolve(Arc::new(Virtual))).with_priority(10);
        let resolver = resolver_for(&root, ResolveConfig::default(), vec![custom]);

        let virt = resolver.resolve("virtual:env", None).await.unwrap();
        assert_eq!(virt.path, PathBuf::from("/virtual:env"));

        let real = resolver.resolve("./util", Some(&root.join("src/main.js"))).await.unwrap();
        assert_eq!(real.path, root.join("src/util.ts"));
    }

    #[test]
    fn test_split_package_specifier() {
        assert_eq!(split_package_specifier("react"), ("react", None));
        assert_eq!(split_package_specifier("react/jsx"), ("react", Some("jsx")));
        assert_eq!(split_package_specifier("@a/b"), ("@a/b", None));
        assert_eq!(split_package_specifier("@a/b/c/d"), ("@a/b", Some("c/d")));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    }
}
