use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Rewrites aliased requests (`@/components/Button`) into filesystem paths
/// before the resolver looks them up.
#[derive(Debug, Clone)]
pub struct PathAliasResolver {
    /// Longest alias first so `@app` wins over `@` for `@app/x`
    aliases: Vec<(String, PathBuf)>,
}

impl PathAliasResolver {
    pub fn new(aliases: &HashMap<String, String>, root: &Path) -> Self {
        let mut aliases: Vec<(String, PathBuf)> = aliases
            .iter()
            .map(|(alias, target)| (alias.clone(), Self::resolve_target(target, root)))
            .collect();
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        if !aliases.is_empty() {
            debug!("🔗 {} path aliases configured", aliases.len());
        }

        Self { aliases }
    }

    /// Rewrite `request` if an alias matches it exactly or as a `alias/` prefix
    pub fn rewrite(&self, request: &str) -> Option<PathBuf> {
        for (alias, target) in &self.aliases {
            if request == alias {
                return Some(target.clone());
            }

            if let Some(rest) = request.strip_prefix(alias.as_str()).and_then(|r| r.strip_prefix('/')) {
                let rewritten = target.join(rest);
                debug!("🔗 Resolved alias: {} → {}", request, rewritten.display());
                return Some(rewritten);
            }
        }

        None
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    fn resolve_target(target: &str, root: &Path) -> PathBuf {
        let path = Path::new(target);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(target.strip_prefix("./").unwrap_or(target))
        }
    }
}
