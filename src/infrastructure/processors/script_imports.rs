// Import discovery for script files
// ES module imports/re-exports and require() are synchronous, import() is dynamic

use crate::core::models::ImportKind;
use crate::core::plugin::{
    Component, ComponentContext, ComponentHook, Outcome, StageEffects, TransformHook, TransformInput, TransformOutput,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

pub const SCRIPT_IMPORTS: &str = "script-imports";

// Pre-compiled patterns
static STATIC_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^|[;\s])(?:import|export)\s+(?:[\w*${}\s,]+?\s+from\s*)?['"]([^'"]+)['"]"#)
        .expect("static import regex")
});
static DYNAMIC_IMPORT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("dynamic import regex"));
static REQUIRE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require regex"));

/// Registers every import a script declares, leaving its contents untouched
pub struct ScriptImportScanner;

impl ScriptImportScanner {
    pub fn into_component(self) -> Component {
        Component::new(SCRIPT_IMPORTS, env!("CARGO_PKG_VERSION"), ComponentHook::Transform(Arc::new(self)))
            .with_priority(100)
            .with_formats(&["script"])
    }

    /// Import requests in source order
    pub fn scan(source: &str) -> Vec<(String, ImportKind)> {
        let mut found: Vec<(usize, String, ImportKind)> = Vec::new();

        let patterns = [
            (&*STATIC_IMPORT_REGEX, ImportKind::Sync),
            (&*REQUIRE_REGEX, ImportKind::Sync),
            (&*DYNAMIC_IMPORT_REGEX, ImportKind::Dynamic),
        ];
        for (regex, kind) in patterns {
            for cap in regex.captures_iter(source) {
                if let Some(request) = cap.get(1) {
                    found.push((request.start(), request.as_str().to_string(), kind));
                }
            }
        }

        found.sort_by_key(|(offset, _, _)| *offset);
        found.into_iter().map(|(_, request, kind)| (request, kind)).collect()
    }
}

#[async_trait]
impl TransformHook for ScriptImportScanner {
    async fn transform(
        &self,
        input: TransformInput<'_>,
        effects: &mut StageEffects,
        _ctx: &ComponentContext,
    ) -> Outcome<TransformOutput> {
        let Some(source) = input.contents.as_text() else {
            return Outcome::Skipped;
        };

        for (request, kind) in Self::scan(source) {
            effects.add_import(request, kind);
        }
        Outcome::Skipped
    }
}
