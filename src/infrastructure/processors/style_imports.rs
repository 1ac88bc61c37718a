// Import discovery for stylesheets
// @import pulls in another stylesheet, url(...) side-loads an asset

use crate::core::models::ImportKind;
use crate::core::plugin::{
    Component, ComponentContext, ComponentHook, Outcome, StageEffects, TransformHook, TransformInput, TransformOutput,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

pub const STYLE_IMPORTS: &str = "style-imports";

static CSS_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\s*\()?\s*['"]([^'"]+)['"]"#).expect("css import regex")
});
static CSS_URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).expect("css url regex"));

pub struct StyleImportScanner;

impl StyleImportScanner {
    pub fn into_component(self) -> Component {
        Component::new(STYLE_IMPORTS, env!("CARGO_PKG_VERSION"), ComponentHook::Transform(Arc::new(self)))
            .with_priority(100)
            .with_formats(&["style"])
    }

    /// Local references of a stylesheet, in source order, as relative requests
    pub fn scan(source: &str) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();

        for regex in [&*CSS_IMPORT_REGEX, &*CSS_URL_REGEX] {
            for cap in regex.captures_iter(source) {
                let Some(reference) = cap.get(1) else { continue };
                let reference = reference.as_str().trim();
                if is_external(reference) {
                    continue;
                }
                let request = as_relative_request(strip_query(reference));
                if !found.iter().any(|(_, existing)| *existing == request) {
                    found.push((cap.get(0).map_or(0, |m| m.start()), request));
                }
            }
        }

        found.sort_by_key(|(offset, _)| *offset);
        found.into_iter().map(|(_, request)| request).collect()
    }
}

#[async_trait]
impl TransformHook for StyleImportScanner {
    async fn transform(
        &self,
        input: TransformInput<'_>,
        effects: &mut StageEffects,
        _ctx: &ComponentContext,
    ) -> Outcome<TransformOutput> {
        let Some(source) = input.contents.as_text() else {
            return Outcome::Skipped;
        };

        for request in Self::scan(source) {
            effects.add_import(request, ImportKind::Sync);
        }
        Outcome::Skipped
    }
}

fn is_external(reference: &str) -> bool {
    reference.is_empty()
        || reference.starts_with('#')
        || reference.starts_with("data:")
        || reference.starts_with("//")
        || reference.contains("://")
}

fn strip_query(reference: &str) -> &str {
    reference.split(|c| c == '?' || c == '#').next().unwrap_or(reference)
}

// stylesheet references are relative to the stylesheet even without "./"
fn as_relative_request(reference: &str) -> String {
    if reference.starts_with('.') || reference.starts_with('/') {
        reference.to_string()
    } else {
        format!("./{}", reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_imports_and_assets() {
        let source = r#"
@import "./reset.css";
@import url('theme.css');
.logo { background: url(img/logo.png?v=2); }
.font { src: url("data:font/woff2;base64,AAAA"); }
.remote { background: url(https://cdn.example.com/x.png); }
"#;
        assert_eq!(
            StyleImportScanner::scan(source),
            vec!["./reset.css", "./theme.css", "./img/logo.png"]
        );
    }

    #[test]
    fn test_fragment_only_urls_are_ignored() {
        assert!(StyleImportScanner::scan("mask: url(#clip);").is_empty());
    }
}
