// Banner Plugin: Adds a comment banner to the top of script and style artifacts

use crate::core::models::{Artifact, Contents};
use crate::core::plugin::{Component, ComponentContext, ComponentHook, Outcome, PostGenerateHook};
use crate::utils::Logger;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub const BANNER: &str = "banner";

/// Post-generate component that prepends a banner comment.
///
/// The text comes from the `banner` option; with no banner configured the
/// component skips.
///
/// # Example
/// ```
/// use kiln::plugins::BannerPlugin;
/// use kiln::core::plugin::ComponentRegistry;
///
/// let mut registry = ComponentRegistry::new();
/// registry
///     .register(BannerPlugin::with_banner("/*! MyApp v1.0.0 */").into_component())
///     .unwrap();
/// ```
#[derive(Default)]
pub struct BannerPlugin {
    banner: Option<String>,
}

impl BannerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Banner used when the build passes no `banner` option override
    pub fn with_banner(banner: impl Into<String>) -> Self {
        Self {
            banner: Some(banner.into()),
        }
    }

    pub fn into_component(self) -> Component {
        let defaults = json!({ "banner": self.banner });
        Component::new(BANNER, env!("CARGO_PKG_VERSION"), ComponentHook::PostGenerate(Arc::new(self)))
            .with_priority(100)
            .with_default_options(defaults)
    }
}

#[async_trait]
impl PostGenerateHook for BannerPlugin {
    async fn post_generate(&self, artifacts: &mut Vec<Artifact>, ctx: &ComponentContext) -> Outcome<()> {
        let Some(text) = ctx.options["banner"].as_str() else {
            return Outcome::Skipped;
        };
        let banner = as_comment(text);
        let lines = banner.lines().count() as u32;

        let mut stamped = 0;
        for artifact in artifacts.iter_mut() {
            if !matches!(artifact.format.as_str(), "script" | "style") {
                continue;
            }
            let Contents::Text(code) = &artifact.contents else {
                continue;
            };

            artifact.contents = Contents::Text(format!("{}\n{}", banner, code));
            if let Some(map) = &artifact.source_map {
                artifact.source_map = Some(shift_mappings(map, lines));
            }
            stamped += 1;
        }

        Logger::debug(&format!("Banner added to {} artifacts", stamped));
        Outcome::Handled(())
    }
}

fn as_comment(text: &str) -> String {
    if text.trim_start().starts_with("/*") {
        text.to_string()
    } else {
        format!("/*! {} */", text)
    }
}

/// Each leading `;` in `mappings` moves every segment down one generated line
fn shift_mappings(map: &str, lines: u32) -> String {
    let Ok(mut parsed) = serde_json::from_str::<Value>(map) else {
        return map.to_string();
    };
    if let Some(Value::String(mappings)) = parsed.get_mut("mappings") {
        mappings.insert_str(0, &";".repeat(lines as usize));
    }
    parsed.to_string()
}
