// Built-in components for kiln

pub mod banner_plugin;
pub mod registry_generator;
pub mod stats_plugin;

pub use banner_plugin::{BannerPlugin, BANNER};
pub use registry_generator::{module_id, RegistryGenerator, REGISTRY_GENERATOR};
pub use stats_plugin::{StatsPlugin, STATS};

use crate::config::BuildConfig;
use crate::core::plugin::ComponentRegistry;
use crate::infrastructure::processors::import_scanners;
use crate::utils::Result;
use std::sync::Arc;

/// Import scanners, the registry generator, the banner and the stats
/// reporter. The filesystem resolver is added by the bundler itself.
pub fn default_registry(config: &BuildConfig) -> Result<ComponentRegistry> {
    let mut registry = ComponentRegistry::new();
    for component in import_scanners() {
        registry.register(component)?;
    }
    registry.register(RegistryGenerator::new(config.source_maps).into_component())?;
    registry.register(BannerPlugin::new().into_component())?;
    for component in StatsPlugin::components(&Arc::new(StatsPlugin::new(false))) {
        registry.register(component)?;
    }
    Ok(registry)
}
