// Built-in import scanners
pub mod script_imports;
pub mod style_imports;

pub use script_imports::*;
pub use style_imports::*;

use crate::core::plugin::Component;

/// The scanners every default build registers
pub fn import_scanners() -> Vec<Component> {
    vec![
        ScriptImportScanner.into_component(),
        StyleImportScanner.into_component(),
    ]
}
