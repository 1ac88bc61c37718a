// Infrastructure layer
pub mod file_system;
pub mod hmr;
pub mod processors;

pub use file_system::*;
pub use hmr::*;
pub use processors::*;
