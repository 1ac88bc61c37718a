// Core domain layer
pub mod interfaces;
pub mod models;
pub mod plugin;
pub mod services;

pub use interfaces::*;
pub use models::*;
pub use services::*;
