//! Configuration Module
//!
//! Resolves the server configuration from explicit builder calls, an
//! external source (TOML file and environment) and built-in defaults.

pub mod builder;
pub mod defaults;
pub mod manager;
pub mod types;

pub use builder::ServerBuilder;
pub use manager::ConfigManager;
pub use types::*;
