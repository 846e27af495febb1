//! # botkernel Config
//!
//! Configuration management for the kernel profile directory.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{default_profile_dir, ConfigLoader, CONFIG_FILE_NAME};
pub use schema::*;
