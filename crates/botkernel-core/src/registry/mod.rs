//! Kernel registries.

mod base;
mod database;
mod module;
mod plugin;

pub use base::{BaseRegistry, Registerable, RegistryError};
pub use database::DatabaseRegistry;
pub use module::ModuleRegistry;
pub use plugin::{PluginEntry, PluginRegistry};
