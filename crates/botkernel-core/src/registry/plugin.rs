//! Plugin namespace registry.

use std::sync::Arc;

use serde::Serialize;

use super::base::{BaseRegistry, Registerable, RegistryError};

/// A plugin namespace claimed by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub namespace: String,
    pub plugin_name: String,
    pub version: String,
    pub author: String,
    /// Module ID that serves the plugin.
    pub resolver: String,
}

impl Registerable for PluginEntry {
    fn registry_id(&self) -> &str {
        &self.namespace
    }
}

/// Plugin namespaces; the first registration of a namespace wins.
#[derive(Default)]
pub struct PluginRegistry {
    inner: BaseRegistry<PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a namespace. Returns `false` on conflict.
    pub fn register(&self, entry: PluginEntry) -> bool {
        match self.inner.register(Arc::new(entry)) {
            Ok(()) => true,
            Err(RegistryError::AlreadyRegistered(_)) | Err(RegistryError::NotFound(_)) => false,
        }
    }

    pub fn unregister(&self, namespace: &str) -> bool {
        self.inner.unregister(namespace).is_ok()
    }

    pub fn get(&self, namespace: &str) -> Option<PluginEntry> {
        self.inner.get(namespace).map(|entry| (*entry).clone())
    }

    pub fn list(&self) -> Vec<PluginEntry> {
        let mut entries: Vec<_> = self.inner.iter().map(|e| (*e).clone()).collect();
        entries.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        entries
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
