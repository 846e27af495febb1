//! Generic registry keyed by a string ID.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Items stored in a [`BaseRegistry`] provide their own unique ID.
pub trait Registerable: Send + Sync {
    fn registry_id(&self) -> &str;
}

/// Thread-safe registry rejecting duplicate IDs.
pub struct BaseRegistry<T: ?Sized + Registerable> {
    items: DashMap<String, Arc<T>>,
}

impl<T: ?Sized + Registerable> BaseRegistry<T> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    /// Register an item. Fails if the ID is taken; the existing item is kept.
    pub fn register(&self, item: Arc<T>) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;

        let id = item.registry_id().to_string();
        match self.items.entry(id) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(item);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, id: &str) -> Result<Arc<T>, RegistryError> {
        self.items
            .remove(id)
            .map(|(_, item)| item)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.items.get(id).map(|item| item.clone())
    }

    pub fn clear(&self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<T>> + '_ {
        self.items.iter().map(|entry| entry.value().clone())
    }
}

impl<T: ?Sized + Registerable> Default for BaseRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
