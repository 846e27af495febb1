//! Initialized databases and the default database selection.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::watch;

/// Database ID to resolver module ID, plus the selected default.
pub struct DatabaseRegistry {
    resolvers: RwLock<BTreeMap<u32, String>>,
    default: watch::Sender<Option<u32>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        let (default, _) = watch::channel(None);
        Self {
            resolvers: RwLock::new(BTreeMap::new()),
            default,
        }
    }

    /// Record an initialized database. Returns `false` if the ID is taken.
    pub fn insert(&self, id: u32, resolver: impl Into<String>) -> bool {
        let mut resolvers = self.resolvers.write();
        if resolvers.contains_key(&id) {
            return false;
        }
        resolvers.insert(id, resolver.into());
        true
    }

    pub fn contains(&self, id: u32) -> bool {
        self.resolvers.read().contains_key(&id)
    }

    pub fn resolver(&self, id: u32) -> Option<String> {
        self.resolvers.read().get(&id).cloned()
    }

    /// Lowest initialized database ID.
    pub fn lowest(&self) -> Option<u32> {
        self.resolvers.read().keys().next().copied()
    }

    pub fn set_default(&self, id: u32) {
        self.default.send_replace(Some(id));
    }

    pub fn default_id(&self) -> Option<u32> {
        *self.default.borrow()
    }

    /// Wait until a default database has been selected.
    pub async fn wait_default(&self) -> u32 {
        let mut rx = self.default.subscribe();
        loop {
            if let Some(id) = *rx.borrow_and_update() {
                return id;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn clear(&self) {
        self.resolvers.write().clear();
        self.default.send_replace(None);
    }
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = DatabaseRegistry::new();
        assert!(registry.insert(2, "5"));
        assert!(!registry.insert(2, "6"));
        assert_eq!(registry.resolver(2).as_deref(), Some("5"));
    }

    #[test]
    fn test_lowest() {
        let registry = DatabaseRegistry::new();
        assert_eq!(registry.lowest(), None);
        registry.insert(7, "1");
        registry.insert(3, "2");
        assert_eq!(registry.lowest(), Some(3));
    }

    #[tokio::test]
    async fn test_wait_default_resolves_after_selection() {
        let registry = Arc::new(DatabaseRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_default().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.set_default(4);
        assert_eq!(waiter.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_wait_default_immediate() {
        let registry = DatabaseRegistry::new();
        registry.set_default(1);
        assert_eq!(registry.wait_default().await, 1);
    }

    #[test]
    fn test_clear_resets_default() {
        let registry = DatabaseRegistry::new();
        registry.insert(1, "1");
        registry.set_default(1);
        registry.clear();
        assert_eq!(registry.default_id(), None);
        assert!(!registry.contains(1));
    }
}
