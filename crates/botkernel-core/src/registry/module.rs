//! Running modules keyed by numeric ID.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::supervisor::ModuleSupervisor;

/// Module table. Iteration is in ascending ID order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<u64, Arc<ModuleSupervisor>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, module: Arc<ModuleSupervisor>) {
        self.modules.write().insert(module.seq(), module);
    }

    /// Look up a module by its string ID. `core` and other non-numeric IDs
    /// never match.
    pub fn get(&self, id: &str) -> Option<Arc<ModuleSupervisor>> {
        let seq = id.parse::<u64>().ok()?;
        self.modules.read().get(&seq).cloned()
    }

    pub fn list(&self) -> Vec<Arc<ModuleSupervisor>> {
        self.modules.read().values().cloned().collect()
    }

    /// First started module serving `namespace`.
    pub fn started_by_namespace(&self, namespace: &str) -> Option<Arc<ModuleSupervisor>> {
        self.modules
            .read()
            .values()
            .find(|m| m.is_started() && m.namespace() == Some(namespace))
            .cloned()
    }

    /// Modules whose handshake reported `kind`, in ID order.
    pub fn by_kind(&self, kind: &str) -> Vec<Arc<ModuleSupervisor>> {
        self.modules
            .read()
            .values()
            .filter(|m| m.identity().kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// Remove and return every module.
    pub fn drain(&self) -> Vec<Arc<ModuleSupervisor>> {
        std::mem::take(&mut *self.modules.write())
            .into_values()
            .collect()
    }
}
