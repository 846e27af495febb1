//! Event hook table.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{json, Value};

use botkernel_protocols::{Envelope, Nonce, CORE_MODULE_ID};

/// A module callback subscribed to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub module_id: String,
    pub callback: String,
}

/// Event name to subscriptions, kept in registration order.
///
/// Registering the same (module, callback) twice produces two deliveries.
#[derive(Default)]
pub struct EventBus {
    table: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, module_id: &str, callback: &str) {
        self.table
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Subscription {
                module_id: module_id.to_string(),
                callback: callback.to_string(),
            });
    }

    /// Remove the first subscription of `module_id` with `callback`.
    pub fn unregister(&self, event: &str, module_id: &str, callback: &str) -> bool {
        let mut table = self.table.write();
        let Some(subs) = table.get_mut(event) else {
            return false;
        };
        let Some(index) = subs
            .iter()
            .position(|s| s.module_id == module_id && s.callback == callback)
        else {
            return false;
        };
        subs.remove(index);
        if subs.is_empty() {
            table.remove(event);
        }
        true
    }

    pub fn subscribers(&self, event: &str) -> Vec<Subscription> {
        self.table.read().get(event).cloned().unwrap_or_default()
    }

    /// Build one fire-and-forget call per subscriber and pass it to
    /// `deliver` together with the target module ID.
    ///
    /// Returns whether the event had any subscriber.
    pub fn publish<F>(&self, event: &str, from: &str, data: &Value, mut deliver: F) -> bool
    where
        F: FnMut(&str, Envelope),
    {
        let subs = self.subscribers(event);
        for sub in &subs {
            let envelope = Envelope::ApiCall {
                call_from: CORE_MODULE_ID.to_string(),
                call_cmd: sub.callback.clone(),
                data: json!({
                    "calledFrom": from,
                    "eventName": event,
                    "eventData": data,
                }),
                nonce: Nonce::NO_REPLY,
            };
            deliver(&sub.module_id, envelope);
        }
        !subs.is_empty()
    }

    pub fn clear(&self) {
        self.table.write().clear();
    }
}
