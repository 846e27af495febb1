//! Calls issued by the kernel that are waiting for a response.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use botkernel_protocols::Nonce;

/// A module's answer to a kernel-originated call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    /// Module ID that produced the response.
    pub from: String,
    pub exist: bool,
    pub data: Value,
    pub error: Option<Value>,
}

impl ApiReply {
    /// `data.<field>` when the call existed and succeeded.
    pub fn field(&self, field: &str) -> Option<&Value> {
        if !self.exist || self.error.is_some() {
            return None;
        }
        self.data.get(field)
    }

    /// Whether the reply carries `data.<field> == true`.
    pub fn flag(&self, field: &str) -> bool {
        self.field(field).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Nonce to waiting caller.
///
/// Entries are removed only when a response arrives.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<Nonce, oneshot::Sender<ApiReply>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, nonce: Nonce) -> oneshot::Receiver<ApiReply> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(nonce, tx);
        rx
    }

    /// Complete the call registered under `nonce`. Returns `false` for an
    /// unknown nonce.
    pub fn resolve(&self, nonce: &Nonce, reply: ApiReply) -> bool {
        match self.calls.remove(nonce) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
