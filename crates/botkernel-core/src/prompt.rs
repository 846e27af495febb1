//! Operator prompts raised by modules.
//!
//! A module asks the kernel for input through the `prompt` core command. The
//! request is broadcast to the host, which answers by nonce.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Kind of answer expected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptKind {
    #[default]
    #[serde(rename = "string")]
    String,
    #[serde(rename = "yes-no")]
    YesNo,
}

/// A prompt waiting for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptRequest {
    pub nonce: String,
    pub module_id: String,
    pub info: String,
    pub kind: PromptKind,
    pub default: Option<Value>,
}

impl PromptRequest {
    /// Interpret a raw line typed by the operator.
    pub fn parse_answer(&self, raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            if let Some(default) = &self.default {
                return default.clone();
            }
        }
        match self.kind {
            PromptKind::String => Value::String(trimmed.to_string()),
            PromptKind::YesNo => Value::Bool(matches!(
                trimmed.to_ascii_lowercase().as_str(),
                "y" | "yes" | "true"
            )),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("no prompt handler attached")]
    NoHandler,
    #[error("prompt was cancelled")]
    Cancelled,
}

/// Routes prompts from modules to the host and answers back.
pub struct PromptChannel {
    waiting: DashMap<String, (PromptRequest, oneshot::Sender<Value>)>,
    notify: broadcast::Sender<PromptRequest>,
}

impl PromptChannel {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            waiting: DashMap::new(),
            notify,
        }
    }

    /// Host side: receive new prompts.
    pub fn subscribe(&self) -> broadcast::Receiver<PromptRequest> {
        self.notify.subscribe()
    }

    /// Raise a prompt and wait for the answer.
    ///
    /// Without an attached host the default value is used if present.
    pub async fn ask(
        &self,
        module_id: &str,
        info: &str,
        kind: PromptKind,
        default: Option<Value>,
    ) -> Result<Value, PromptError> {
        let request = PromptRequest {
            nonce: Uuid::new_v4().simple().to_string(),
            module_id: module_id.to_string(),
            info: info.to_string(),
            kind,
            default,
        };

        if self.notify.receiver_count() == 0 {
            return request.default.ok_or(PromptError::NoHandler);
        }

        let (tx, rx) = oneshot::channel();
        self.waiting
            .insert(request.nonce.clone(), (request.clone(), tx));
        debug!(module_id, nonce = %request.nonce, "Prompt raised");
        let _ = self.notify.send(request);

        rx.await.map_err(|_| PromptError::Cancelled)
    }

    /// Host side: answer a prompt. Returns `false` for an unknown nonce.
    pub fn answer(&self, nonce: &str, value: Value) -> bool {
        match self.waiting.remove(nonce) {
            Some((_, (_, tx))) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Prompts not yet answered.
    pub fn waiting(&self) -> Vec<PromptRequest> {
        self.waiting
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    /// Cancel every waiting prompt.
    pub fn cancel_all(&self) {
        self.waiting.clear();
    }
}

impl Default for PromptChannel {
    fn default() -> Self {
        Self::new()
    }
}
