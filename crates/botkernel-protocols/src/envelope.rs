//! Envelope definitions.
//!
//! Every message crossing a transport is one [`Envelope`]. The `type` field
//! selects the variant; unknown tags fail to decode instead of being ignored.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Module ID reserved for the kernel itself.
pub const CORE_MODULE_ID: &str = "core";

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// Correlation token of an API call.
///
/// Modules may use either numbers or strings. The kernel generates string
/// nonces and uses [`Nonce::NO_REPLY`] for fire-and-forget event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Nonce {
    Seq(i64),
    Id(String),
}

impl Nonce {
    /// Sentinel meaning "no response expected".
    pub const NO_REPLY: Nonce = Nonce::Seq(-1);

    /// Generate a fresh nonce for a call addressed to `target`.
    pub fn for_target(target: &str, suffix: impl fmt::Display) -> Self {
        Nonce::Id(format!("{}-{}", target, suffix))
    }

    /// Whether this is the no-reply sentinel.
    pub fn is_no_reply(&self) -> bool {
        *self == Self::NO_REPLY
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nonce::Seq(n) => write!(f, "{}", n),
            Nonce::Id(s) => f.write_str(s),
        }
    }
}

/// Message exchanged between the kernel and a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Kernel to module: invoke `call_cmd` on the receiving module.
    ApiCall {
        call_from: String,
        call_cmd: String,
        #[serde(default)]
        data: Value,
        nonce: Nonce,
    },

    /// Kernel to module: result of a call the module issued earlier.
    ApiResponse {
        response_from: String,
        exist: bool,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<Value>,
        nonce: Nonce,
    },

    /// Module to kernel: call `call_cmd` on module `call_to` (or `core`).
    ApiSend {
        call_to: String,
        call_cmd: String,
        #[serde(default)]
        data: Value,
        nonce: Nonce,
    },

    /// Module to kernel: answer a call previously delivered by `api_call`.
    #[serde(rename = "api_sendresponse")]
    ApiSendResponse {
        response_to: String,
        exist: bool,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<Value>,
        nonce: Nonce,
    },

    Handshake {
        id: String,
        protocol_version: String,
        #[serde(default)]
        config: Value,
    },

    HandshakeSuccess {
        module: String,
        module_displayname: String,
        module_namespace: String,
    },

    HandshakeFail {
        #[serde(default)]
        error: Value,
    },

    Challenge {
        challenge: String,
    },

    ChallengeResponse {
        challenge: String,
    },
}

impl Envelope {
    /// Wire tag of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ApiCall { .. } => "api_call",
            Envelope::ApiResponse { .. } => "api_response",
            Envelope::ApiSend { .. } => "api_send",
            Envelope::ApiSendResponse { .. } => "api_sendresponse",
            Envelope::Handshake { .. } => "handshake",
            Envelope::HandshakeSuccess { .. } => "handshake_success",
            Envelope::HandshakeFail { .. } => "handshake_fail",
            Envelope::Challenge { .. } => "challenge",
            Envelope::ChallengeResponse { .. } => "challenge_response",
        }
    }

    /// Build a successful response from `from`.
    pub fn response(from: impl Into<String>, nonce: Nonce, data: Value) -> Self {
        Envelope::ApiResponse {
            response_from: from.into(),
            exist: true,
            data,
            error: None,
            nonce,
        }
    }

    /// Build an error response from `from`.
    pub fn error_response(from: impl Into<String>, nonce: Nonce, error: impl Into<String>) -> Self {
        Envelope::ApiResponse {
            response_from: from.into(),
            exist: true,
            data: Value::Null,
            error: Some(Value::String(error.into())),
            nonce,
        }
    }

    /// Build a response for a command or module that does not exist.
    pub fn missing_response(from: impl Into<String>, nonce: Nonce) -> Self {
        Envelope::ApiResponse {
            response_from: from.into(),
            exist: false,
            data: Value::Null,
            error: None,
            nonce,
        }
    }
}
