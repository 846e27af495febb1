//! Error taxonomy.
//!
//! - [`ManifestError`] and [`KernelError::UnsupportedTransport`] are
//!   configuration errors: fatal to one module, never to the kernel.
//! - [`HandshakeFailure`] aborts a start attempt without triggering restarts.
//! - [`FrameError`] comes from the stdio codec.

use std::time::Duration;

use thiserror::Error;

use crate::manifest::{CommProtocol, ModuleType};

/// Errors raised while reading `module.json`.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("Namespace must not be empty")]
    EmptyNamespace,

    #[error("Malformed module.json: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Reasons a handshake can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    #[error("module did not respond within {0:?}")]
    Timeout(Duration),

    #[error("module rejected the handshake: {0}")]
    Rejected(String),

    #[error("namespace mismatch (manifest: {expected}, reported: {reported})")]
    NamespaceMismatch { expected: String, reported: String },

    #[error("transport closed before the handshake completed")]
    TransportClosed,
}

/// Errors raised by the stdio framing codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {len} bytes, max {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("Payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Kernel-wide error type.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Invalid manifest for module {module}: {source}")]
    Manifest {
        module: String,
        #[source]
        source: ManifestError,
    },

    #[error("Module {module}: {module_type} modules cannot use the {protocol} transport")]
    UnsupportedTransport {
        module: String,
        module_type: ModuleType,
        protocol: CommProtocol,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Handshake with module {module} failed: {reason}")]
    Handshake {
        module: String,
        reason: HandshakeFailure,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Bundle error: {0}")]
    Bundle(String),

    #[error("Dependency installation failed: {0}")]
    Install(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl KernelError {
    /// Whether this error belongs to the configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            KernelError::Manifest { .. }
                | KernelError::UnsupportedTransport { .. }
                | KernelError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_error_display() {
        let err = ManifestError::MissingField("autoRestart");
        assert!(err.to_string().contains("autoRestart"));
        assert!(ManifestError::EmptyNamespace.to_string().contains("empty"));
    }

    #[test]
    fn test_handshake_mismatch_display() {
        let err = KernelError::Handshake {
            module: "3".to_string(),
            reason: HandshakeFailure::NamespaceMismatch {
                expected: "discord".to_string(),
                reported: "telegram".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("3"));
        assert!(msg.contains("discord"));
        assert!(msg.contains("telegram"));
    }

    #[test]
    fn test_unsupported_transport_display() {
        let err = KernelError::UnsupportedTransport {
            module: "1".to_string(),
            module_type: ModuleType::Package,
            protocol: CommProtocol::Worker,
        };
        let msg = err.to_string();
        assert!(msg.contains("package"));
        assert!(msg.contains("node_worker"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KernelError = io_err.into();
        assert!(err.to_string().contains("file not found"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = FrameError::TooLarge { len: 10, max: 5 };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("5"));
    }
}
