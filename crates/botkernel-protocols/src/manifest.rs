//! Module manifest (`module.json`).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManifestError;

/// How a module bundle is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// A single script or worker entry point.
    Script,
    /// A package with its own dependencies and launch command.
    Package,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleType::Script => write!(f, "script"),
            ModuleType::Package => write!(f, "package"),
        }
    }
}

/// Transport a module talks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommProtocol {
    /// In-process worker task.
    #[serde(rename = "node_worker")]
    Worker,
    /// Child process exchanging JSON lines.
    #[serde(rename = "node_ipc")]
    Ipc,
    /// Child process exchanging framed MessagePack over stdio.
    #[serde(rename = "msgpack", alias = "msgpack(stdio)")]
    Stdio,
}

impl fmt::Display for CommProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommProtocol::Worker => write!(f, "node_worker"),
            CommProtocol::Ipc => write!(f, "node_ipc"),
            CommProtocol::Stdio => write!(f, "msgpack"),
        }
    }
}

impl CommProtocol {
    /// Whether a module of `module_type` can run over this transport.
    ///
    /// Packages carry their own process and cannot be hosted in-process;
    /// plain scripts have no launcher that speaks the framed stdio protocol.
    pub fn supports(self, module_type: ModuleType) -> bool {
        !matches!(
            (module_type, self),
            (ModuleType::Package, CommProtocol::Worker) | (ModuleType::Script, CommProtocol::Stdio)
        )
    }
}

/// Parsed `module.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleManifest {
    pub namespace: String,
    pub auto_restart: bool,
    pub module_type: ModuleType,
    pub protocol: CommProtocol,
    /// Worker name (`node_worker`) or script path inside the bundle (`node_ipc`).
    pub script_src: Option<String>,
    /// Interpreter used to launch script modules over IPC.
    pub runtime: Option<String>,
    /// Launch command of package modules.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// The complete manifest as read.
    pub raw: Value,
}

impl ModuleManifest {
    /// Parse and validate a manifest.
    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        let raw: Value = serde_json::from_str(text)?;
        Self::from_value(raw)
    }

    /// Validate an already parsed manifest.
    pub fn from_value(raw: Value) -> Result<Self, ManifestError> {
        let namespace = raw
            .get("namespace")
            .ok_or(ManifestError::MissingField("namespace"))?
            .as_str()
            .ok_or_else(|| invalid("namespace", "expected a string"))?
            .to_string();
        if namespace.trim().is_empty() {
            return Err(ManifestError::EmptyNamespace);
        }

        let auto_restart = raw
            .get("autoRestart")
            .ok_or(ManifestError::MissingField("autoRestart"))?
            .as_bool()
            .ok_or_else(|| invalid("autoRestart", "expected a boolean"))?;

        let module_type: ModuleType = serde_json::from_value(
            raw.get("type").cloned().ok_or(ManifestError::MissingField("type"))?,
        )
        .map_err(|e| invalid("type", e.to_string()))?;

        let protocol: CommProtocol = serde_json::from_value(
            raw.get("communicationProtocol")
                .cloned()
                .ok_or(ManifestError::MissingField("communicationProtocol"))?,
        )
        .map_err(|e| invalid("communicationProtocol", e.to_string()))?;

        let args = match raw.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| invalid("args", e.to_string()))?,
        };

        Ok(Self {
            namespace,
            auto_restart,
            module_type,
            protocol,
            script_src: optional_str(&raw, "scriptSrc"),
            runtime: optional_str(&raw, "runtime"),
            command: optional_str(&raw, "command"),
            args,
            raw,
        })
    }
}

fn optional_str(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}

fn invalid(field: &'static str, message: impl Into<String>) -> ManifestError {
    ManifestError::InvalidField {
        field,
        message: message.into(),
    }
}
