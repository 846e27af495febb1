//! Configuration schema definitions.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

/// Root configuration stored in `<profile>/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Default database ID.
    #[serde(default)]
    pub default_database: u32,

    /// Abort startup when the default database cannot be initialized.
    #[serde(default = "default_true")]
    pub crash_on_default_database_fail: bool,

    /// Operator identifiers exposed through `get_operator_list`.
    #[serde(default)]
    pub operators: Vec<String>,

    /// Interface logins, initialized in order.
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,

    /// Database connections, initialized in order.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    /// Per-namespace configuration passed to modules at handshake.
    #[serde(default)]
    pub module_config: BTreeMap<String, Value>,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub installer: InstallerConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_database: 0,
            crash_on_default_database_fail: true,
            operators: Vec::new(),
            listener: Vec::new(),
            databases: Vec::new(),
            module_config: BTreeMap::new(),
            supervisor: SupervisorConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Configuration handed to the module with `namespace` at handshake.
    pub fn module_config_for(&self, namespace: &str) -> Value {
        self.module_config
            .get(namespace)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.supervisor.validate()?;

        let mut seen = HashSet::new();
        for db in &self.databases {
            if !seen.insert(db.id) {
                return Err(ConfigError::InvalidValue {
                    field: "databases.id".to_string(),
                    message: format!("database ID {} is declared more than once", db.id),
                });
            }
        }

        if self.installer.program.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "installer.program".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// An interface login handled by an interface-kind module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Namespace of the handling module.
    pub namespace: String,
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_data: Option<Value>,
}

/// A database served by a database-kind module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Namespace of the handling module.
    pub namespace: String,
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Module supervision timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_ms: u64,

    /// Lower bound of the heartbeat interval (inclusive).
    #[serde(default = "default_heartbeat_min")]
    pub heartbeat_min_ms: u64,

    /// Upper bound of the heartbeat interval (exclusive).
    #[serde(default = "default_heartbeat_max")]
    pub heartbeat_max_ms: u64,

    /// Grace window between SIGTERM and a forced kill for IPC modules.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,
}

fn default_handshake_timeout() -> u64 {
    30_000
}

fn default_challenge_timeout() -> u64 {
    30_000
}

fn default_heartbeat_min() -> u64 {
    30_000
}

fn default_heartbeat_max() -> u64 {
    60_000
}

fn default_kill_grace() -> u64 {
    5_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            challenge_timeout_ms: default_challenge_timeout(),
            heartbeat_min_ms: default_heartbeat_min(),
            heartbeat_max_ms: default_heartbeat_max(),
            kill_grace_ms: default_kill_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn heartbeat_min(&self) -> Duration {
        Duration::from_millis(self.heartbeat_min_ms)
    }

    pub fn heartbeat_max(&self) -> Duration {
        Duration::from_millis(self.heartbeat_max_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("supervisor.handshake_timeout_ms", self.handshake_timeout_ms),
            ("supervisor.challenge_timeout_ms", self.challenge_timeout_ms),
            ("supervisor.heartbeat_max_ms", self.heartbeat_max_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be > 0".to_string(),
                });
            }
        }

        if self.heartbeat_min_ms >= self.heartbeat_max_ms {
            return Err(ConfigError::InvalidValue {
                field: "supervisor.heartbeat_min_ms".to_string(),
                message: "must be lower than heartbeat_max_ms".to_string(),
            });
        }

        Ok(())
    }
}

/// External dependency installer used for package modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default = "default_installer_program")]
    pub program: String,

    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,

    #[serde(default = "default_add_args")]
    pub add_args: Vec<String>,
}

fn default_installer_program() -> String {
    "pnpm".to_string()
}

fn default_install_args() -> Vec<String> {
    vec![
        "install".to_string(),
        "--prefer-offline".to_string(),
        "--frozen-lockfile".to_string(),
    ]
}

fn default_add_args() -> Vec<String> {
    vec!["add".to_string()]
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: default_installer_program(),
            install_args: default_install_args(),
            add_args: default_add_args(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.default_database, 0);
        assert!(config.crash_on_default_database_fail);
        assert_eq!(config.supervisor.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.supervisor.heartbeat_min(), Duration::from_secs(30));
        assert_eq!(config.supervisor.heartbeat_max(), Duration::from_secs(60));
        assert_eq!(config.installer.program, "pnpm");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_module_config_for() {
        let mut config = KernelConfig::default();
        config
            .module_config
            .insert("discord".to_string(), json!({"prefix": "!"}));
        assert_eq!(config.module_config_for("discord"), json!({"prefix": "!"}));
        assert!(config.module_config_for("telegram").is_null());
    }

    #[test]
    fn test_validate_heartbeat_bounds() {
        let mut config = KernelConfig::default();
        config.supervisor.heartbeat_min_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = KernelConfig::default();
        config.supervisor.challenge_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_database() {
        let mut config = KernelConfig::default();
        for _ in 0..2 {
            config.databases.push(DatabaseConfig {
                namespace: "sqlite".to_string(),
                id: 1,
                name: "main".to_string(),
                params: None,
            });
        }
        assert!(config.validate().is_err());
    }
}
