//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::schema::KernelConfig;

/// File name of the configuration inside a profile directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Default profile directory (`~/.botkernel`).
pub fn default_profile_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".botkernel"))
        .unwrap_or_else(|| PathBuf::from(".botkernel"))
}

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<KernelConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string.
    ///
    /// Missing fields take their defaults, so a partial file is merged over
    /// [`KernelConfig::default`].
    pub fn load_str(content: &str) -> Result<KernelConfig, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let config: KernelConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<profile>/config.toml`.
    pub fn load_profile(profile_dir: &Path) -> Result<KernelConfig, ConfigError> {
        Self::load(&profile_dir.join(CONFIG_FILE_NAME))
    }

    /// Write the (merged) configuration back to `<profile>/config.toml`.
    pub fn save_profile(profile_dir: &Path, config: &KernelConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        fs::write(profile_dir.join(CONFIG_FILE_NAME), content)?;
        Ok(())
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();
        let re = regex::Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.botkernel`).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert!(config.crash_on_default_database_fail);
        assert!(config.databases.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let content = r#"
            default_database = 2
            crash_on_default_database_fail = false
            operators = ["alice", "bob"]

            [[listener]]
            namespace = "discord"
            id = 1
            login_data = { token = "abc" }

            [[databases]]
            namespace = "sqlite"
            id = 2
            name = "main"
            params = { path = "bot.db" }

            [module_config.discord]
            prefix = "!"

            [supervisor]
            heartbeat_min_ms = 1000
            heartbeat_max_ms = 2000
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.default_database, 2);
        assert!(!config.crash_on_default_database_fail);
        assert_eq!(config.operators, vec!["alice", "bob"]);
        assert_eq!(config.listener[0].namespace, "discord");
        assert_eq!(config.listener[0].login_data, Some(json!({"token": "abc"})));
        assert_eq!(config.databases[0].params, Some(json!({"path": "bot.db"})));
        assert_eq!(config.module_config_for("discord"), json!({"prefix": "!"}));
        assert_eq!(config.supervisor.heartbeat_max_ms, 2000);
        assert_eq!(config.supervisor.challenge_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let content = r#"
            [supervisor]
            heartbeat_min_ms = 5000
            heartbeat_max_ms = 10
        "#;
        assert!(matches!(
            ConfigLoader::load_str(content),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_save_and_reload_profile() {
        let dir = TempDir::new().unwrap();
        let mut config = KernelConfig::default();
        config.operators.push("carol".to_string());
        config
            .module_config
            .insert("echo".to_string(), json!({"loud": true}));

        ConfigLoader::save_profile(dir.path(), &config).unwrap();
        let reloaded = ConfigLoader::load_profile(dir.path()).unwrap();
        assert_eq!(reloaded.operators, vec!["carol"]);
        assert_eq!(reloaded.module_config_for("echo"), json!({"loud": true}));
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: This test runs in isolation and sets a unique test-only env var
        unsafe {
            std::env::set_var("BOTKERNEL_TEST_CONFIG_VAR", "test_value");
        }
        let content = "value = \"${BOTKERNEL_TEST_CONFIG_VAR}\"";
        let expanded = ConfigLoader::expand_env_vars(content).unwrap();
        assert!(expanded.contains("test_value"));
        unsafe {
            std::env::remove_var("BOTKERNEL_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${BOTKERNEL_NONEXISTENT_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = ConfigLoader::expand_path("~/profile");
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with("profile"));
    }
}
