//! Dependency installation for package modules.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use botkernel_config::InstallerConfig;
use botkernel_protocols::KernelError;

/// Installs a package module's dependencies.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// Install everything declared in `dir`.
    async fn install(&self, dir: &Path) -> Result<(), KernelError>;

    /// Add a single dependency to the package in `dir`.
    async fn add(&self, dir: &Path, dependency: &str) -> Result<(), KernelError>;
}

/// Runs an external package manager (pnpm by default).
pub struct CommandInstaller {
    config: InstallerConfig,
}

impl CommandInstaller {
    pub fn new(config: InstallerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, dir: &Path, args: &[String]) -> Result<(), KernelError> {
        debug!(program = %self.config.program, ?args, dir = %dir.display(), "Running installer");
        let output = Command::new(&self.config.program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KernelError::Install(format!("{}: {}", self.config.program, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(KernelError::Install(format!(
            "{} exited with {}: {}",
            self.config.program,
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl DependencyInstaller for CommandInstaller {
    async fn install(&self, dir: &Path) -> Result<(), KernelError> {
        info!(dir = %dir.display(), "Installing dependencies");
        self.run(dir, &self.config.install_args).await
    }

    async fn add(&self, dir: &Path, dependency: &str) -> Result<(), KernelError> {
        info!(dir = %dir.display(), dependency, "Adding dependency");
        let mut args = self.config.add_args.clone();
        args.push(dependency.to_string());
        self.run(dir, &args).await
    }
}
