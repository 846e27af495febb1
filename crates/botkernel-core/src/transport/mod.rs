//! Transports carrying envelopes between the kernel and a module.
//!
//! A transport is spawned by a [`TransportFactory`] and reports everything it
//! observes through a [`TransportEvent`] channel. Sending never blocks:
//! envelopes are handed to a writer task (processes) or an inbox (workers).

mod ipc;
mod process;
mod stdio;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use botkernel_protocols::{CommProtocol, Envelope, KernelError, ModuleManifest, ModuleType};

use crate::installer::DependencyInstaller;

pub use ipc::IpcTransport;
pub use process::ProcessCommand;
pub use stdio::StdioTransport;
pub use worker::{
    EchoWorker, WorkerContext, WorkerFactory, WorkerModule, WorkerRegistry, WorkerResult,
    WorkerTransport,
};

/// Something observed on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded envelope from the module.
    Message(Envelope),
    /// The transport failed and will not deliver anything else.
    Error(String),
    /// The module exited, with its exit code when known.
    Exited(Option<i32>),
}

/// A live connection to one module.
#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> CommProtocol;

    /// Queue an envelope for the module. A no-op once killed.
    fn send(&self, envelope: Envelope);

    /// Terminate the module. Idempotent.
    async fn kill(&self);

    fn is_killed(&self) -> bool;
}

/// A freshly spawned transport and its event stream.
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// What a factory needs to launch a module.
pub struct SpawnRequest<'a> {
    pub module_id: &'a str,
    pub manifest: &'a ModuleManifest,
    /// Directory the bundle was extracted to.
    pub work_dir: &'a Path,
}

/// Creates transports for modules.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<TransportHandle, KernelError>;
}

/// Default factory: in-process workers from a [`WorkerRegistry`] and child
/// processes for the IPC and stdio protocols.
pub struct DefaultTransportFactory {
    workers: Arc<WorkerRegistry>,
    installer: Arc<dyn DependencyInstaller>,
    kill_grace: Duration,
}

impl DefaultTransportFactory {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        installer: Arc<dyn DependencyInstaller>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            workers,
            installer,
            kill_grace,
        }
    }

    fn script_command(request: &SpawnRequest<'_>) -> Result<ProcessCommand, KernelError> {
        let script = required(request, "scriptSrc", request.manifest.script_src.as_deref())?;
        let script_path = request.work_dir.join(script);
        let (program, args) = match &request.manifest.runtime {
            Some(runtime) => (
                PathBuf::from(runtime),
                vec![script_path.to_string_lossy().to_string()],
            ),
            None => (script_path, Vec::new()),
        };
        Ok(ProcessCommand {
            module_id: request.module_id.to_string(),
            program,
            args,
            cwd: request.work_dir.to_path_buf(),
        })
    }

    async fn package_command(
        &self,
        request: &SpawnRequest<'_>,
    ) -> Result<ProcessCommand, KernelError> {
        let command = required(request, "command", request.manifest.command.as_deref())?;
        if request.work_dir.join("package.json").exists() {
            info!(module_id = request.module_id, "Installing package dependencies");
            self.installer.install(request.work_dir).await?;
        }
        Ok(ProcessCommand {
            module_id: request.module_id.to_string(),
            program: resolve_program(request.work_dir, command),
            args: request.manifest.args.clone(),
            cwd: request.work_dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<TransportHandle, KernelError> {
        let manifest = request.manifest;
        match (manifest.module_type, manifest.protocol) {
            (ModuleType::Script, CommProtocol::Worker) => {
                let name = required(&request, "scriptSrc", manifest.script_src.as_deref())?;
                let worker = self.workers.create(name).ok_or_else(|| {
                    KernelError::Configuration(format!(
                        "module {}: no worker registered as {}",
                        request.module_id, name
                    ))
                })?;
                Ok(WorkerTransport::spawn(
                    request.module_id,
                    worker,
                    self.kill_grace,
                ))
            }
            (ModuleType::Script, CommProtocol::Ipc) => {
                let command = Self::script_command(&request)?;
                IpcTransport::spawn(&command, self.kill_grace)
            }
            (ModuleType::Package, CommProtocol::Ipc) => {
                let command = self.package_command(&request).await?;
                IpcTransport::spawn(&command, self.kill_grace)
            }
            (ModuleType::Package, CommProtocol::Stdio) => {
                let command = self.package_command(&request).await?;
                StdioTransport::spawn(&command)
            }
            (module_type, protocol) => Err(KernelError::UnsupportedTransport {
                module: request.module_id.to_string(),
                module_type,
                protocol,
            }),
        }
    }
}

fn required<'a>(
    request: &SpawnRequest<'_>,
    field: &str,
    value: Option<&'a str>,
) -> Result<&'a str, KernelError> {
    value.ok_or_else(|| {
        KernelError::Configuration(format!(
            "module {}: {} transport requires `{}` in module.json",
            request.module_id, request.manifest.protocol, field
        ))
    })
}

/// Relative paths with a separator are taken from the bundle directory;
/// bare names are looked up on `PATH`.
fn resolve_program(work_dir: &Path, command: &str) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && command.contains('/') {
        work_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
