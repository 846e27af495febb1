//! The kernel: discovers module bundles, supervises them and routes their
//! messages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use botkernel_config::{InstallerConfig, KernelConfig};
use botkernel_protocols::{Envelope, KernelError, Nonce, CORE_MODULE_ID};

use crate::events::EventBus;
use crate::installer::{CommandInstaller, DependencyInstaller};
use crate::lifecycle::{KernelSignal, KernelState, SignalChannel};
use crate::pending::{ApiReply, PendingCalls};
use crate::prompt::PromptChannel;
use crate::registry::{DatabaseRegistry, ModuleRegistry, PluginEntry, PluginRegistry};
use crate::supervisor::{Inbound, ModuleSupervisor};
use crate::transport::{TransportFactory, WorkerModule, WorkerRegistry};

#[path = "kernel_startup.rs"]
mod kernel_startup;

#[cfg(test)]
#[path = "kernel_tests.rs"]
mod tests;

/// Delay between stop and start on restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Summary of a module as reported by `get_registered_modules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    #[serde(rename = "moduleID")]
    pub module_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub namespace: String,
    #[serde(rename = "displayname")]
    pub display_name: String,
    pub running: bool,
}

/// Builder for [`Kernel`].
pub struct KernelBuilder {
    profile_dir: PathBuf,
    workers: WorkerRegistry,
    installer: Option<Arc<dyn DependencyInstaller>>,
    transports: Option<Arc<dyn TransportFactory>>,
}

impl KernelBuilder {
    /// Register an in-process worker addressable by `scriptSrc`.
    pub fn worker<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn WorkerModule> + Send + Sync + 'static,
    {
        self.workers.register(name, factory);
        self
    }

    /// Replace the configured dependency installer.
    pub fn installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Replace the default transport factory.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(factory);
        self
    }

    pub fn build(self) -> Kernel {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let installer: Arc<dyn DependencyInstaller> = match &self.installer {
            Some(installer) => installer.clone(),
            None => Arc::new(CommandInstaller::new(InstallerConfig::default())),
        };

        Kernel {
            inner: Arc::new(KernelInner {
                profile_dir: self.profile_dir,
                state: AtomicU8::new(KernelState::Created as u8),
                config: RwLock::new(KernelConfig::default()),
                run_id: RwLock::new(String::new()),
                next_seq: AtomicU64::new(1),
                modules: ModuleRegistry::new(),
                events: EventBus::new(),
                plugins: PluginRegistry::new(),
                databases: DatabaseRegistry::new(),
                pending: PendingCalls::new(),
                persistent: DashMap::new(),
                prompts: PromptChannel::new(),
                signals: SignalChannel::new(),
                workers: Arc::new(self.workers),
                installer_override: self.installer,
                transports_override: self.transports,
                installer: RwLock::new(installer),
                router_tx,
                router_rx: Mutex::new(Some(router_rx)),
            }),
        }
    }
}

pub(crate) struct KernelInner {
    profile_dir: PathBuf,
    state: AtomicU8,
    config: RwLock<KernelConfig>,
    run_id: RwLock<String>,
    next_seq: AtomicU64,
    pub(crate) modules: ModuleRegistry,
    pub(crate) events: EventBus,
    pub(crate) plugins: PluginRegistry,
    pub(crate) databases: DatabaseRegistry,
    pub(crate) pending: PendingCalls,
    pub(crate) persistent: DashMap<String, Value>,
    pub(crate) prompts: PromptChannel,
    signals: SignalChannel,
    workers: Arc<WorkerRegistry>,
    installer_override: Option<Arc<dyn DependencyInstaller>>,
    transports_override: Option<Arc<dyn TransportFactory>>,
    installer: RwLock<Arc<dyn DependencyInstaller>>,
    router_tx: mpsc::UnboundedSender<Inbound>,
    router_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

/// Handle to the kernel. Cheap to clone.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn builder(profile_dir: impl Into<PathBuf>) -> KernelBuilder {
        KernelBuilder {
            profile_dir: profile_dir.into(),
            workers: WorkerRegistry::new(),
            installer: None,
            transports: None,
        }
    }

    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self::builder(profile_dir).build()
    }

    pub fn profile_dir(&self) -> &Path {
        &self.inner.profile_dir
    }

    pub fn state(&self) -> KernelState {
        KernelState::from(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == KernelState::Running
    }

    fn set_state(&self, state: KernelState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: &[KernelState], to: KernelState) -> bool {
        from.iter().any(|state| {
            self.inner
                .state
                .compare_exchange(*state as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    /// ID of the current run; empty before the first start.
    pub fn run_id(&self) -> String {
        self.inner.run_id.read().clone()
    }

    /// Active configuration.
    pub fn config(&self) -> KernelConfig {
        self.inner.config.read().clone()
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.inner.workers
    }

    pub fn prompts(&self) -> &PromptChannel {
        &self.inner.prompts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelSignal> {
        self.inner.signals.subscribe()
    }

    pub(crate) fn installer(&self) -> Arc<dyn DependencyInstaller> {
        self.inner.installer.read().clone()
    }

    pub fn module(&self, id: &str) -> Option<Arc<ModuleSupervisor>> {
        self.inner.modules.get(id)
    }

    /// The kernel itself followed by every module in ID order.
    pub fn registered_modules(&self) -> Vec<ModuleInfo> {
        let mut list = vec![ModuleInfo {
            module_id: CORE_MODULE_ID.to_string(),
            kind: CORE_MODULE_ID.to_string(),
            namespace: CORE_MODULE_ID.to_string(),
            display_name: "botkernel core".to_string(),
            running: self.is_running(),
        }];
        list.extend(self.inner.modules.list().into_iter().map(|m| {
            let identity = m.identity();
            ModuleInfo {
                module_id: m.id().to_string(),
                kind: identity.kind,
                namespace: m.namespace().unwrap_or_default().to_string(),
                display_name: identity.display_name,
                running: m.is_started(),
            }
        }));
        list
    }

    pub fn plugins(&self) -> Vec<PluginEntry> {
        self.inner.plugins.list()
    }

    pub fn default_database(&self) -> Option<u32> {
        self.inner.databases.default_id()
    }

    pub fn database_resolver(&self, id: u32) -> Option<String> {
        self.inner.databases.resolver(id)
    }

    /// Wait until a default database is selected.
    pub async fn wait_for_default_db(&self) -> u32 {
        self.inner.databases.wait_default().await
    }

    /// `<profile>/data/<namespace>`.
    pub fn data_dir(&self, namespace: &str) -> PathBuf {
        self.inner.profile_dir.join("data").join(namespace)
    }

    /// `<profile>/temp/<runID>`.
    pub fn run_dir(&self) -> PathBuf {
        self.inner.profile_dir.join("temp").join(self.run_id())
    }

    /// Call `command` on module `target` and wait for its response.
    ///
    /// There is no timeout: the call stays pending until the module answers.
    pub async fn call_api(
        &self,
        target: &str,
        command: &str,
        data: Value,
    ) -> Result<ApiReply, KernelError> {
        let module = self
            .inner
            .modules
            .get(target)
            .ok_or_else(|| KernelError::ModuleNotFound(target.to_string()))?;

        let nonce = Nonce::for_target(target, Uuid::new_v4().simple());
        let reply = self.inner.pending.register(nonce.clone());
        debug!(module_id = target, command, %nonce, "Calling module");
        module.queue_message(Envelope::ApiCall {
            call_from: CORE_MODULE_ID.to_string(),
            call_cmd: command.to_string(),
            data,
            nonce,
        });

        reply
            .await
            .map_err(|_| KernelError::Transport(format!("call to {} was dropped", target)))
    }

    /// Deliver an event to its subscribers. Returns whether any existed.
    pub fn publish_event(&self, event: &str, from: &str, data: &Value) -> bool {
        let modules = &self.inner.modules;
        self.inner.events.publish(event, from, data, |target, envelope| {
            match modules.get(target) {
                Some(module) => module.queue_message(envelope),
                None => debug!(module_id = target, event, "Subscriber is gone"),
            }
        })
    }

    /// Wait until a module serving `namespace` is started.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_module(&self, namespace: &str, timeout: Option<Duration>) -> bool {
        let mut signals = self.inner.signals.subscribe();
        if self.inner.modules.started_by_namespace(namespace).is_some() {
            return true;
        }

        let wait = async {
            loop {
                match signals.recv().await {
                    Ok(KernelSignal::ModuleLoaded { namespace: loaded, .. }) if loaded == namespace => {
                        return true;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.inner.modules.started_by_namespace(namespace).is_some() {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    /// Stop every module and clear the registries. A no-op unless running.
    pub async fn stop(&self) {
        if !self.transition(&[KernelState::Running], KernelState::ShuttingDown) {
            debug!(state = ?self.state(), "Kernel not running, nothing to stop");
            return;
        }
        info!("Stopping kernel");
        self.shutdown().await;
        self.set_state(KernelState::Stopped);
        self.inner.signals.emit(KernelSignal::Stopped);
        info!("Kernel stopped");
    }

    /// Stop, wait [`RESTART_DELAY`], start again.
    pub async fn restart(&self) -> Result<(), KernelError> {
        if !self.transition(&[KernelState::Running], KernelState::ShuttingDown) {
            return Ok(());
        }
        info!("Restarting kernel");
        self.shutdown().await;
        self.set_state(KernelState::Stopped);
        tokio::time::sleep(RESTART_DELAY).await;
        self.start().await
    }

    async fn shutdown(&self) {
        let modules = self.inner.modules.drain();
        futures::future::join_all(modules.iter().map(|m| m.terminate())).await;

        self.inner.events.clear();
        self.inner.plugins.clear();
        self.inner.databases.clear();
        self.inner.prompts.cancel_all();

        let run_dir = self.run_dir();
        if self.run_id().is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %run_dir.display(), "Failed to remove run directory: {}", e);
            }
        }
    }

    /// Start the router loop once. It ends when the kernel is dropped.
    fn ensure_router(&self) {
        let Some(mut inbound) = self.inner.router_rx.lock().take() else {
            return;
        };
        let kernel = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(inner) = kernel.upgrade() else {
                    break;
                };
                Kernel { inner }.route(message);
            }
            debug!("Router stopped");
        });
    }
}
