//! Startup phases, run in order by [`Kernel::start`].

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use botkernel_config::{ConfigError, ConfigLoader, KernelConfig};
use botkernel_protocols::KernelError;

use super::Kernel;
use crate::bundle;
use crate::installer::{CommandInstaller, DependencyInstaller};
use crate::lifecycle::{KernelSignal, KernelState};
use crate::pending::ApiReply;
use crate::supervisor::{ModuleSupervisor, SupervisorContext};
use crate::transport::{DefaultTransportFactory, TransportFactory};

const PROFILE_DIRS: [&str; 3] = ["plugins", "modules", "data"];

impl Kernel {
    /// Run every startup phase. A no-op if already starting or running.
    ///
    /// Individual module failures are logged and isolated; only a missing
    /// default database aborts startup, leaving the kernel stopped.
    pub async fn start(&self) -> Result<(), KernelError> {
        if !self.transition(
            &[KernelState::Created, KernelState::Stopped],
            KernelState::Starting,
        ) {
            info!(state = ?self.state(), "Kernel already started");
            return Ok(());
        }
        self.ensure_router();
        info!(profile = %self.inner.profile_dir.display(), "Starting kernel");

        match self.run_startup().await {
            Ok(()) => {
                self.set_state(KernelState::Running);
                info!(run_id = %self.run_id(), "Kernel started");
                Ok(())
            }
            Err(e) => {
                error!("Kernel startup failed: {}", e);
                self.shutdown().await;
                self.set_state(KernelState::Stopped);
                Err(e)
            }
        }
    }

    async fn run_startup(&self) -> Result<(), KernelError> {
        self.prepare_profile().await?;
        let config = self.load_config();
        self.new_run().await?;
        self.load_modules(&config).await?;
        self.init_databases(&config).await?;
        self.init_plugin_handlers().await;
        self.init_interfaces(&config).await;
        Ok(())
    }

    async fn prepare_profile(&self) -> Result<(), KernelError> {
        let profile = &self.inner.profile_dir;
        tokio::fs::create_dir_all(profile).await?;
        for dir in PROFILE_DIRS {
            tokio::fs::create_dir_all(profile.join(dir)).await?;
        }
        Ok(())
    }

    /// Load `<profile>/config.toml`, falling back to defaults, and write the
    /// merged result back. A file that fails to parse is left untouched.
    fn load_config(&self) -> KernelConfig {
        let profile = &self.inner.profile_dir;
        let (config, write_back) = match ConfigLoader::load_profile(profile) {
            Ok(config) => (config, true),
            Err(ConfigError::NotFound(_)) => {
                info!("No configuration found, using defaults");
                (KernelConfig::default(), true)
            }
            Err(e) => {
                warn!("Invalid configuration, using defaults: {}", e);
                (KernelConfig::default(), false)
            }
        };
        if write_back {
            if let Err(e) = ConfigLoader::save_profile(profile, &config) {
                warn!("Failed to write configuration: {}", e);
            }
        }

        let installer: Arc<dyn DependencyInstaller> = match &self.inner.installer_override {
            Some(installer) => installer.clone(),
            None => Arc::new(CommandInstaller::new(config.installer.clone())),
        };
        *self.inner.installer.write() = installer;
        *self.inner.config.write() = config.clone();
        config
    }

    async fn new_run(&self) -> Result<(), KernelError> {
        let run_id = Uuid::new_v4().simple().to_string();
        *self.inner.run_id.write() = run_id.clone();
        tokio::fs::create_dir_all(self.run_dir()).await?;
        info!(run_id = %run_id, "Created run directory");
        Ok(())
    }

    fn supervisor_context(&self, config: &KernelConfig) -> SupervisorContext {
        let transports: Arc<dyn TransportFactory> = match &self.inner.transports_override {
            Some(factory) => factory.clone(),
            None => Arc::new(DefaultTransportFactory::new(
                self.inner.workers.clone(),
                self.installer(),
                config.supervisor.kill_grace(),
            )),
        };
        SupervisorContext {
            router: self.inner.router_tx.clone(),
            transports,
            settings: config.supervisor.clone(),
            signals: self.inner.signals.clone(),
        }
    }

    async fn load_modules(&self, config: &KernelConfig) -> Result<(), KernelError> {
        let bundles = bundle::discover(&self.inner.profile_dir.join("modules")).await?;
        let ctx = self.supervisor_context(config);
        let run_dir = self.run_dir();

        let mut loaded = Vec::new();
        for path in bundles {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
            let work_dir = run_dir.join(format!("tmodule-{}", seq));
            let module = ModuleSupervisor::new(seq, path.clone(), work_dir, ctx.clone());
            match module.load_manifest().await {
                Ok(manifest) => {
                    module.set_config(config.module_config_for(&manifest.namespace));
                    self.inner.modules.insert(module.clone());
                    loaded.push(module);
                }
                Err(e) => {
                    error!(module_id = seq, bundle = %path.display(), "Skipping module: {}", e);
                }
            }
        }
        info!("Found {} module(s)", loaded.len());

        let results = futures::future::join_all(loaded.iter().map(|m| m.start())).await;
        let mut started = 0;
        for (module, result) in loaded.iter().zip(results) {
            match result {
                Ok(()) => started += 1,
                Err(e) => error!(module_id = %module.id(), "Module failed to start: {}", e),
            }
        }
        info!("{} of {} module(s) started", started, loaded.len());
        Ok(())
    }

    async fn init_databases(&self, config: &KernelConfig) -> Result<(), KernelError> {
        for db in &config.databases {
            let Some(module) = self.inner.modules.started_by_namespace(&db.namespace) else {
                error!(database_id = db.id, namespace = %db.namespace, "No running module for database");
                continue;
            };
            if module.identity().kind != "database" {
                error!(
                    database_id = db.id,
                    module_id = %module.id(),
                    "Module is not a database module"
                );
                continue;
            }

            info!(database_id = db.id, module_id = %module.id(), "Initializing database {}", db.name);
            let request = json!({"databaseID": db.id, "params": db.params});
            match self.call_api(module.id(), "connect_db", request).await {
                Ok(reply) if reply.flag("success") => {
                    if self.inner.databases.insert(db.id, module.id()) {
                        info!(database_id = db.id, "Database initialized");
                    } else {
                        warn!(database_id = db.id, "Database ID already initialized");
                    }
                }
                Ok(reply) => {
                    error!(database_id = db.id, "Database failed to initialize: {}", describe(&reply));
                }
                Err(e) => error!(database_id = db.id, "Database failed to initialize: {}", e),
            }
        }

        let databases = &self.inner.databases;
        let selected = if databases.contains(config.default_database) {
            Some(config.default_database)
        } else if !config.crash_on_default_database_fail {
            databases.lowest()
        } else {
            None
        };

        let Some(id) = selected else {
            return Err(KernelError::Startup(format!(
                "default database {} is not available",
                config.default_database
            )));
        };
        if id != config.default_database {
            warn!(
                configured = config.default_database,
                selected = id,
                "Default database unavailable, using the lowest initialized ID"
            );
        }
        databases.set_default(id);
        self.inner.signals.emit(KernelSignal::DefaultDatabaseReady { id });
        info!(database_id = id, "Default database selected");
        Ok(())
    }

    async fn init_plugin_handlers(&self) {
        let plugin_dir = self.inner.profile_dir.join("plugins");
        let mut initialized = 0;

        for handler in self.inner.modules.by_kind("pl_handler") {
            if !handler.is_started() {
                continue;
            }
            let request = json!({"pathname": plugin_dir});
            let reply = match self.call_api(handler.id(), "plugin_search", request).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(module_id = %handler.id(), "Plugin search failed: {}", e);
                    continue;
                }
            };
            if !reply.exist {
                continue;
            }
            let Some(found) = reply.field("valid").and_then(Value::as_array) else {
                error!(module_id = %handler.id(), "Plugin search failed: {}", describe(&reply));
                continue;
            };
            let found: Vec<String> = found
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            info!(module_id = %handler.id(), "Plugin handler found {} plugin(s)", found.len());

            for path in found {
                let request = plugin_request(&path).await;
                match self.call_api(handler.id(), "load_plugin", request).await {
                    Ok(reply) if reply.flag("loaded") => {
                        initialized += 1;
                        info!(module_id = %handler.id(), plugin = %path, "Plugin loaded");
                    }
                    Ok(reply) => {
                        error!(plugin = %path, "Plugin failed to load: {}", describe(&reply));
                    }
                    Err(e) => error!(plugin = %path, "Plugin failed to load: {}", e),
                }
            }
        }
        info!("{} plugin(s) initialized", initialized);
    }

    async fn init_interfaces(&self, config: &KernelConfig) {
        for listener in &config.listener {
            let Some(module) = self.inner.modules.started_by_namespace(&listener.namespace) else {
                error!(interface_id = listener.id, namespace = %listener.namespace, "No running module for interface");
                continue;
            };
            if module.identity().kind != "interface" {
                error!(
                    interface_id = listener.id,
                    module_id = %module.id(),
                    "Module is not an interface module"
                );
                continue;
            }

            let request = json!({"interfaceID": listener.id, "loginData": listener.login_data});
            match self.call_api(module.id(), "login", request).await {
                Ok(reply) if reply.flag("success") => {
                    info!(interface_id = listener.id, "Interface logged in");
                }
                Ok(reply) => {
                    error!(interface_id = listener.id, "Interface login failed: {}", describe(&reply));
                }
                Err(e) => error!(interface_id = listener.id, "Interface login failed: {}", e),
            }
        }
    }
}

/// `load_plugin` request: files are passed as `filename`, anything else as
/// `pathname`.
async fn plugin_request(path: &str) -> Value {
    match tokio::fs::metadata(Path::new(path)).await {
        Ok(meta) if meta.is_file() => json!({"filename": path}),
        _ => json!({"pathname": path}),
    }
}

fn describe(reply: &ApiReply) -> String {
    if !reply.exist {
        return format!("module {} does not implement the command", reply.from);
    }
    reply
        .error
        .as_ref()
        .or_else(|| reply.data.get("error"))
        .map(|e| match e {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "unknown error".to_string())
}
