//! Commands served by the kernel under the `core` module ID.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use botkernel_protocols::{Envelope, KernelError, Nonce, CORE_MODULE_ID};

use crate::kernel::Kernel;
use crate::prompt::PromptKind;
use crate::registry::PluginEntry;

/// Failure of a core command, returned to the caller as the `error` field.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Failed(String),
}

/// Work done after the response has been queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowUp {
    StopCaller,
    Shutdown,
    Restart,
}

type CommandResult = Result<Option<(Value, Option<FollowUp>)>, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventHookRequest {
    event_name: String,
    callback_function: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendEventRequest {
    event_name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPluginRequest {
    plugin_name: String,
    namespace: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    author: String,
}

#[derive(Deserialize)]
struct NamespaceRequest {
    namespace: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptRequestBody {
    prompt_info: String,
    #[serde(default)]
    prompt_type: PromptKind,
    default_value: Option<Value>,
}

#[derive(Deserialize)]
struct LogRequest {
    level: String,
    #[serde(default)]
    data: Vec<Value>,
    namespace: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitForModuleRequest {
    module_namespace: String,
    /// Milliseconds.
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct InstallRequest {
    path: String,
    dep: Option<String>,
}

#[derive(Deserialize)]
struct DatabaseRequest {
    #[serde(rename = "databaseID")]
    database_id: Option<u32>,
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, ApiError> {
    let data = if data.is_null() { json!({}) } else { data };
    serde_json::from_value(data).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

fn done(value: Value) -> CommandResult {
    Ok(Some((value, None)))
}

fn install_result(result: Result<(), KernelError>) -> Value {
    match result {
        Ok(()) => json!({"success": true}),
        Err(e) => json!({"success": false, "error": e.to_string()}),
    }
}

impl Kernel {
    /// Run a core command for module `caller` and queue exactly one response.
    pub(crate) async fn dispatch_core_call(
        &self,
        caller: String,
        command: String,
        data: Value,
        nonce: Nonce,
    ) {
        trace!(module_id = %caller, command = %command, "Core command");
        let (response, follow_up) = match self.handle_core_command(&caller, &command, data).await {
            Ok(Some((value, follow_up))) => (Envelope::response(CORE_MODULE_ID, nonce, value), follow_up),
            Ok(None) => {
                debug!(module_id = %caller, command = %command, "Unknown core command");
                (Envelope::missing_response(CORE_MODULE_ID, nonce), None)
            }
            Err(e) => {
                warn!(module_id = %caller, command = %command, "Core command failed: {}", e);
                (Envelope::error_response(CORE_MODULE_ID, nonce, e.to_string()), None)
            }
        };
        self.reply_to(&caller, response);

        match follow_up {
            Some(FollowUp::StopCaller) => {
                if let Some(module) = self.module(&caller) {
                    module.stop().await;
                }
            }
            Some(FollowUp::Shutdown) => self.stop().await,
            Some(FollowUp::Restart) => {
                if let Err(e) = self.restart().await {
                    error!("Restart failed: {}", e);
                }
            }
            None => {}
        }
    }

    pub(crate) async fn handle_core_command(
        &self,
        caller: &str,
        command: &str,
        data: Value,
    ) -> CommandResult {
        match command {
            "get_registered_modules" => done(json!(self.registered_modules())),
            "kill" => Ok(Some((Value::Null, Some(FollowUp::StopCaller)))),
            "shutdown_core" => Ok(Some((Value::Null, Some(FollowUp::Shutdown)))),
            "restart_core" => Ok(Some((Value::Null, Some(FollowUp::Restart)))),

            "register_event_hook" => {
                let req: EventHookRequest = parse(data)?;
                self.inner
                    .events
                    .register(&req.event_name, caller, &req.callback_function);
                done(json!({"success": true}))
            }
            "unregister_event_hook" => {
                let req: EventHookRequest = parse(data)?;
                let removed = self
                    .inner
                    .events
                    .unregister(&req.event_name, caller, &req.callback_function);
                done(json!({"success": removed}))
            }
            "send_event" => {
                let req: SendEventRequest = parse(data)?;
                let delivered = self.publish_event(&req.event_name, caller, &req.data);
                done(json!({"hasSubscribers": delivered}))
            }

            "register_plugin" => {
                let req: RegisterPluginRequest = parse(data)?;
                let registered = self.inner.plugins.register(PluginEntry {
                    namespace: req.namespace,
                    plugin_name: req.plugin_name,
                    version: req.version,
                    author: req.author,
                    resolver: caller.to_string(),
                });
                done(json!({"conflict": !registered}))
            }
            "unregister_plugin" => {
                let req: NamespaceRequest = parse(data)?;
                done(json!({"success": self.inner.plugins.unregister(&req.namespace)}))
            }
            "get_plugin_namespace_info" => {
                let req: NamespaceRequest = parse(data)?;
                let info = match self.inner.plugins.get(&req.namespace) {
                    Some(entry) => json!({
                        "exist": true,
                        "pluginName": entry.plugin_name,
                        "version": entry.version,
                        "author": entry.author,
                        "resolver": entry.resolver,
                    }),
                    None => json!({"exist": false}),
                };
                done(info)
            }

            "prompt" => {
                let req: PromptRequestBody = parse(data)?;
                let answer = self
                    .inner
                    .prompts
                    .ask(caller, &req.prompt_info, req.prompt_type, req.default_value)
                    .await
                    .map_err(|e| ApiError::Failed(e.to_string()))?;
                done(json!({"data": answer}))
            }
            "log" => {
                let req: LogRequest = parse(data)?;
                self.log_from_module(caller, req);
                done(Value::Null)
            }
            "wait_for_module" => {
                let req: WaitForModuleRequest = parse(data)?;
                let timeout = req.timeout.map(Duration::from_millis);
                let found = self.wait_for_module(&req.module_namespace, timeout).await;
                done(json!(found))
            }

            "get_data_folder" => {
                let namespace = self.caller_namespace(caller)?;
                let dir = self.data_dir(&namespace);
                create_dir(&dir).await?;
                done(json!(dir.to_string_lossy()))
            }
            "get_temp_folder" => {
                let dir = self.run_dir().join(format!("data-{}", caller));
                create_dir(&dir).await?;
                done(json!(dir.to_string_lossy()))
            }

            "pnpm_install" => {
                let req: InstallRequest = parse(data)?;
                let result = self.installer().install(Path::new(&req.path)).await;
                done(install_result(result))
            }
            "pnpm_install_specific" => {
                let req: InstallRequest = parse(data)?;
                let dep = req
                    .dep
                    .ok_or_else(|| ApiError::InvalidRequest("missing field `dep`".to_string()))?;
                let result = self.installer().add(Path::new(&req.path), &dep).await;
                done(install_result(result))
            }

            "get_default_db" | "get_db_resolver" => {
                let req: DatabaseRequest = parse(data)?;
                let id = req
                    .database_id
                    .or_else(|| self.default_database())
                    .ok_or_else(|| ApiError::Failed("no default database selected".to_string()))?;
                let resolver = self.database_resolver(id).ok_or_else(|| {
                    ApiError::Failed(format!("database {} is not initialized", id))
                })?;
                done(json!({"databaseID": id, "resolver": resolver}))
            }
            "wait_for_default_db" => {
                self.wait_for_default_db().await;
                done(Value::Null)
            }

            "get_persistent_data" => {
                let namespace = self.caller_namespace(caller)?;
                let value = self
                    .inner
                    .persistent
                    .get(&namespace)
                    .map(|v| v.value().clone())
                    .unwrap_or(Value::Null);
                done(value)
            }
            "set_persistent_data" => {
                let namespace = self.caller_namespace(caller)?;
                self.inner.persistent.insert(namespace, data);
                done(json!({"success": true}))
            }
            "get_operator_list" => done(json!(self.config().operators)),

            _ => Ok(None),
        }
    }

    fn caller_namespace(&self, caller: &str) -> Result<String, ApiError> {
        self.module(caller)
            .and_then(|m| m.namespace().map(str::to_string))
            .ok_or_else(|| ApiError::Failed(format!("unknown module {}", caller)))
    }

    fn log_from_module(&self, caller: &str, req: LogRequest) {
        let namespace = req
            .namespace
            .or_else(|| self.caller_namespace(caller).ok())
            .unwrap_or_default();
        let message = req
            .data
            .iter()
            .map(|v| match v {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");

        match req.level.as_str() {
            "verbose" => trace!(target: "module", module_id = caller, namespace = %namespace, "{}", message),
            "debug" => debug!(target: "module", module_id = caller, namespace = %namespace, "{}", message),
            "warn" | "warning" => warn!(target: "module", module_id = caller, namespace = %namespace, "{}", message),
            "error" | "critical" => error!(target: "module", module_id = caller, namespace = %namespace, "{}", message),
            _ => info!(target: "module", module_id = caller, namespace = %namespace, "{}", message),
        }
    }
}

async fn create_dir(dir: &Path) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ApiError::Failed(format!("{}: {}", dir.display(), e)))
}

#[cfg(test)]
#[path = "core_api_tests.rs"]
mod tests;
