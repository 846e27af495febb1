//! Test fixtures: bundle writer and a scriptable in-process module.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use zip::write::FileOptions;
use zip::ZipWriter;

use botkernel_config::SupervisorConfig;
use botkernel_protocols::Envelope;

use crate::supervisor::{ModuleState, ModuleSupervisor};
use crate::transport::{WorkerContext, WorkerModule, WorkerResult};

/// Write a bundle named `name` into `dir`.
pub(crate) fn write_bundle(
    dir: &Path,
    name: &str,
    manifest: &str,
    files: &[(&str, &str)],
) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    let mut zip = ZipWriter::new(fs::File::create(&path).unwrap());
    let options = FileOptions::default();
    zip.start_file("module.json", options).unwrap();
    zip.write_all(manifest.as_bytes()).unwrap();
    for (file, content) in files {
        zip.start_file(*file, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path
}

/// Manifest of a worker module served by `worker`.
pub(crate) fn worker_manifest(namespace: &str, worker: &str, auto_restart: bool) -> String {
    json!({
        "namespace": namespace,
        "autoRestart": auto_restart,
        "type": "script",
        "communicationProtocol": "node_worker",
        "scriptSrc": worker,
    })
    .to_string()
}

/// Supervisor timings short enough for tests.
pub(crate) fn fast_settings() -> SupervisorConfig {
    SupervisorConfig {
        handshake_timeout_ms: 500,
        challenge_timeout_ms: 200,
        heartbeat_min_ms: 40,
        heartbeat_max_ms: 80,
        kill_grace_ms: 500,
    }
}

/// Wait until the supervisor reaches a state matching `pred`.
pub(crate) async fn wait_state(
    supervisor: &ModuleSupervisor,
    pred: impl Fn(ModuleState) -> bool,
) -> ModuleState {
    let mut rx = supervisor.subscribe_state();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(*s)))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
    *reached
}

type Handler = Arc<dyn Fn(&WorkerContext, &str, &str, &Value) -> Option<Value> + Send + Sync>;

/// A worker whose behavior is configured per test.
#[derive(Clone)]
pub(crate) struct ScriptedWorker {
    namespace: String,
    kind: String,
    answer_challenges: bool,
    reject: Option<String>,
    silent: bool,
    handler: Option<Handler>,
    pub received: Arc<Mutex<Vec<Envelope>>>,
    pub handshakes: Arc<AtomicUsize>,
}

impl ScriptedWorker {
    pub(crate) fn new(namespace: &str, kind: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            answer_challenges: true,
            reject: None,
            silent: false,
            handler: None,
            received: Arc::new(Mutex::new(Vec::new())),
            handshakes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer `api_call`s: `(ctx, caller, command, data) -> reply data`.
    pub(crate) fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkerContext, &str, &str, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    pub(crate) fn ignore_challenges(mut self) -> Self {
        self.answer_challenges = false;
        self
    }

    pub(crate) fn reject(mut self, reason: &str) -> Self {
        self.reject = Some(reason.to_string());
        self
    }

    pub(crate) fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub(crate) fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self, command: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter_map(|env| match env {
                Envelope::ApiCall { call_cmd, data, .. } if call_cmd == command => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub(crate) fn responses(&self) -> Vec<Envelope> {
        self.received
            .lock()
            .iter()
            .filter(|env| matches!(env, Envelope::ApiResponse { .. }))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkerModule for ScriptedWorker {
    async fn run(self: Box<Self>, mut ctx: WorkerContext) -> WorkerResult {
        while let Some(envelope) = ctx.recv().await {
            self.received.lock().push(envelope.clone());
            match envelope {
                Envelope::Handshake { .. } => {
                    self.handshakes.fetch_add(1, Ordering::SeqCst);
                    if self.silent {
                        continue;
                    }
                    let reply = match &self.reject {
                        Some(reason) => Envelope::HandshakeFail {
                            error: Value::String(reason.clone()),
                        },
                        None => Envelope::HandshakeSuccess {
                            module: self.kind.clone(),
                            module_displayname: format!("Scripted {}", self.namespace),
                            module_namespace: self.namespace.clone(),
                        },
                    };
                    ctx.send(reply);
                }
                Envelope::Challenge { challenge } => {
                    if self.answer_challenges {
                        ctx.send(Envelope::ChallengeResponse { challenge });
                    }
                }
                Envelope::ApiCall {
                    call_from,
                    call_cmd,
                    data,
                    nonce,
                } => {
                    if call_cmd == "crash" {
                        return Err("crash requested".into());
                    }
                    if let Some(handler) = &self.handler {
                        if let Some(reply) = handler(&ctx, &call_from, &call_cmd, &data) {
                            ctx.respond(&call_from, nonce, reply);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
