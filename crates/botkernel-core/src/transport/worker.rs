//! In-process worker transport.
//!
//! A worker is a [`WorkerModule`] running as a tokio task. It receives
//! envelopes through its [`WorkerContext`] and answers the same way; the
//! kernel sees it exactly like an out-of-process module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use botkernel_protocols::{CommProtocol, Envelope, Nonce};

use super::{Transport, TransportEvent, TransportHandle};

pub type WorkerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Module code hosted inside the kernel process.
#[async_trait]
pub trait WorkerModule: Send + 'static {
    /// Run until the inbox closes or cancellation is requested.
    async fn run(self: Box<Self>, ctx: WorkerContext) -> WorkerResult;
}

/// A worker's side of the transport.
pub struct WorkerContext {
    module_id: String,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl WorkerContext {
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Next envelope from the kernel; `None` once the worker is being killed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            envelope = self.inbox.recv() => envelope,
        }
    }

    /// Send an envelope to the kernel. Returns `false` if nobody listens.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.events.send(TransportEvent::Message(envelope)).is_ok()
    }

    /// Answer an `api_call`. Calls carrying the no-reply nonce are skipped.
    pub fn respond(&self, call_from: &str, nonce: Nonce, data: Value) -> bool {
        if nonce.is_no_reply() {
            return true;
        }
        self.send(Envelope::ApiSendResponse {
            response_to: call_from.to_string(),
            exist: true,
            data,
            error: None,
            nonce,
        })
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn WorkerModule> + Send + Sync>;

/// Worker implementations addressable by a manifest's `scriptSrc`.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: DashMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn WorkerModule> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn WorkerModule>> {
        let factory = self.factories.get(name)?.value().clone();
        Some(factory())
    }
}

/// Transport to a worker task.
pub struct WorkerTransport {
    inbox: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
    runner: tokio::task::AbortHandle,
    kill_grace: Duration,
    killed: AtomicBool,
}

impl WorkerTransport {
    /// Start `worker` on the runtime.
    pub fn spawn(
        module_id: &str,
        worker: Box<dyn WorkerModule>,
        kill_grace: Duration,
    ) -> TransportHandle {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let ctx = WorkerContext {
            module_id: module_id.to_string(),
            inbox: inbox_rx,
            events: events_tx.clone(),
            cancel: cancel.clone(),
        };
        let runner = tokio::spawn(worker.run(ctx));
        let abort = runner.abort_handle();

        let id = module_id.to_string();
        let watcher = tokio::spawn(async move {
            let event = match runner.await {
                Ok(Ok(())) => TransportEvent::Exited(Some(0)),
                Ok(Err(e)) => TransportEvent::Error(format!("worker failed: {}", e)),
                Err(e) if e.is_panic() => TransportEvent::Error("worker panicked".to_string()),
                Err(_) => TransportEvent::Exited(None),
            };
            debug!(module_id = %id, ?event, "Worker finished");
            let _ = events_tx.send(event);
        });

        let transport = Arc::new(Self {
            inbox: inbox_tx,
            cancel,
            watcher: Mutex::new(Some(watcher)),
            runner: abort,
            kill_grace,
            killed: AtomicBool::new(false),
        });

        TransportHandle {
            transport,
            events: events_rx,
        }
    }
}

#[async_trait]
impl Transport for WorkerTransport {
    fn protocol(&self) -> CommProtocol {
        CommProtocol::Worker
    }

    fn send(&self, envelope: Envelope) {
        if self.is_killed() {
            return;
        }
        trace!(kind = envelope.kind(), "Sending to worker");
        let _ = self.inbox.send(envelope);
    }

    async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let Some(mut watcher) = self.watcher.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(self.kill_grace, &mut watcher)
            .await
            .is_err()
        {
            warn!("Worker ignored cancellation, aborting");
            self.runner.abort();
            let _ = watcher.await;
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Diagnostic worker answering `echo` with its input.
pub struct EchoWorker {
    namespace: String,
}

impl EchoWorker {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl WorkerModule for EchoWorker {
    async fn run(self: Box<Self>, mut ctx: WorkerContext) -> WorkerResult {
        while let Some(envelope) = ctx.recv().await {
            match envelope {
                Envelope::Handshake { .. } => {
                    ctx.send(Envelope::HandshakeSuccess {
                        module: "diagnostic".to_string(),
                        module_displayname: "Echo".to_string(),
                        module_namespace: self.namespace.clone(),
                    });
                }
                Envelope::Challenge { challenge } => {
                    ctx.send(Envelope::ChallengeResponse { challenge });
                }
                Envelope::ApiCall {
                    call_from,
                    call_cmd,
                    data,
                    nonce,
                } => {
                    if call_cmd == "echo" {
                        ctx.respond(&call_from, nonce, data);
                    } else if !nonce.is_no_reply() {
                        ctx.send(Envelope::ApiSendResponse {
                            response_to: call_from,
                            exist: false,
                            data: Value::Null,
                            error: None,
                            nonce,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
