//! Per-module supervision.
//!
//! A [`ModuleSupervisor`] owns one module: it extracts the bundle, spawns the
//! transport, performs the handshake, runs the heartbeat and restarts the
//! module after a crash when its manifest asks for it.
//!
//! ```text
//! Idle ─start─▶ Starting ─spawn─▶ HandshakeWait ─success─▶ Started
//!                  │                    │                     │
//!                  └──── error ─────────┴──▶ Failed           │ exit / missed challenge
//!                                                             ▼
//!              Stopped ◀── autoRestart=false ── CrashDetected ─▶ Restarting ─▶ Starting
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use botkernel_config::SupervisorConfig;
use botkernel_protocols::{
    Envelope, HandshakeFailure, KernelError, ModuleManifest, PROTOCOL_VERSION,
};

use crate::bundle;
use crate::lifecycle::{KernelSignal, SignalChannel};
use crate::queue::OutboundQueue;
use crate::transport::{SpawnRequest, Transport, TransportEvent, TransportFactory};

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Idle,
    Starting,
    HandshakeWait,
    Started,
    CrashDetected,
    Restarting,
    Stopped,
    Failed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Idle => "idle",
            ModuleState::Starting => "starting",
            ModuleState::HandshakeWait => "handshake_wait",
            ModuleState::Started => "started",
            ModuleState::CrashDetected => "crash_detected",
            ModuleState::Restarting => "restarting",
            ModuleState::Stopped => "stopped",
            ModuleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// An envelope received from a module, tagged with the sender's ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: String,
    pub envelope: Envelope,
}

/// What a supervisor needs from the kernel.
#[derive(Clone)]
pub struct SupervisorContext {
    pub router: mpsc::UnboundedSender<Inbound>,
    pub transports: Arc<dyn TransportFactory>,
    pub settings: SupervisorConfig,
    pub signals: SignalChannel,
}

/// Identity reported by the module in its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// Module kind, e.g. `database`, `interface` or `pl_handler`.
    pub kind: String,
    pub display_name: String,
}

impl Default for ModuleIdentity {
    fn default() -> Self {
        Self {
            kind: "unknown".to_string(),
            display_name: String::new(),
        }
    }
}

#[derive(Debug)]
struct HandshakeReply {
    identity: ModuleIdentity,
    namespace: String,
}

type HandshakeSlot = oneshot::Sender<Result<HandshakeReply, HandshakeFailure>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CrashReason {
    TransportDown(String),
    MissedChallenge,
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashReason::TransportDown(reason) => write!(f, "transport down: {}", reason),
            CrashReason::MissedChallenge => write!(f, "missed heartbeat challenge"),
        }
    }
}

/// Supervises one module instance.
pub struct ModuleSupervisor {
    seq: u64,
    id: String,
    bundle_path: PathBuf,
    work_dir: PathBuf,
    manifest: OnceLock<ModuleManifest>,
    identity: RwLock<ModuleIdentity>,
    config: RwLock<Value>,
    state: watch::Sender<ModuleState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<CancellationToken>>,
    handshake: Mutex<Option<HandshakeSlot>>,
    challenge: Mutex<Option<(String, oneshot::Sender<()>)>>,
    queue: OutboundQueue,
    ctx: SupervisorContext,
    launches: AtomicU32,
    crashes: AtomicU32,
}

impl ModuleSupervisor {
    pub fn new(seq: u64, bundle_path: PathBuf, work_dir: PathBuf, ctx: SupervisorContext) -> Arc<Self> {
        let (state, _) = watch::channel(ModuleState::Idle);
        Arc::new(Self {
            seq,
            id: seq.to_string(),
            bundle_path,
            work_dir,
            manifest: OnceLock::new(),
            identity: RwLock::new(ModuleIdentity::default()),
            config: RwLock::new(Value::Null),
            state,
            transport: Mutex::new(None),
            listener: Mutex::new(None),
            heartbeat: Mutex::new(None),
            handshake: Mutex::new(None),
            challenge: Mutex::new(None),
            queue: OutboundQueue::new(),
            ctx,
            launches: AtomicU32::new(0),
            crashes: AtomicU32::new(0),
        })
    }

    /// Numeric module ID.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Read and cache the bundle's manifest.
    pub async fn load_manifest(&self) -> Result<&ModuleManifest, KernelError> {
        if let Some(manifest) = self.manifest.get() {
            return Ok(manifest);
        }
        let manifest = bundle::read_manifest(&self.id, &self.bundle_path).await?;
        Ok(self.manifest.get_or_init(|| manifest))
    }

    pub fn manifest(&self) -> Option<&ModuleManifest> {
        self.manifest.get()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.manifest.get().map(|m| m.namespace.as_str())
    }

    pub fn identity(&self) -> ModuleIdentity {
        self.identity.read().clone()
    }

    /// Configuration sent with the next handshake.
    pub fn set_config(&self, config: Value) {
        *self.config.write() = config;
    }

    pub fn state(&self) -> ModuleState {
        *self.state.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ModuleState::Started
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ModuleState> {
        self.state.subscribe()
    }

    /// Number of transports spawned so far.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn crashes(&self) -> u32 {
        self.crashes.load(Ordering::SeqCst)
    }

    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue an envelope and deliver whatever the module can take now.
    pub fn queue_message(&self, envelope: Envelope) {
        self.queue.push(envelope);
        self.flush();
    }

    fn flush(&self) {
        let delivered = self.queue.drain(|envelope| {
            if !self.is_started() {
                return Err(envelope);
            }
            match self.transport.lock().as_ref() {
                Some(transport) if !transport.is_killed() => {
                    transport.send(envelope);
                    Ok(())
                }
                _ => Err(envelope),
            }
        });
        if delivered > 0 {
            trace!(module_id = %self.id, delivered, "Flushed outbound queue");
        }
    }

    fn send_direct(&self, envelope: Envelope) {
        let transport = self.transport.lock().clone();
        if let Some(transport) = transport {
            transport.send(envelope);
        }
    }

    fn set_state(&self, next: ModuleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(module_id = %self.id, from = %previous, to = %next, "Module state changed");
        }
    }

    /// Move to `next` if the current state is one of `from`.
    fn transition(&self, from: &[ModuleState], next: ModuleState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(module_id = %self.id, to = %next, "Module state changed");
        }
        changed
    }

    /// Launch the module and complete the handshake.
    ///
    /// A no-op unless the module is idle, stopped or failed. On error the
    /// module is left `Failed` with no transport.
    pub async fn start(self: &Arc<Self>) -> Result<(), KernelError> {
        let from = [ModuleState::Idle, ModuleState::Stopped, ModuleState::Failed];
        if !self.transition(&from, ModuleState::Starting) {
            return Ok(());
        }
        match self.launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown().await;
                self.transition(
                    &[ModuleState::Starting, ModuleState::HandshakeWait],
                    ModuleState::Failed,
                );
                Err(e)
            }
        }
    }

    async fn launch(self: &Arc<Self>) -> Result<(), KernelError> {
        let manifest = self.load_manifest().await?.clone();
        if !manifest.protocol.supports(manifest.module_type) {
            return Err(KernelError::UnsupportedTransport {
                module: self.id.clone(),
                module_type: manifest.module_type,
                protocol: manifest.protocol,
            });
        }

        bundle::extract(&self.bundle_path, &self.work_dir).await?;

        self.launches.fetch_add(1, Ordering::SeqCst);
        let handle = self
            .ctx
            .transports
            .spawn(SpawnRequest {
                module_id: &self.id,
                manifest: &manifest,
                work_dir: &self.work_dir,
            })
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        *self.handshake.lock() = Some(reply_tx);
        *self.transport.lock() = Some(handle.transport.clone());
        let listener = self.listen(handle.events);
        *self.listener.lock() = Some(listener);

        if !self.transition(&[ModuleState::Starting], ModuleState::HandshakeWait) {
            return Err(KernelError::Startup(format!(
                "module {} was stopped during startup",
                self.id
            )));
        }

        let config = self.config.read().clone();
        handle.transport.send(Envelope::Handshake {
            id: self.id.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            config,
        });

        let timeout = self.ctx.settings.handshake_timeout();
        let outcome = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HandshakeFailure::TransportClosed),
            Err(_) => Err(HandshakeFailure::Timeout(timeout)),
        };
        let reply = outcome.map_err(|reason| KernelError::Handshake {
            module: self.id.clone(),
            reason,
        })?;

        if reply.namespace != manifest.namespace {
            return Err(KernelError::Handshake {
                module: self.id.clone(),
                reason: HandshakeFailure::NamespaceMismatch {
                    expected: manifest.namespace.clone(),
                    reported: reply.namespace,
                },
            });
        }

        *self.identity.write() = reply.identity.clone();
        if !self.transition(&[ModuleState::HandshakeWait], ModuleState::Started) {
            return Err(KernelError::Startup(format!(
                "module {} was stopped during startup",
                self.id
            )));
        }

        info!(
            module_id = %self.id,
            namespace = %manifest.namespace,
            kind = %reply.identity.kind,
            "Module {} started",
            reply.identity.display_name
        );
        self.ctx.signals.emit(KernelSignal::ModuleLoaded {
            id: self.id.clone(),
            namespace: manifest.namespace.clone(),
        });
        self.spawn_heartbeat();
        self.flush();
        Ok(())
    }

    fn listen(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(envelope) => this.on_message(envelope),
                    TransportEvent::Error(reason) => {
                        this.on_transport_down(reason);
                        return;
                    }
                    TransportEvent::Exited(code) => {
                        let reason = match code {
                            Some(code) => format!("exited with code {}", code),
                            None => "exited".to_string(),
                        };
                        this.on_transport_down(reason);
                        return;
                    }
                }
            }
            this.on_transport_down("transport closed".to_string());
        })
    }

    fn on_message(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::HandshakeSuccess {
                module,
                module_displayname,
                module_namespace,
            } => self.complete_handshake(Ok(HandshakeReply {
                identity: ModuleIdentity {
                    kind: module,
                    display_name: module_displayname,
                },
                namespace: module_namespace,
            })),
            Envelope::HandshakeFail { error } => {
                let reason = match error {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                self.complete_handshake(Err(HandshakeFailure::Rejected(reason)));
            }
            Envelope::ChallengeResponse { challenge } => self.answer_challenge(&challenge),
            envelope @ (Envelope::ApiSend { .. } | Envelope::ApiSendResponse { .. }) => {
                let inbound = Inbound {
                    from: self.id.clone(),
                    envelope,
                };
                if self.ctx.router.send(inbound).is_err() {
                    warn!(module_id = %self.id, "Router is gone, dropping message");
                }
            }
            other => {
                warn!(module_id = %self.id, kind = other.kind(), "Unexpected message from module");
            }
        }
    }

    fn complete_handshake(&self, outcome: Result<HandshakeReply, HandshakeFailure>) {
        match self.handshake.lock().take() {
            Some(slot) => {
                let _ = slot.send(outcome);
            }
            None => debug!(module_id = %self.id, "Ignoring handshake reply outside handshake"),
        }
    }

    fn answer_challenge(&self, token: &str) {
        let mut pending = self.challenge.lock();
        match pending.take() {
            Some((expected, slot)) if expected == token => {
                let _ = slot.send(());
            }
            other => {
                *pending = other;
                debug!(module_id = %self.id, "Ignoring stale challenge response");
            }
        }
    }

    fn on_transport_down(self: &Arc<Self>, reason: String) {
        if let Some(slot) = self.handshake.lock().take() {
            let _ = slot.send(Err(HandshakeFailure::TransportClosed));
        }
        self.report_crash(CrashReason::TransportDown(reason));
    }

    fn report_crash(self: &Arc<Self>, reason: CrashReason) {
        if !self.transition(&[ModuleState::Started], ModuleState::CrashDetected) {
            return;
        }
        self.crashes.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.recover(reason).await });
    }

    async fn recover(self: Arc<Self>, reason: CrashReason) {
        self.teardown().await;

        let auto_restart = self.manifest().is_some_and(|m| m.auto_restart);
        if !auto_restart {
            error!(module_id = %self.id, "Module crashed ({}), not restarting", reason);
            self.transition(&[ModuleState::CrashDetected], ModuleState::Stopped);
            return;
        }

        warn!(module_id = %self.id, "Module crashed ({}), restarting", reason);
        if !self.transition(&[ModuleState::CrashDetected], ModuleState::Restarting) {
            return;
        }
        if !self.transition(&[ModuleState::Restarting], ModuleState::Starting) {
            return;
        }
        if let Err(e) = self.launch().await {
            error!(module_id = %self.id, "Restart failed: {}", e);
            self.teardown().await;
            self.transition(
                &[ModuleState::Starting, ModuleState::HandshakeWait],
                ModuleState::Stopped,
            );
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.heartbeat.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.heartbeat_loop(cancel).await });
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let settings = self.ctx.settings.clone();
        loop {
            let interval = jittered(settings.heartbeat_min(), settings.heartbeat_max());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if !self.is_started() {
                return;
            }

            let token = Uuid::new_v4().simple().to_string();
            let (answered_tx, answered_rx) = oneshot::channel();
            *self.challenge.lock() = Some((token.clone(), answered_tx));
            trace!(module_id = %self.id, "Sending heartbeat challenge");
            self.send_direct(Envelope::Challenge { challenge: token });

            tokio::select! {
                _ = cancel.cancelled() => return,
                answered = tokio::time::timeout(settings.challenge_timeout(), answered_rx) => {
                    if !matches!(answered, Ok(Ok(()))) {
                        warn!(module_id = %self.id, "Heartbeat challenge not answered");
                        self.report_crash(CrashReason::MissedChallenge);
                        return;
                    }
                }
            }
        }
    }

    /// Stop a running module. A no-op unless `Started`.
    pub async fn stop(&self) -> bool {
        if !self.transition(&[ModuleState::Started], ModuleState::Stopped) {
            return false;
        }
        info!(module_id = %self.id, "Stopping module");
        self.teardown().await;
        true
    }

    /// Stop the module whatever it is doing. Used at kernel shutdown.
    pub async fn terminate(&self) {
        self.set_state(ModuleState::Stopped);
        self.teardown().await;
    }

    async fn teardown(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.cancel();
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.challenge.lock().take();
        self.handshake.lock().take();
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.kill().await;
        }
    }
}

/// Uniform duration in `[min, max)`.
fn jittered(min: Duration, max: Duration) -> Duration {
    let span = max.saturating_sub(min).as_millis();
    if span == 0 {
        return min;
    }
    min + Duration::from_millis(random_below(span) as u64)
}

/// Random integer in `[0, bound)`, drawn from a v4 UUID's random bits.
fn random_below(bound: u128) -> u128 {
    Uuid::new_v4().as_u128() % bound
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
