//! Kernel lifecycle state and signals.

use tokio::sync::broadcast;

/// Kernel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelState {
    /// Initial state, not started.
    Created = 0,
    /// Running the startup phases.
    Starting = 1,
    /// All phases completed.
    Running = 2,
    /// Stopping modules and clearing registries.
    ShuttingDown = 3,
    /// Stopped; may be started again.
    Stopped = 4,
}

impl From<u8> for KernelState {
    fn from(v: u8) -> Self {
        match v {
            0 => KernelState::Created,
            1 => KernelState::Starting,
            2 => KernelState::Running,
            3 => KernelState::ShuttingDown,
            4 => KernelState::Stopped,
            _ => KernelState::Created,
        }
    }
}

/// Notifications broadcast by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSignal {
    /// A module completed its handshake (initial start or restart).
    ModuleLoaded { id: String, namespace: String },
    /// The default database has been selected.
    DefaultDatabaseReady { id: u32 },
    /// The kernel finished stopping.
    Stopped,
}

/// Broadcast channel carrying [`KernelSignal`]s.
#[derive(Clone)]
pub struct SignalChannel {
    sender: broadcast::Sender<KernelSignal>,
}

impl SignalChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Emit a signal. Dropped silently when nobody listens.
    pub fn emit(&self, signal: KernelSignal) {
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelSignal> {
        self.sender.subscribe()
    }
}

impl Default for SignalChannel {
    fn default() -> Self {
        Self::new()
    }
}
