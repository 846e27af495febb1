//! # botkernel Core
//!
//! The module communication kernel of a pluggable bot runtime.
//!
//! ## Components
//!
//! - [`Kernel`] - Discovers module bundles, runs startup and routes messages
//! - [`ModuleSupervisor`] - Per-module lifecycle: handshake, heartbeat, crash recovery
//! - [`transport`] - Worker, IPC and stdio carriers behind one [`Transport`] trait
//! - Registries for modules, plugins and databases
//!
//! ## Core API
//!
//! Modules address the kernel itself as `core`. Every call gets exactly one
//! response; unknown commands answer `exist: false`.

pub mod bundle;
mod core_api;
pub mod events;
pub mod installer;
pub mod kernel;
pub mod lifecycle;
pub mod pending;
pub mod prompt;
pub mod queue;
pub mod registry;
mod router;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use core_api::ApiError;
pub use events::{EventBus, Subscription};
pub use installer::{CommandInstaller, DependencyInstaller};
pub use kernel::{Kernel, KernelBuilder, ModuleInfo, RESTART_DELAY};
pub use lifecycle::{KernelSignal, KernelState};
pub use pending::ApiReply;
pub use prompt::{PromptChannel, PromptError, PromptKind, PromptRequest};
pub use registry::{DatabaseRegistry, ModuleRegistry, PluginEntry, PluginRegistry};
pub use supervisor::{ModuleIdentity, ModuleState, ModuleSupervisor};
pub use transport::{
    EchoWorker, Transport, TransportEvent, TransportFactory, WorkerContext, WorkerModule,
    WorkerRegistry,
};
