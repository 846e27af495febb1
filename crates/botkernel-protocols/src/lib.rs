//! # botkernel Protocols
//!
//! Wire-level definitions shared by the kernel and its transports.
//! Contains only data types and codecs - no runtime behavior.
//!
//! ## Contents
//!
//! - [`Envelope`] - The tagged message unit exchanged with modules
//! - [`Nonce`] - Correlation token pairing calls with responses
//! - [`ModuleManifest`] - Parsed `module.json` of a module bundle
//! - [`FrameCodec`] - Marker-synchronized length-prefixed framing for stdio modules
//! - [`KernelError`] - Error taxonomy used across the workspace

pub mod envelope;
pub mod error;
pub mod framing;
pub mod manifest;

pub use envelope::{Envelope, Nonce, CORE_MODULE_ID, PROTOCOL_VERSION};
pub use error::{FrameError, HandshakeFailure, KernelError, ManifestError};
pub use framing::{FrameCodec, FRAME_MARKER, MARKER_RUN, MAX_FRAME_LEN};
pub use manifest::{CommProtocol, ModuleManifest, ModuleType};
