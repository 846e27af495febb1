//! Child-process transport exchanging framed MessagePack over stdio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{trace, warn};

use botkernel_protocols::{CommProtocol, Envelope, FrameCodec, KernelError};

use super::process::{spawn_child, ChildControl, ProcessCommand};
use super::{Transport, TransportEvent, TransportHandle};

/// Transport to a module process using [`FrameCodec`] frames.
///
/// Kill sends SIGTERM without waiting for the process to exit.
pub struct StdioTransport {
    writer: mpsc::UnboundedSender<Envelope>,
    control: ChildControl,
    killed: AtomicBool,
}

impl StdioTransport {
    pub fn spawn(command: &ProcessCommand) -> Result<TransportHandle, KernelError> {
        let (child, stdin, stdout) = spawn_child(command)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Envelope>();

        let module_id = command.module_id.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, FrameCodec::new());
            while let Some(envelope) = writer_rx.recv().await {
                let payload = match FrameCodec::encode_payload(&envelope) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(module_id = %module_id, "Failed to encode {}: {}", envelope.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(payload).await {
                    warn!(module_id = %module_id, "Write to module failed: {}", e);
                    break;
                }
            }
        });

        let module_id = command.module_id.clone();
        let reader_events = events_tx.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(stdout, FrameCodec::new());
            while let Some(frame) = frames.next().await {
                let payload = match frame {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(module_id = %module_id, "Read from module failed: {}", e);
                        break;
                    }
                };
                match FrameCodec::decode_payload(&payload) {
                    Ok(envelope) => {
                        if reader_events.send(TransportEvent::Message(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(module_id = %module_id, "Dropping undecodable frame: {}", e),
                }
            }
            let resyncs = frames.decoder().resyncs();
            if resyncs > 0 {
                warn!(module_id = %module_id, resyncs, "Stream resynchronized");
            }
        });

        let control = ChildControl::reap(command.module_id.clone(), child, events_tx, None);

        Ok(TransportHandle {
            transport: Arc::new(Self {
                writer: writer_tx,
                control,
                killed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn protocol(&self) -> CommProtocol {
        CommProtocol::Stdio
    }

    fn send(&self, envelope: Envelope) {
        if self.is_killed() {
            return;
        }
        trace!(kind = envelope.kind(), "Sending over stdio");
        let _ = self.writer.send(envelope);
    }

    async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.control.kill(false).await;
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
