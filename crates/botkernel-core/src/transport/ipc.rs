//! Child-process transport exchanging newline-delimited JSON envelopes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use botkernel_protocols::{CommProtocol, Envelope, KernelError};

use super::process::{spawn_child, ChildControl, ProcessCommand};
use super::{Transport, TransportEvent, TransportHandle};

/// Transport to a module process speaking JSON lines on stdin/stdout.
///
/// Kill sends SIGTERM and waits up to the grace window before a forced kill.
pub struct IpcTransport {
    writer: mpsc::UnboundedSender<Envelope>,
    control: ChildControl,
    killed: AtomicBool,
}

impl IpcTransport {
    pub fn spawn(command: &ProcessCommand, kill_grace: Duration) -> Result<TransportHandle, KernelError> {
        let (child, mut stdin, stdout) = spawn_child(command)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Envelope>();

        let module_id = command.module_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = writer_rx.recv().await {
                let mut line = match serde_json::to_string(&envelope) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(module_id = %module_id, "Failed to encode {}: {}", envelope.kind(), e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(module_id = %module_id, "Write to module failed: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!(module_id = %module_id, "Flush to module failed: {}", e);
                    break;
                }
            }
        });

        let module_id = command.module_id.clone();
        let reader_events = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(&line) {
                            Ok(envelope) => {
                                if reader_events.send(TransportEvent::Message(envelope)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    module_id = %module_id,
                                    "Dropping undecodable line: {} - {}",
                                    e,
                                    excerpt(&line)
                                );
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(module_id = %module_id, "Read from module failed: {}", e);
                        break;
                    }
                }
            }
        });

        let control = ChildControl::reap(
            command.module_id.clone(),
            child,
            events_tx,
            Some(kill_grace),
        );

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

/// First 200 characters of a line, for logging.
fn excerpt(line: &str) -> &str {
    match line.char_indices().nth(200) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

#[async_trait]
impl Transport for IpcTransport {
    fn protocol(&self) -> CommProtocol {
        CommProtocol::Ipc
    }

    fn send(&self, envelope: Envelope) {
        if self.is_killed() {
            return;
        }
        trace!(kind = envelope.kind(), "Sending over IPC");
        let _ = self.writer.send(envelope);
    }

    async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.control.kill(true).await;
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
