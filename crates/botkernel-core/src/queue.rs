//! Per-module outbound queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

use botkernel_protocols::Envelope;

/// FIFO of envelopes waiting for a module to become deliverable.
///
/// Draining holds the queue lock, so at most one drain runs per module and
/// envelopes leave in enqueue order.
#[derive(Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Envelope>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: Envelope) {
        self.items.lock().push_back(envelope);
    }

    /// Hand queued envelopes to `deliver` in order.
    ///
    /// `deliver` returns the envelope back when it cannot be sent; it is put
    /// back at the head and draining stops. Returns the number delivered.
    pub fn drain<F>(&self, mut deliver: F) -> usize
    where
        F: FnMut(Envelope) -> Result<(), Envelope>,
    {
        let mut items = self.items.lock();
        let mut delivered = 0;
        while let Some(envelope) = items.pop_front() {
            match deliver(envelope) {
                Ok(()) => delivered += 1,
                Err(envelope) => {
                    items.push_front(envelope);
                    break;
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
