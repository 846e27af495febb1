//! Routing of envelopes received from modules.

use serde_json::Value;
use tracing::{debug, warn};

use botkernel_protocols::{Envelope, CORE_MODULE_ID};

use crate::kernel::Kernel;
use crate::pending::ApiReply;
use crate::supervisor::Inbound;

impl Kernel {
    /// Route one envelope from module `from`.
    pub(crate) fn route(&self, inbound: Inbound) {
        let Inbound { from, envelope } = inbound;
        match envelope {
            Envelope::ApiSend {
                call_to,
                call_cmd,
                data,
                nonce,
            } => {
                if call_to == CORE_MODULE_ID {
                    let kernel = self.clone();
                    tokio::spawn(async move {
                        kernel.dispatch_core_call(from, call_cmd, data, nonce).await;
                    });
                    return;
                }
                match self.inner.modules.get(&call_to) {
                    Some(target) => target.queue_message(Envelope::ApiCall {
                        call_from: from,
                        call_cmd,
                        data,
                        nonce,
                    }),
                    None => {
                        warn!(module_id = %from, target = %call_to, "Call to unknown module");
                        self.reply_to(
                            &from,
                            Envelope::ApiResponse {
                                response_from: call_to,
                                exist: false,
                                data: Value::Null,
                                error: Some(Value::String("module not found".to_string())),
                                nonce,
                            },
                        );
                    }
                }
            }
            Envelope::ApiSendResponse {
                response_to,
                exist,
                data,
                error,
                nonce,
            } => {
                if response_to == CORE_MODULE_ID {
                    let reply = ApiReply {
                        from: from.clone(),
                        exist,
                        data,
                        error,
                    };
                    if !self.inner.pending.resolve(&nonce, reply) {
                        debug!(module_id = %from, %nonce, "Dropping response to unknown call");
                    }
                    return;
                }
                match self.inner.modules.get(&response_to) {
                    Some(target) => target.queue_message(Envelope::ApiResponse {
                        response_from: from,
                        exist,
                        data,
                        error,
                        nonce,
                    }),
                    None => {
                        debug!(module_id = %from, target = %response_to, "Dropping response to unknown module");
                    }
                }
            }
            other => {
                warn!(module_id = %from, kind = other.kind(), "Cannot route message");
            }
        }
    }

    /// Enqueue `envelope` on module `id`, if it still exists.
    pub(crate) fn reply_to(&self, id: &str, envelope: Envelope) {
        match self.inner.modules.get(id) {
            Some(module) => module.queue_message(envelope),
            None => debug!(module_id = id, kind = envelope.kind(), "Reply target is gone"),
        }
    }
}
