use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use gattlink_frame::{FrameConfig, MessageReassembler};
use tracing::{debug, warn};

use crate::callbacks::HostCallbacks;

/// Inbound frame path of one session: reassembly, then host callbacks.
pub(crate) struct InboundPipeline {
    reassembler: Mutex<MessageReassembler>,
    callbacks: Arc<HostCallbacks>,
}

impl InboundPipeline {
    pub(crate) fn new(config: &FrameConfig, callbacks: Arc<HostCallbacks>) -> Self {
        Self {
            reassembler: Mutex::new(MessageReassembler::with_config(config)),
            callbacks,
        }
    }

    /// Feed one received characteristic value. Malformed frames are dropped.
    pub(crate) fn on_value(&self, raw: Bytes) {
        let progress = {
            let mut reassembler = self
                .reassembler
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match reassembler.consume_raw(raw) {
                Ok(progress) => progress,
                Err(err) => {
                    warn!(%err, "dropping malformed inbound frame");
                    return;
                }
            }
        };

        if progress.started {
            self.callbacks.message_start_received();
        }
        if let Some(message) = progress.completed {
            debug!(len = message.len(), payload = %hex::encode(&message), "message received");
            self.callbacks.message_received(message);
        }
    }

    /// Discard a partially received message.
    pub(crate) fn reset(&self) {
        let discarded = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        if discarded > 0 {
            warn!(discarded, "partial inbound message discarded");
        }
    }
}
