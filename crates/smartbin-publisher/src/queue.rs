//! Cross-worker envelope queue.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::envelope::Envelope;

/// Unbounded lock-free FIFO of envelopes waiting for the publisher.
///
/// Clones share the same queue, so capture workers and the publisher each
/// hold their own handle.
#[derive(Clone, Default)]
pub struct EnvelopeQueue {
    inner: Arc<SegQueue<Envelope>>,
}

impl std::fmt::Debug for EnvelopeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl EnvelopeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: Envelope) {
        tracing::debug!(uid = %envelope.uid, "envelope queued");
        self.inner.push(envelope);
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
