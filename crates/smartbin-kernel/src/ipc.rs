//! Fleet lifecycle bus.
//!
//! Workers, the supervisor and the publisher announce lifecycle transitions
//! on a [`FleetBus`] built on [`tokio::sync::broadcast`].  The bus carries
//! notifications only; device control still goes through the registry's
//! event flags.  Sending never blocks, so it is safe from worker threads.
//!
//! ```rust
//! # use smartbin_kernel::ipc::{FleetBus, FleetEvent};
//! let bus = FleetBus::new(64);
//! let mut rx = bus.subscribe();
//! bus.publish(FleetEvent::WorkerStarted { driver: "Scale".into() });
//! assert!(matches!(
//!     rx.try_recv().unwrap().event,
//!     FleetEvent::WorkerStarted { .. }
//! ));
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FleetEvent {
    /// A worker thread was spawned.
    WorkerStarted { driver: String },

    /// `initialize()` returned successfully.
    WorkerInitialized { driver: String },

    /// `initialize()` failed or panicked.
    WorkerInitFailed { driver: String, reason: String },

    /// One `measure()` tick failed or panicked; the loop continues.
    MeasureFailed { driver: String, reason: String },

    /// A `measure()` call has been running far longer than its interval.
    WorkerHung { driver: String, busy_for_ms: u64 },

    /// The worker loop exited and `kill()` has run.
    WorkerStopped { driver: String },

    /// A stop timed out and the thread was left behind.  `released` tells
    /// whether the driver's release handle freed its hardware.
    WorkerDetached { driver: String, released: bool },

    /// An envelope was written to the on-disk journal.
    EnvelopeJournaled { uid: String },

    /// The server acknowledged an envelope.
    UploadAcked { uid: String },

    /// An upload attempt failed; the envelope was re-queued.
    UploadFailed {
        uid: String,
        status: Option<u16>,
        reason: String,
    },

    /// The cached online flag flipped.
    ConnectivityChanged { online: bool },

    /// An operator alert was sent for a new failure code.
    OperatorAlerted { status: Option<u16> },
}

/// A [`FleetEvent`] stamped with its publication time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped {
    pub at: DateTime<Utc>,
    pub event: FleetEvent,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus backed by [`tokio::sync::broadcast`].
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct FleetBus {
    inner: Arc<FleetBusInner>,
}

struct FleetBusInner {
    sender: broadcast::Sender<Arc<Stamped>>,
}

impl std::fmt::Debug for FleetBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl FleetBus {
    /// Create a bus with the given channel capacity.  Subscribers that lag
    /// behind by more than `capacity` events observe
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(FleetBusInner { sender }),
        }
    }

    /// Publish to every current subscriber and return how many there were.
    ///
    /// Publishing with nobody listening is not an error.
    pub fn publish(&self, event: FleetEvent) -> usize {
        let stamped = Arc::new(Stamped {
            at: Utc::now(),
            event,
        });
        match self.inner.sender.send(stamped) {
            Ok(n) => {
                tracing::trace!(receivers = n, "fleet event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to every future event.  Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Stamped>> {
        self.inner.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for FleetBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
