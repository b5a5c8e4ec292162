//! Smart bin sample publisher.
//!
//! Capture cycles produce [`Envelope`]s that are pushed onto an
//! [`EnvelopeQueue`].  The [`AsyncPublisher`] driver drains that queue on its
//! own worker, journaling each envelope to disk before it is uploaded and
//! removing it only once the server acknowledged it.
//!
//! - **[`envelope`]** -- envelope, uid and origin types.
//! - **[`journal`]** -- crash-durable JSON journal with atomic rewrites.
//! - **[`queue`]** -- lock-free queue shared by producers and the publisher.
//! - **[`transport`]** -- multipart upload and heartbeat over [`reqwest`].
//! - **[`secrets`]** -- JSON secret store, reloaded when the file changes.
//! - **[`alert`]** -- operator alerts over SMTP.
//! - **[`enrich`]** -- transcription hook for user-triggered samples.
//! - **[`publisher`]** -- the publisher driver and its state machine.

pub mod alert;
pub mod enrich;
pub mod envelope;
pub mod error;
pub mod journal;
pub mod publisher;
pub mod queue;
pub mod secrets;
pub mod transport;

pub use alert::{Alerter, OperatorAlert, SmtpAlerter};
pub use enrich::{Enricher, NoEnrichment, SidecarTranscript};
pub use envelope::{Envelope, EnvelopeId, Origin, roles};
pub use error::{PublishError, Result};
pub use journal::Journal;
pub use publisher::{AsyncPublisher, PUBLISHER_NAME, PublisherConfig, default_readings};
pub use queue::EnvelopeQueue;
pub use secrets::{AlertSecrets, SecretStore, Secrets};
pub use transport::{
    DeviceIdentity, HttpTransport, ScanPayload, Transport, UploadOutcome, interpret_response,
};
