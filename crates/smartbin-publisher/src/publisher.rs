//! The durable publisher driver.
//!
//! [`AsyncPublisher`] is hosted by an ordinary worker.  Each tick it moves
//! at most one envelope through
//!
//! ```text
//! Queued -> Journaled -> Uploading -> Acked   (journal entry, then files removed)
//!                                  -> Failed  (re-queued unchanged)
//! ```
//!
//! The envelope is written to the journal before anything else happens, so
//! a crash at any later point resumes it on the next start.  Delivery is
//! at-least-once: an envelope leaves the journal only after the server
//! acknowledged it.
//!
//! The publisher owns a current-thread tokio runtime built in
//! `initialize()` and drives the async [`Transport`] and [`Alerter`] with
//! `block_on` from its worker thread.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smartbin_kernel::{Driver, DriverContext, DriverError, DriverResult, FleetEvent, Scalar};

use crate::alert::{Alerter, OperatorAlert};
use crate::enrich::{Enricher, NoEnrichment};
use crate::envelope::Envelope;
use crate::journal::Journal;
use crate::queue::EnvelopeQueue;
use crate::transport::{DeviceIdentity, ScanPayload, Transport, UploadOutcome};

/// Registry name of the publisher driver.
pub const PUBLISHER_NAME: &str = "AsyncPublisher";

/// Data fields published by the driver.
pub mod fields {
    pub const QUEUED: &str = "queued";
    pub const JOURNALED: &str = "journaled";
    pub const ONLINE: &str = "online";
    pub const LAST_STATUS: &str = "last_status";
    pub const UPLOADS_ACKED: &str = "uploads_acked";
    pub const UPLOADS_FAILED: &str = "uploads_failed";
}

/// Events raised by the driver.  Indicator drivers clear them.
pub mod events {
    pub const UPLOAD_DONE: &str = "UPLOAD_DONE";
    pub const UPLOAD_FAILED: &str = "UPLOAD_FAILED";
}

/// Payload reading names mapped to their default registry keys.
pub fn default_readings() -> BTreeMap<String, String> {
    [
        ("weight", "NAU7802.weight"),
        ("weight_delta", "NAU7802.weight_delta"),
        ("temperature", "BME688.temperature"),
        ("pressure", "BME688.pressure"),
        ("humidity", "BME688.humidity"),
        ("gas_resistance", "BME688.gas_resistance"),
    ]
    .into_iter()
    .map(|(name, key)| (name.to_string(), key.to_string()))
    .collect()
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub journal_path: PathBuf,
    pub identity: DeviceIdentity,
    pub poll_interval: Duration,
    /// Pause after an offline tick before the next envelope is tried.
    pub offline_backoff: Duration,
    pub readings: BTreeMap<String, String>,
}

impl PublisherConfig {
    pub fn new(journal_path: impl Into<PathBuf>, identity: DeviceIdentity) -> Self {
        Self {
            journal_path: journal_path.into(),
            identity,
            poll_interval: Duration::from_millis(200),
            offline_backoff: Duration::from_secs(1),
            readings: default_readings(),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Journals, uploads and retries sample envelopes.
pub struct AsyncPublisher {
    config: PublisherConfig,
    queue: EnvelopeQueue,
    transport: Arc<dyn Transport>,
    alerter: Option<Arc<dyn Alerter>>,
    enricher: Box<dyn Enricher>,
    journal: Option<Journal>,
    runtime: Option<tokio::runtime::Runtime>,
    online: bool,
    backoff_until: Option<Instant>,
    /// Code of the previous attempt; `-1` when the server was unreachable.
    last_code: Option<i32>,
    acked: u64,
    failed: u64,
}

impl std::fmt::Debug for AsyncPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPublisher")
            .field("journal", &self.config.journal_path)
            .field("queued", &self.queue.len())
            .field("online", &self.online)
            .finish()
    }
}

impl AsyncPublisher {
    pub fn new(config: PublisherConfig, queue: EnvelopeQueue, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            queue,
            transport,
            alerter: None,
            enricher: Box::new(NoEnrichment),
            journal: None,
            runtime: None,
            online: true,
            backoff_until: None,
            last_code: None,
            acked: 0,
            failed: 0,
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn with_enricher(mut self, enricher: impl Enricher + 'static) -> Self {
        self.enricher = Box::new(enricher);
        self
    }

    /// Cached connectivity flag.
    pub fn is_online(&self) -> bool {
        self.online
    }

    fn runtime(&self) -> DriverResult<&tokio::runtime::Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| DriverError::NotReady("publisher runtime not started".into()))
    }

    fn journal(&mut self) -> DriverResult<&mut Journal> {
        self.journal
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("journal not loaded".into()))
    }

    /// Re-probe connectivity and publish a change of the cached flag.
    fn probe(&mut self, ctx: &DriverContext) -> DriverResult {
        let transport = Arc::clone(&self.transport);
        let online = self.runtime()?.block_on(async move { transport.heartbeat().await });
        if online != self.online {
            tracing::info!(online, "connectivity changed");
            ctx.publish(FleetEvent::ConnectivityChanged { online });
        }
        self.online = online;
        Ok(())
    }

    fn transcription(&mut self, envelope: &Envelope) -> String {
        if !envelope.origin_trigger.is_user_triggered() {
            return String::new();
        }
        match self.enricher.enrich(envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(uid = %envelope.uid, error = %e, "enrichment failed, uploading without it");
                String::new()
            }
        }
    }

    fn upload(&mut self, envelope: &Envelope) -> DriverResult<UploadOutcome> {
        let transcription = self.transcription(envelope);
        let payload = ScanPayload::build(
            envelope,
            &self.config.identity,
            &self.config.readings,
            transcription,
        );
        let transport = Arc::clone(&self.transport);
        let files = envelope.file_refs.clone();
        Ok(self
            .runtime()?
            .block_on(async move { transport.upload(&files, &payload).await }))
    }

    /// Removes the journal entry, then the files.  If the removal fails the
    /// entry and its files stay and the envelope resumes on the next start.
    fn on_acked(&mut self, ctx: &DriverContext, envelope: &Envelope) -> DriverResult {
        if let Err(e) = self.journal()?.remove(&envelope.uid) {
            tracing::error!(uid = %envelope.uid, error = %e, "acknowledged envelope still journaled, keeping its files");
            return Err(e.into());
        }
        self.acked += 1;

        let derived = self.enricher.derived_files(envelope);
        let files = envelope
            .file_refs
            .iter()
            .map(|(role, path)| (role.as_str(), path))
            .chain(derived.iter().map(|path| ("derived", path)));
        for (role, path) in files {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(uid = %envelope.uid, role = %role, path = %path.display(), error = %e, "cannot delete uploaded file"),
            }
        }

        tracing::info!(uid = %envelope.uid, "upload acknowledged");
        ctx.set_event(events::UPLOAD_DONE)?;
        ctx.publish(FleetEvent::UploadAcked {
            uid: envelope.uid.to_string(),
        });
        Ok(())
    }

    fn on_failed(&mut self, ctx: &DriverContext, envelope: Envelope, outcome: &UploadOutcome) -> DriverResult {
        self.failed += 1;
        tracing::warn!(uid = %envelope.uid, status = ?outcome.status(), detail = %outcome.detail(), "upload failed");
        ctx.set_event(events::UPLOAD_FAILED)?;
        ctx.publish(FleetEvent::UploadFailed {
            uid: envelope.uid.to_string(),
            status: outcome.status(),
            reason: outcome.detail(),
        });

        if self.last_code != Some(code_of(outcome)) {
            self.alert(ctx, &envelope, outcome);
        }

        self.queue.push(envelope);
        self.probe(ctx)
    }

    fn alert(&self, ctx: &DriverContext, envelope: &Envelope, outcome: &UploadOutcome) {
        let Some(alerter) = self.alerter.clone() else {
            return;
        };
        let Ok(runtime) = self.runtime() else {
            return;
        };
        let alert = OperatorAlert {
            device_id: self.config.identity.device_id.clone(),
            uid: envelope.uid.to_string(),
            status: outcome.status(),
            detail: outcome.detail(),
        };
        match runtime.block_on(async { alerter.alert(&alert).await }) {
            Ok(()) => {
                tracing::warn!(status = ?alert.status, "operator alerted about upload failures");
                ctx.publish(FleetEvent::OperatorAlerted {
                    status: alert.status,
                });
            }
            Err(e) => tracing::error!(error = %e, "operator alert could not be sent"),
        }
    }

    fn write_fields(&self, ctx: &DriverContext) -> DriverResult {
        ctx.write(fields::QUEUED, self.queue.len())?;
        ctx.write(
            fields::JOURNALED,
            self.journal.as_ref().map_or(0, Journal::len),
        )?;
        ctx.write(fields::ONLINE, self.online)?;
        ctx.write(fields::LAST_STATUS, i64::from(self.last_code.unwrap_or(0)))?;
        ctx.write(fields::UPLOADS_ACKED, self.acked as i64)?;
        ctx.write(fields::UPLOADS_FAILED, self.failed as i64)?;
        Ok(())
    }

    fn step(&mut self, ctx: &DriverContext) -> DriverResult {
        if self.backoff_until.is_some_and(|until| Instant::now() < until) {
            return Ok(());
        }
        self.backoff_until = None;
        if self.journal.is_none() || self.runtime.is_none() {
            return Err(DriverError::NotReady("publisher not initialized".into()));
        }

        let Some(envelope) = self.queue.pop() else {
            return Ok(());
        };

        if let Err(e) = self.journal()?.record(&envelope) {
            tracing::error!(uid = %envelope.uid, error = %e, "cannot journal envelope");
            self.queue.push(envelope);
            return Err(e.into());
        }
        ctx.publish(FleetEvent::EnvelopeJournaled {
            uid: envelope.uid.to_string(),
        });

        if !self.online {
            tracing::debug!(uid = %envelope.uid, "offline, deferring upload");
            self.queue.push(envelope);
            self.probe(ctx)?;
            self.backoff_until = Some(Instant::now() + self.config.offline_backoff);
            return Ok(());
        }

        let outcome = self.upload(&envelope)?;
        let code = code_of(&outcome);
        let result = if outcome.is_acked() {
            self.on_acked(ctx, &envelope)
        } else {
            self.on_failed(ctx, envelope, &outcome)
        };
        self.last_code = Some(code);
        result
    }
}

/// Code used to deduplicate alerts; unreachable servers share `-1`.
fn code_of(outcome: &UploadOutcome) -> i32 {
    outcome.status().map_or(-1, i32::from)
}

impl Driver for AsyncPublisher {
    fn name(&self) -> &str {
        PUBLISHER_NAME
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.config.poll_interval)
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::from([
            (fields::QUEUED.to_string(), Scalar::Int(0)),
            (fields::JOURNALED.to_string(), Scalar::Int(0)),
            (fields::ONLINE.to_string(), Scalar::Bool(true)),
            (fields::LAST_STATUS.to_string(), Scalar::Int(0)),
            (fields::UPLOADS_ACKED.to_string(), Scalar::Int(0)),
            (fields::UPLOADS_FAILED.to_string(), Scalar::Int(0)),
        ])
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from([
            events::UPLOAD_DONE.to_string(),
            events::UPLOAD_FAILED.to_string(),
        ])
    }

    /// Build the runtime, load the journal and re-queue every envelope that
    /// survived the previous run.
    fn initialize(&mut self, ctx: &DriverContext) -> DriverResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        self.runtime = Some(runtime);

        let journal = Journal::open(&self.config.journal_path)?;
        let pending = journal.envelopes();
        if !pending.is_empty() {
            tracing::info!(pending = pending.len(), "resuming journaled envelopes");
        }
        for envelope in pending {
            self.queue.push(envelope);
        }
        self.journal = Some(journal);
        self.write_fields(ctx)
    }

    fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
        let result = self.step(ctx);
        self.write_fields(ctx)?;
        result
    }

    fn kill(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Origin, roles};
    use crate::error::Result as PublishResult;
    use async_trait::async_trait;
    use smartbin_kernel::{DriverDescriptor, SharedRegistry, Snapshot};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<Vec<UploadOutcome>>,
        online: AtomicBool,
        uploads: Mutex<Vec<ScanPayload>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn upload(&self, _files: &BTreeMap<String, PathBuf>, payload: &ScanPayload) -> UploadOutcome {
            self.uploads.lock().unwrap().push(payload.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                UploadOutcome::Acked { status: 200 }
            } else {
                outcomes.remove(0)
            }
        }

        async fn heartbeat(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Option<u16>>>,
    }

    #[async_trait]
    impl Alerter for Recorder {
        async fn alert(&self, alert: &OperatorAlert) -> PublishResult<()> {
            self.sent.lock().unwrap().push(alert.status);
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        ctx: DriverContext,
        queue: EnvelopeQueue,
        publisher: AsyncPublisher,
        transport: Arc<Scripted>,
        alerts: Arc<Recorder>,
    }

    fn fixture(outcomes: Vec<UploadOutcome>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(Scripted {
            outcomes: Mutex::new(outcomes),
            online: AtomicBool::new(true),
            ..Scripted::default()
        });
        let alerts = Arc::new(Recorder::default());
        let queue = EnvelopeQueue::new();
        let identity = DeviceIdentity {
            device_id: "bin-1".into(),
            commit_id: "deadbeef".into(),
        };
        let config = PublisherConfig {
            offline_backoff: Duration::ZERO,
            ..PublisherConfig::new(dir.path().join("journal.json"), identity)
        };
        let publisher = AsyncPublisher::new(config, queue.clone(), transport.clone())
            .with_alerter(alerts.clone());

        let mut builder = SharedRegistry::builder();
        let id = builder.register(&DriverDescriptor::of(&publisher)).unwrap();
        let ctx = DriverContext::new(builder.build(), id);
        Fixture {
            dir,
            ctx,
            queue,
            publisher,
            transport,
            alerts,
        }
    }

    fn envelope() -> Envelope {
        Envelope::capture(BTreeMap::new(), Snapshot::default(), Origin::Scheduled)
    }

    #[test]
    fn rejected_upload_is_requeued_and_flagged() {
        let mut f = fixture(vec![UploadOutcome::Rejected {
            status: 500,
            body: "boom".into(),
        }]);
        f.publisher.initialize(&f.ctx).unwrap();
        let env = envelope();
        f.queue.push(env.clone());

        f.publisher.measure(&f.ctx).unwrap();
        assert_eq!(f.queue.pop(), Some(env.clone()));
        assert!(f.publisher.journal.as_ref().unwrap().contains(&env.uid));
        assert!(f.ctx.is_set(events::UPLOAD_FAILED).unwrap());
        assert_eq!(f.ctx.read(fields::LAST_STATUS).unwrap(), Scalar::Int(500));
        assert_eq!(f.ctx.read(fields::UPLOADS_FAILED).unwrap(), Scalar::Int(1));
    }

    #[test]
    fn alerts_only_when_code_changes() {
        let rejected = |status| UploadOutcome::Rejected {
            status,
            body: String::new(),
        };
        let mut f = fixture(vec![rejected(500), rejected(500), rejected(503)]);
        f.transport.online.store(true, Ordering::SeqCst);
        f.publisher.initialize(&f.ctx).unwrap();
        f.queue.push(envelope());

        for _ in 0..3 {
            f.publisher.measure(&f.ctx).unwrap();
        }
        assert_eq!(*f.alerts.sent.lock().unwrap(), vec![Some(500), Some(503)]);
    }

    #[test]
    fn enrichment_runs_only_for_user_triggered() {
        struct Fixed;
        impl Enricher for Fixed {
            fn enrich(&mut self, _envelope: &Envelope) -> PublishResult<String> {
                Ok("yogurt cup".into())
            }
        }

        let f = fixture(Vec::new());
        let mut publisher = f.publisher.with_enricher(Fixed);
        publisher.initialize(&f.ctx).unwrap();

        let user = Envelope::capture(BTreeMap::new(), Snapshot::default(), Origin::UserTriggered);
        f.queue.push(user);
        f.queue.push(envelope());
        publisher.measure(&f.ctx).unwrap();
        publisher.measure(&f.ctx).unwrap();

        let uploads = f.transport.uploads.lock().unwrap();
        assert_eq!(uploads[0].transcription, "yogurt cup");
        assert!(uploads[0].user_trigger);
        assert_eq!(uploads[1].transcription, "");
    }

    #[test]
    fn measure_before_initialize_is_not_ready() {
        let mut f = fixture(Vec::new());
        f.queue.push(envelope());
        assert!(matches!(
            f.publisher.measure(&f.ctx),
            Err(DriverError::NotReady(_))
        ));
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn ack_removes_journal_entry_then_files_and_transcript() {
        let f = fixture(Vec::new());
        let mut publisher = f.publisher.with_enricher(crate::enrich::SidecarTranscript);
        publisher.initialize(&f.ctx).unwrap();

        let recording = f.dir.path().join("clip.wav");
        let transcript = f.dir.path().join("clip.txt");
        let depth = f.dir.path().join("depth.png");
        std::fs::write(&recording, b"RIFF").unwrap();
        std::fs::write(&transcript, "banana peel").unwrap();
        std::fs::write(&depth, b"PNG").unwrap();
        let env = Envelope::capture(
            BTreeMap::from([
                (roles::VOICE_RECORDING.to_string(), recording.clone()),
                (roles::DEPTH_IMAGE.to_string(), depth.clone()),
            ]),
            Snapshot::default(),
            Origin::UserTriggered,
        );
        f.queue.push(env.clone());

        publisher.measure(&f.ctx).unwrap();
        assert_eq!(f.transport.uploads.lock().unwrap()[0].transcription, "banana peel");
        assert!(!publisher.journal.as_ref().unwrap().contains(&env.uid));
        assert!(!recording.exists());
        assert!(!transcript.exists());
        assert!(!depth.exists());
        assert!(f.ctx.is_set(events::UPLOAD_DONE).unwrap());
    }

    #[test]
    fn files_survive_when_journal_removal_fails() {
        /// Acknowledges every upload after turning the journal path into a
        /// directory, so the following journal rewrite cannot land.
        struct BlocksJournal {
            journal: PathBuf,
        }

        #[async_trait]
        impl Transport for BlocksJournal {
            async fn upload(&self, _files: &BTreeMap<String, PathBuf>, _payload: &ScanPayload) -> UploadOutcome {
                std::fs::remove_file(&self.journal).unwrap();
                std::fs::create_dir(&self.journal).unwrap();
                std::fs::write(self.journal.join("occupied"), b"").unwrap();
                UploadOutcome::Acked { status: 200 }
            }

            async fn heartbeat(&self) -> bool {
                true
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("journal.json");
        let identity = DeviceIdentity {
            device_id: "bin-1".into(),
            commit_id: "deadbeef".into(),
        };
        let queue = EnvelopeQueue::new();
        let transport = Arc::new(BlocksJournal {
            journal: journal_path.clone(),
        });
        let mut publisher =
            AsyncPublisher::new(PublisherConfig::new(&journal_path, identity), queue.clone(), transport);
        let mut builder = SharedRegistry::builder();
        let id = builder.register(&DriverDescriptor::of(&publisher)).unwrap();
        let ctx = DriverContext::new(builder.build(), id);
        publisher.initialize(&ctx).unwrap();

        let image = dir.path().join("color.jpg");
        std::fs::write(&image, b"JPEG").unwrap();
        let env = Envelope::capture(
            BTreeMap::from([(roles::COLOR_IMAGE.to_string(), image.clone())]),
            Snapshot::default(),
            Origin::Scheduled,
        );
        queue.push(env.clone());

        assert!(publisher.measure(&ctx).is_err());
        assert!(image.exists());
        assert!(publisher.journal.as_ref().unwrap().contains(&env.uid));
        assert!(!ctx.is_set(events::UPLOAD_DONE).unwrap());
        assert_eq!(ctx.read(fields::UPLOADS_ACKED).unwrap(), Scalar::Int(0));
    }

    #[test]
    fn kill_is_idempotent() {
        let mut f = fixture(Vec::new());
        f.publisher.initialize(&f.ctx).unwrap();
        f.publisher.kill();
        f.publisher.kill();
        assert!(f.publisher.runtime.is_none());
    }
}
