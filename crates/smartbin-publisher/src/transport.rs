//! Upload transport.
//!
//! [`Transport`] is the seam between the publisher state machine and the
//! network.  [`HttpTransport`] sends a multipart request to the scan
//! endpoint: one part per file, named by its logical role, plus a `data`
//! field holding the JSON [`ScanPayload`].  The API key travels in a
//! `token` header.  Connectivity is probed with an unauthenticated `GET`
//! on a separate health path.
//!
//! An upload counts as acknowledged only when the server answers with a
//! 2xx status *and* a JSON body carrying `"status": true`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::Serialize;

use crate::envelope::Envelope;
use crate::secrets::SecretStore;

/// Default scan ingestion path.
pub const DEFAULT_SCAN_PATH: &str = "/api/scan";

/// Default unauthenticated reachability path.
pub const DEFAULT_HEALTH_PATH: &str = "/api/heartbeat";

/// Default upload timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 45;

/// Heartbeats are cheap; give up on them quickly.
const HEARTBEAT_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 2xx with `"status": true`.
    Acked { status: u16 },
    /// The server answered, but not with an acknowledgment.
    Rejected { status: u16, body: String },
    /// No response: DNS, TLS, timeout, missing credentials.
    Unreachable { reason: String },
}

impl UploadOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked { .. })
    }

    /// HTTP status, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Acked { status } | Self::Rejected { status, .. } => Some(*status),
            Self::Unreachable { .. } => None,
        }
    }

    /// Human-readable detail for logs and alerts.
    pub fn detail(&self) -> String {
        match self {
            Self::Acked { status } => format!("acknowledged ({status})"),
            Self::Rejected { status, body } => format!("status {status}: {body}"),
            Self::Unreachable { reason } => reason.clone(),
        }
    }
}

/// Classify a server response.
pub fn interpret_response(status: u16, body: &str) -> UploadOutcome {
    let acknowledged = (200..300).contains(&status)
        && serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("status").and_then(serde_json::Value::as_bool))
            .unwrap_or(false);

    if acknowledged {
        UploadOutcome::Acked { status }
    } else {
        UploadOutcome::Rejected {
            status,
            body: body.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Device identity stamped on every upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub commit_id: String,
}

/// JSON body of the `data` form field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPayload {
    pub uid: String,
    pub device_id: String,
    pub commit_id: String,
    pub captured_at: DateTime<Utc>,
    /// Numeric readings by payload name; `null` when absent.
    #[serde(flatten)]
    pub readings: BTreeMap<String, Option<f64>>,
    pub transcription: String,
    pub user_trigger: bool,
}

impl ScanPayload {
    /// Build the payload of `envelope`.  `readings` maps payload names to
    /// `"Driver.field"` keys looked up in the envelope snapshot.
    pub fn build(
        envelope: &Envelope,
        identity: &DeviceIdentity,
        readings: &BTreeMap<String, String>,
        transcription: String,
    ) -> Self {
        let snapshot = &envelope.data_snapshot;
        let readings = readings
            .iter()
            .map(|(name, key)| (name.clone(), snapshot.value(key).map(|v| v.as_f64()).filter(|f| f.is_finite())))
            .collect();

        Self {
            uid: envelope.uid.to_string(),
            device_id: identity.device_id.clone(),
            commit_id: identity.commit_id.clone(),
            captured_at: snapshot.taken_at,
            readings,
            transcription,
            user_trigger: envelope.origin_trigger.is_user_triggered(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Network side of the publisher.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one sample.  Never fails: every failure is an outcome.
    async fn upload(&self, files: &BTreeMap<String, PathBuf>, payload: &ScanPayload) -> UploadOutcome;

    /// Cheap reachability check.
    async fn heartbeat(&self) -> bool;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Multipart upload over HTTPS via [`reqwest`].
pub struct HttpTransport {
    client: reqwest::Client,
    secrets: Arc<SecretStore>,
    scan_path: String,
    health_path: String,
    timeout: Duration,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("scan_path", &self.scan_path)
            .field("health_path", &self.health_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("smartbin/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            secrets,
            scan_path: DEFAULT_SCAN_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_paths(mut self, scan_path: impl Into<String>, health_path: impl Into<String>) -> Self {
        self.scan_path = scan_path.into();
        self.health_path = health_path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach every readable file under its role.  Missing files are
    /// skipped with a warning.
    async fn build_form(files: &BTreeMap<String, PathBuf>, payload: &ScanPayload) -> Result<Form, String> {
        let mut form = Form::new();
        for (role, path) in files {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(uid = %payload.uid, role = %role, path = %path.display(), "attachment missing, sending without it");
                    continue;
                }
                Err(e) => return Err(format!("cannot read {role} at {}: {e}", path.display())),
            };
            form = form.part(role.clone(), Part::bytes(bytes).file_name(file_name(path)));
        }

        let data = serde_json::to_string(payload).map_err(|e| format!("cannot encode payload: {e}"))?;
        Ok(form.text("data", data))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(&self, files: &BTreeMap<String, PathBuf>, payload: &ScanPayload) -> UploadOutcome {
        let secrets = match self.secrets.current() {
            Ok(secrets) => secrets,
            Err(e) => return UploadOutcome::Unreachable { reason: e.to_string() },
        };
        let url = match secrets.url_for(&self.scan_path) {
            Ok(url) => url,
            Err(e) => return UploadOutcome::Unreachable { reason: e.to_string() },
        };
        let form = match Self::build_form(files, payload).await {
            Ok(form) => form,
            Err(reason) => return UploadOutcome::Unreachable { reason },
        };

        tracing::debug!(uid = %payload.uid, url = %url, files = files.len(), "uploading sample");
        let response = self
            .client
            .post(url)
            .header("token", secrets.api_key)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                interpret_response(status, &body)
            }
            Err(e) if e.is_timeout() => UploadOutcome::Unreachable {
                reason: format!("timeout after {}s", self.timeout.as_secs()),
            },
            Err(e) => UploadOutcome::Unreachable { reason: e.to_string() },
        }
    }

    async fn heartbeat(&self) -> bool {
        let url = match self.secrets.current().and_then(|s| s.url_for(&self.health_path)) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat skipped");
                return false;
            }
        };

        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(HEARTBEAT_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "heartbeat failed");
                false
            }
        }
    }
}
