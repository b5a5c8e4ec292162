//! Reloadable secret store.
//!
//! Credentials live in a small JSON file next to the device configuration:
//!
//! ```json
//! {
//!   "api_key": "...",
//!   "endpoint": "https://scans.example.org",
//!   "port": 8443,
//!   "alert": {
//!     "smtp_host": "smtp.example.org",
//!     "username": "bin-17@example.org",
//!     "password": "...",
//!     "recipients": ["ops@example.org"]
//!   }
//! }
//! ```
//!
//! [`SecretStore::current`] re-reads the file whenever its modification time
//! changes, so credentials can be rotated on a running device.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::Deserialize;
use url::Url;

use crate::error::{PublishError, Result};

const DEFAULT_SMTP_PORT: u16 = 465;

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

/// Upload credentials and endpoint.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Secrets {
    pub api_key: String,
    pub endpoint: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub alert: Option<AlertSecrets>,
}

/// SMTP credentials for operator alerts.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AlertSecrets {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub recipients: Vec<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("alert", &self.alert)
            .finish()
    }
}

impl std::fmt::Debug for AlertSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSecrets")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("recipients", &self.recipients)
            .finish()
    }
}

impl Secrets {
    /// Endpoint with the configured port applied.
    pub fn base_url(&self) -> Result<Url> {
        let invalid = |reason: String| PublishError::InvalidEndpoint {
            url: self.endpoint.clone(),
            reason,
        };
        let mut url = Url::parse(&self.endpoint).map_err(|e| invalid(e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(invalid("not a base URL".into()));
        }
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|()| invalid(format!("cannot apply port {port}")))?;
        }
        Ok(url)
    }

    /// `path` resolved against [`Secrets::base_url`].
    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.base_url()?
            .join(path)
            .map_err(|e| PublishError::InvalidEndpoint {
                url: format!("{}{path}", self.endpoint),
                reason: e.to_string(),
            })
    }
}

struct Cached {
    modified: SystemTime,
    secrets: Secrets,
}

/// JSON secret file, reloaded on change.
pub struct SecretStore {
    path: PathBuf,
    cache: RwLock<Option<Cached>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SecretStore {
    /// Store backed by `path`.  Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: impl Into<String>) -> PublishError {
        PublishError::Secrets {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Current secrets, re-read if the file changed since the last call.
    pub fn current(&self) -> Result<Secrets> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| self.error(e.to_string()))?;

        {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = cache.as_ref().filter(|c| c.modified == modified) {
                return Ok(cached.secrets.clone());
            }
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|e| self.error(e.to_string()))?;
        let secrets: Secrets =
            serde_json::from_str(&raw).map_err(|e| self.error(format!("invalid JSON: {e}")))?;
        tracing::info!(path = %self.path.display(), "secrets loaded");

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = Some(Cached {
            modified,
            secrets: secrets.clone(),
        });
        Ok(secrets)
    }
}
