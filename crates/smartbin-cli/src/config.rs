//! Device configuration.
//!
//! Reads `config/device.toml` (or the path given with `--config`).  Every key
//! is optional; a missing file yields the defaults below.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use smartbin_kernel::{SupervisorConfig, WorkerConfig};
use smartbin_publisher::transport::{DEFAULT_HEALTH_PATH, DEFAULT_SCAN_PATH};
use smartbin_publisher::{DeviceIdentity, PublisherConfig, default_readings};

pub const DEFAULT_CONFIG_PATH: &str = "config/device.toml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub startup_timeout_secs: u64,
    pub init_poll_millis: u64,
    pub stop_grace_secs: u64,
    /// Period of the supervisor loop that fires callbacks and triggers.
    pub event_tick_millis: u64,
    pub hung_factor: u32,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 25,
            init_poll_millis: 100,
            stop_grace_secs: 5,
            event_tick_millis: 10,
            hung_factor: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub poll_interval_millis: u64,
    pub offline_backoff_millis: u64,
    pub scan_path: String,
    pub health_path: String,
    pub request_timeout_secs: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            poll_interval_millis: 200,
            offline_backoff_millis: 1000,
            scan_path: DEFAULT_SCAN_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            request_timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Interval between two scheduled samples.
    pub scheduled_interval_secs: u64,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            scheduled_interval_secs: 2 * 60 * 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Device configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    /// Directory captured files are written to.
    pub data_dir: PathBuf,
    pub journal_path: PathBuf,
    pub secrets_path: PathBuf,
    /// Checkout of the device firmware, used to resolve the commit id.
    pub firmware_dir: PathBuf,
    pub supervisor: SupervisorSection,
    pub publisher: PublisherSection,
    pub capture: CaptureSection,
    /// Payload reading name -> `"Driver.field"` registry key.
    pub readings: BTreeMap<String, String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "smartbin-dev".to_string(),
            data_dir: PathBuf::from("data"),
            journal_path: PathBuf::from("data/journal.json"),
            secrets_path: PathBuf::from("config/secrets.json"),
            firmware_dir: PathBuf::from("/firmware"),
            supervisor: SupervisorSection::default(),
            publisher: PublisherSection::default(),
            capture: CaptureSection::default(),
            readings: default_readings(),
        }
    }
}

impl DeviceConfig {
    /// Load the configuration at `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn event_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor.event_tick_millis.max(1))
    }

    pub fn scheduled_interval(&self) -> Duration {
        Duration::from_secs(self.capture.scheduled_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.publisher.request_timeout_secs)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let s = &self.supervisor;
        SupervisorConfig {
            startup_timeout: Duration::from_secs(s.startup_timeout_secs),
            init_poll: Duration::from_millis(s.init_poll_millis.max(1)),
            worker: WorkerConfig {
                min_tick: self.event_tick(),
                stop_grace: Duration::from_secs(s.stop_grace_secs),
                hung_factor: s.hung_factor.max(1),
                ..WorkerConfig::default()
            },
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            commit_id: commit_id(&self.firmware_dir),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            poll_interval: Duration::from_millis(self.publisher.poll_interval_millis.max(1)),
            offline_backoff: Duration::from_millis(self.publisher.offline_backoff_millis),
            readings: self.readings.clone(),
            ..PublisherConfig::new(&self.journal_path, self.identity())
        }
    }
}

// ---------------------------------------------------------------------------
// Build identity
// ---------------------------------------------------------------------------

/// Commit the firmware checkout is on.
///
/// Follows `ref:` lines in `.git/HEAD`; a detached HEAD is used as is.  Falls
/// back to the crate version when the checkout cannot be read.
pub fn commit_id(firmware_dir: &Path) -> String {
    resolve_head(&firmware_dir.join(".git"))
        .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
}

fn resolve_head(git_dir: &Path) -> Option<String> {
    let head = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();
    let commit = match head.strip_prefix("ref:") {
        Some(reference) => {
            let reference = reference.trim();
            let loose = std::fs::read_to_string(git_dir.join(reference)).ok();
            match loose {
                Some(commit) => commit.trim().to_string(),
                None => packed_ref(git_dir, reference)?,
            }
        }
        None => head.to_string(),
    };
    (!commit.is_empty()).then_some(commit)
}

/// Look `reference` up in `packed-refs` after `git gc` removed the loose file.
fn packed_ref(git_dir: &Path, reference: &str) -> Option<String> {
    let packed = std::fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed.lines().find_map(|line| {
        let (commit, name) = line.split_once(' ')?;
        (name.trim() == reference).then(|| commit.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert_eq!(config.supervisor.startup_timeout_secs, 25);
        assert_eq!(config.capture.scheduled_interval_secs, 7200);
        assert_eq!(config.readings["weight"], "NAU7802.weight");
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let config = DeviceConfig::parse(
            r#"
            device_id = "bin-42"

            [publisher]
            scan_path = "/v2/scan"

            [readings]
            weight = "SimScale.weight"
            "#,
        )
        .unwrap();
        assert_eq!(config.device_id, "bin-42");
        assert_eq!(config.publisher.scan_path, "/v2/scan");
        assert_eq!(config.publisher.poll_interval_millis, 200);
        assert_eq!(config.supervisor, SupervisorSection::default());
        assert_eq!(config.readings.len(), 1);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        std::fs::write(&path, "device_id = [").unwrap();
        assert!(DeviceConfig::load(&path).is_err());
    }

    #[test]
    fn durations_come_from_sections() {
        let config = DeviceConfig::default();
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.startup_timeout, Duration::from_secs(25));
        assert_eq!(supervisor.worker.min_tick, Duration::from_millis(10));
        assert_eq!(supervisor.worker.stop_grace, Duration::from_secs(5));

        let publisher = config.publisher_config();
        assert_eq!(publisher.offline_backoff, Duration::from_secs(1));
        assert_eq!(publisher.journal_path, PathBuf::from("data/journal.json"));
    }

    #[test]
    fn commit_id_follows_ref() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(git.join("refs/heads/main"), "4f2a9c1\n").unwrap();
        assert_eq!(commit_id(dir.path()), "4f2a9c1");
    }

    #[test]
    fn commit_id_reads_packed_refs_and_detached_head() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        std::fs::create_dir_all(&git).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/release\n").unwrap();
        std::fs::write(
            git.join("packed-refs"),
            "# pack-refs with: peeled\nabc123 refs/heads/release\n",
        )
        .unwrap();
        assert_eq!(commit_id(dir.path()), "abc123");

        std::fs::write(git.join("HEAD"), "deadbeef\n").unwrap();
        assert_eq!(commit_id(dir.path()), "deadbeef");
    }

    #[test]
    fn commit_id_falls_back_to_version() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(commit_id(dir.path()), format!("v{}", env!("CARGO_PKG_VERSION")));
    }
}
