//! Sample envelopes.
//!
//! An [`Envelope`] is one capture cycle: the files it produced, keyed by
//! logical role, plus a snapshot of the whole registry taken at capture
//! time.  Envelopes are immutable once queued; retries resend the exact
//! same envelope under the same uid.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use smartbin_kernel::Snapshot;
use uuid::Uuid;

/// Logical file roles understood by the scan endpoint.
pub mod roles {
    pub const COLOR_IMAGE: &str = "color_image";
    pub const DEPTH_IMAGE: &str = "depth_image";
    pub const THERMAL_IMAGE: &str = "thermal_image";
    pub const TOPOLOGY: &str = "topology";
    pub const VOICE_RECORDING: &str = "voice_recording";

    /// Every known role, in upload order.
    pub const ALL: [&str; 5] = [COLOR_IMAGE, DEPTH_IMAGE, THERMAL_IMAGE, TOPOLOGY, VOICE_RECORDING];
}

/// Unique, time-ordered envelope identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Fresh UUIDv7 identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EnvelopeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What started the capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// The user closed the lid.
    UserTriggered,
    /// The periodic background capture.
    Scheduled,
}

impl Origin {
    pub fn is_user_triggered(self) -> bool {
        matches!(self, Self::UserTriggered)
    }
}

/// One captured sample on its way to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub uid: EnvelopeId,
    pub file_refs: BTreeMap<String, PathBuf>,
    pub data_snapshot: Snapshot,
    pub origin_trigger: Origin,
}

impl Envelope {
    /// Envelope for a new capture cycle.
    pub fn capture(
        file_refs: BTreeMap<String, PathBuf>,
        data_snapshot: Snapshot,
        origin_trigger: Origin,
    ) -> Self {
        Self {
            uid: EnvelopeId::generate(),
            file_refs,
            data_snapshot,
            origin_trigger,
        }
    }

    pub(crate) fn into_parts(self) -> (EnvelopeId, JournalEntry) {
        (
            self.uid,
            JournalEntry {
                file_refs: self.file_refs,
                data_snapshot: self.data_snapshot,
                origin_trigger: self.origin_trigger,
            },
        )
    }

    pub(crate) fn from_parts(uid: EnvelopeId, entry: JournalEntry) -> Self {
        Self {
            uid,
            file_refs: entry.file_refs,
            data_snapshot: entry.data_snapshot,
            origin_trigger: entry.origin_trigger,
        }
    }
}

/// Journal value: an envelope without its uid, which is the map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JournalEntry {
    pub file_refs: BTreeMap<String, PathBuf>,
    pub data_snapshot: Snapshot,
    pub origin_trigger: Origin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_generates_distinct_ids() {
        let a = Envelope::capture(BTreeMap::new(), Snapshot::default(), Origin::Scheduled);
        let b = Envelope::capture(BTreeMap::new(), Snapshot::default(), Origin::Scheduled);
        assert_ne!(a.uid, b.uid);
        assert_eq!(a.uid.as_str().len(), 36);
    }

    #[test]
    fn journal_entry_uses_camel_case() {
        let envelope = Envelope {
            uid: "abc".into(),
            file_refs: BTreeMap::from([(
                roles::COLOR_IMAGE.to_string(),
                PathBuf::from("/data/abc/color.jpg"),
            )]),
            data_snapshot: Snapshot::default(),
            origin_trigger: Origin::UserTriggered,
        };
        let (uid, entry) = envelope.clone().into_parts();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["fileRefs"]["color_image"], "/data/abc/color.jpg");
        assert_eq!(json["originTrigger"], "UserTriggered");
        assert!(json.get("dataSnapshot").is_some());
        assert_eq!(Envelope::from_parts(uid, entry), envelope);
    }
}
