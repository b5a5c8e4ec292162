//! Crash-durable envelope journal.
//!
//! The journal is a single JSON object on disk mapping
//! `uid -> {fileRefs, dataSnapshot, originTrigger}`.  It is rewritten in full
//! after every change through a temporary file that is atomically renamed
//! over the old one, so a power cut leaves either the previous or the new
//! journal, never a torn one.
//!
//! Only the publisher writes the journal.  Content that fails to parse is
//! logged and replaced with an empty map; a single unreadable entry is
//! dropped on its own.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::envelope::{Envelope, EnvelopeId, JournalEntry};
use crate::error::{PublishError, Result};

/// In-memory mirror of the on-disk journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    entries: BTreeMap<EnvelopeId, JournalEntry>,
}

impl Journal {
    /// Load the journal at `path`.  A missing file is an empty journal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    entries: BTreeMap::new(),
                });
            }
            Err(source) => return Err(PublishError::Journal { path, source }),
        };

        let mut journal = Self {
            path,
            entries: BTreeMap::new(),
        };
        let raw_entries = match serde_json::from_str::<BTreeMap<EnvelopeId, serde_json::Value>>(&raw) {
            Ok(raw_entries) => raw_entries,
            Err(e) => {
                tracing::error!(
                    path = %journal.path.display(),
                    error = %e,
                    "journal is corrupt, starting empty"
                );
                journal.persist()?;
                return Ok(journal);
            }
        };

        let mut dropped = 0usize;
        for (uid, value) in raw_entries {
            match serde_json::from_value::<JournalEntry>(value) {
                Ok(entry) => {
                    journal.entries.insert(uid, entry);
                }
                Err(e) => {
                    dropped += 1;
                    tracing::error!(
                        path = %journal.path.display(),
                        uid = %uid,
                        error = %e,
                        "unreadable journal entry dropped"
                    );
                }
            }
        }
        if dropped > 0 {
            journal.persist()?;
        }
        tracing::info!(
            path = %journal.path.display(),
            pending = journal.entries.len(),
            dropped,
            "journal loaded"
        );
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uid: &EnvelopeId) -> bool {
        self.entries.contains_key(uid)
    }

    /// Every journaled envelope, oldest uid first.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.entries
            .iter()
            .map(|(uid, entry)| Envelope::from_parts(uid.clone(), entry.clone()))
            .collect()
    }

    /// Insert or replace `envelope` and flush to disk.
    pub fn record(&mut self, envelope: &Envelope) -> Result<()> {
        let (uid, entry) = envelope.clone().into_parts();
        let previous = self.entries.insert(uid.clone(), entry);
        if let Err(e) = self.persist() {
            match previous {
                Some(previous) => self.entries.insert(uid, previous),
                None => self.entries.remove(&uid),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Drop `uid` and flush to disk.  Returns whether it was present.  The
    /// entry stays when the flush fails.
    pub fn remove(&mut self, uid: &EnvelopeId) -> Result<bool> {
        let Some(entry) = self.entries.remove(uid) else {
            return Ok(false);
        };
        if let Err(e) = self.persist() {
            self.entries.insert(uid.clone(), entry);
            return Err(e);
        }
        Ok(true)
    }

    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let io_err = |source| PublishError::Journal {
            path: self.path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        serde_json::to_writer(&mut tmp, &self.entries)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::trace!(path = %self.path.display(), entries = self.entries.len(), "journal flushed");
        Ok(())
    }
}
