//! Pre-upload enrichment.
//!
//! User-triggered samples carry a voice recording; an [`Enricher`] turns it
//! into the text sent in the payload's `transcription` field.  Scheduled
//! samples are never enriched.

use std::path::PathBuf;

use crate::envelope::{Envelope, roles};
use crate::error::{PublishError, Result};

/// Produces the transcription text for a user-triggered envelope.
///
/// Runs on the publisher's worker thread and may block.
pub trait Enricher: Send {
    fn enrich(&mut self, envelope: &Envelope) -> Result<String>;

    /// Files the enricher reads that belong to `envelope` without being
    /// among its `file_refs`.  They are deleted once the upload is
    /// acknowledged.
    fn derived_files(&self, _envelope: &Envelope) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Sends an empty transcription.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

impl Enricher for NoEnrichment {
    fn enrich(&mut self, _envelope: &Envelope) -> Result<String> {
        Ok(String::new())
    }
}

/// Reads a transcript written next to the voice recording by an external
/// speech-to-text step (`clip.wav` -> `clip.txt`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarTranscript;

impl SidecarTranscript {
    fn transcript_path(envelope: &Envelope) -> Option<PathBuf> {
        envelope
            .file_refs
            .get(roles::VOICE_RECORDING)
            .map(|recording| recording.with_extension("txt"))
    }
}

impl Enricher for SidecarTranscript {
    fn enrich(&mut self, envelope: &Envelope) -> Result<String> {
        let Some(path) = Self::transcript_path(envelope) else {
            return Ok(String::new());
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(PublishError::Enrichment {
                reason: format!("cannot read {}: {e}", path.display()),
            }),
        }
    }

    fn derived_files(&self, envelope: &Envelope) -> Vec<PathBuf> {
        Self::transcript_path(envelope).into_iter().collect()
    }
}
