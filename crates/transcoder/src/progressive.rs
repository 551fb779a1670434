//! Progressive output reader.
//!
//! Lets playback start before a job finishes by serving whatever segments
//! the encoder has produced so far.

use crate::jobs::{JobStatus, TranscodeJob, Variant};
use crate::output::{self, OutputError, OutputLayout, SegmentEntry};
use crate::store::{JobStore, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProgressiveError {
    #[error("no playable output yet for {audio_file_id}/{variant}")]
    NotReady {
        audio_file_id: String,
        variant: Variant,
    },

    #[error("not a segment name: {0:?}")]
    InvalidSegment(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("failed to list segments: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ProgressiveReader {
    store: Arc<dyn JobStore>,
    layout: OutputLayout,
    segment_secs: u32,
}

impl ProgressiveReader {
    pub fn new(store: Arc<dyn JobStore>, layout: OutputLayout, segment_secs: u32) -> Self {
        Self {
            store,
            layout,
            segment_secs,
        }
    }

    /// Manifest location for a job that already has at least one segment.
    ///
    /// Running jobs qualify; completion is not required.
    pub async fn ready_path(
        &self,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<PathBuf, ProgressiveError> {
        let (_, dir, _) = self.playable(audio_file_id, variant).await?;
        Ok(dir.join(output::MANIFEST_FILE))
    }

    /// Playlist listing the segments available right now.
    ///
    /// The end marker is present only once the job is Completed.
    pub async fn build_manifest(
        &self,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<String, ProgressiveError> {
        let (job, dir, segments) = self.playable(audio_file_id, variant).await?;
        let complete = job.status == JobStatus::Completed;

        // Finished output carries real per-segment durations in the encoder's
        // playlist; the final segment is usually shorter.
        let mut durations = HashMap::new();
        if complete {
            let manifest = dir.join(output::MANIFEST_FILE);
            match tokio::fs::read_to_string(&manifest).await {
                Ok(content) => durations = output::parse_segment_durations(&content),
                Err(e) => {
                    warn!(path = %manifest.display(), error = %e, "encoder playlist unreadable")
                }
            }
        }

        let entries: Vec<SegmentEntry> = segments
            .into_iter()
            .map(|name| SegmentEntry {
                duration_secs: durations
                    .get(&name)
                    .copied()
                    .unwrap_or(f64::from(self.segment_secs)),
                name,
            })
            .collect();
        Ok(output::synthesize_manifest(&entries, self.segment_secs, complete))
    }

    /// Resolve a segment file of a playable job.
    pub async fn segment_path(
        &self,
        audio_file_id: &str,
        variant: Variant,
        segment: &str,
    ) -> Result<PathBuf, ProgressiveError> {
        if !output::is_segment_name(segment) {
            return Err(ProgressiveError::InvalidSegment(segment.to_string()));
        }
        let (_, dir, segments) = self.playable(audio_file_id, variant).await?;
        if segments.iter().any(|s| s == segment) {
            Ok(dir.join(segment))
        } else {
            Err(self.not_ready(audio_file_id, variant))
        }
    }

    async fn playable(
        &self,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<(TranscodeJob, PathBuf, Vec<String>), ProgressiveError> {
        // The status is read before listing: a job that completes mid-listing
        // is reported as in progress, never as finished with missing segments.
        let job = self
            .store
            .get_by_key(audio_file_id, variant)
            .await?
            .filter(|job| matches!(job.status, JobStatus::Running | JobStatus::Completed))
            .ok_or_else(|| self.not_ready(audio_file_id, variant))?;

        let dir = self.layout.dir_for(&job)?;
        let listing_dir = dir.clone();
        let segments = tokio::task::spawn_blocking(move || output::list_segments(&listing_dir))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        if segments.is_empty() {
            return Err(self.not_ready(audio_file_id, variant));
        }
        Ok((job, dir, segments))
    }

    fn not_ready(&self, audio_file_id: &str, variant: Variant) -> ProgressiveError {
        ProgressiveError::NotReady {
            audio_file_id: audio_file_id.to_string(),
            variant,
        }
    }
}
