//! Job admission
//!
//! Decides, for each transcode request, whether existing work can be reused,
//! must be rebuilt, or needs a new job. Content fingerprints make cached
//! output self-invalidating when a source file changes in place.

use crate::fingerprint::{fingerprint, FingerprintError};
use crate::jobs::{JobStatus, TranscodeJob, TranscodeRequest, Variant};
use crate::output::{self, OutputError, OutputLayout};
use crate::probe::EncoderProbe;
use crate::store::{JobStore, StoreError};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("failed to remove stale output: {0}")]
    Io(#[from] io::Error),

    #[error("job for {audio_file_id}/{variant} kept changing during admission")]
    Contended {
        audio_file_id: String,
        variant: Variant,
    },
}

enum Resolution {
    /// Hand back this job as the admission result.
    Keep(TranscodeJob),
    /// The old record is gone; create a fresh job with this fingerprint.
    Replace(String),
}

pub struct AdmissionController {
    store: Arc<dyn JobStore>,
    probe: Arc<dyn EncoderProbe>,
    layout: OutputLayout,
    wake: Arc<Notify>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn JobStore>,
        probe: Arc<dyn EncoderProbe>,
        layout: OutputLayout,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            probe,
            layout,
            wake,
        }
    }

    /// Admit a transcode request, returning the job that serves it.
    ///
    /// # Arguments
    /// * `request` - Source descriptor, target variant and priority
    ///
    /// # Errors
    /// Fingerprint failures are returned as-is and never treated as
    /// "unchanged". Store and output cleanup errors also propagate.
    pub async fn admit(&self, request: &TranscodeRequest) -> Result<TranscodeJob, AdmissionError> {
        // A lost creation race is decided again against the winner, once.
        for attempt in 0..2 {
            let existing = self
                .store
                .get_by_key(&request.audio_file_id, request.variant)
                .await?;

            let source_hash = match existing {
                None => fingerprint(&request.source_path).await?,
                Some(job) => match self.resolve_existing(request, job).await? {
                    Resolution::Keep(job) => return Ok(job),
                    Resolution::Replace(hash) => hash,
                },
            };

            let job = TranscodeJob::new(request, source_hash);
            match self.store.create(&job).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        audio_file_id = %job.audio_file_id,
                        variant = %job.variant,
                        priority = job.priority,
                        "admitted transcode job"
                    );
                    self.wake.notify_one();
                    return Ok(job);
                }
                Err(StoreError::Conflict { existing_id, .. }) if attempt == 0 => {
                    debug!(
                        audio_file_id = %request.audio_file_id,
                        %existing_id,
                        "lost job creation race, re-reading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AdmissionError::Contended {
            audio_file_id: request.audio_file_id.clone(),
            variant: request.variant,
        })
    }

    async fn resolve_existing(
        &self,
        request: &TranscodeRequest,
        job: TranscodeJob,
    ) -> Result<Resolution, AdmissionError> {
        match job.status {
            JobStatus::Completed => {
                let hash = fingerprint(&request.source_path).await?;
                let manifest = self.layout.manifest_path(&job)?;
                let verified = tokio::task::spawn_blocking(move || output::verify_manifest(&manifest))
                    .await
                    .unwrap_or(false);

                if verified && hash == job.source_hash {
                    debug!(job_id = %job.id, "serving cached output");
                    return Ok(Resolution::Keep(job));
                }
                info!(
                    job_id = %job.id,
                    content_changed = hash != job.source_hash,
                    manifest_valid = verified,
                    "completed output is stale, rebuilding"
                );
                self.discard(&job).await?;
                Ok(Resolution::Replace(hash))
            }
            JobStatus::Pending | JobStatus::Running => {
                Ok(Resolution::Keep(self.raise_priority(job, request.priority).await?))
            }
            JobStatus::Failed => {
                let hash = fingerprint(&request.source_path).await?;
                if self.probe.can_decode(&request.source_codec).await {
                    info!(job_id = %job.id, "retrying failed job");
                } else if hash == job.source_hash {
                    debug!(
                        job_id = %job.id,
                        reason = job.error_reason.as_deref().unwrap_or(""),
                        "source unchanged and still undecodable"
                    );
                    return Ok(Resolution::Keep(job));
                } else {
                    info!(job_id = %job.id, "source changed since failure, rebuilding");
                }
                self.discard(&job).await?;
                Ok(Resolution::Replace(hash))
            }
        }
    }

    /// Raise a queued or running job's priority, never lowering it.
    async fn raise_priority(
        &self,
        mut current: TranscodeJob,
        priority: i32,
    ) -> Result<TranscodeJob, AdmissionError> {
        loop {
            if priority <= current.priority {
                return Ok(current);
            }
            let bumped = self
                .store
                .update_if(&current.id, current.status, &|j| {
                    j.priority = j.priority.max(priority)
                })
                .await?;
            if let Some(job) = bumped {
                info!(job_id = %job.id, priority = job.priority, "raised job priority");
                return Ok(job);
            }

            // Status moved under us; retry against the fresh record while it
            // is still active.
            match self.store.get(&current.id).await? {
                Some(latest) if latest.is_active() => current = latest,
                Some(latest) => return Ok(latest),
                None => return Ok(current),
            }
        }
    }

    /// Delete a stale record and its output.
    ///
    /// Output is only removed by the caller that actually deleted the record;
    /// otherwise the directory may already belong to a replacement job.
    async fn discard(&self, job: &TranscodeJob) -> Result<(), AdmissionError> {
        if self.store.delete(&job.id).await? {
            output::remove_output(&self.layout.dir_for(job)?).await?;
        } else {
            debug!(job_id = %job.id, "stale job already replaced, keeping output");
        }
        Ok(())
    }
}
