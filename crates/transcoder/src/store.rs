//! Job store adapter.
//!
//! The store is the single source of truth for job state. Every mutation made
//! by workers goes through [`JobStore::update_if`], an atomic
//! read-modify-write that only applies while the job still has the expected
//! status. That conditional update is the only synchronization between
//! workers.
//!
//! [`JsonJobStore`] persists one JSON file per job in a state directory, or
//! keeps records in memory only for tests and embedded use.

use crate::jobs::{JobStatus, TranscodeJob, Variant};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {existing_id} already exists for {audio_file_id}/{variant}")]
    Conflict {
        audio_file_id: String,
        variant: Variant,
        existing_id: String,
    },

    #[error("job store IO error: {0}")]
    Io(#[from] io::Error),

    #[error("job record serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Mutation applied by [`JobStore::update_if`].
pub type JobUpdate<'a> = &'a (dyn Fn(&mut TranscodeJob) + Send + Sync);

/// Access contract for persisted job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with [`StoreError::Conflict`] when a record for
    /// the same (audio file, variant) key already exists.
    async fn create(&self, job: &TranscodeJob) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<TranscodeJob>, StoreError>;

    async fn get_by_key(
        &self,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<Option<TranscodeJob>, StoreError>;

    /// Unconditionally replace a job record.
    async fn update(&self, job: &TranscodeJob) -> Result<(), StoreError>;

    /// Apply `apply` to the job only if its current status is `expected`.
    ///
    /// Returns the updated job, or `None` when the job is missing or its
    /// status no longer matches.
    async fn update_if(
        &self,
        id: &str,
        expected: JobStatus,
        apply: JobUpdate<'_>,
    ) -> Result<Option<TranscodeJob>, StoreError>;

    /// Delete a job record. Returns whether a record existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<TranscodeJob>, StoreError>;

    async fn list_by_collection(&self, collection_id: &str)
        -> Result<Vec<TranscodeJob>, StoreError>;

    async fn list_all(&self) -> Result<Vec<TranscodeJob>, StoreError>;

    /// Pending jobs in claim order.
    async fn list_pending_by_priority(&self) -> Result<Vec<TranscodeJob>, StoreError> {
        let mut jobs = self.list_by_status(JobStatus::Pending).await?;
        sort_by_claim_order(&mut jobs);
        Ok(jobs)
    }
}

/// Priority descending, then creation time ascending (FIFO within a tier).
pub fn sort_by_claim_order(jobs: &mut [TranscodeJob]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// JSON-file backed job store.
#[derive(Debug)]
pub struct JsonJobStore {
    state_dir: Option<PathBuf>,
    jobs: Mutex<HashMap<String, TranscodeJob>>,
}

impl JsonJobStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            state_dir: None,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Open (creating if needed) a state directory and load its records.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        let (kept, dropped) = dedupe_by_key(load_jobs(&state_dir)?);
        for job in dropped {
            warn!(
                job_id = %job.id,
                audio_file_id = %job.audio_file_id,
                variant = %job.variant,
                "dropping duplicate job record"
            );
            if let Err(e) = fs::remove_file(state_dir.join(format!("{}.json", job.id))) {
                warn!(job_id = %job.id, error = %e, "failed to remove duplicate job record");
            }
        }
        let jobs = kept
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect::<HashMap<_, _>>();
        debug!(count = jobs.len(), dir = %state_dir.display(), "loaded job records");

        Ok(Self {
            state_dir: Some(state_dir),
            jobs: Mutex::new(jobs),
        })
    }

    async fn persist(&self, job: &TranscodeJob) -> Result<(), StoreError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(job)?;
        let final_path = dir.join(format!("{}.json", job.id));
        let temp_path = dir.join(format!(".{}.json.tmp", job.id));
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    async fn remove_record(&self, id: &str) -> Result<(), StoreError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        match tokio::fs::remove_file(dir.join(format!("{}.json", id))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn create(&self, job: &TranscodeJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs
            .values()
            .find(|j| j.id == job.id || (j.audio_file_id == job.audio_file_id && j.variant == job.variant))
        {
            return Err(StoreError::Conflict {
                audio_file_id: job.audio_file_id.clone(),
                variant: job.variant,
                existing_id: existing.id.clone(),
            });
        }
        self.persist(job).await?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TranscodeJob>, StoreError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn get_by_key(
        &self,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<Option<TranscodeJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .find(|j| j.audio_file_id == audio_file_id && j.variant == variant)
            .cloned())
    }

    async fn update(&self, job: &TranscodeJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.id) {
            return Err(StoreError::NotFound(job.id.clone()));
        }
        self.persist(job).await?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_if(
        &self,
        id: &str,
        expected: JobStatus,
        apply: JobUpdate<'_>,
    ) -> Result<Option<TranscodeJob>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(current) = jobs.get(id) else {
            return Ok(None);
        };
        if current.status != expected {
            return Ok(None);
        }
        let mut updated = current.clone();
        apply(&mut updated);
        self.persist(&updated).await?;
        jobs.insert(id.to_string(), updated.clone());
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(id) {
            return Ok(false);
        }
        // The file goes first so a failed removal leaves the record visible.
        self.remove_record(id).await?;
        jobs.remove(id);
        Ok(true)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<TranscodeJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_collection(
        &self,
        collection_id: &str,
    ) -> Result<Vec<TranscodeJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| j.collection_id == collection_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<TranscodeJob>, StoreError> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }
}

/// Split loaded records into one per (audio file, variant) key and the rest.
///
/// The most recently created record of a key wins.
fn dedupe_by_key(jobs: Vec<TranscodeJob>) -> (Vec<TranscodeJob>, Vec<TranscodeJob>) {
    let mut by_key: HashMap<(String, Variant), TranscodeJob> = HashMap::new();
    let mut dropped = Vec::new();
    for job in jobs {
        let key = (job.audio_file_id.clone(), job.variant);
        match by_key.remove(&key) {
            Some(current) if (current.created_at, &current.id) >= (job.created_at, &job.id) => {
                dropped.push(job);
                by_key.insert(key, current);
            }
            Some(current) => {
                dropped.push(current);
                by_key.insert(key, job);
            }
            None => {
                by_key.insert(key, job);
            }
        }
    }
    (by_key.into_values().collect(), dropped)
}

/// Loads all jobs from JSON files in the state directory.
///
/// Files that fail to parse are skipped with a warning.
pub fn load_jobs(state_dir: &Path) -> Result<Vec<TranscodeJob>, io::Error> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();

    for entry in fs::read_dir(state_dir)? {
        let path = entry?.path();

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_job_from_file(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable job record");
            }
        }
    }

    Ok(jobs)
}

fn load_job_from_file(path: &Path) -> Result<TranscodeJob, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
