//! Scheduler and worker pool
//!
//! A fixed set of workers pulls Pending jobs from the store in priority
//! order. Claiming is a conditional Pending -> Running transition, so any
//! number of workers can race for the same job and exactly one wins.

use crate::jobs::{JobStatus, TranscodeJob};
use crate::runner::ProcessRunner;
use crate::store::{JobStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    runner: Arc<ProcessRunner>,
    wake: Arc<Notify>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<ProcessRunner>,
        wake: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            wake,
            poll_interval,
        }
    }

    /// Claim the highest-priority Pending job.
    ///
    /// Returns `None` when the queue is empty or another worker won the
    /// claim; losing is not an error.
    pub async fn claim_next(&self) -> Result<Option<TranscodeJob>, StoreError> {
        let Some(candidate) = self.store.list_pending_by_priority().await?.into_iter().next() else {
            return Ok(None);
        };
        let claimed = self
            .store
            .update_if(&candidate.id, JobStatus::Pending, &|j| j.start())
            .await?;
        if claimed.is_none() {
            debug!(job_id = %candidate.id, "job claimed by another worker");
        }
        Ok(claimed)
    }

    /// Claim and run at most one job. Returns whether a job was processed.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<bool, StoreError> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let Some(job) = self.claim_next().await? else {
            return Ok(false);
        };
        // Failures are recorded on the job by the runner.
        if let Err(e) = self.runner.run(&job).await {
            debug!(job_id = %job.id, error = %e, "job finished with failure");
        }
        Ok(true)
    }

    async fn worker_loop(self: Arc<Self>, worker: u32, cancel: CancellationToken) {
        info!(worker, "worker started");
        while !cancel.is_cancelled() {
            // Drain the backlog before sleeping again.
            loop {
                match self.tick(&cancel).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(worker, error = %e, "failed to claim job");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(worker, "worker stopped");
    }
}

/// Running worker tasks.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` workers (at least one) sharing `scheduler`.
    pub fn start(scheduler: Arc<Scheduler>, workers: u32, cancel: CancellationToken) -> Self {
        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|worker| tokio::spawn(scheduler.clone().worker_loop(worker, cancel.clone())))
            .collect();
        info!(workers, "worker pool started");
        Self { cancel, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming new jobs and wait for in-flight encodes to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}
