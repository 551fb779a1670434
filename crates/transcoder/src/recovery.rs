//! Startup recovery of orphaned jobs.

use crate::jobs::JobStatus;
use crate::store::{JobStore, StoreError};
use tracing::{info, warn};

/// Return every Running job to Pending.
///
/// Must run before any worker starts: at that point nothing can be encoding,
/// so a Running record was left behind by a crash or restart. Progress and
/// `started_at` are cleared; the runner clears partial output when the job
/// is claimed again, so progress restarts from 0.
pub async fn recover_orphaned_jobs(store: &dyn JobStore) -> Result<usize, StoreError> {
    let running = store.list_by_status(JobStatus::Running).await?;
    let mut recovered = 0;

    for job in running {
        match store
            .update_if(&job.id, JobStatus::Running, &|j| j.reset_to_pending())
            .await?
        {
            Some(_) => {
                info!(job_id = %job.id, audio_file_id = %job.audio_file_id, "recovered orphaned job");
                recovered += 1;
            }
            None => warn!(job_id = %job.id, "job left Running during recovery"),
        }
    }

    if recovered > 0 {
        info!(recovered, "startup recovery complete");
    }
    Ok(recovered)
}
