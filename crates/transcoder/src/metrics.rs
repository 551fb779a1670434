//! Metrics module
//!
//! Job and system metrics snapshots with JSON serialization support,
//! rebuilt periodically from the job store.

use crate::jobs::{current_timestamp_ms, JobStatus, TranscodeJob, Variant};
use crate::store::{JobStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub audio_file_id: String,
    pub collection_id: String,
    pub variant: Variant,
    pub status: JobStatus,
    pub priority: i32,
    pub progress: u8,
    pub output_size_bytes: u64,
    pub error_reason: Option<String>,
}

impl From<&TranscodeJob> for JobMetrics {
    fn from(job: &TranscodeJob) -> Self {
        Self {
            id: job.id.clone(),
            audio_file_id: job.audio_file_id.clone(),
            collection_id: job.collection_id.clone(),
            variant: job.variant,
            status: job.status,
            priority: job.priority,
            progress: job.progress,
            output_size_bytes: job.output_size_bytes,
            error_reason: job.error_reason.clone(),
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Pending and Running jobs; terminal jobs only appear in the counts.
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub total_output_bytes: u64,
}

impl MetricsSnapshot {
    /// Aggregate a snapshot from job records.
    pub fn from_jobs(jobs: &[TranscodeJob], system: SystemMetrics) -> Self {
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();

        let mut active: Vec<JobMetrics> = jobs
            .iter()
            .filter(|j| j.is_active())
            .map(JobMetrics::from)
            .collect();
        active.sort_by(|a, b| {
            (b.status == JobStatus::Running)
                .cmp(&(a.status == JobStatus::Running))
                .then(b.priority.cmp(&a.priority))
                .then_with(|| a.id.cmp(&b.id))
        });

        Self {
            timestamp_unix_ms: current_timestamp_ms(),
            jobs: active,
            system,
            pending_jobs: count(JobStatus::Pending),
            running_jobs: count(JobStatus::Running),
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            total_output_bytes: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .map(|j| j.output_size_bytes)
                .sum(),
        }
    }
}

/// Shared metrics state for concurrent access across service components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Rebuild the shared snapshot from the store and current system state.
pub async fn refresh_metrics(store: &dyn JobStore, metrics: &SharedMetrics) -> Result<(), StoreError> {
    let jobs = store.list_all().await?;
    let system = tokio::task::spawn_blocking(collect_system_metrics)
        .await
        .unwrap_or_default();
    let snapshot = MetricsSnapshot::from_jobs(&jobs, system);
    *metrics.write().await = snapshot;
    Ok(())
}
