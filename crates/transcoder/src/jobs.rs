//! Transcode job records.
//!
//! A job converts one source audio file into one output variant. Jobs are
//! persisted through a [`JobStore`](crate::store::JobStore) and move through
//! `Pending -> Running -> {Completed, Failed}`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Codec every variant is encoded to.
pub const OUTPUT_CODEC: &str = "aac";

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker; the encoder is running.
    Running,
    /// Output written and verified.
    Completed,
    /// The job failed; `error_reason` says why.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Named output policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Two-channel downmix for the widest client support.
    Stereo,
    /// Discrete multichannel (5.1) output.
    Spatial,
}

/// Channel count and bitrate bounds implied by a [`Variant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantPolicy {
    pub channels: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
}

impl VariantPolicy {
    /// Clamp a requested bitrate into this policy's bounds.
    pub fn clamp_bitrate(&self, requested_kbps: u32) -> u32 {
        requested_kbps.clamp(self.min_bitrate_kbps, self.max_bitrate_kbps)
    }
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Stereo, Variant::Spatial];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Stereo => "stereo",
            Variant::Spatial => "spatial",
        }
    }

    pub fn policy(&self) -> VariantPolicy {
        match self {
            Variant::Stereo => VariantPolicy {
                channels: 2,
                min_bitrate_kbps: 32,
                max_bitrate_kbps: 192,
            },
            Variant::Spatial => VariantPolicy {
                channels: 6,
                min_bitrate_kbps: 256,
                max_bitrate_kbps: 768,
            },
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stereo" => Ok(Variant::Stereo),
            "spatial" => Ok(Variant::Spatial),
            other => Err(format!("unknown variant: {}", other)),
        }
    }
}

/// A request to transcode one file, as supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub audio_file_id: String,
    pub collection_id: String,
    pub source_path: PathBuf,
    pub source_codec: String,
    pub priority: i32,
    pub variant: Variant,
}

/// A persisted transcode job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeJob {
    /// Unique job identifier (UUID).
    pub id: String,
    /// Source audio file this job converts.
    pub audio_file_id: String,
    /// Book (collection) that owns the audio file.
    pub collection_id: String,
    pub source_path: PathBuf,
    pub source_codec: String,
    /// SHA-256 of the source bytes at admission time.
    pub source_hash: String,
    pub output_codec: String,
    pub variant: Variant,
    pub status: JobStatus,
    /// Higher runs sooner.
    pub priority: i32,
    /// 0-100.
    pub progress: u8,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Manifest path once completed.
    pub output_path: Option<PathBuf>,
    pub output_size_bytes: u64,
    pub error_reason: Option<String>,
}

impl TranscodeJob {
    /// Build a fresh Pending job for `request` with the given source digest.
    pub fn new(request: &TranscodeRequest, source_hash: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            audio_file_id: request.audio_file_id.clone(),
            collection_id: request.collection_id.clone(),
            source_path: request.source_path.clone(),
            source_codec: request.source_codec.clone(),
            source_hash,
            output_codec: OUTPUT_CODEC.to_string(),
            variant: request.variant,
            status: JobStatus::Pending,
            priority: request.priority,
            progress: 0,
            created_at: current_timestamp_ms(),
            started_at: None,
            completed_at: None,
            output_path: None,
            output_size_bytes: 0,
            error_reason: None,
        }
    }

    /// Transition into Running as a freshly claimed job.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.progress = 0;
        self.started_at = Some(current_timestamp_ms());
        self.error_reason = None;
    }

    /// Mark the job completed with its verified output.
    pub fn complete(&mut self, output_path: PathBuf, output_size_bytes: u64) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.output_path = Some(output_path);
        self.output_size_bytes = output_size_bytes;
        self.completed_at = Some(current_timestamp_ms());
    }

    /// Mark the job as failed with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.status = JobStatus::Failed;
        self.error_reason = Some(reason.to_string());
        self.completed_at = Some(current_timestamp_ms());
    }

    /// Return an orphaned Running job to the queue.
    pub fn reset_to_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.started_at = None;
    }

    /// Check if the job is active (pending or running).
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn make_request(audio_file_id: &str, variant: Variant, priority: i32) -> TranscodeRequest {
        TranscodeRequest {
            audio_file_id: audio_file_id.to_string(),
            collection_id: "book-1".to_string(),
            source_path: PathBuf::from(format!("/library/{}.mp3", audio_file_id)),
            source_codec: "mp3".to_string(),
            priority,
            variant,
        }
    }

    #[test]
    fn test_new_job_is_pending() {
        let request = make_request("a", Variant::Stereo, 1);
        let job = TranscodeJob::new(&request, "abc123".to_string());

        assert_eq!(job.id.len(), 36);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 1);
        assert_eq!(job.progress, 0);
        assert_eq!(job.source_hash, "abc123");
        assert_eq!(job.output_codec, "aac");
        assert!(job.created_at > 0);
        assert!(job.started_at.is_none());
        assert!(job.output_path.is_none());
        assert!(job.is_active());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let request = make_request("a", Variant::Spatial, 0);
        let mut job = TranscodeJob::new(&request, String::new());

        job.start();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(job.is_active());

        job.complete(PathBuf::from("/out/playlist.m3u8"), 4096);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.output_size_bytes, 4096);
        assert!(job.completed_at.is_some());
        assert!(!job.is_active());
    }

    #[test]
    fn test_fail_records_reason() {
        let request = make_request("a", Variant::Stereo, 0);
        let mut job = TranscodeJob::new(&request, String::new());
        job.start();
        job.fail("unsupported codec: opus");

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_reason.as_deref(), Some("unsupported codec: opus"));
    }

    #[test]
    fn test_reset_to_pending_clears_run_state() {
        let request = make_request("a", Variant::Stereo, 0);
        let mut job = TranscodeJob::new(&request, String::new());
        job.start();
        job.progress = 40;

        job.reset_to_pending();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_variant_policies() {
        let stereo = Variant::Stereo.policy();
        assert_eq!(stereo.channels, 2);
        assert_eq!(stereo.clamp_bitrate(320), 192);
        assert_eq!(stereo.clamp_bitrate(128), 128);

        let spatial = Variant::Spatial.policy();
        assert_eq!(spatial.channels, 6);
        assert_eq!(spatial.clamp_bitrate(128), 256);
    }

    #[test]
    fn test_variant_parse_and_display() {
        assert_eq!("stereo".parse::<Variant>(), Ok(Variant::Stereo));
        assert_eq!("Spatial".parse::<Variant>(), Ok(Variant::Spatial));
        assert!("mono".parse::<Variant>().is_err());
        assert_eq!(Variant::Spatial.to_string(), "spatial");
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(format!("{}", JobStatus::Pending), "pending");
        assert_eq!(format!("{}", JobStatus::Running), "running");
        assert_eq!(format!("{}", JobStatus::Completed), "completed");
        assert_eq!(format!("{}", JobStatus::Failed), "failed");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_clamped_bitrate_stays_in_bounds(requested in 0u32..10_000, spatial in proptest::bool::ANY) {
            let variant = if spatial { Variant::Spatial } else { Variant::Stereo };
            let policy = variant.policy();
            let kbps = policy.clamp_bitrate(requested);
            prop_assert!(kbps >= policy.min_bitrate_kbps);
            prop_assert!(kbps <= policy.max_bitrate_kbps);
        }
    }
}
