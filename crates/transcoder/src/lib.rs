//! Audiobook Transcoder
//!
//! Durable queue of HLS transcode jobs for an audiobook server: admission with
//! source fingerprinting, a priority-ordered worker pool driving ffmpeg,
//! crash recovery, progressive playback of in-flight output, and metrics.

pub mod admission;
pub mod concurrency;
pub mod encode;
pub mod events;
pub mod fingerprint;
pub mod jobs;
pub mod metrics;
pub mod output;
pub mod probe;
pub mod progress;
pub mod progressive;
pub mod recovery;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod startup;
pub mod store;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, AdmissionError};
pub use audiobook_transcode_config as config;
pub use audiobook_transcode_config::Config;
pub use concurrency::{derive_plan, WorkerPlan};
pub use events::{BroadcastSink, EventSink, TranscodeEvent};
pub use jobs::{JobStatus, TranscodeJob, TranscodeRequest, Variant, VariantPolicy};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use output::OutputLayout;
pub use probe::{EncoderProbe, FfmpegProbe};
pub use progressive::{ProgressiveError, ProgressiveReader};
pub use runner::{ProcessRunner, RunError, RunnerSettings};
pub use scheduler::{Scheduler, WorkerPool};
pub use server::{create_router, run_server, AppState, ServerError};
pub use service::{ServiceError, TranscodeService};
pub use startup::{run_startup_checks, StartupError};
pub use store::{JobStore, JsonJobStore, StoreError};
