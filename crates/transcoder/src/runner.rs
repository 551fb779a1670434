//! Process runner
//!
//! Drives one encoder invocation for a Running job: prepares the output
//! directory, tracks progress from the encoder's diagnostic stream, verifies
//! the result and records the terminal state.

use crate::encode::{build_ffmpeg_command, describe_command, HlsEncodeParams};
use crate::events::{EventSink, TranscodeEvent};
use crate::jobs::{JobStatus, TranscodeJob, Variant};
use crate::output::{self, OutputError, OutputLayout};
use crate::probe::EncoderProbe;
use crate::progress::ProgressTracker;
use crate::store::{JobStore, StoreError};
use audiobook_transcode_config::Config;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::ChildStderr;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, error, info, warn};

/// Diagnostic lines kept for failure reasons.
pub const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum RunError {
    /// Permanent: the encoder cannot read the source codec.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("encoder cannot produce {0}")]
    MissingEncoder(String),

    #[error("failed to start encoder: {0}")]
    Spawn(#[source] io::Error),

    #[error("encoder exited with status {status}: {tail}")]
    EncoderExit { status: String, tail: String },

    #[error("encoder finished without a valid manifest at {}", .0.display())]
    InvalidManifest(PathBuf),

    #[error("job {0} is no longer running")]
    NotRunning(String),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("output IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunError {
    /// Whether retrying without a change in decodability is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RunError::UnsupportedCodec(_))
    }
}

/// Encoder settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub ffmpeg_path: PathBuf,
    pub segment_secs: u32,
    pub min_step_percent: u8,
    pub stereo_bitrate_kbps: u32,
    pub spatial_bitrate_kbps: u32,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg_path: config.encoder.ffmpeg_path.clone(),
            segment_secs: config.encoder.segment_duration_secs,
            min_step_percent: config.progress.min_step_percent,
            stereo_bitrate_kbps: config.variants.stereo_bitrate_kbps,
            spatial_bitrate_kbps: config.variants.spatial_bitrate_kbps,
        }
    }

    /// Configured bitrate clamped into the variant's bounds.
    pub fn bitrate_for(&self, variant: Variant) -> u32 {
        let requested = match variant {
            Variant::Stereo => self.stereo_bitrate_kbps,
            Variant::Spatial => self.spatial_bitrate_kbps,
        };
        variant.policy().clamp_bitrate(requested)
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ProcessRunner {
    store: Arc<dyn JobStore>,
    probe: Arc<dyn EncoderProbe>,
    events: Arc<dyn EventSink>,
    layout: OutputLayout,
    settings: RunnerSettings,
}

impl ProcessRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        probe: Arc<dyn EncoderProbe>,
        events: Arc<dyn EventSink>,
        layout: OutputLayout,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            probe,
            events,
            layout,
            settings,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Encode a claimed job and record its terminal state.
    ///
    /// On success the job is Completed and the manifest path is returned.
    /// Every error has already been persisted as Failed and broadcast by the
    /// time it is returned.
    pub async fn run(&self, job: &TranscodeJob) -> Result<PathBuf, RunError> {
        match self.execute(job).await {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                self.record_failure(job, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &TranscodeJob) -> Result<PathBuf, RunError> {
        if !self.probe.can_decode(&job.source_codec).await {
            return Err(RunError::UnsupportedCodec(job.source_codec.clone()));
        }
        if !self.probe.can_encode(&job.output_codec).await {
            return Err(RunError::MissingEncoder(job.output_codec.clone()));
        }

        let output_dir = self.layout.dir_for(job)?;
        output::remove_output(&output_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;
        self.emit_progress(job, 0);

        let params = HlsEncodeParams {
            ffmpeg_path: self.settings.ffmpeg_path.clone(),
            input_path: job.source_path.clone(),
            output_dir: output_dir.clone(),
            source_codec: job.source_codec.clone(),
            variant: job.variant,
            bitrate_kbps: self.settings.bitrate_for(job.variant),
            segment_secs: self.settings.segment_secs,
        };
        let mut cmd = build_ffmpeg_command(&params);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        info!(
            job_id = %job.id,
            audio_file_id = %job.audio_file_id,
            variant = %job.variant,
            "starting encode"
        );
        debug!(job_id = %job.id, command = %describe_command(&cmd), "encoder command");

        let mut child = cmd.spawn().map_err(RunError::Spawn)?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "encoder stderr not captured"))?;

        let tracker = tokio::spawn(track_progress(
            stderr,
            ProgressContext {
                store: self.store.clone(),
                events: self.events.clone(),
                job_id: job.id.clone(),
                audio_file_id: job.audio_file_id.clone(),
                min_step: self.settings.min_step_percent,
            },
        ));

        let status = child.wait().await?;
        let (tail, mut tracker) = match tracker.await {
            Ok(finished) => finished,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "progress task ended abnormally");
                (VecDeque::new(), ProgressTracker::new(self.settings.min_step_percent))
            }
        };

        if !status.success() {
            let status = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(RunError::EncoderExit {
                status,
                tail: Vec::from(tail).join("\n"),
            });
        }

        let manifest = params.manifest_path();
        let (verified, size) = {
            let manifest = manifest.clone();
            let dir = output_dir.clone();
            tokio::task::spawn_blocking(move || {
                (output::verify_manifest(&manifest), output::output_size(&dir))
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        };
        if !verified {
            return Err(RunError::InvalidManifest(manifest));
        }

        let completed = self
            .store
            .update_if(&job.id, JobStatus::Running, &|j| {
                j.complete(manifest.clone(), size)
            })
            .await?;
        if completed.is_none() {
            return Err(RunError::NotRunning(job.id.clone()));
        }

        if let Some(percent) = tracker.finish() {
            self.emit_progress(job, percent);
        }
        self.events.emit(TranscodeEvent::Completed {
            job_id: job.id.clone(),
            audio_file_id: job.audio_file_id.clone(),
        });
        info!(
            job_id = %job.id,
            output_size_bytes = size,
            "encode completed"
        );
        Ok(manifest)
    }

    async fn record_failure(&self, job: &TranscodeJob, err: &RunError) {
        let reason = err.to_string();
        if err.is_permanent() {
            warn!(job_id = %job.id, %reason, "job failed permanently");
        } else {
            error!(job_id = %job.id, %reason, "job failed");
        }

        if matches!(err, RunError::NotRunning(_)) {
            return;
        }

        match self
            .store
            .update_if(&job.id, JobStatus::Running, &|j| j.fail(&reason))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(job_id = %job.id, "job left Running before failure was recorded"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to persist job failure"),
        }

        self.events.emit(TranscodeEvent::Failed {
            job_id: job.id.clone(),
            audio_file_id: job.audio_file_id.clone(),
            reason,
        });
    }

    fn emit_progress(&self, job: &TranscodeJob, percent: u8) {
        self.events.emit(TranscodeEvent::Progress {
            job_id: job.id.clone(),
            audio_file_id: job.audio_file_id.clone(),
            percent,
        });
    }
}

struct ProgressContext {
    store: Arc<dyn JobStore>,
    events: Arc<dyn EventSink>,
    job_id: String,
    audio_file_id: String,
    min_step: u8,
}

/// Consume the encoder's stderr until it closes.
///
/// Stats lines end in `\r`, ordinary log lines in `\n`. Returns the last
/// [`STDERR_TAIL_LINES`] non-empty lines and the tracker state.
async fn track_progress(
    stderr: ChildStderr,
    ctx: ProgressContext,
) -> (VecDeque<String>, ProgressTracker) {
    let codec = AnyDelimiterCodec::new(b"\r\n".to_vec(), Vec::new());
    let mut frames = FramedRead::new(stderr, codec);
    let mut tracker = ProgressTracker::new(ctx.min_step);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(job_id = %ctx.job_id, error = %e, "stopped reading encoder output");
                break;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());

        let Some(percent) = tracker.observe_line(line) else {
            continue;
        };
        match ctx
            .store
            .update_if(&ctx.job_id, JobStatus::Running, &|j| {
                j.progress = j.progress.max(percent)
            })
            .await
        {
            Ok(Some(_)) => ctx.events.emit(TranscodeEvent::Progress {
                job_id: ctx.job_id.clone(),
                audio_file_id: ctx.audio_file_id.clone(),
                percent,
            }),
            Ok(None) => debug!(job_id = %ctx.job_id, "progress for job no longer running"),
            Err(e) => warn!(job_id = %ctx.job_id, error = %e, "failed to persist progress"),
        }
    }
    (tail, tracker)
}
