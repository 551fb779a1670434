//! Transcode service
//!
//! Wires the store, encoder probe, admission, worker pool, recovery, metrics
//! and HTTP surface into one handle the host application talks to.

use crate::admission::{AdmissionController, AdmissionError};
use crate::concurrency::{derive_plan, WorkerPlan};
use crate::config::Config;
use crate::events::{BroadcastSink, EventSink};
use crate::jobs::{TranscodeJob, TranscodeRequest, Variant};
use crate::metrics::{new_shared_metrics, refresh_metrics, SharedMetrics};
use crate::output::{self, OutputError, OutputLayout};
use crate::probe::{EncoderProbe, FfmpegProbe};
use crate::progressive::ProgressiveReader;
use crate::recovery::recover_orphaned_jobs;
use crate::runner::{ProcessRunner, RunnerSettings};
use crate::scheduler::{Scheduler, WorkerPool};
use crate::server::{run_server, AppState, ServerError};
use crate::store::{JobStore, JsonJobStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Admission failed: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("service already started")]
    AlreadyStarted,
}

/// Service state containing all runtime components
pub struct TranscodeService {
    config: Config,
    plan: WorkerPlan,
    store: Arc<dyn JobStore>,
    layout: OutputLayout,
    admission: AdmissionController,
    scheduler: Arc<Scheduler>,
    reader: Arc<ProgressiveReader>,
    metrics: SharedMetrics,
    cancel: CancellationToken,
    pool: Mutex<Option<WorkerPool>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TranscodeService {
    /// Build a service over explicit collaborators.
    ///
    /// # Arguments
    /// * `config` - Loaded configuration
    /// * `store` - Persistent job store
    /// * `probe` - Encoder capability probe
    /// * `events` - Receiver of progress and completion events
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        probe: Arc<dyn EncoderProbe>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let layout = OutputLayout::new(config.storage.output_dir.clone());
        let wake = Arc::new(Notify::new());
        let plan = derive_plan(&config);

        let runner = Arc::new(ProcessRunner::new(
            store.clone(),
            probe.clone(),
            events,
            layout.clone(),
            RunnerSettings::from_config(&config),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            runner,
            wake.clone(),
            Duration::from_secs(config.workers.poll_interval_secs.max(1)),
        ));
        let admission = AdmissionController::new(store.clone(), probe, layout.clone(), wake);
        let reader = Arc::new(ProgressiveReader::new(
            store.clone(),
            layout.clone(),
            config.encoder.segment_duration_secs,
        ));

        Self {
            config,
            plan,
            store,
            layout,
            admission,
            scheduler,
            reader,
            metrics: new_shared_metrics(),
            cancel: CancellationToken::new(),
            pool: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Build a service with the file-backed store, the ffmpeg probe and a
    /// broadcast sink. The sink is returned for subscribing.
    pub fn open(config: Config) -> Result<(Self, BroadcastSink), ServiceError> {
        let store = Arc::new(JsonJobStore::open(config.storage.state_dir.clone())?);
        let probe = Arc::new(FfmpegProbe::new(config.encoder.ffmpeg_path.clone()));
        let sink = BroadcastSink::default();
        let service = Self::new(config, store, probe, Arc::new(sink.clone()));
        Ok((service, sink))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> &WorkerPlan {
        &self.plan
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn reader(&self) -> Arc<ProgressiveReader> {
        self.reader.clone()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Admit a transcode request. See [`AdmissionController::admit`].
    pub async fn admit(&self, request: &TranscodeRequest) -> Result<TranscodeJob, ServiceError> {
        Ok(self.admission.admit(request).await?)
    }

    pub async fn job_for(
        &self,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<Option<TranscodeJob>, ServiceError> {
        Ok(self.store.get_by_key(audio_file_id, variant).await?)
    }

    /// Recover orphaned jobs, then start the worker pool.
    ///
    /// Returns the number of recovered jobs.
    pub async fn start(&self) -> Result<usize, ServiceError> {
        let mut pool = self.pool.lock().await;
        if pool.is_some() || self.cancel.is_cancelled() {
            return Err(ServiceError::AlreadyStarted);
        }

        let recovered = recover_orphaned_jobs(self.store.as_ref()).await?;
        *pool = Some(WorkerPool::start(
            self.scheduler.clone(),
            self.plan.workers,
            self.cancel.clone(),
        ));
        info!(
            workers = self.plan.workers,
            total_cores = self.plan.total_cores,
            recovered,
            "transcode service started"
        );
        Ok(recovered)
    }

    /// Start the metrics update task
    ///
    /// Periodically rebuilds the metrics snapshot from the store.
    pub async fn start_metrics_updater(&self, every: Duration) {
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = refresh_metrics(store.as_ref(), &metrics).await {
                            warn!(error = %e, "failed to refresh metrics");
                        }
                    }
                }
            }
        });
        self.background.lock().await.push(handle);
    }

    /// Start the HTTP server on the configured bind address
    pub async fn start_http_server(&self) {
        let bind = self.config.server.bind.clone();
        let state = AppState {
            metrics: self.metrics.clone(),
            reader: self.reader.clone(),
        };
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = run_server(&bind, state, cancel).await {
                error!(error = %e, %bind, "http server failed");
            }
        });
        self.background.lock().await.push(handle);
    }

    /// Stop claiming work, let running encodes finish, and stop background
    /// tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("transcode service stopped");
    }

    /// Delete every job and all output for an audio file.
    ///
    /// Returns the number of deleted job records. An encode already running
    /// for the file finishes without being recorded.
    pub async fn remove_audio_file(&self, audio_file_id: &str) -> Result<usize, ServiceError> {
        let mut removed = 0;
        for variant in Variant::ALL {
            if let Some(job) = self.store.get_by_key(audio_file_id, variant).await? {
                removed += self.remove_job(&job).await? as usize;
            }
        }
        info!(audio_file_id, removed, "removed audio file transcodes");
        Ok(removed)
    }

    /// Delete every job and all output belonging to a collection.
    pub async fn remove_collection(&self, collection_id: &str) -> Result<usize, ServiceError> {
        let mut removed = 0;
        for job in self.store.list_by_collection(collection_id).await? {
            removed += self.remove_job(&job).await? as usize;
        }
        output::remove_output(&self.layout.collection_dir(collection_id)?).await?;
        info!(collection_id, removed, "removed collection transcodes");
        Ok(removed)
    }

    async fn remove_job(&self, job: &TranscodeJob) -> Result<bool, ServiceError> {
        let existed = self.store.delete(&job.id).await?;
        output::remove_output(&self.layout.dir_for(job)?).await?;
        Ok(existed)
    }
}
