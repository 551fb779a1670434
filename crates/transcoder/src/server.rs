//! HTTP server
//!
//! Exposes the metrics snapshot and progressive HLS playback:
//! - `GET /metrics`
//! - `GET /stream/{audio_file_id}/{variant}/playlist.m3u8`
//! - `GET /stream/{audio_file_id}/{variant}/{segment}`

use crate::jobs::Variant;
use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::output::{OutputError, MANIFEST_FILE};
use crate::progressive::{ProgressiveError, ProgressiveReader};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub metrics: SharedMetrics,
    pub reader: Arc<ProgressiveReader>,
}

struct ApiError(StatusCode, String);

impl From<ProgressiveError> for ApiError {
    fn from(err: ProgressiveError) -> Self {
        let status = match &err {
            ProgressiveError::NotReady { .. } => StatusCode::NOT_FOUND,
            ProgressiveError::InvalidSegment(_)
            | ProgressiveError::Output(OutputError::InvalidComponent(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %err, "stream request failed");
        }
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let snapshot = state.metrics.read().await.clone();
    Json(snapshot)
}

/// Handler for playlist and segment requests under /stream
async fn get_stream_file(
    State(state): State<AppState>,
    Path((audio_file_id, variant, file)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let variant: Variant = variant
        .parse()
        .map_err(|e: String| ApiError(StatusCode::BAD_REQUEST, e))?;

    if file == MANIFEST_FILE {
        let manifest = state.reader.build_manifest(&audio_file_id, variant).await?;
        return Ok((
            [
                (header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            manifest,
        )
            .into_response());
    }

    let path = state
        .reader
        .segment_path(&audio_file_id, variant, &file)
        .await?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        warn!(path = %path.display(), error = %e, "failed to read segment");
        ApiError(StatusCode::NOT_FOUND, format!("segment unavailable: {file}"))
    })?;
    Ok(([(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)], bytes).into_response())
}

/// Creates the axum Router with metrics and stream endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/stream/:audio_file_id/:variant/:file", get(get_stream_file))
        .with_state(state)
}

/// Runs the HTTP server until `cancel` fires
///
/// # Arguments
/// * `bind` - Listen address, e.g. `127.0.0.1:7879`
/// * `state` - Shared metrics and progressive reader
/// * `cancel` - Graceful shutdown signal
pub async fn run_server(
    bind: &str,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::make_request;
    use crate::jobs::{JobStatus, TranscodeJob};
    use crate::metrics::new_shared_metrics;
    use crate::output::OutputLayout;
    use crate::store::{JobStore, JsonJobStore};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _dir: TempDir,
        app: Router,
        job_dir: std::path::PathBuf,
        metrics: SharedMetrics,
    }

    async fn fixture(status: JobStatus, segments: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonJobStore::in_memory());
        let layout = OutputLayout::new(dir.path());
        let mut job = TranscodeJob::new(&make_request("a1", Variant::Stereo, 0), "h".into());
        job.status = status;
        store.create(&job).await.unwrap();

        let job_dir = layout.dir_for(&job).unwrap();
        fs::create_dir_all(&job_dir).unwrap();
        for i in 0..segments {
            fs::write(job_dir.join(format!("segment_{:05}.ts", i)), b"mpegts").unwrap();
        }

        let metrics = new_shared_metrics();
        let reader = Arc::new(ProgressiveReader::new(store, layout, 6));
        Fixture {
            _dir: dir,
            app: create_router(AppState {
                metrics: metrics.clone(),
                reader,
            }),
            job_dir,
            metrics,
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, content_type, body)
    }

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let fx = fixture(JobStatus::Pending, 0).await;
        {
            let mut snapshot = fx.metrics.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.pending_jobs = 5;
            snapshot.total_output_bytes = 1024;
        }

        let (status, content_type, body) = get(fx.app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().contains("application/json"));

        let snapshot: MetricsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert_eq!(snapshot.pending_jobs, 5);
        assert_eq!(snapshot.total_output_bytes, 1024);
    }

    #[tokio::test]
    async fn test_manifest_not_ready_is_404() {
        let fx = fixture(JobStatus::Pending, 0).await;
        let (status, _, _) = get(fx.app, "/stream/a1/stereo/playlist.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_running_manifest_lists_segments_without_end_marker() {
        let fx = fixture(JobStatus::Running, 2).await;
        let (status, content_type, body) = get(fx.app, "/stream/a1/stereo/playlist.m3u8").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(MANIFEST_CONTENT_TYPE));
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("#EXTM3U"));
        assert!(text.contains("segment_00001.ts"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn test_completed_manifest_has_end_marker() {
        let fx = fixture(JobStatus::Completed, 3).await;
        let (_, _, body) = get(fx.app, "/stream/a1/stereo/playlist.m3u8").await;
        assert!(String::from_utf8(body).unwrap().ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn test_segment_bytes_served() {
        let fx = fixture(JobStatus::Running, 1).await;
        assert!(fx.job_dir.join("segment_00000.ts").exists());

        let (status, content_type, body) = get(fx.app, "/stream/a1/stereo/segment_00000.ts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(SEGMENT_CONTENT_TYPE));
        assert_eq!(body, b"mpegts");
    }

    #[tokio::test]
    async fn test_bad_requests_rejected() {
        let fx = fixture(JobStatus::Running, 1).await;
        let (status, _, _) = get(fx.app.clone(), "/stream/a1/surround/playlist.m3u8").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = get(fx.app, "/stream/a1/stereo/notes.txt").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
