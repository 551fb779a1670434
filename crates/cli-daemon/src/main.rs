//! CLI entry point for the audiobook transcode daemon
//!
//! Parses command line arguments, runs startup checks and serves until
//! interrupted.

use audiobook_transcoder::{run_startup_checks, Config, TranscodeEvent, TranscodeService};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const METRICS_REFRESH: Duration = Duration::from_secs(2);

/// Audiobook transcode daemon - HLS variants for an audiobook library
#[derive(Parser, Debug)]
#[command(name = "audiobook-transcoderd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg version, aac encoder). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Emit logs as JSON
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

fn log_event(event: &TranscodeEvent) {
    match event {
        TranscodeEvent::Progress {
            job_id,
            audio_file_id,
            percent,
        } => debug!(%job_id, %audio_file_id, percent, "transcode progress"),
        TranscodeEvent::Completed {
            job_id,
            audio_file_id,
        } => info!(%job_id, %audio_file_id, "transcode completed"),
        TranscodeEvent::Failed {
            job_id,
            audio_file_id,
            reason,
        } => warn!(%job_id, %audio_file_id, %reason, "transcode failed"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!(config = %args.config.display(), "audiobook transcode daemon starting");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup checks failed");
        return ExitCode::FAILURE;
    }

    let (service, sink) = match TranscodeService::open(config) {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, "failed to initialize transcode service");
            return ExitCode::FAILURE;
        }
    };

    let mut events = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = service.start().await {
        error!(error = %e, "failed to start workers");
        return ExitCode::FAILURE;
    }
    service.start_metrics_updater(METRICS_REFRESH).await;
    service.start_http_server().await;

    info!(
        workers = service.plan().workers,
        bind = %service.config().server.bind,
        "daemon running; press Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested; waiting for running encodes");
    service.shutdown().await;

    ExitCode::SUCCESS
}
