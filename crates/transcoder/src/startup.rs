//! Startup checks
//!
//! Preflight checks run before the service starts:
//! - the encoder binary runs and is FFmpeg 4 or newer
//! - the encoder can produce AAC
//! - output and state directories exist

use crate::config::Config;
use crate::jobs::OUTPUT_CODEC;
use crate::probe::{parse_capability_table, table_supports};
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest FFmpeg major version with the HLS muxer options we pass.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("FFmpeg cannot encode {0}")]
    MissingEncoder(String),

    #[error("cannot prepare directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

fn run_ffmpeg(ffmpeg_path: &Path, args: &[&str]) -> Result<String, StartupError> {
    let output = Command::new(ffmpeg_path).args(args).output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "{} {} failed; is FFmpeg installed? Error: {}",
            ffmpeg_path.display(),
            args.join(" "),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} {} exited with {}",
            ffmpeg_path.display(),
            args.join(" "),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that FFmpeg runs and is at least [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg_version(ffmpeg_path: &Path) -> Result<u32, StartupError> {
    let version_output = run_ffmpeg(ffmpeg_path, &["-version"])?;
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }

    Ok(major_version)
}

/// Check that FFmpeg lists an encoder for the output codec
pub fn check_output_encoder(ffmpeg_path: &Path) -> Result<(), StartupError> {
    let encoders = run_ffmpeg(ffmpeg_path, &["-hide_banner", "-encoders"])?;
    if table_supports(&parse_capability_table(&encoders), OUTPUT_CODEC) {
        Ok(())
    } else {
        Err(StartupError::MissingEncoder(OUTPUT_CODEC.to_string()))
    }
}

/// Create the output and state directories if missing
pub fn ensure_directories(cfg: &Config) -> Result<(), StartupError> {
    for dir in [&cfg.storage.output_dir, &cfg.storage.state_dir] {
        fs::create_dir_all(dir).map_err(|source| StartupError::Directory {
            path: dir.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg version
/// 2. AAC encoder availability
/// 3. Directory preparation
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let major = check_ffmpeg_version(&cfg.encoder.ffmpeg_path)?;
    check_output_encoder(&cfg.encoder.ffmpeg_path)?;
    ensure_directories(cfg)?;
    info!(ffmpeg_major = major, "startup checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = r#"ffmpeg version n6.1-5-g1234567 Copyright (c) 2000-2024
built with gcc 12.2.0
configuration: --enable-gpl"#;
        assert_eq!(parse_ffmpeg_version(output), Some(6));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let err = check_ffmpeg_version(Path::new("/nonexistent/ffmpeg")).unwrap_err();
        assert!(matches!(err, StartupError::FfmpegUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_checks_against_fake_binary() {
        use crate::testing::FakeFfmpeg;

        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = FakeFfmpeg::new(&["mp3"]).write(dir.path());
        assert_eq!(check_ffmpeg_version(&ffmpeg).unwrap(), 6);
        check_output_encoder(&ffmpeg).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_old_version_rejected() {
        use crate::testing::FakeFfmpeg;

        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = FakeFfmpeg::new(&[]).version("3.4.8").write(dir.path());
        assert!(matches!(
            check_ffmpeg_version(&ffmpeg),
            Err(StartupError::FfmpegVersion(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_aac_encoder_rejected() {
        use crate::testing::FakeFfmpeg;

        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = FakeFfmpeg::new(&[]).encoders(&["libopus"]).write(dir.path());
        assert!(matches!(
            check_output_encoder(&ffmpeg),
            Err(StartupError::MissingEncoder(_))
        ));
    }

    #[test]
    fn test_ensure_directories_creates_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.storage.output_dir = dir.path().join("out/nested");
        cfg.storage.state_dir = dir.path().join("state");

        ensure_directories(&cfg).unwrap();
        assert!(cfg.storage.output_dir.is_dir());
        assert!(cfg.storage.state_dir.is_dir());
    }
}
