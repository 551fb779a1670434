//! Encoder capability probe.
//!
//! Answers "can the encoder process this codec?" by asking the ffmpeg binary
//! for its decoder and encoder tables.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Capability queries against the external encoder.
#[async_trait]
pub trait EncoderProbe: Send + Sync {
    /// Whether the encoder can decode `codec`.
    async fn can_decode(&self, codec: &str) -> bool;

    /// Whether the encoder can produce `codec`.
    async fn can_encode(&self, codec: &str) -> bool;
}

/// Canonical spelling for codec comparisons (`E-AC-3` and `eac3` match).
pub fn normalize_codec(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Codec names from `ffmpeg -decoders` / `-encoders` output.
///
/// Entries follow the `------` separator line; the second column is the name.
pub fn parse_capability_table(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(normalize_codec)
        .collect()
}

/// Substring match of a codec against a parsed capability table.
pub fn table_supports(table: &[String], codec: &str) -> bool {
    let wanted = normalize_codec(codec);
    if wanted.is_empty() {
        return false;
    }
    table.iter().any(|name| name.contains(&wanted))
}

/// Probe backed by the ffmpeg binary.
///
/// Every query re-runs ffmpeg so capability changes (an upgraded binary) are
/// seen by the next admission.
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    ffmpeg_path: PathBuf,
}

impl FfmpegProbe {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    /// Run `ffmpeg -hide_banner <flag>` and return the parsed table, or
    /// `None` when the binary cannot be run.
    async fn capability_table(&self, flag: &str) -> Option<Vec<String>> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg(flag)
            .stdin(std::process::Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let table = parse_capability_table(&String::from_utf8_lossy(&output.stdout));
                debug!(flag, entries = table.len(), "probed encoder capabilities");
                Some(table)
            }
            Ok(output) => {
                warn!(
                    flag,
                    status = ?output.status.code(),
                    "encoder probe exited unsuccessfully"
                );
                None
            }
            Err(e) => {
                warn!(flag, error = %e, path = %self.ffmpeg_path.display(), "encoder probe could not run");
                None
            }
        }
    }

    async fn supports(&self, flag: &str, codec: &str) -> bool {
        if normalize_codec(codec).is_empty() {
            return false;
        }
        match self.capability_table(flag).await {
            Some(table) => table_supports(&table, codec),
            // Unknown capabilities are assumed present.
            None => true,
        }
    }
}

#[async_trait]
impl EncoderProbe for FfmpegProbe {
    async fn can_decode(&self, codec: &str) -> bool {
        self.supports("-decoders", codec).await
    }

    async fn can_encode(&self, codec: &str) -> bool {
        self.supports("-encoders", codec).await
    }
}
