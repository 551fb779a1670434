//! On-disk layout of transcoded output.
//!
//! Output for a job lives in `<root>/<collection_id>/<audio_file_id>/<variant>/`
//! as a `playlist.m3u8` manifest plus `segment_00000.ts`, `segment_00001.ts`, ...
//! The names are fixed so output written before a restart is still found.

use crate::jobs::{TranscodeJob, Variant};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "playlist.m3u8";
pub const SEGMENT_PREFIX: &str = "segment_";
pub const SEGMENT_EXTENSION: &str = ".ts";
/// ffmpeg `-hls_segment_filename` pattern matching [`is_segment_name`].
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

pub const MANIFEST_HEADER: &str = "#EXTM3U";
pub const END_MARKER: &str = "#EXT-X-ENDLIST";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid path component: {0:?}")]
    InvalidComponent(String),

    #[error("output IO error: {0}")]
    Io(#[from] io::Error),
}

/// Maps job keys to output directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(
        &self,
        collection_id: &str,
        audio_file_id: &str,
        variant: Variant,
    ) -> Result<PathBuf, OutputError> {
        Ok(self
            .root
            .join(checked_component(collection_id)?)
            .join(checked_component(audio_file_id)?)
            .join(variant.as_str()))
    }

    pub fn dir_for(&self, job: &TranscodeJob) -> Result<PathBuf, OutputError> {
        self.job_dir(&job.collection_id, &job.audio_file_id, job.variant)
    }

    pub fn manifest_path(&self, job: &TranscodeJob) -> Result<PathBuf, OutputError> {
        Ok(self.dir_for(job)?.join(MANIFEST_FILE))
    }

    pub fn collection_dir(&self, collection_id: &str) -> Result<PathBuf, OutputError> {
        Ok(self.root.join(checked_component(collection_id)?))
    }
}

/// IDs become directory names, so they must be a single normal component.
fn checked_component(value: &str) -> Result<&str, OutputError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        Err(OutputError::InvalidComponent(value.to_string()))
    } else {
        Ok(value)
    }
}

/// `segment_<digits>.ts`
pub fn is_segment_name(name: &str) -> bool {
    name.strip_prefix(SEGMENT_PREFIX)
        .and_then(|rest| rest.strip_suffix(SEGMENT_EXTENSION))
        .map(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Segment file names currently in `dir`, in sequence order.
///
/// Names are zero padded, so lexicographic order is sequence order. A
/// missing directory has no segments.
pub fn list_segments(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_segment_name(name) {
                segments.push(name.to_string());
            }
        }
    }
    segments.sort();
    Ok(segments)
}

/// Whether `path` holds a finished segmented-stream manifest.
pub fn verify_manifest(path: &Path) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let mut lines = content.lines().map(str::trim);
    if lines.next() != Some(MANIFEST_HEADER) {
        return false;
    }
    let mut has_segment = false;
    let mut has_end = false;
    for line in lines {
        if line == END_MARKER {
            has_end = true;
        } else if !line.is_empty() && !line.starts_with('#') {
            has_segment = true;
        }
    }
    has_segment && has_end
}

/// Total bytes of all files under `dir`.
pub fn output_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Remove a job's output directory; a missing directory is not an error.
pub async fn remove_output(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// A playlist entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub name: String,
    pub duration_secs: f64,
}

/// `#EXTINF` durations by segment name from an encoder-written playlist.
pub fn parse_segment_durations(content: &str) -> HashMap<String, f64> {
    let mut durations = HashMap::new();
    let mut pending: Option<f64> = None;
    for line in content.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending = rest.split(',').next().and_then(|d| d.trim().parse().ok());
        } else if !line.is_empty() && !line.starts_with('#') {
            if let (Some(duration), Some(name)) = (pending.take(), line.rsplit('/').next()) {
                durations.insert(name.to_string(), duration);
            }
        }
    }
    durations
}

/// Playlist over the segments available so far.
///
/// The end marker is only written for finished output, which tells players
/// whether to keep polling for more segments.
pub fn synthesize_manifest(segments: &[SegmentEntry], segment_secs: u32, complete: bool) -> String {
    let target = segments
        .iter()
        .map(|s| s.duration_secs.ceil() as u32)
        .fold(segment_secs.max(1), u32::max);

    let mut out = String::new();
    out.push_str(MANIFEST_HEADER);
    out.push('\n');
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str(if complete {
        "#EXT-X-PLAYLIST-TYPE:VOD\n"
    } else {
        "#EXT-X-PLAYLIST-TYPE:EVENT\n"
    });
    for segment in segments {
        out.push_str(&format!(
            "#EXTINF:{:.3},\n{}\n",
            segment.duration_secs, segment.name
        ));
    }
    if complete {
        out.push_str(END_MARKER);
        out.push('\n');
    }
    out
}
