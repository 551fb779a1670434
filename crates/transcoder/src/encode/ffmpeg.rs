//! ffmpeg HLS encode command
//!
//! Builds the ffmpeg invocation that turns one source audio file into an
//! AAC segmented stream for a single output variant.

use crate::jobs::Variant;
use crate::output::{MANIFEST_FILE, SEGMENT_PATTERN};
use crate::probe::normalize_codec;
use std::path::PathBuf;
use tokio::process::Command;

/// Source codecs whose container may advertise fewer channels than the
/// stream carries. Compared after [`normalize_codec`].
const SURROUND_FAMILIES: &[&str] = &["eac3", "ac3"];

/// Parameters for one HLS encode
#[derive(Debug, Clone)]
pub struct HlsEncodeParams {
    /// Encoder binary
    pub ffmpeg_path: PathBuf,
    /// Source audio file
    pub input_path: PathBuf,
    /// Directory receiving the playlist and segments
    pub output_dir: PathBuf,
    /// Codec reported for the source
    pub source_codec: String,
    pub variant: Variant,
    /// Target bitrate, already clamped to the variant policy
    pub bitrate_kbps: u32,
    pub segment_secs: u32,
}

impl HlsEncodeParams {
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE)
    }

    pub fn segment_pattern(&self) -> PathBuf {
        self.output_dir.join(SEGMENT_PATTERN)
    }
}

/// Whether the spatial variant must force a 5.1 input layout for `codec`.
///
/// Matches the E-AC-3/AC-3 family, including object-audio names such as
/// `eac3_joc`.
pub fn needs_channel_override(variant: Variant, source_codec: &str) -> bool {
    if variant != Variant::Spatial {
        return false;
    }
    let codec = normalize_codec(source_codec);
    SURROUND_FAMILIES.iter().any(|family| codec.starts_with(family))
}

/// Build the ffmpeg command for an HLS encode
///
/// The command writes `segment_%05d.ts` files and `playlist.m3u8` into
/// `params.output_dir`; `temp_file` makes each segment appear only once
/// fully written. Stats go to stderr.
///
/// # Arguments
/// * `params` - Encode parameters including paths and variant policy
pub fn build_ffmpeg_command(params: &HlsEncodeParams) -> Command {
    let policy = params.variant.policy();
    let mut cmd = Command::new(&params.ffmpeg_path);

    cmd.arg("-hide_banner").arg("-nostdin").arg("-y");

    if needs_channel_override(params.variant, &params.source_codec) {
        cmd.arg("-ch_layout").arg("5.1");
    }

    cmd.arg("-i").arg(&params.input_path);
    cmd.arg("-vn").arg("-map").arg("0:a:0");

    cmd.arg("-c:a").arg(crate::jobs::OUTPUT_CODEC);
    cmd.arg("-b:a").arg(format!("{}k", params.bitrate_kbps));
    cmd.arg("-ac").arg(policy.channels.to_string());

    cmd.arg("-f").arg("hls");
    cmd.arg("-hls_time").arg(params.segment_secs.to_string());
    cmd.arg("-hls_playlist_type").arg("vod");
    cmd.arg("-hls_flags").arg("temp_file");
    cmd.arg("-hls_segment_filename").arg(params.segment_pattern());
    cmd.arg(params.manifest_path());

    cmd
}

/// Render a command line for logging.
pub fn describe_command(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(std_cmd.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}
