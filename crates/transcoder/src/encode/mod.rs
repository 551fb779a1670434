//! Encoder invocation

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, describe_command, needs_channel_override, HlsEncodeParams};
