//! Test fixtures: a shell script standing in for ffmpeg.
//!
//! The fake answers `-version`, `-decoders` and `-encoders` like the real
//! binary. Any other invocation is treated as an HLS encode: it reports a
//! duration, writes segments next to the playlist path (the last argument)
//! while printing `time=` stats lines, then writes the playlist.

use std::fs;
use std::path::{Path, PathBuf};

const SCRIPT: &str = r##"#!/bin/sh
echo "$@" >> "@ARGS_LOG@"
for arg in "$@"; do
  case "$arg" in
    -version)
      echo "ffmpeg version @VERSION@ Copyright (c) 2000-2023 the FFmpeg developers"
      exit 0
      ;;
    -decoders)
      echo "Decoders:"
      echo " A..... = Audio"
      echo " ------"
@DECODERS@      exit 0
      ;;
    -encoders)
      echo "Encoders:"
      echo " A..... = Audio"
      echo " ------"
@ENCODERS@      exit 0
      ;;
  esac
done

for last in "$@"; do :; done
outdir=$(dirname "$last")
segments=@SEGMENTS@
total=$((segments * 6))
printf '  Duration: %02d:%02d:%02d.00, start: 0.000000, bitrate: 64 kb/s\n' $((total / 3600)) $((total / 60 % 60)) $((total % 60)) >&2

i=0
while [ $i -lt $segments ]; do
  if [ $i -eq @PAUSE_AT@ ]; then
    while [ ! -f "@GATE@" ]; do sleep 0.02; done
  fi
  seg=$(printf '%s/segment_%05d.ts' "$outdir" $i)
  printf 'fake-ts-payload' > "$seg.tmp"
  mv "$seg.tmp" "$seg"
  t=$(((i + 1) * 6))
  printf 'size=N/A time=%02d:%02d:%02d.00 bitrate=N/A speed=10x\r' $((t / 3600)) $((t / 60 % 60)) $((t % 60)) >&2
  sleep 0.01
  i=$((i + 1))
done

if [ @EXIT@ -ne 0 ]; then
  echo "Conversion failed!" >&2
  exit @EXIT@
fi

if [ @MANIFEST@ -eq 1 ]; then
  echo "#EXTM3U" > "$last.tmp"
  echo "#EXT-X-VERSION:3" >> "$last.tmp"
  echo "#EXT-X-TARGETDURATION:6" >> "$last.tmp"
  echo "#EXT-X-PLAYLIST-TYPE:VOD" >> "$last.tmp"
  i=0
  while [ $i -lt $segments ]; do
    echo "#EXTINF:6.000000," >> "$last.tmp"
    printf 'segment_%05d.ts\n' $i >> "$last.tmp"
    i=$((i + 1))
  done
  echo "#EXT-X-ENDLIST" >> "$last.tmp"
  mv "$last.tmp" "$last"
fi
exit 0
"##;

/// Builder for the fake encoder script.
#[derive(Debug, Clone)]
pub(crate) struct FakeFfmpeg {
    decoders: Vec<String>,
    encoders: Vec<String>,
    version: String,
    segments: u32,
    exit_code: i32,
    write_manifest: bool,
    pause_at: Option<u32>,
}

impl FakeFfmpeg {
    pub(crate) fn new(decoders: &[&str]) -> Self {
        Self {
            decoders: decoders.iter().map(|s| s.to_string()).collect(),
            encoders: vec!["aac".to_string()],
            version: "6.1.1".to_string(),
            segments: 3,
            exit_code: 0,
            write_manifest: true,
            pause_at: None,
        }
    }

    pub(crate) fn encoders(mut self, encoders: &[&str]) -> Self {
        self.encoders = encoders.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub(crate) fn segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    pub(crate) fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub(crate) fn without_manifest(mut self) -> Self {
        self.write_manifest = false;
        self
    }

    /// Block before writing segment `index` until [`FakeFfmpeg::gate_path`] exists.
    pub(crate) fn pause_at(mut self, index: u32) -> Self {
        self.pause_at = Some(index);
        self
    }

    pub(crate) fn gate_path(dir: &Path) -> PathBuf {
        dir.join("ffmpeg.gate")
    }

    pub(crate) fn args_log(dir: &Path) -> PathBuf {
        dir.join("ffmpeg-args.log")
    }

    /// Write the script into `dir` and return its path.
    pub(crate) fn write(&self, dir: &Path) -> PathBuf {
        let script = SCRIPT
            .replace("@ARGS_LOG@", &Self::args_log(dir).to_string_lossy())
            .replace("@GATE@", &Self::gate_path(dir).to_string_lossy())
            .replace("@VERSION@", &self.version)
            .replace("@DECODERS@", &table_lines(&self.decoders, "decoder"))
            .replace("@ENCODERS@", &table_lines(&self.encoders, "encoder"))
            .replace("@SEGMENTS@", &self.segments.to_string())
            .replace("@EXIT@", &self.exit_code.to_string())
            .replace("@MANIFEST@", if self.write_manifest { "1" } else { "0" })
            .replace(
                "@PAUSE_AT@",
                &self.pause_at.map(i64::from).unwrap_or(-1).to_string(),
            );

        let path = dir.join("ffmpeg");
        fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }
}

fn table_lines(codecs: &[String], kind: &str) -> String {
    codecs
        .iter()
        .map(|codec| format!("      echo \" A....D {codec}    fake {kind}\"\n"))
        .collect()
}

/// Fake encoder with the given decoders and default encode behaviour.
pub(crate) fn write_fake_ffmpeg(dir: &Path, decoders: &[&str]) -> PathBuf {
    FakeFfmpeg::new(decoders).write(dir)
}

/// Argument lines of every invocation so far.
pub(crate) fn recorded_invocations(dir: &Path) -> Vec<String> {
    fs::read_to_string(FakeFfmpeg::args_log(dir))
        .map(|log| log.lines().map(String::from).collect())
        .unwrap_or_default()
}

/// Invocations that were encodes rather than capability queries.
pub(crate) fn recorded_encodes(dir: &Path) -> Vec<String> {
    recorded_invocations(dir)
        .into_iter()
        .filter(|line| line.contains(" -i "))
        .collect()
}

/// Probe with a switchable answer for every codec.
#[derive(Debug)]
pub(crate) struct StaticProbe {
    decodable: std::sync::atomic::AtomicBool,
    encodable: std::sync::atomic::AtomicBool,
}

impl StaticProbe {
    pub(crate) fn new(decodable: bool) -> Self {
        Self {
            decodable: std::sync::atomic::AtomicBool::new(decodable),
            encodable: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub(crate) fn set_decodable(&self, decodable: bool) {
        self.decodable
            .store(decodable, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn set_encodable(&self, encodable: bool) {
        self.encodable
            .store(encodable, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl crate::probe::EncoderProbe for StaticProbe {
    async fn can_decode(&self, codec: &str) -> bool {
        !codec.is_empty() && self.decodable.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn can_encode(&self, codec: &str) -> bool {
        !codec.is_empty() && self.encodable.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Sink that keeps every event for inspection.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: std::sync::Mutex<Vec<crate::events::TranscodeEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<crate::events::TranscodeEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Progress percentages reported for `job_id`, in order.
    pub(crate) fn progress_for(&self, job_id: &str) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                crate::events::TranscodeEvent::Progress { job_id: id, percent, .. } if id == job_id => {
                    Some(percent)
                }
                _ => None,
            })
            .collect()
    }
}

impl crate::events::EventSink for RecordingSink {
    fn emit(&self, event: crate::events::TranscodeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub(crate) async fn wait_for<F, Fut>(timeout: std::time::Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
