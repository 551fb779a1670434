//! Encoder progress parsing
//!
//! ffmpeg reports `Duration: HH:MM:SS.xx` once per input and
//! `time=HH:MM:SS.xx` on each stats line of its diagnostic stream.

/// Highest percentage reported while the encoder is still running.
pub const RUNNING_CEILING: u8 = 99;

/// Parse `HH:MM:SS(.frac)` into seconds.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let mut parts = s.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Total input duration from a `Duration:` line.
pub fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.split("Duration:").nth(1)?;
    let value = rest.split(',').next()?;
    parse_timestamp(value)
}

/// Elapsed output time from a stats line (`... time=00:01:02.50 ...`).
pub fn parse_elapsed(line: &str) -> Option<f64> {
    let rest = line.split("time=").nth(1)?;
    let value = rest.split_whitespace().next()?;
    parse_timestamp(value)
}

/// Percentage of `total` covered by `elapsed`, capped at [`RUNNING_CEILING`].
///
/// Without a known duration the raw elapsed seconds are used.
pub fn percent_of(elapsed: f64, total: Option<f64>) -> u8 {
    let raw = match total {
        Some(total) if total > 0.0 => elapsed / total * 100.0,
        _ => elapsed,
    };
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    raw.floor().min(RUNNING_CEILING as f64) as u8
}

/// Turns diagnostic lines into throttled, non-decreasing progress reports.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    min_step: u8,
    last_reported: u8,
    duration_secs: Option<f64>,
}

impl ProgressTracker {
    pub fn new(min_step: u8) -> Self {
        Self {
            min_step: min_step.max(1),
            last_reported: 0,
            duration_secs: None,
        }
    }

    /// Feed one diagnostic line; returns a percentage when it should be reported.
    pub fn observe_line(&mut self, line: &str) -> Option<u8> {
        if self.duration_secs.is_none() {
            if let Some(duration) = parse_duration_line(line) {
                self.duration_secs = Some(duration);
                return None;
            }
        }

        let elapsed = parse_elapsed(line)?;
        let percent = percent_of(elapsed, self.duration_secs);
        if percent >= self.last_reported.saturating_add(self.min_step) {
            self.last_reported = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Final report once the output is verified.
    pub fn finish(&mut self) -> Option<u8> {
        if self.last_reported < 100 {
            self.last_reported = 100;
            Some(100)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:10.50"), Some(10.5));
        assert_eq!(parse_timestamp("01:02:03"), Some(3723.0));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("10.5"), None);
    }

    #[test]
    fn test_parse_duration_line() {
        let line = "  Duration: 02:30:00.25, start: 0.025057, bitrate: 64 kb/s";
        assert_eq!(parse_duration_line(line), Some(9000.25));
        assert_eq!(parse_duration_line("  Duration: N/A, bitrate: N/A"), None);
    }

    #[test]
    fn test_parse_elapsed() {
        let line = "size=    1024kB time=00:01:30.00 bitrate= 93.2kbits/s speed=42.1x";
        assert_eq!(parse_elapsed(line), Some(90.0));
        assert_eq!(parse_elapsed("size=N/A time=N/A bitrate=N/A"), None);
        assert_eq!(parse_elapsed("Stream mapping:"), None);
    }

    #[test]
    fn test_percent_of_known_and_unknown_duration() {
        assert_eq!(percent_of(30.0, Some(60.0)), 50);
        assert_eq!(percent_of(60.0, Some(60.0)), RUNNING_CEILING);
        assert_eq!(percent_of(42.7, None), 42);
        assert_eq!(percent_of(500.0, None), RUNNING_CEILING);
        assert_eq!(percent_of(0.0, Some(60.0)), 0);
    }

    #[test]
    fn test_tracker_throttles_small_steps() {
        let mut tracker = ProgressTracker::new(5);
        assert_eq!(tracker.observe_line("  Duration: 00:01:40.00, start: 0"), None);
        assert_eq!(tracker.observe_line("time=00:00:02.00"), None); // 2%
        assert_eq!(tracker.observe_line("time=00:00:05.00"), Some(5));
        assert_eq!(tracker.observe_line("time=00:00:08.00"), None); // 8%
        assert_eq!(tracker.observe_line("time=00:00:30.00"), Some(30));
        assert_eq!(tracker.observe_line("time=00:00:20.00"), None); // never backwards
        assert_eq!(tracker.observe_line("garbage line"), None);
        assert_eq!(tracker.finish(), Some(100));
        assert_eq!(tracker.finish(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_reports_are_non_decreasing_and_end_at_100(
            duration in 1u32..36_000,
            elapsed in proptest::collection::vec(0u32..40_000, 0..50),
            step in 1u8..20,
        ) {
            let mut tracker = ProgressTracker::new(step);
            let mut reports = Vec::new();
            tracker.observe_line(&format!("  Duration: {:02}:{:02}:{:02}.00, start: 0", duration / 3600, (duration / 60) % 60, duration % 60));
            for secs in elapsed {
                let line = format!("size=N/A time={:02}:{:02}:{:02}.00 bitrate=N/A", secs / 3600, (secs / 60) % 60, secs % 60);
                if let Some(p) = tracker.observe_line(&line) {
                    reports.push(p);
                }
            }
            if let Some(p) = tracker.finish() {
                reports.push(p);
            }

            prop_assert!(reports.windows(2).all(|w| w[0] <= w[1]));
            prop_assert_eq!(reports.last().copied(), Some(100));
            prop_assert!(reports[..reports.len() - 1].iter().all(|p| *p <= RUNNING_CEILING));
        }
    }
}
