//! Range sources - where per-tick sensor distances come from
//!
//! The monitor only needs `measure(sensor)`; drivers for real ranging hardware
//! live outside this crate. Included here is a replay source that plays back a
//! JSONL capture against the caller's tick clock.
//!
//! Capture format (one JSON object per line, `#` lines ignored):
//! `{"t_ms": 0, "entrance": 41.5, "exit": null}`

use crate::domain::types::SensorId;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Source of distance readings, one call per sensor per tick
pub trait RangeSource {
    /// Called once at the start of every tick, before any `measure`
    fn begin_tick(&mut self, _now_ms: u64) {}

    /// Distance for `sensor`, `None` when there was no echo.
    /// May block for one ranging cycle.
    fn measure(&mut self, sensor: SensorId) -> Option<f64>;
}

/// One recorded tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureFrame {
    pub t_ms: u64,
    #[serde(default)]
    pub entrance: Option<f64>,
    #[serde(default)]
    pub exit: Option<f64>,
}

impl CaptureFrame {
    #[inline]
    pub fn distance(&self, sensor: SensorId) -> Option<f64> {
        match sensor {
            SensorId::Entrance => self.entrance,
            SensorId::Exit => self.exit,
        }
    }
}

/// Parse capture text. Frame times must be non-decreasing.
pub fn parse_capture(content: &str) -> anyhow::Result<Vec<CaptureFrame>> {
    let mut frames: Vec<CaptureFrame> = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let frame: CaptureFrame = serde_json::from_str(line)
            .with_context(|| format!("Invalid capture frame on line {}", idx + 1))?;

        if let Some(prev) = frames.last() {
            if frame.t_ms < prev.t_ms {
                bail!(
                    "Capture time went backwards on line {} ({} < {})",
                    idx + 1,
                    frame.t_ms,
                    prev.t_ms
                );
            }
        }
        frames.push(frame);
    }

    Ok(frames)
}

/// Load a capture file from disk
pub fn load_capture<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<CaptureFrame>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read capture file {}", path.display()))?;
    parse_capture(&content).with_context(|| format!("Failed to parse capture {}", path.display()))
}

/// Plays a capture back against tick time.
///
/// Frame times are relative to the first tick seen. Between frames the most
/// recent frame is current; after the last frame its readings are held unless
/// playback loops.
pub struct ReplaySource {
    frames: Vec<CaptureFrame>,
    loop_playback: bool,
    /// Length of one playback cycle when looping
    period_ms: u64,
    /// Tick time that maps to capture time 0
    origin_ms: Option<u64>,
    /// Index of the current frame, `None` before the first frame
    current: Option<usize>,
    finished_logged: bool,
}

impl ReplaySource {
    pub fn new(frames: Vec<CaptureFrame>, loop_playback: bool) -> Self {
        let period_ms = match frames.as_slice() {
            [] => 1,
            [only] => only.t_ms + 1,
            [.., prev, last] => last.t_ms + (last.t_ms - prev.t_ms).max(1),
        };
        info!(frames = %frames.len(), period_ms = %period_ms, loop_playback = %loop_playback, "replay_loaded");
        Self {
            frames,
            loop_playback,
            period_ms,
            origin_ms: None,
            current: None,
            finished_logged: false,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, loop_playback: bool) -> anyhow::Result<Self> {
        Ok(Self::new(load_capture(path)?, loop_playback))
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Whether a non-looping playback has passed its final frame
    pub fn is_finished(&self) -> bool {
        !self.loop_playback && self.current.is_some_and(|idx| idx + 1 == self.frames.len())
    }

    fn playback_position(&mut self, now_ms: u64) -> u64 {
        let origin = *self.origin_ms.get_or_insert(now_ms);
        let elapsed = now_ms.saturating_sub(origin);
        if self.loop_playback {
            elapsed % self.period_ms
        } else {
            elapsed
        }
    }
}

impl RangeSource for ReplaySource {
    fn begin_tick(&mut self, now_ms: u64) {
        let pos = self.playback_position(now_ms);
        let upto = self.frames.partition_point(|f| f.t_ms <= pos);
        self.current = upto.checked_sub(1);

        if self.is_finished() && !self.finished_logged {
            self.finished_logged = true;
            info!(frames = %self.frames.len(), "replay_finished");
        }
    }

    fn measure(&mut self, sensor: SensorId) -> Option<f64> {
        self.current.and_then(|idx| self.frames[idx].distance(sensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = r#"
# walk in
{"t_ms": 0, "entrance": 200.0, "exit": 210.0}
{"t_ms": 100, "entrance": 40.0, "exit": 210.0}
{"t_ms": 300, "entrance": 40.0, "exit": null}
"#;

    #[test]
    fn test_parse_capture_skips_comments() {
        let frames = parse_capture(CAPTURE).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].entrance, Some(40.0));
        assert_eq!(frames[2].exit, None);
    }

    #[test]
    fn test_parse_capture_missing_field_is_no_echo() {
        let frames = parse_capture(r#"{"t_ms": 5, "exit": 12.0}"#).unwrap();
        assert_eq!(frames[0].entrance, None);
        assert_eq!(frames[0].exit, Some(12.0));
    }

    #[test]
    fn test_parse_capture_rejects_backwards_time() {
        let err = parse_capture("{\"t_ms\": 10}\n{\"t_ms\": 5}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_capture_rejects_garbage() {
        assert!(parse_capture("not json").is_err());
    }

    #[test]
    fn test_replay_follows_tick_clock() {
        let mut source = ReplaySource::new(parse_capture(CAPTURE).unwrap(), false);

        // First tick defines the origin
        source.begin_tick(10_000);
        assert_eq!(source.measure(SensorId::Entrance), Some(200.0));

        source.begin_tick(10_150);
        assert_eq!(source.measure(SensorId::Entrance), Some(40.0));
        assert_eq!(source.measure(SensorId::Exit), Some(210.0));

        source.begin_tick(10_300);
        assert_eq!(source.measure(SensorId::Exit), None);
        assert!(source.is_finished());

        // Held after the end
        source.begin_tick(20_000);
        assert_eq!(source.measure(SensorId::Entrance), Some(40.0));
    }

    #[test]
    fn test_replay_loops() {
        let mut source = ReplaySource::new(parse_capture(CAPTURE).unwrap(), true);

        source.begin_tick(0);
        // Period is 300 + 200 = 500ms
        source.begin_tick(550);
        assert_eq!(source.measure(SensorId::Entrance), Some(200.0));
        assert!(!source.is_finished());
    }

    #[test]
    fn test_empty_replay_reads_no_echo() {
        let mut source = ReplaySource::new(Vec::new(), false);
        source.begin_tick(0);
        assert_eq!(source.measure(SensorId::Entrance), None);
        assert_eq!(source.frame_count(), 0);
    }
}
