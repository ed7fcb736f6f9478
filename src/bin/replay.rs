//! Replay - offline crossing analysis of a recorded capture
//!
//! Runs every frame of a JSONL capture through the same detector and tracker
//! the service uses, printing each event and a final summary. Useful for
//! tuning the threshold and sequence timeout against real recordings.
//!
//! Usage:
//!   replay captures/doorway.jsonl
//!   replay --config config/dev.toml --threshold 60 --timeout-ms 2000 walk.jsonl
//!   replay --json walk.jsonl > events.jsonl

use anyhow::Context;
use clap::Parser;
use doorway_occupancy::domain::{CompletedSession, CrossingEvent, OccupancyState, SensorId, SensorSample};
use doorway_occupancy::infra::Config;
use doorway_occupancy::io::range_source::{load_capture, CaptureFrame};
use doorway_occupancy::services::{DetectorSettings, DoorwayMonitor, EventSink, MonitorSnapshot};
use serde_json::json;
use std::io::Write;
use tracing::warn;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Replay - run a doorway capture through the crossing detector
#[derive(Parser, Debug)]
#[command(name = "replay", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file (detector and sampling sections are used)
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Override detector.threshold_distance
    #[arg(long)]
    threshold: Option<f64>,

    /// Override detector.sequence_timeout_ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// JSONL capture to replay
    capture: String,
}

/// Writes notifications as they happen
struct PrintSink<W: Write> {
    json: bool,
    out: W,
}

impl<W: Write> PrintSink<W> {
    fn emit(&mut self, line: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            warn!(error = %e, "replay_output_failed");
        }
    }
}

impl<W: Write> EventSink for PrintSink<W> {
    fn on_crossing(&mut self, event: &CrossingEvent, state: &OccupancyState) {
        if self.json {
            let line =
                json!({"type": "crossing", "event": event, "occupant_count": state.occupant_count});
            self.emit(format_args!("{}", line));
        } else {
            self.emit(format_args!(
                "{:>10} ms  {:<8} count={}",
                event.at_ms(),
                event.as_str(),
                state.occupant_count
            ));
        }
    }

    fn on_occupancy_changed(&mut self, occupied: bool, at_ms: u64) {
        if self.json {
            let line = json!({"type": "occupancy", "occupied": occupied, "at_ms": at_ms});
            self.emit(format_args!("{}", line));
        } else {
            let state = if occupied { "OCCUPIED" } else { "EMPTY" };
            self.emit(format_args!("{:>10} ms  {}", at_ms, state));
        }
    }

    fn on_session_completed(&mut self, session: &CompletedSession) {
        if self.json {
            self.emit(format_args!("{}", json!({"type": "session", "session": session})));
        } else {
            self.emit(format_args!(
                "{:>10} ms  session {} ms (peak {}, entries {})",
                session.ended_at_ms, session.duration_ms, session.peak_occupants, session.entries
            ));
        }
    }

    fn on_sensor_health(&mut self, sensor: SensorId, unresponsive: bool, at_ms: u64) {
        let state = if unresponsive { "unresponsive" } else { "recovered" };
        if self.json {
            let line = json!({"type": "sensor", "sensor": sensor, "state": state, "at_ms": at_ms});
            self.emit(format_args!("{}", line));
        } else {
            self.emit(format_args!("{:>10} ms  {} sensor {}", at_ms, sensor, state));
        }
    }
}

/// Run every frame through a monitor built from the config
fn replay<W: Write>(
    config: &Config,
    frames: &[CaptureFrame],
    sink: PrintSink<W>,
) -> DoorwayMonitor<PrintSink<W>> {
    let mut monitor =
        DoorwayMonitor::new(config.detector_settings(), config.unresponsive_after(), sink);
    for frame in frames {
        let entrance = SensorSample::new(SensorId::Entrance, frame.entrance, frame.t_ms);
        let exit = SensorSample::new(SensorId::Exit, frame.exit, frame.t_ms);
        monitor.process(&entrance, &exit, frame.t_ms);
    }
    monitor
}

fn write_summary<W: Write>(
    out: &mut W,
    capture: &str,
    frame_count: usize,
    settings: &DetectorSettings,
    summary: &MonitorSnapshot,
    json: bool,
) -> std::io::Result<()> {
    if json {
        writeln!(out, "{}", json!({"type": "summary", "frames": frame_count, "final": summary}))?;
        return Ok(());
    }

    writeln!(out)?;
    writeln!(out, "capture            {}", capture)?;
    writeln!(out, "frames             {}", frame_count)?;
    writeln!(
        out,
        "detector           threshold={} timeout_ms={} no_echo={}",
        settings.threshold_distance,
        settings.sequence_timeout_ms,
        settings.no_echo.as_str()
    )?;
    writeln!(out, "entries            {}", summary.entries_total)?;
    writeln!(out, "exits              {}", summary.exits_total)?;
    writeln!(out, "sessions           {}", summary.sessions_completed)?;
    writeln!(out, "occupied total ms  {}", summary.occupied_ms_total)?;
    writeln!(out, "stale expirations  {}", summary.stale_expirations)?;
    writeln!(out, "ambiguous ties     {}", summary.ambiguous_ties)?;
    writeln!(out, "underflow clamps   {}", summary.underflow_clamps)?;
    match summary.occupied_for_ms {
        Some(open_ms) => writeln!(
            out,
            "final              OCCUPIED count={} open session {} ms",
            summary.occupant_count, open_ms
        ),
        None => writeln!(out, "final              EMPTY"),
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays clean for --json
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config)?
        .with_detector_overrides(args.threshold, args.timeout_ms)
        .context("Invalid detector override")?;
    let frames = load_capture(&args.capture)?;

    let sink = PrintSink { json: args.json, out: std::io::stdout().lock() };
    let mut monitor = replay(&config, &frames, sink);

    let end_ms = frames.last().map(|f| f.t_ms).unwrap_or(0);
    let summary = monitor.snapshot(end_ms);
    write_summary(
        &mut monitor.sink_mut().out,
        &args.capture,
        frames.len(),
        &config.detector_settings(),
        &summary,
        args.json,
    )
    .context("Failed to write summary")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorway_occupancy::io::range_source::parse_capture;
    use serde_json::Value;

    // 70 only interrupts the beam at the default threshold, and the 2500 ms
    // gap only pairs at the default timeout
    const CAPTURE: &str = r#"
{"t_ms": 0, "entrance": 200.0, "exit": 200.0}
{"t_ms": 100, "entrance": 70.0, "exit": 200.0}
{"t_ms": 200, "entrance": 70.0, "exit": 40.0}
{"t_ms": 300, "entrance": 200.0, "exit": 200.0}
{"t_ms": 1000, "entrance": 40.0, "exit": 200.0}
{"t_ms": 3500, "entrance": 40.0, "exit": 40.0}
{"t_ms": 3600, "entrance": 200.0, "exit": 200.0}
{"t_ms": 5000, "entrance": 40.0, "exit": 200.0}
{"t_ms": 5500, "entrance": 40.0, "exit": 40.0}
{"t_ms": 5800, "entrance": 200.0, "exit": 200.0}
"#;

    fn json_lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8(out.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_overrides_change_detection() {
        let frames = parse_capture(CAPTURE).unwrap();
        let config = Config::default().with_detector_overrides(Some(60.0), Some(2000)).unwrap();

        let mut monitor = replay(&config, &frames, PrintSink { json: true, out: Vec::new() });
        let summary = monitor.snapshot(5_800);
        write_summary(
            &mut monitor.sink_mut().out,
            "inline",
            frames.len(),
            &config.detector_settings(),
            &summary,
            true,
        )
        .unwrap();

        let lines = json_lines(&monitor.sink().out);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "crossing");
        assert_eq!(lines[0]["event"]["kind"], "entered");
        assert_eq!(lines[0]["event"]["at_ms"], 5_500);
        assert_eq!(lines[0]["occupant_count"], 1);
        assert_eq!(lines[1], serde_json::json!({"type": "occupancy", "occupied": true, "at_ms": 5_500}));
        assert_eq!(lines[2]["type"], "summary");
        assert_eq!(lines[2]["frames"], 10);
        assert_eq!(lines[2]["final"]["entries_total"], 1);
        assert_eq!(lines[2]["final"]["stale_expirations"], 1);
    }

    #[test]
    fn test_default_settings_count_every_walk_in() {
        let frames = parse_capture(CAPTURE).unwrap();

        let monitor = replay(&Config::default(), &frames, PrintSink { json: false, out: Vec::new() });

        assert_eq!(monitor.snapshot(5_800).entries_total, 3);
        let text = String::from_utf8(monitor.sink().out.clone()).unwrap();
        assert!(text.contains("entered"));
        assert!(text.contains("OCCUPIED"));
    }

    #[test]
    fn test_text_summary() {
        let mut out = Vec::new();
        let monitor = replay(&Config::default(), &[], PrintSink { json: false, out: Vec::new() });
        let settings = DetectorSettings::default();

        write_summary(&mut out, "empty.jsonl", 0, &settings, &monitor.snapshot(0), false).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("capture            empty.jsonl"));
        assert!(text.contains("threshold=75 timeout_ms=3000 no_echo=hold"));
        assert!(text.ends_with("final              EMPTY\n"));
    }
}
