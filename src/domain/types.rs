//! Shared types for the doorway occupancy monitor

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// One of the two ranging sensors mounted across the doorway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorId {
    /// Outer beam, crossed first by someone walking in
    Entrance,
    /// Inner beam, crossed first by someone walking out
    Exit,
}

impl SensorId {
    pub const ALL: [SensorId; 2] = [SensorId::Entrance, SensorId::Exit];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::Entrance => "entrance",
            SensorId::Exit => "exit",
        }
    }

    /// Stable array index for per-sensor state
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            SensorId::Entrance => 0,
            SensorId::Exit => 1,
        }
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ranging result for one sensor on one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub sensor: SensorId,
    /// Measured distance in sensor units, `None` when there was no echo
    pub distance: Option<f64>,
    /// Monotonic tick time in milliseconds
    pub timestamp_ms: u64,
}

impl SensorSample {
    #[inline]
    pub fn new(sensor: SensorId, distance: Option<f64>, timestamp_ms: u64) -> Self {
        Self { sensor, distance, timestamp_ms }
    }

    #[inline]
    pub fn no_echo(sensor: SensorId, timestamp_ms: u64) -> Self {
        Self { sensor, distance: None, timestamp_ms }
    }
}

/// A directional crossing of the doorway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CrossingEvent {
    Entered { at_ms: u64 },
    Exited { at_ms: u64 },
}

impl CrossingEvent {
    #[inline]
    pub fn at_ms(&self) -> u64 {
        match self {
            CrossingEvent::Entered { at_ms } | CrossingEvent::Exited { at_ms } => *at_ms,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingEvent::Entered { .. } => "entered",
            CrossingEvent::Exited { .. } => "exited",
        }
    }
}

/// Occupant count and the derived occupied flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OccupancyState {
    pub occupant_count: u32,
    pub occupied: bool,
    /// Tick at which the current session started (count went 0 -> 1)
    pub occupied_since_ms: Option<u64>,
}

/// A finished occupied session, reported when the last occupant leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletedSession {
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub duration_ms: u64,
    /// Highest occupant count seen during the session
    pub peak_occupants: u32,
    /// Entered events folded into the session
    pub entries: u32,
}
