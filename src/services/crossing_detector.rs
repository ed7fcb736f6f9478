//! Directional crossing detection from two ranging beams
//!
//! Each sensor is armed on the rising edge of a "something in the beam"
//! reading. When both beams are armed, the order of their arm timestamps
//! gives the walking direction:
//! - Entrance armed before Exit, within the sequence timeout -> Entered
//! - Exit armed strictly before Entrance, within the sequence timeout -> Exited
//!
//! Both beams arming on the same tick resolves to Entered and is counted as
//! an ambiguous tie.
//!
//! A fired pair is consumed (both arms cleared) and a beam has to see a clear
//! reading before it can arm again, so a person standing in the doorway cannot
//! produce repeated events. Arms older than the timeout expire on their own.

use crate::domain::types::{CrossingEvent, SensorId, SensorSample};
use serde::Deserialize;
use tracing::{debug, info};

/// What an absent ("no echo") reading does to an armed sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoEchoPolicy {
    /// Keep an existing arm; only a measured clear distance disarms. The
    /// latch is still released, so the next in-range reading can arm again.
    #[default]
    Hold,
    /// Treat the missing reading like a clear one
    Clear,
}

impl NoEchoPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoEchoPolicy::Hold => "hold",
            NoEchoPolicy::Clear => "clear",
        }
    }
}

/// Tuning for the crossing detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    /// Readings strictly below this distance mean "beam interrupted"
    pub threshold_distance: f64,
    /// Maximum age of an arm that can still pair with the other sensor
    pub sequence_timeout_ms: u64,
    /// Consecutive in-range readings needed before a sensor arms
    pub min_stable_samples: u32,
    /// Readings below this are implausible and treated as no echo
    pub min_valid_distance: f64,
    /// Readings above this are implausible and treated as no echo
    pub max_valid_distance: f64,
    pub no_echo: NoEchoPolicy,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            threshold_distance: 75.0,
            sequence_timeout_ms: 3000,
            min_stable_samples: 1,
            min_valid_distance: 2.0,
            max_valid_distance: 400.0,
            no_echo: NoEchoPolicy::Hold,
        }
    }
}

/// How a single reading is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reading {
    Triggered,
    Clear,
    NoEcho,
}

/// Arm state of one sensor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmState {
    armed: bool,
    /// Tick of the most recent arming edge
    armed_at_ms: u64,
    /// The current in-range stretch already produced an arm (possibly consumed
    /// or expired since); released by a clear or no-echo reading
    latched: bool,
    /// Consecutive in-range readings
    in_range_run: u32,
}

impl ArmState {
    #[inline]
    pub fn armed(&self) -> bool {
        self.armed
    }

    /// Tick of the most recent arming edge (meaningful while armed)
    #[inline]
    pub fn armed_at_ms(&self) -> u64 {
        self.armed_at_ms
    }

    /// Age of the current arm, saturating if the clock stepped backwards
    #[inline]
    fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.armed_at_ms)
    }

    fn disarm_and_unlatch(&mut self) {
        self.armed = false;
        self.latched = false;
        self.in_range_run = 0;
    }
}

/// Diagnostic counters for anomalies the detector heals by itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    /// Arms dropped because the other sensor never followed in time
    pub stale_expirations: u64,
    /// Both sensors armed on the same tick; resolved as Entered
    pub ambiguous_ties: u64,
}

/// Two-sensor ordered-pair state machine
pub struct CrossingDetector {
    settings: DetectorSettings,
    /// Indexed by `SensorId::index()`
    arms: [ArmState; 2],
    stats: DetectorStats,
}

impl CrossingDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings, arms: [ArmState::default(); 2], stats: DetectorStats::default() }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn arm_state(&self, sensor: SensorId) -> &ArmState {
        &self.arms[sensor.index()]
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    /// Process one tick worth of samples.
    ///
    /// Both arm states are updated first, then stale arms expire, then the
    /// ordered-pair rule is evaluated. Returns at most one event.
    pub fn process_tick(
        &mut self,
        entrance: &SensorSample,
        exit: &SensorSample,
        now_ms: u64,
    ) -> Option<CrossingEvent> {
        self.update_arm(SensorId::Entrance, entrance.distance, now_ms);
        self.update_arm(SensorId::Exit, exit.distance, now_ms);
        self.expire_stale(now_ms);
        self.evaluate_pair(now_ms)
    }

    /// Drop both arms (operator reset). Beams still interrupted stay latched.
    pub fn reset(&mut self) {
        for arm in &mut self.arms {
            arm.armed = false;
        }
    }

    /// Whether a reading is a usable echo (present, finite, plausible)
    pub fn is_echo(&self, distance: Option<f64>) -> bool {
        self.classify(distance) != Reading::NoEcho
    }

    fn classify(&self, distance: Option<f64>) -> Reading {
        let Some(d) = distance else {
            return Reading::NoEcho;
        };
        if !d.is_finite()
            || d < self.settings.min_valid_distance
            || d > self.settings.max_valid_distance
        {
            return Reading::NoEcho;
        }
        if d < self.settings.threshold_distance {
            Reading::Triggered
        } else {
            Reading::Clear
        }
    }

    fn update_arm(&mut self, sensor: SensorId, distance: Option<f64>, now_ms: u64) {
        let reading = match self.classify(distance) {
            Reading::NoEcho if self.settings.no_echo == NoEchoPolicy::Clear => Reading::Clear,
            other => other,
        };
        let min_stable = self.settings.min_stable_samples.max(1);
        let arm = &mut self.arms[sensor.index()];

        match reading {
            Reading::Triggered => {
                arm.in_range_run = arm.in_range_run.saturating_add(1);
                if !arm.armed && !arm.latched && arm.in_range_run >= min_stable {
                    arm.armed = true;
                    arm.latched = true;
                    arm.armed_at_ms = now_ms;
                    debug!(sensor = %sensor, at_ms = %now_ms, distance = ?distance, "sensor_armed");
                }
            }
            Reading::Clear => {
                if arm.armed {
                    debug!(
                        sensor = %sensor,
                        armed_for_ms = %arm.age_ms(now_ms),
                        "sensor_cleared"
                    );
                }
                arm.disarm_and_unlatch();
            }
            Reading::NoEcho => {
                // An idle beam with nothing to reflect off reads no echo
                arm.latched = false;
                arm.in_range_run = 0;
            }
        }
    }

    fn expire_stale(&mut self, now_ms: u64) {
        let timeout = self.settings.sequence_timeout_ms;
        for sensor in SensorId::ALL {
            let arm = &mut self.arms[sensor.index()];
            if arm.armed && arm.age_ms(now_ms) > timeout {
                arm.armed = false;
                self.stats.stale_expirations += 1;
                info!(
                    sensor = %sensor,
                    armed_at_ms = %arm.armed_at_ms,
                    age_ms = %arm.age_ms(now_ms),
                    "arm_expired"
                );
            }
        }
    }

    fn evaluate_pair(&mut self, now_ms: u64) -> Option<CrossingEvent> {
        let timeout = self.settings.sequence_timeout_ms;
        let entrance = self.arms[SensorId::Entrance.index()];
        let exit = self.arms[SensorId::Exit.index()];

        if !(entrance.armed && exit.armed) {
            return None;
        }

        let event = if exit.armed_at_ms >= entrance.armed_at_ms
            && entrance.age_ms(now_ms) < timeout
        {
            if exit.armed_at_ms == entrance.armed_at_ms {
                self.stats.ambiguous_ties += 1;
                debug!(at_ms = %now_ms, "crossing_ambiguous");
            }
            CrossingEvent::Entered { at_ms: now_ms }
        } else if entrance.armed_at_ms > exit.armed_at_ms && exit.age_ms(now_ms) < timeout {
            CrossingEvent::Exited { at_ms: now_ms }
        } else {
            return None;
        };

        // Consume the pair
        for arm in &mut self.arms {
            arm.armed = false;
        }
        debug!(
            kind = %event.as_str(),
            entrance_armed_at_ms = %entrance.armed_at_ms,
            exit_armed_at_ms = %exit.armed_at_ms,
            "crossing_detected"
        );
        Some(event)
    }
}
