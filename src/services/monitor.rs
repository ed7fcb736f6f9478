//! Doorway monitor - the per-tick pipeline
//!
//! One tick runs measure -> detect -> track -> notify, synchronously and to
//! completion. Taking `&mut self` keeps ticks from overlapping. Time is always
//! supplied by the caller so the whole pipeline runs on synthetic clocks in
//! tests.

use crate::domain::types::{
    CompletedSession, CrossingEvent, OccupancyState, SensorId, SensorSample,
};
use crate::io::range_source::RangeSource;
use crate::services::crossing_detector::{CrossingDetector, DetectorSettings};
use crate::services::occupancy_tracker::{OccupancyTracker, TrackerUpdate};
use serde::Serialize;
use tracing::{info, warn};

/// Receiver of occupancy notifications. Called synchronously inside the tick;
/// implementations must not call back into the monitor.
pub trait EventSink {
    /// Every crossing, after the tracker has applied it
    fn on_crossing(&mut self, _event: &CrossingEvent, _state: &OccupancyState) {}

    /// Exactly once per Empty <-> Occupied transition
    fn on_occupancy_changed(&mut self, occupied: bool, at_ms: u64);

    /// Once per completed session, after the matching occupancy change
    fn on_session_completed(&mut self, session: &CompletedSession);

    /// A sensor crossed the no-echo limit (`unresponsive == true`) or returned
    /// a usable reading after having crossed it
    fn on_sensor_health(&mut self, _sensor: SensorId, _unresponsive: bool, _at_ms: u64) {}
}

/// What happened during one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub event: Option<CrossingEvent>,
    pub state: OccupancyState,
    /// Arms that expired on this tick
    pub stale_expirations: u64,
    /// An exit arrived with the count already at zero
    pub underflow: bool,
    /// Per sensor (by `SensorId::index`), whether the reading carried no echo
    pub no_echo: [bool; 2],
}

/// Consecutive no-echo tracking for one sensor
#[derive(Debug, Clone, Copy, Default)]
struct SensorHealth {
    consecutive_no_echo: u32,
    unresponsive: bool,
    last_distance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub sensor: SensorId,
    pub armed: bool,
    pub armed_at_ms: Option<u64>,
    pub last_distance: Option<f64>,
    pub consecutive_no_echo: u32,
    pub unresponsive: bool,
}

/// Point-in-time view of the monitor for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub now_ms: u64,
    pub occupant_count: u32,
    pub occupied: bool,
    pub occupied_since_ms: Option<u64>,
    /// Length of the open session so far
    pub occupied_for_ms: Option<u64>,
    pub sensors: Vec<SensorSnapshot>,
    pub last_event: Option<CrossingEvent>,
    pub ticks: u64,
    pub entries_total: u64,
    pub exits_total: u64,
    pub sessions_completed: u64,
    pub occupied_ms_total: u64,
    pub stale_expirations: u64,
    pub ambiguous_ties: u64,
    pub underflow_clamps: u64,
}

pub struct DoorwayMonitor<S: EventSink> {
    detector: CrossingDetector,
    tracker: OccupancyTracker,
    sink: S,
    health: [SensorHealth; 2],
    /// No-echo ticks before a sensor is reported unresponsive (0 disables)
    unresponsive_after: u32,
    last_event: Option<CrossingEvent>,
    ticks: u64,
}

impl<S: EventSink> DoorwayMonitor<S> {
    pub fn new(settings: DetectorSettings, unresponsive_after: u32, sink: S) -> Self {
        Self {
            detector: CrossingDetector::new(settings),
            tracker: OccupancyTracker::new(),
            sink,
            health: [SensorHealth::default(); 2],
            unresponsive_after,
            last_event: None,
            ticks: 0,
        }
    }

    pub fn detector(&self) -> &CrossingDetector {
        &self.detector
    }

    pub fn tracker(&self) -> &OccupancyTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn state(&self) -> OccupancyState {
        self.tracker.state()
    }

    /// Measure both sensors and run the pipeline
    pub fn tick<R: RangeSource + ?Sized>(&mut self, source: &mut R, now_ms: u64) -> TickReport {
        source.begin_tick(now_ms);
        let entrance =
            SensorSample::new(SensorId::Entrance, source.measure(SensorId::Entrance), now_ms);
        let exit = SensorSample::new(SensorId::Exit, source.measure(SensorId::Exit), now_ms);
        self.process(&entrance, &exit, now_ms)
    }

    /// Run the pipeline on samples that were already taken
    pub fn process(
        &mut self,
        entrance: &SensorSample,
        exit: &SensorSample,
        now_ms: u64,
    ) -> TickReport {
        self.ticks += 1;
        let no_echo = [self.observe(entrance, now_ms), self.observe(exit, now_ms)];

        let stale_before = self.detector.stats().stale_expirations;
        let clamps_before = self.tracker.stats().underflow_clamps;

        let event = self.detector.process_tick(entrance, exit, now_ms);
        if let Some(event) = event {
            self.last_event = Some(event);
            let update = self.tracker.apply(&event, now_ms);
            match event {
                CrossingEvent::Entered { .. } => {
                    info!(at_ms = %now_ms, occupant_count = %update.state.occupant_count, "crossing_entered")
                }
                CrossingEvent::Exited { .. } => {
                    info!(at_ms = %now_ms, occupant_count = %update.state.occupant_count, "crossing_exited")
                }
            }
            self.sink.on_crossing(&event, &update.state);
            self.notify(&update, now_ms);
        }

        TickReport {
            event,
            state: self.tracker.state(),
            stale_expirations: self.detector.stats().stale_expirations - stale_before,
            underflow: self.tracker.stats().underflow_clamps > clamps_before,
            no_echo,
        }
    }

    /// Operator reset: drop both arms and force the room empty
    pub fn reset(&mut self, now_ms: u64) -> TrackerUpdate {
        self.detector.reset();
        let update = self.tracker.reset(now_ms);
        self.notify(&update, now_ms);
        update
    }

    pub fn snapshot(&self, now_ms: u64) -> MonitorSnapshot {
        let state = self.tracker.state();
        let detector_stats = self.detector.stats();
        let tracker_stats = self.tracker.stats();

        let sensors = SensorId::ALL
            .iter()
            .map(|&sensor| {
                let arm = self.detector.arm_state(sensor);
                let health = &self.health[sensor.index()];
                SensorSnapshot {
                    sensor,
                    armed: arm.armed(),
                    armed_at_ms: arm.armed().then(|| arm.armed_at_ms()),
                    last_distance: health.last_distance,
                    consecutive_no_echo: health.consecutive_no_echo,
                    unresponsive: health.unresponsive,
                }
            })
            .collect();

        MonitorSnapshot {
            now_ms,
            occupant_count: state.occupant_count,
            occupied: state.occupied,
            occupied_since_ms: state.occupied_since_ms,
            occupied_for_ms: state.occupied_since_ms.map(|since| now_ms.saturating_sub(since)),
            sensors,
            last_event: self.last_event,
            ticks: self.ticks,
            entries_total: tracker_stats.entries_total,
            exits_total: tracker_stats.exits_total,
            sessions_completed: tracker_stats.sessions_completed,
            occupied_ms_total: tracker_stats.occupied_ms_total,
            stale_expirations: detector_stats.stale_expirations,
            ambiguous_ties: detector_stats.ambiguous_ties,
            underflow_clamps: tracker_stats.underflow_clamps,
        }
    }

    fn notify(&mut self, update: &TrackerUpdate, now_ms: u64) {
        if let Some(occupied) = update.transition {
            self.sink.on_occupancy_changed(occupied, now_ms);
        }
        if let Some(ref session) = update.session {
            self.sink.on_session_completed(session);
        }
    }

    /// Update sensor health, returns true when the sample carried no echo
    fn observe(&mut self, sample: &SensorSample, now_ms: u64) -> bool {
        let no_echo = !self.detector.is_echo(sample.distance);
        let health = &mut self.health[sample.sensor.index()];
        health.last_distance = sample.distance;

        if !no_echo {
            if health.unresponsive {
                info!(
                    sensor = %sample.sensor,
                    silent_ticks = %health.consecutive_no_echo,
                    "sensor_recovered"
                );
                self.sink.on_sensor_health(sample.sensor, false, now_ms);
            }
            health.consecutive_no_echo = 0;
            health.unresponsive = false;
            return false;
        }

        health.consecutive_no_echo = health.consecutive_no_echo.saturating_add(1);
        if self.unresponsive_after > 0
            && !health.unresponsive
            && health.consecutive_no_echo >= self.unresponsive_after
        {
            health.unresponsive = true;
            warn!(
                sensor = %sample.sensor,
                silent_ticks = %health.consecutive_no_echo,
                "sensor_unresponsive"
            );
            self.sink.on_sensor_health(sample.sensor, true, now_ms);
        }
        true
    }
}
