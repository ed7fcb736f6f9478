//! Service loop - drives the monitor on a fixed tick cadence
//!
//! Ticks run on a tokio interval. Each tick is wrapped in `block_in_place`
//! because a range source may block for a ranging cycle. A cycle that finds
//! queued operator commands handles only those and skips measuring, so a reset
//! and a crossing never land in the same cycle. A fresh snapshot is published
//! after every cycle for the status server.

use crate::domain::types::{epoch_ms, SensorId};
use crate::infra::metrics::Metrics;
use crate::io::range_source::RangeSource;
use crate::io::status_server::ControlCmd;
use crate::services::monitor::{DoorwayMonitor, EventSink, MonitorSnapshot, TickReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Monotonic millisecond clock anchored to wall time at start, so tick
/// times double as epoch milliseconds without ever going backwards.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    epoch_at_start_ms: u64,
    started: Instant,
}

impl TickClock {
    pub fn new() -> Self {
        Self { epoch_at_start_ms: epoch_ms(), started: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_at_start_ms + self.started.elapsed().as_millis() as u64
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DoorwayService<S: EventSink, R: RangeSource> {
    monitor: DoorwayMonitor<S>,
    source: R,
    metrics: Arc<Metrics>,
    snapshot_tx: watch::Sender<MonitorSnapshot>,
    control_rx: mpsc::Receiver<ControlCmd>,
    tick_interval: Duration,
}

impl<S: EventSink, R: RangeSource> DoorwayService<S, R> {
    pub fn new(
        monitor: DoorwayMonitor<S>,
        source: R,
        metrics: Arc<Metrics>,
        snapshot_tx: watch::Sender<MonitorSnapshot>,
        control_rx: mpsc::Receiver<ControlCmd>,
        tick_interval_ms: u64,
    ) -> Self {
        Self {
            monitor,
            source,
            metrics,
            snapshot_tx,
            control_rx,
            tick_interval: Duration::from_millis(tick_interval_ms.max(1)),
        }
    }

    pub fn monitor(&self) -> &DoorwayMonitor<S> {
        &self.monitor
    }

    /// One measured tick, with metrics and snapshot publication
    pub fn run_tick(&mut self, now_ms: u64) -> TickReport {
        let start = Instant::now();
        let report = self.monitor.tick(&mut self.source, now_ms);

        self.metrics.record_tick(start.elapsed().as_micros() as u64);
        self.metrics.record_stale_expirations(report.stale_expirations);
        if report.underflow {
            self.metrics.record_underflow_clamp();
        }
        for sensor in SensorId::ALL {
            if report.no_echo[sensor.index()] {
                self.metrics.record_no_echo(sensor);
            }
        }
        self.metrics.set_occupancy(report.state.occupant_count, report.state.occupied);

        self.publish(now_ms);
        report
    }

    /// Apply queued operator commands. Returns how many were handled.
    pub fn drain_control(&mut self, now_ms: u64) -> usize {
        let mut handled = 0;
        while let Ok(cmd) = self.control_rx.try_recv() {
            handled += 1;
            match cmd {
                ControlCmd::ResetOccupancy => {
                    let before = self.monitor.state().occupant_count;
                    let update = self.monitor.reset(now_ms);
                    self.metrics.record_reset();
                    self.metrics.set_occupancy(update.state.occupant_count, update.state.occupied);
                    info!(previous_count = %before, at_ms = %now_ms, "occupancy_reset");
                }
            }
        }
        if handled > 0 {
            self.publish(now_ms);
        }
        handled
    }

    /// One loop cycle: queued commands if there are any, otherwise a tick
    pub fn cycle(&mut self, now_ms: u64) -> Option<TickReport> {
        if self.drain_control(now_ms) > 0 {
            return None;
        }
        Some(self.run_tick(now_ms))
    }

    fn publish(&self, now_ms: u64) {
        // No receivers is fine: the status server may be disabled
        let _ = self.snapshot_tx.send(self.monitor.snapshot(now_ms));
    }

    /// Tick until shutdown. Needs the multi-threaded runtime for `block_in_place`.
    pub async fn run(mut self, clock: TickClock, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_interval_ms = %self.tick_interval.as_millis(), "service_loop_started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::task::block_in_place(|| {
                        self.cycle(clock.now_ms());
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let state = self.monitor.state();
        info!(
            occupant_count = %state.occupant_count,
            occupied = %state.occupied,
            ticks = %self.metrics.ticks_total(),
            "service_loop_stopped"
        );
    }
}
