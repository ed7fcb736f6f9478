//! Occupant count and session state
//!
//! Folds Entered/Exited events into a count and the derived occupied flag.
//! This is the single owner of the occupant count; nothing else writes it.
//!
//! Key behaviors:
//! - `occupied` is always recomputed as `occupant_count > 0`
//! - A session opens on 0 -> 1 and closes on 1 -> 0
//! - Exits at zero are clamped and counted, never negative

use crate::domain::types::{CompletedSession, CrossingEvent, OccupancyState};
use tracing::{debug, warn};

/// Result of folding one event (or a reset) into the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerUpdate {
    pub state: OccupancyState,
    /// New occupied value when the Empty/Occupied boundary was crossed
    pub transition: Option<bool>,
    /// Present when the last occupant left
    pub session: Option<CompletedSession>,
}

/// Running totals kept alongside the state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub entries_total: u64,
    pub exits_total: u64,
    pub sessions_completed: u64,
    /// Sum of completed session durations
    pub occupied_ms_total: u64,
    /// Exits received with the count already at zero
    pub underflow_clamps: u64,
}

pub struct OccupancyTracker {
    state: OccupancyState,
    /// Peak count of the open session
    session_peak: u32,
    /// Entries folded into the open session
    session_entries: u32,
    stats: TrackerStats,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self {
            state: OccupancyState::default(),
            session_peak: 0,
            session_entries: 0,
            stats: TrackerStats::default(),
        }
    }

    pub fn state(&self) -> OccupancyState {
        self.state
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Apply a crossing event at tick `now_ms`
    pub fn apply(&mut self, event: &CrossingEvent, now_ms: u64) -> TrackerUpdate {
        match event {
            CrossingEvent::Entered { .. } => self.apply_entered(now_ms),
            CrossingEvent::Exited { .. } => self.apply_exited(now_ms),
        }
    }

    /// Force the count to zero, closing any open session at `now_ms`
    pub fn reset(&mut self, now_ms: u64) -> TrackerUpdate {
        if self.state.occupant_count == 0 {
            return self.update(None, None);
        }
        warn!(occupant_count = %self.state.occupant_count, "occupancy_reset");
        self.state.occupant_count = 0;
        self.recompute();
        let session = self.close_session(now_ms);
        self.update(Some(false), session)
    }

    fn apply_entered(&mut self, now_ms: u64) -> TrackerUpdate {
        self.stats.entries_total += 1;
        let was_empty = self.state.occupant_count == 0;

        self.state.occupant_count = self.state.occupant_count.saturating_add(1);
        self.recompute();

        if was_empty {
            self.state.occupied_since_ms = Some(now_ms);
            self.session_peak = 0;
            self.session_entries = 0;
        }
        self.session_entries += 1;
        self.session_peak = self.session_peak.max(self.state.occupant_count);

        debug!(occupant_count = %self.state.occupant_count, "occupant_added");
        self.update(was_empty.then_some(true), None)
    }

    fn apply_exited(&mut self, now_ms: u64) -> TrackerUpdate {
        self.stats.exits_total += 1;

        if self.state.occupant_count == 0 {
            self.stats.underflow_clamps += 1;
            self.recompute();
            warn!(underflow_clamps = %self.stats.underflow_clamps, "exit_while_empty");
            return self.update(None, None);
        }

        self.state.occupant_count -= 1;
        self.recompute();
        debug!(occupant_count = %self.state.occupant_count, "occupant_removed");

        if self.state.occupant_count > 0 {
            return self.update(None, None);
        }

        let session = self.close_session(now_ms);
        self.update(Some(false), session)
    }

    fn close_session(&mut self, now_ms: u64) -> Option<CompletedSession> {
        let started_at_ms = self.state.occupied_since_ms.take()?;
        let duration_ms = now_ms.saturating_sub(started_at_ms);

        self.stats.sessions_completed += 1;
        self.stats.occupied_ms_total += duration_ms;

        Some(CompletedSession {
            started_at_ms,
            ended_at_ms: now_ms,
            duration_ms,
            peak_occupants: self.session_peak,
            entries: self.session_entries,
        })
    }

    #[inline]
    fn recompute(&mut self) {
        self.state.occupied = self.state.occupant_count > 0;
    }

    #[inline]
    fn update(
        &self,
        transition: Option<bool>,
        session: Option<CompletedSession>,
    ) -> TrackerUpdate {
        TrackerUpdate { state: self.state, transition, session }
    }
}

impl Default for OccupancyTracker {
    fn default() -> Self {
        Self::new()
    }
}
