//! Service event sink - fans monitor notifications out to the adapters
//!
//! Runs inside the tick, so everything here is non-blocking: webhooks (occupancy
//! transitions and sensor alerts) are queued with `try_send` and the session
//! log is a single small append.

use crate::domain::types::{CompletedSession, CrossingEvent, OccupancyState, SensorId};
use crate::infra::metrics::Metrics;
use crate::io::session_log::SessionLog;
use crate::io::webhook::{WebhookCmd, WebhookEvent};
use crate::services::monitor::EventSink;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

pub struct ServiceSink {
    metrics: Arc<Metrics>,
    webhook_tx: Option<mpsc::Sender<WebhookCmd>>,
    session_log: Option<SessionLog>,
}

impl ServiceSink {
    pub fn new(
        metrics: Arc<Metrics>,
        webhook_tx: Option<mpsc::Sender<WebhookCmd>>,
        session_log: Option<SessionLog>,
    ) -> Self {
        Self { metrics, webhook_tx, session_log }
    }

    fn enqueue_webhook(&self, event: WebhookEvent, at_ms: u64) {
        let Some(ref tx) = self.webhook_tx else {
            return;
        };
        let cmd = WebhookCmd { event, at_ms, enqueued_at: Instant::now() };
        match tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_webhook_dropped();
                warn!(event = %event.as_str(), at_ms = %at_ms, "webhook_queue_full");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_webhook_dropped();
                warn!(event = %event.as_str(), at_ms = %at_ms, "webhook_worker_gone");
            }
        }
    }
}

impl EventSink for ServiceSink {
    fn on_crossing(&mut self, event: &CrossingEvent, state: &OccupancyState) {
        match event {
            CrossingEvent::Entered { .. } => self.metrics.record_entry(),
            CrossingEvent::Exited { .. } => self.metrics.record_exit(),
        }
        self.metrics.set_occupancy(state.occupant_count, state.occupied);
    }

    fn on_occupancy_changed(&mut self, occupied: bool, at_ms: u64) {
        info!(occupied = %occupied, at_ms = %at_ms, "occupancy_changed");
        self.enqueue_webhook(WebhookEvent::Occupancy { occupied }, at_ms);
    }

    fn on_session_completed(&mut self, session: &CompletedSession) {
        info!(
            started_at_ms = %session.started_at_ms,
            ended_at_ms = %session.ended_at_ms,
            duration_ms = %session.duration_ms,
            peak_occupants = %session.peak_occupants,
            entries = %session.entries,
            "session_completed"
        );
        self.metrics.record_session(session.duration_ms);
        if let Some(ref log) = self.session_log {
            log.write_session(session);
        }
    }

    fn on_sensor_health(&mut self, sensor: SensorId, unresponsive: bool, at_ms: u64) {
        self.enqueue_webhook(WebhookEvent::SensorHealth { sensor, unresponsive }, at_ms);
    }
}
