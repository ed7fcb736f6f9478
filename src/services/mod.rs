//! Services - detection, tracking and the tick pipeline
//!
//! - `crossing_detector` - ordered-pair direction detection from two beams
//! - `occupancy_tracker` - occupant count and sessions
//! - `monitor` - one tick: measure, detect, track, notify
//! - `notifier` - event sink feeding metrics, webhooks and the session log
//! - `service_loop` - tokio tick loop around the monitor

pub mod crossing_detector;
pub mod monitor;
pub mod notifier;
pub mod occupancy_tracker;
pub mod service_loop;

// Re-export commonly used types
pub use crossing_detector::{CrossingDetector, DetectorSettings, NoEchoPolicy};
pub use monitor::{DoorwayMonitor, EventSink, MonitorSnapshot, TickReport};
pub use notifier::ServiceSink;
pub use occupancy_tracker::OccupancyTracker;
pub use service_loop::{DoorwayService, TickClock};
