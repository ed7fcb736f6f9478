//! Domain models - sensor samples, crossings and occupancy state
//!
//! - `SensorId` / `SensorSample` - one reading from one doorway sensor
//! - `CrossingEvent` - a detected entry or exit
//! - `OccupancyState` / `CompletedSession` - what the tracker reports

pub mod types;

pub use types::{CompletedSession, CrossingEvent, OccupancyState, SensorId, SensorSample};
