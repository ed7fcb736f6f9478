//! IO modules - external system interfaces
//!
//! - `range_source` - distance sources, including capture replay
//! - `webhook` - occupancy and sensor alert webhooks, and their worker
//! - `session_log` - completed sessions to file (JSONL format)
//! - `status_server` - status JSON, dashboard, Prometheus metrics and reset

pub mod range_source;
pub mod session_log;
pub mod status_server;
pub mod webhook;

// Re-export commonly used types
pub use range_source::{CaptureFrame, RangeSource, ReplaySource};
pub use session_log::SessionLog;
pub use status_server::{start_status_server, ControlCmd, StatusContext};
pub use webhook::{create_webhook_worker, WebhookCmd, WebhookEvent, WebhookNotifier, WebhookWorker};
