//! Status HTTP endpoint
//!
//! - `GET /status`  JSON snapshot of occupancy, sensors and counters
//! - `GET /`        small HTML dashboard that polls `/status`
//! - `GET /metrics` Prometheus text format
//! - `POST /reset`  operator reset of the occupant count
//!
//! The server never touches the monitor directly. It reads the latest snapshot
//! from a watch channel and forwards resets to the tick loop over mpsc.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_NUM_BUCKETS, METRICS_SESSION_BUCKET_BOUNDS,
    METRICS_TICK_BUCKET_BOUNDS,
};
use crate::services::monitor::MonitorSnapshot;
use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Operator commands handled between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCmd {
    ResetOccupancy,
}

/// Everything a request handler needs
pub struct StatusContext {
    pub site_id: String,
    pub version: &'static str,
    pub started_at: Instant,
    pub snapshot_rx: watch::Receiver<MonitorSnapshot>,
    pub metrics: Arc<Metrics>,
    pub control_tx: mpsc::Sender<ControlCmd>,
}

#[derive(Debug, Serialize)]
struct StatusResponse<'a> {
    site: &'a str,
    version: &'a str,
    uptime_secs: u64,
    #[serde(flatten)]
    monitor: MonitorSnapshot,
    webhook_sent: u64,
    webhook_failed: u64,
    webhook_dropped: u64,
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Doorway occupancy</title>
<style>
body { font-family: sans-serif; margin: 2em; background: #111; color: #eee; }
#state { font-size: 3em; font-weight: bold; }
.occupied { color: #f55; }
.empty { color: #5f5; }
table { border-collapse: collapse; margin-top: 1em; }
td, th { padding: 0.3em 1em; border-bottom: 1px solid #333; text-align: left; }
</style>
</head>
<body>
<div id="state">...</div>
<div id="detail"></div>
<table id="sensors"><tr><th>sensor</th><th>distance</th><th>armed</th><th>health</th></tr></table>
<p><button onclick="fetch('/reset', {method: 'POST'}).then(refresh)">Reset occupancy</button></p>
<script>
function fmtDuration(ms) {
  if (ms == null) return '-';
  const s = Math.floor(ms / 1000);
  return Math.floor(s / 3600) + 'h ' + Math.floor((s % 3600) / 60) + 'm ' + (s % 60) + 's';
}
function refresh() {
  fetch('/status').then(r => r.json()).then(s => {
    const state = document.getElementById('state');
    state.textContent = s.occupied ? 'OCCUPIED (' + s.occupant_count + ')' : 'EMPTY';
    state.className = s.occupied ? 'occupied' : 'empty';
    document.getElementById('detail').textContent =
      s.site + ' | session ' + fmtDuration(s.occupied_for_ms) +
      ' | entries ' + s.entries_total + ' | exits ' + s.exits_total +
      ' | sessions ' + s.sessions_completed + ' | version ' + s.version;
    const table = document.getElementById('sensors');
    while (table.rows.length > 1) table.deleteRow(1);
    for (const sensor of s.sensors) {
      const row = table.insertRow();
      row.insertCell().textContent = sensor.sensor;
      row.insertCell().textContent = sensor.last_distance == null ? 'no echo' : sensor.last_distance.toFixed(1);
      row.insertCell().textContent = sensor.armed ? 'yes' : 'no';
      row.insertCell().textContent = sensor.unresponsive ? 'unresponsive' : 'ok';
    }
  }).catch(() => {});
}
refresh();
setInterval(refresh, 1000);
</script>
</body>
</html>
"#;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter split by sensor label
fn write_sensor_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (sensor, val) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",sensor=\"{sensor}\"}} {val}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_occupancy_metrics(&mut output, site, summary);
    write_tick_metrics(&mut output, site, summary);
    write_anomaly_metrics(&mut output, site, summary);
    write_webhook_metrics(&mut output, site, summary);

    output
}

fn write_occupancy_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "doorway_occupants",
        "Current occupant count",
        MetricType::Gauge,
        site,
        summary.occupant_count,
    );
    write_metric(
        output,
        "doorway_occupied",
        "1 when the room is occupied",
        MetricType::Gauge,
        site,
        summary.occupied as u64,
    );
    write_metric(
        output,
        "doorway_entries_total",
        "Entered crossings detected",
        MetricType::Counter,
        site,
        summary.entries_total,
    );
    write_metric(
        output,
        "doorway_exits_total",
        "Exited crossings detected",
        MetricType::Counter,
        site,
        summary.exits_total,
    );
    // Session histogram is in seconds, so the sum is too
    write_histogram(
        output,
        "doorway_session_duration_seconds",
        "Completed session duration in seconds",
        site,
        &summary.session_duration_buckets,
        &METRICS_SESSION_BUCKET_BOUNDS,
        summary.session_duration_ms_sum / 1000,
    );
}

fn write_tick_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "doorway_ticks_total",
        "Sensor ticks processed",
        MetricType::Counter,
        site,
        summary.ticks_total,
    );
    let tick_count: u64 = summary.tick_lat_buckets.iter().sum();
    write_histogram(
        output,
        "doorway_tick_latency_us",
        "Tick processing latency in microseconds",
        site,
        &summary.tick_lat_buckets,
        &METRICS_TICK_BUCKET_BOUNDS,
        summary.avg_tick_latency_us * tick_count,
    );
    write_metric(
        output,
        "doorway_tick_latency_p99_us",
        "99th percentile tick latency",
        MetricType::Gauge,
        site,
        summary.tick_lat_p99_us,
    );
}

fn write_anomaly_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "doorway_stale_expirations_total",
        "Arms dropped after the sequence timeout",
        MetricType::Counter,
        site,
        summary.stale_expirations_total,
    );
    write_metric(
        output,
        "doorway_underflow_clamps_total",
        "Exits seen with no occupants",
        MetricType::Counter,
        site,
        summary.underflow_clamps_total,
    );
    write_metric(
        output,
        "doorway_resets_total",
        "Operator occupancy resets",
        MetricType::Counter,
        site,
        summary.resets_total,
    );
    write_sensor_counter(
        output,
        "doorway_no_echo_total",
        "Readings with no usable echo",
        site,
        &[("entrance", summary.no_echo_entrance_total), ("exit", summary.no_echo_exit_total)],
    );
}

fn write_webhook_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "doorway_webhook_sent_total",
        "Webhook calls that succeeded",
        MetricType::Counter,
        site,
        summary.webhook_sent_total,
    );
    write_metric(
        output,
        "doorway_webhook_failed_total",
        "Webhook calls that failed",
        MetricType::Counter,
        site,
        summary.webhook_failed_total,
    );
    write_metric(
        output,
        "doorway_webhook_dropped_total",
        "Webhook calls dropped on a full queue",
        MetricType::Counter,
        site,
        summary.webhook_dropped_total,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn status_json(ctx: &StatusContext) -> Response<Full<Bytes>> {
    let status = StatusResponse {
        site: &ctx.site_id,
        version: ctx.version,
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        monitor: ctx.snapshot_rx.borrow().clone(),
        webhook_sent: ctx.metrics.webhook_sent_total(),
        webhook_failed: ctx.metrics.webhook_failed_total(),
        webhook_dropped: ctx.metrics.webhook_dropped_total(),
    };
    match serde_json::to_string(&status) {
        Ok(body) => respond(StatusCode::OK, "application/json", body),
        Err(e) => {
            error!(error = %e, "status_serialize_failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "serialize failed")
        }
    }
}

fn reset(ctx: &StatusContext) -> Response<Full<Bytes>> {
    match ctx.control_tx.try_send(ControlCmd::ResetOccupancy) {
        Ok(()) => {
            info!("occupancy_reset_requested");
            respond(StatusCode::ACCEPTED, "application/json", r#"{"ok":true}"#)
        }
        Err(e) => {
            warn!(error = %e, "occupancy_reset_rejected");
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                r#"{"ok":false,"error":"control_queue_unavailable"}"#,
            )
        }
    }
}

/// Route one request
fn route(method: &Method, path: &str, ctx: &StatusContext) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/status") => status_json(ctx),
        (&Method::GET, "/") => respond(StatusCode::OK, "text/html; charset=utf-8", DASHBOARD_HTML),
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&ctx.metrics.snapshot(), &ctx.site_id),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        (&Method::POST, "/reset") => reset(ctx),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<StatusContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &ctx))
}

/// Serve on an already bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<StatusContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, ctx.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "status_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "status_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("status_server_shutdown");
                    return;
                }
            }
        }
    }
}

/// Bind and run the status server
pub async fn start_status_server(
    bind_address: &str,
    port: u16,
    ctx: Arc<StatusContext>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .with_context(|| format!("Invalid status bind address {}:{}", bind_address, port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server on {}", addr))?;

    info!(addr = %addr, site = %ctx.site_id, "status_server_started");
    serve(listener, ctx, shutdown).await;
    Ok(())
}
