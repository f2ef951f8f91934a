//! Gateway metrics, exposed in Prometheus text format.
//!
//! The registry is one more [`PollObserver`]; pollers feed it blindly and
//! the exporter endpoint is optional (no `METRICS_PORT` means no listener,
//! and a bind failure is logged and bypassed, never fatal).

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::poll::observer::PollObserver;
use crate::tags::structures::PlcName;

const RECENT_ERRORS_CAP: u32 = 10;

/// Prometheus default buckets, in seconds.
const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Default)]
struct PlcSeries {
    ip: String,
    last_backoff_s: f64,
    fail_count: u32,
    reconnect_total: u64,
    connected: bool,
    recent_errors: u32,
}

#[derive(Debug)]
struct LatencyHistogram {
    counts: [u64; LATENCY_BUCKETS.len() + 1],
    sum: f64,
    count: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        LatencyHistogram {
            counts: [0; LATENCY_BUCKETS.len() + 1],
            sum: 0.0,
            count: 0,
        }
    }
}

impl LatencyHistogram {
    fn observe(&mut self, seconds: f64) {
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.counts[i] += 1;
            }
        }
        *self.counts.last_mut().unwrap() += 1; // +Inf
        self.sum += seconds;
        self.count += 1;
    }
}

/// Per-PLC gauges/counters plus the poll latency histogram.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    plcs: RwLock<HashMap<PlcName, PlcSeries>>,
    latency: Mutex<LatencyHistogram>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plc: PlcName, ip: &str) {
        let mut plcs = self.plcs.write().unwrap();
        plcs.entry(plc).or_insert_with(|| PlcSeries {
            ip: ip.to_string(),
            ..Default::default()
        });
    }

    /// Render every series in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let plcs = self.plcs.read().unwrap();
        let mut keys: Vec<_> = plcs.keys().copied().collect();
        keys.sort_by_key(|p| p.as_str());

        let gauge = |out: &mut String, name: &str, help: &str| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
        };

        gauge(
            &mut out,
            "vs_opc_plc_last_backoff_seconds",
            "Last backoff delay seconds",
        );
        for plc in &keys {
            let s = &plcs[plc];
            let _ = writeln!(
                out,
                "vs_opc_plc_last_backoff_seconds{{plc=\"{plc}\",ip=\"{}\"}} {}",
                s.ip, s.last_backoff_s
            );
        }

        gauge(&mut out, "vs_opc_plc_fail_count", "Current PLC fail count");
        for plc in &keys {
            let s = &plcs[plc];
            let _ = writeln!(
                out,
                "vs_opc_plc_fail_count{{plc=\"{plc}\",ip=\"{}\"}} {}",
                s.ip, s.fail_count
            );
        }

        let _ = writeln!(out, "# HELP vs_opc_plc_reconnect_total Total reconnect attempts");
        let _ = writeln!(out, "# TYPE vs_opc_plc_reconnect_total counter");
        for plc in &keys {
            let s = &plcs[plc];
            let _ = writeln!(
                out,
                "vs_opc_plc_reconnect_total{{plc=\"{plc}\",ip=\"{}\"}} {}",
                s.ip, s.reconnect_total
            );
        }

        gauge(&mut out, "vs_opc_plc_connected", "PLC connected boolean (1/0)");
        for plc in &keys {
            let s = &plcs[plc];
            let _ = writeln!(
                out,
                "vs_opc_plc_connected{{plc=\"{plc}\",ip=\"{}\"}} {}",
                s.ip,
                u8::from(s.connected)
            );
        }

        gauge(
            &mut out,
            "vs_opc_plc_recent_errors_count",
            "Number of recent errors stored",
        );
        for plc in &keys {
            let s = &plcs[plc];
            let _ = writeln!(
                out,
                "vs_opc_plc_recent_errors_count{{plc=\"{plc}\",ip=\"{}\"}} {}",
                s.ip, s.recent_errors
            );
        }
        drop(plcs);

        let hist = self.latency.lock().unwrap();
        let _ = writeln!(out, "# HELP vs_opc_poll_latency_seconds PLC poll loop latency seconds");
        let _ = writeln!(out, "# TYPE vs_opc_poll_latency_seconds histogram");
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                out,
                "vs_opc_poll_latency_seconds_bucket{{le=\"{bound}\"}} {}",
                hist.counts[i]
            );
        }
        let _ = writeln!(
            out,
            "vs_opc_poll_latency_seconds_bucket{{le=\"+Inf\"}} {}",
            hist.counts[LATENCY_BUCKETS.len()]
        );
        let _ = writeln!(out, "vs_opc_poll_latency_seconds_sum {}", hist.sum);
        let _ = writeln!(out, "vs_opc_poll_latency_seconds_count {}", hist.count);

        out
    }

    fn with_series(&self, plc: PlcName, ip: &str, f: impl FnOnce(&mut PlcSeries)) {
        let mut plcs = self.plcs.write().unwrap();
        let series = plcs.entry(plc).or_insert_with(|| PlcSeries {
            ip: ip.to_string(),
            ..Default::default()
        });
        f(series);
    }
}

impl PollObserver for MetricsRegistry {
    fn on_connected(&self, plc: PlcName, ip: &str) {
        self.with_series(plc, ip, |s| {
            s.connected = true;
            s.fail_count = 0;
            s.last_backoff_s = 0.0;
            s.reconnect_total += 1;
        });
    }

    fn on_read_ok(&self, plc: PlcName, ip: &str) {
        self.with_series(plc, ip, |s| {
            s.connected = true;
            s.fail_count = 0;
            s.last_backoff_s = 0.0;
        });
    }

    fn on_failure(&self, plc: PlcName, ip: &str, fail_count: u32, _error: &str) {
        self.with_series(plc, ip, |s| {
            s.connected = false;
            s.fail_count = fail_count;
            s.recent_errors = (s.recent_errors + 1).min(RECENT_ERRORS_CAP);
        });
    }

    fn on_backoff(&self, plc: PlcName, ip: &str, seconds: f64) {
        self.with_series(plc, ip, |s| s.last_backoff_s = seconds);
    }

    fn on_cycle(&self, _plc: PlcName, latency: Duration) {
        self.latency.lock().unwrap().observe(latency.as_secs_f64());
    }
}

async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.render(),
    )
}

/// Serve `GET /metrics` on the given port until cancelled. A bind failure
/// is logged and swallowed; the gateway keeps running without metrics.
pub async fn serve(registry: Arc<MetricsRegistry>, port: u16, cancel: CancellationToken) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("metrics exporter disabled, cannot bind {addr}: {e}");
            return;
        }
    };
    info!("Prometheus metrics on http://{addr}/metrics");
    let shutdown = cancel.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!("metrics exporter failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reports_backoff_and_connection_state() {
        let registry = MetricsRegistry::new();
        registry.register(PlcName::Compactlogix, "10.0.0.2");
        registry.on_failure(PlcName::Compactlogix, "10.0.0.2", 3, "boom");
        registry.on_backoff(PlcName::Compactlogix, "10.0.0.2", 4.0);

        let text = registry.render();
        assert!(text.contains(
            "vs_opc_plc_last_backoff_seconds{plc=\"compactlogix\",ip=\"10.0.0.2\"} 4"
        ));
        assert!(text.contains("vs_opc_plc_fail_count{plc=\"compactlogix\",ip=\"10.0.0.2\"} 3"));
        assert!(text.contains("vs_opc_plc_connected{plc=\"compactlogix\",ip=\"10.0.0.2\"} 0"));
    }

    #[test]
    fn connect_resets_gauges_and_counts_reconnects() {
        let registry = MetricsRegistry::new();
        registry.on_failure(PlcName::Slc500, "10.0.0.3", 1, "x");
        registry.on_backoff(PlcName::Slc500, "10.0.0.3", 1.0);
        registry.on_connected(PlcName::Slc500, "10.0.0.3");

        let text = registry.render();
        assert!(text.contains("vs_opc_plc_last_backoff_seconds{plc=\"slc500\",ip=\"10.0.0.3\"} 0"));
        assert!(text.contains("vs_opc_plc_fail_count{plc=\"slc500\",ip=\"10.0.0.3\"} 0"));
        assert!(text.contains("vs_opc_plc_reconnect_total{plc=\"slc500\",ip=\"10.0.0.3\"} 1"));
        assert!(text.contains("vs_opc_plc_connected{plc=\"slc500\",ip=\"10.0.0.3\"} 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let registry = MetricsRegistry::new();
        registry.on_cycle(PlcName::Compactlogix, Duration::from_millis(3));
        registry.on_cycle(PlcName::Compactlogix, Duration::from_millis(80));

        let text = registry.render();
        assert!(text.contains("vs_opc_poll_latency_seconds_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("vs_opc_poll_latency_seconds_bucket{le=\"0.1\"} 2"));
        assert!(text.contains("vs_opc_poll_latency_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("vs_opc_poll_latency_seconds_count 2"));
    }
}
