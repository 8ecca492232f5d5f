//! Read-only HTTP status server.
//!
//! Exposes aggregator statistics in Prometheus text format at `/metrics`,
//! plus JSON views of the stats snapshot and the open windows.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::aggregator::AggregatorHandle;
use crate::persistence::Persister;
use crate::pskreporter::{PskReporter, PskReporterStats};
use crate::stats::{StatsSnapshot, StatsSummary, StatsTracker};
use crate::wsprnet::{WsprNetStatus, WsprNetSubmitter};

/// Everything the status endpoints read from.
#[derive(Clone)]
pub struct StatusState {
    pub stats: Arc<StatsTracker>,
    pub aggregator: AggregatorHandle,
    pub wsprnet: Option<Arc<WsprNetSubmitter>>,
    pub pskreporter: Option<Arc<PskReporter>>,
    pub persister: Arc<Persister>,
}

/// Point-in-time view used for `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub summary: StatsSummary,
    pub wsprnet: Option<WsprNetStatus>,
    pub pskreporter: Option<PskReporterStats>,
    pub persistence_saves: u64,
    pub persistence_failures: u64,
}

impl StatusState {
    pub fn report(&self) -> StatusReport {
        StatusReport {
            summary: self.stats.summary(),
            wsprnet: self.wsprnet.as_ref().map(|w| w.status()),
            pskreporter: self.pskreporter.as_ref().map(|p| p.stats()),
            persistence_saves: self.persister.saves(),
            persistence_failures: self.persister.failures(),
        }
    }
}

#[derive(Serialize)]
struct ApiStats {
    #[serde(flatten)]
    snapshot: StatsSnapshot,
    wsprnet: Option<WsprNetStatus>,
    pskreporter: Option<PskReporterStats>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/windows", get(windows_handler))
        .with_state(state)
}

/// Start the status server and run until `shutdown` fires.
///
/// Returns an error if the server fails to bind to the port.
pub async fn start_status_server(
    port: u16,
    state: StatusState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Status server listening on http://{}/metrics", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let output = format_prometheus_metrics(&state.report());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

async fn stats_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(ApiStats {
        snapshot: state.stats.snapshot(),
        wsprnet: state.wsprnet.as_ref().map(|w| w.status()),
        pskreporter: state.pskreporter.as_ref().map(|p| p.stats()),
    })
}

async fn windows_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.aggregator.open_windows().await)
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Format a status report as Prometheus text format.
pub fn format_prometheus_metrics(report: &StatusReport) -> String {
    let summary = &report.summary;
    let t = &summary.totals;
    let mut out = String::with_capacity(4096);

    push_metric(
        &mut out,
        "wspr_uptime_seconds",
        "gauge",
        "Time since the aggregator started",
        format!("{:.3}", summary.elapsed_secs),
    );

    for (name, help, value) in [
        ("wspr_spots_total", "Raw spots received from all instances", t.total_spots),
        ("wspr_deduped_spots_total", "Spots emitted after dedup", t.total_submitted),
        ("wspr_unique_spots_total", "Spots heard by a single instance", t.total_unique),
        ("wspr_duplicate_spots_total", "Spots that lost dedup", t.total_duplicates),
        ("wspr_tied_spots_total", "Spots that tied the winner's SNR", t.total_tied),
        ("wspr_windows_total", "Windows closed", t.total_windows),
        ("wspr_filtered_spots_total", "Spots with hashed or empty callsigns", t.filtered_spots),
        ("wspr_parse_failures_total", "MQTT payloads that failed to parse", t.parse_failures),
        ("wspr_dropped_spots_total", "Spots dropped on a full aggregator queue", t.dropped_spots),
        ("wspr_late_spots_total", "Spots for windows already closed", t.late_spots),
    ] {
        push_metric(&mut out, name, "counter", help, value);
    }

    // Per-instance counters
    if !summary.instances.is_empty() {
        out.push_str("# HELP wspr_instance_spots_total Spots per instance by dedup outcome\n");
        out.push_str("# TYPE wspr_instance_spots_total counter\n");
        for i in &summary.instances {
            let name = escape_label(&i.name);
            for (outcome, value) in [
                ("received", i.total_spots),
                ("unique", i.unique_spots),
                ("best_snr", i.best_snr_wins),
                ("tied", i.tied_snr),
                ("duplicate", i.duplicates),
            ] {
                let _ = writeln!(
                    out,
                    "wspr_instance_spots_total{{instance=\"{}\",outcome=\"{}\"}} {}",
                    name, outcome, value
                );
            }
        }
    }

    // Spots by band
    if !summary.spots_by_band.is_empty() {
        out.push_str("# HELP wspr_band_spots Deduped spots per band over the last 24h\n");
        out.push_str("# TYPE wspr_band_spots gauge\n");
        for (band, count) in &summary.spots_by_band {
            let _ = writeln!(out, "wspr_band_spots{{band=\"{}\"}} {}", escape_label(band), count);
        }
    }

    if let Some(ref snr) = summary.snr_percentiles {
        out.push_str("# HELP wspr_snr_db SNR distribution in decibels\n");
        out.push_str("# TYPE wspr_snr_db summary\n");
        let _ = writeln!(out, "wspr_snr_db{{quantile=\"0.5\"}} {}", snr.p50);
        let _ = writeln!(out, "wspr_snr_db{{quantile=\"0.9\"}} {}", snr.p90);
        let _ = writeln!(out, "wspr_snr_db_count {}", t.total_spots);
    }

    if let Some(ref w) = report.wsprnet {
        for (name, help, value) in [
            ("wsprnet_successful_total", "Spots accepted by WSPRNet", w.stats.successful),
            ("wsprnet_failed_total", "Spots WSPRNet submission gave up on", w.stats.failed),
            ("wsprnet_retries_total", "WSPRNet retry attempts", w.stats.retries),
            ("wsprnet_dropped_total", "Spots dropped on a full WSPRNet queue", w.dropped),
        ] {
            push_metric(&mut out, name, "counter", help, value);
        }
        if let Some(ref l) = w.latency_ms {
            out.push_str("# HELP wsprnet_post_latency_ms WSPRNet POST latency\n");
            out.push_str("# TYPE wsprnet_post_latency_ms summary\n");
            let _ = writeln!(out, "wsprnet_post_latency_ms{{quantile=\"0.5\"}} {}", l.p50);
            let _ = writeln!(out, "wsprnet_post_latency_ms{{quantile=\"0.9\"}} {}", l.p90);
            let _ = writeln!(out, "wsprnet_post_latency_ms{{quantile=\"0.99\"}} {}", l.p99);
        }
    }

    if let Some(ref p) = report.pskreporter {
        for (name, help, value) in [
            ("pskreporter_queued_total", "Reports queued for PSKReporter", p.queued),
            ("pskreporter_sent_reports_total", "Reports packed into packets", p.sent_reports),
            ("pskreporter_suppressed_total", "Reports suppressed as recent repeats", p.suppressed),
            ("pskreporter_packets_total", "Packets sent", p.packets_sent),
            ("pskreporter_send_errors_total", "UDP send failures", p.send_errors),
            ("pskreporter_queue_full_total", "Reports rejected on a full queue", p.queue_full),
        ] {
            push_metric(&mut out, name, "counter", help, value);
        }
    }

    push_metric(
        &mut out,
        "wspr_persistence_failures_total",
        "counter",
        "Failed stats snapshot writes",
        report.persistence_failures,
    );
    push_metric(
        &mut out,
        "wspr_persistence_saves_total",
        "counter",
        "Successful stats snapshot writes",
        report.persistence_saves,
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, DEFAULT_GRACE};
    use crate::spot::test_support::make_spot;
    use crate::stats::WindowStats;
    use crate::wsprnet::WsprNetStats;

    fn report(stats: &StatsTracker) -> StatusReport {
        StatusReport {
            summary: stats.summary(),
            wsprnet: None,
            pskreporter: None,
            persistence_saves: 0,
            persistence_failures: 0,
        }
    }

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let stats = StatsTracker::new("FN42");
        let output = format_prometheus_metrics(&report(&stats));

        assert!(output.contains("wspr_uptime_seconds"));
        assert!(output.contains("wspr_spots_total 0"));
        assert!(output.contains("wspr_parse_failures_total 0"));
        assert!(output.contains("wspr_persistence_failures_total 0"));
        assert!(!output.contains("wsprnet_"));
    }

    #[test]
    fn test_format_prometheus_metrics_with_data() {
        let stats = StatsTracker::new("FN42");
        let spot = make_spot("kiwi-a", "G0XYZ", -14);
        stats.record_spot(&spot);
        stats.record_unique("kiwi-a", "20m");
        let mut window = WindowStats {
            window_time: spot.epoch_time,
            total_spots: 1,
            deduped_spots: 1,
            ..Default::default()
        };
        window.band_counts.insert("20m".to_string(), 1);
        stats.finish_window(window);

        let mut r = report(&stats);
        r.wsprnet = Some(WsprNetStatus {
            stats: WsprNetStats {
                successful: 3,
                failed: 1,
                retries: 2,
            },
            dropped: 0,
            dry_run: false,
            latency_ms: None,
            recent: Vec::new(),
        });
        r.pskreporter = Some(PskReporterStats {
            packets_sent: 4,
            ..Default::default()
        });

        let output = format_prometheus_metrics(&r);
        assert!(output.contains("wspr_spots_total 1"));
        assert!(output.contains("wspr_unique_spots_total 1"));
        assert!(output.contains(
            "wspr_instance_spots_total{instance=\"kiwi-a\",outcome=\"unique\"} 1"
        ));
        assert!(output.contains("wspr_band_spots{band=\"20m\"} 1"));
        assert!(output.contains("wsprnet_successful_total 3"));
        assert!(output.contains("wsprnet_retries_total 2"));
        assert!(output.contains("pskreporter_packets_total 4"));
    }

    #[test]
    fn test_prometheus_format_validity() {
        let stats = StatsTracker::new("FN42");
        stats.record_spot(&make_spot("kiwi-a", "G0XYZ", -14));
        let output = format_prometheus_metrics(&report(&stats));

        // Check that each non-comment, non-empty line has proper format
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            assert!(parts.len() >= 2, "Invalid metric line: {}", line);
        }
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label(r#"kiwi "a""#), r#"kiwi \"a\""#);
    }

    #[tokio::test]
    async fn test_endpoints() {
        let stats = Arc::new(StatsTracker::new("FN42"));
        let mut agg = Aggregator::new(DEFAULT_GRACE, Arc::clone(&stats), Vec::new());
        let mut spot = make_spot("kiwi-a", "G0XYZ", -14);
        spot.epoch_time = chrono::Utc::now();
        agg.ingest(spot);
        let (_ingest, handle, _task) = agg.spawn(8);

        let state = StatusState {
            stats,
            aggregator: handle,
            wsprnet: None,
            pskreporter: None,
            persister: Arc::new(Persister::new(std::env::temp_dir().join("unused.json"))),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let client = reqwest::Client::new();
        let health = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");

        let body = client
            .get(format!("http://{}/api/windows", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let windows: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(windows[0]["spot_count"], 1);

        let body = client
            .get(format!("http://{}/api/stats", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["total_stats"]["total_spots"], 1);
    }
}
