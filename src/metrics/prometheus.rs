//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Executions by kind and how they ended
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "control_plane_reconciler_reconciliations_total",
        "Total number of record executions by result",
        &["kind", "result"]
    ).unwrap();

    /// Store errors that aborted a cycle or an execution
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "control_plane_reconciler_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Time spent executing one transition, driver call included
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "control_plane_reconciler_reconcile_duration_seconds",
        "Duration of one transition in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Time spent on one scheduler cycle
    pub static ref CYCLE_DURATION: HistogramVec = register_histogram_vec!(
        "control_plane_reconciler_cycle_duration_seconds",
        "Duration of scheduler cycles in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    /// Candidates found by the last cycle
    pub static ref CANDIDATES: GaugeVec = register_gauge_vec!(
        "control_plane_reconciler_candidates",
        "Records needing work in the last scan",
        &["kind"]
    ).unwrap();

    /// Claims lost to another worker
    pub static ref LEASE_CONTENTION: CounterVec = register_counter_vec!(
        "control_plane_reconciler_lease_contention_total",
        "Lease claims denied because another worker held the record",
        &["kind"]
    ).unwrap();

    /// Driver calls by outcome
    pub static ref DRIVER_CALLS: CounterVec = register_counter_vec!(
        "control_plane_reconciler_driver_calls_total",
        "Total number of driver calls by outcome",
        &["kind", "action", "outcome"]
    ).unwrap();

    /// Driver call latency
    pub static ref DRIVER_DURATION: HistogramVec = register_histogram_vec!(
        "control_plane_reconciler_driver_duration_seconds",
        "Duration of driver calls in seconds",
        &["kind", "action"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Desired-state writes made by cascades
    pub static ref CASCADE_WRITES: CounterVec = register_counter_vec!(
        "control_plane_reconciler_cascade_writes_total",
        "Desired states changed by cascade propagation",
        &["parent_kind", "child_kind", "state"]
    ).unwrap();

    /// Scheduler loops currently running
    pub static ref ACTIVE_SCHEDULERS: IntGauge = register_int_gauge!(
        "control_plane_reconciler_active_schedulers",
        "Number of running scheduler loops"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "control_plane_reconciler_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => health_response(),
        "/readyz" | "/ready" => ready_response(),
        _ => not_found_response(),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

/// Health check response
fn health_response() -> Response<Full<Bytes>> {
    text_response(StatusCode::OK, "ok")
}

/// Ready while healthy and at least one scheduler loop is running
fn is_ready() -> bool {
    OPERATOR_HEALTH.get() >= 1.0 && ACTIVE_SCHEDULERS.get() > 0
}

fn ready_response() -> Response<Full<Bytes>> {
    if is_ready() {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Not found response
fn not_found_response() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_needs_health_and_a_running_scheduler() {
        OPERATOR_HEALTH.set(1.0);
        ACTIVE_SCHEDULERS.set(0);
        assert_eq!(ready_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        ACTIVE_SCHEDULERS.set(2);
        assert_eq!(ready_response().status(), StatusCode::OK);

        OPERATOR_HEALTH.set(0.0);
        assert_eq!(ready_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        ACTIVE_SCHEDULERS.set(0);
    }

    #[test]
    fn metrics_response_uses_the_text_exposition_format() {
        CASCADE_WRITES
            .with_label_values(&["Application", "Database", "Deleted"])
            .inc();
        let response = metrics_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some(prometheus::TEXT_FORMAT)
        );
        assert_eq!(not_found_response().status(), StatusCode::NOT_FOUND);
    }
}
