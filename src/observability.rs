use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Admission ───────────────────────────────────────────────────

/// Counter: bookings confirmed.
pub const BOOKINGS_CREATED_TOTAL: &str = "fleetbook_bookings_created_total";

/// Counter: create_booking failures. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "fleetbook_booking_rejections_total";

/// Counter: backoffs taken inside the admission loop. Labels: cause (overlap, transient).
pub const ADMISSION_RETRIES_TOTAL: &str = "fleetbook_admission_retries_total";

/// Histogram: create_booking latency in seconds, backoffs included.
pub const ADMISSION_DURATION_SECONDS: &str = "fleetbook_admission_duration_seconds";

// ── Cancellation ────────────────────────────────────────────────

/// Counter: cancel_booking calls. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "fleetbook_cancellations_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install the fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Map an EngineError variant to a short label for metrics.
pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::Unauthorized { .. } => "unauthorized",
        EngineError::InvalidRequest(_) => "invalid_request",
        EngineError::ResourceNotFound(_) => "resource_not_found",
        EngineError::NotFound(_) => "not_found",
        EngineError::ResourceUnavailable(_) => "resource_unavailable",
        EngineError::CancellationTooLate { .. } => "cancellation_too_late",
        EngineError::ServiceUnavailable(_) => "service_unavailable",
    }
}
