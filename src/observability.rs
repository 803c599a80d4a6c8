use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "slotline_http_requests_total";

/// Counter: engine errors returned to HTTP callers. Labels: kind.
pub const ENGINE_ERRORS_TOTAL: &str = "slotline_engine_errors_total";

/// Histogram: slot grid computation latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "slotline_slot_query_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotline_bookings_created_total";

/// Counter: booking attempts rejected because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotline_booking_conflicts_total";

/// Counter: bookings cancelled. Labels: cause (customer, expired, refund).
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotline_bookings_cancelled_total";

/// Counter: bookings moved to another slot.
pub const BOOKINGS_RESCHEDULED_TOTAL: &str = "slotline_bookings_rescheduled_total";

/// Counter: payment confirmations applied (duplicates excluded).
pub const PAYMENTS_CONFIRMED_TOTAL: &str = "slotline_payments_confirmed_total";

/// Counter: reminders recorded as sent. Labels: kind.
pub const REMINDERS_SENT_TOTAL: &str = "slotline_reminders_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: registered businesses.
pub const BUSINESSES_ACTIVE: &str = "slotline_businesses_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotline_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotline_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
