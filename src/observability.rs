use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: scheduling decisions. Labels: op, outcome.
pub const DECISIONS_TOTAL: &str = "salon_sched_decisions_total";

/// Histogram: read-decide-write latency in seconds. Labels: op.
pub const DECISION_DURATION_SECONDS: &str = "salon_sched_decision_duration_seconds";

// ── Closeout ────────────────────────────────────────────────────

/// Counter: transactions seen by closeout. Labels: outcome (closed, already_closed, failed).
pub const CLOSEOUT_TRANSACTIONS_TOTAL: &str = "salon_sched_closeout_transactions_total";

/// Counter: revenue closed, minor currency units.
pub const CLOSEOUT_REVENUE_MINOR_TOTAL: &str = "salon_sched_closeout_revenue_minor_total";

// ── Storage ─────────────────────────────────────────────────────

/// Counter: journal entries written.
pub const JOURNAL_APPENDS_TOTAL: &str = "salon_sched_journal_appends_total";

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

/// Count one decision and its latency.
pub fn record_decision<T>(op: &'static str, result: &Result<T, EngineError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "accepted",
        Err(e) => e.outcome_label(),
    };
    metrics::counter!(DECISIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    metrics::histogram!(DECISION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
