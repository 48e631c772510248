// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the ward capacity service.
//
// The recorder is installed globally in `main`. Until then (and in tests) the
// `metrics` macros are no-ops, so services can record unconditionally.
//
// METRIC TYPES USED:
// - Counter: bed assignment attempts, ledger operations, step failures
// - Gauge: live bed counts and idle ledger units per department
// - Histogram: HTTP, store and cache latency
// =============================================================================

use std::time::Instant;

use anyhow::Result;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::models::{DepartmentOccupancy, LedgerEntry, Step};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: department, outcome (assigned/capacity_exceeded/no_beds)
pub const BED_ASSIGNMENTS_TOTAL: &str = "ward_bed_assignments_total";

/// Labels: from_department, to_department
pub const BED_SHIFTS_TOTAL: &str = "ward_bed_shifts_total";

/// Labels: department
pub const DEPARTMENT_OCCUPIED_BEDS: &str = "ward_department_occupied_beds";

/// Labels: department
pub const DEPARTMENT_AVAILABLE_BEDS: &str = "ward_department_available_beds";

/// Idle units per ledger entry. Labels: department, resource
pub const LEDGER_AVAILABLE_UNITS: &str = "ward_ledger_available_units";

/// Labels: operation (transfer/allocate/deallocate/edit), status (success/failed)
pub const LEDGER_OPERATIONS_TOTAL: &str = "ward_ledger_operations_total";

/// Non-fatal admission/discharge step failures. Labels: step
pub const STEP_FAILURES_TOTAL: &str = "ward_step_failures_total";

/// Labels: operation
pub const STORE_OPERATION_DURATION_SECONDS: &str = "store_operation_duration_seconds";

/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the Prometheus recorder globally and return the render handle
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(STORE_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(BED_ASSIGNMENTS_TOTAL, "Bed assignment attempts by outcome");
    describe_counter!(BED_SHIFTS_TOTAL, "Beds moved between departments");
    describe_gauge!(DEPARTMENT_OCCUPIED_BEDS, "Occupied beds per department");
    describe_gauge!(DEPARTMENT_AVAILABLE_BEDS, "Available beds per department");
    describe_gauge!(LEDGER_AVAILABLE_UNITS, "Idle units per department resource");
    describe_counter!(LEDGER_OPERATIONS_TOTAL, "Resource ledger operations by outcome");
    describe_counter!(
        STEP_FAILURES_TOTAL,
        "Secondary admission and discharge steps that failed"
    );
    describe_histogram!(STORE_OPERATION_DURATION_SECONDS, "Store operation latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

// =============================================================================
// HTTP MIDDLEWARE
// =============================================================================
/// Record count and latency for every request, labelled by route template
/// (`/api/v1/departments/:id`) rather than the raw path.
pub async fn track_http(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    record_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_bed_assignment(department: &str, outcome: &'static str) {
    counter!(
        BED_ASSIGNMENTS_TOTAL,
        "department" => department.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_bed_shift(from_department: &str, to_department: &str) {
    counter!(
        BED_SHIFTS_TOTAL,
        "from_department" => from_department.to_string(),
        "to_department" => to_department.to_string()
    )
    .increment(1);
}

pub fn set_occupancy(occupancy: &DepartmentOccupancy) {
    gauge!(DEPARTMENT_OCCUPIED_BEDS, "department" => occupancy.name.clone())
        .set(occupancy.occupied_beds as f64);
    gauge!(DEPARTMENT_AVAILABLE_BEDS, "department" => occupancy.name.clone())
        .set(occupancy.available_beds as f64);
}

pub fn set_ledger_level(entry: &LedgerEntry) {
    gauge!(
        LEDGER_AVAILABLE_UNITS,
        "department" => entry.department_id.to_string(),
        "resource" => entry.resource_key.clone()
    )
    .set(entry.available as f64);
}

pub fn record_ledger_operation(operation: &'static str, success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        LEDGER_OPERATIONS_TOTAL,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

pub fn record_step_failure(step: Step) {
    let label = serde_json::to_value(step)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", step));
    counter!(STEP_FAILURES_TOTAL, "step" => label).increment(1);
}

pub fn record_store_operation(operation: &'static str, duration_secs: f64) {
    histogram!(STORE_OPERATION_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

pub fn record_redis_operation(operation: &'static str, duration_secs: f64) {
    histogram!(REDIS_OPERATION_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}
