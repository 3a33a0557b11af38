//! Prometheus metrics instrumentation for Bayeux transports.
//!
//! This module is only available when the `metrics` feature is enabled.

/// Metric names used throughout the workspace.
pub mod names {
    /// Total suspended connections admitted.
    pub const ADMISSIONS_GRANTED: &str = "bayeux_admissions_granted_total";
    /// Total connects refused by the per-browser limit.
    pub const ADMISSIONS_REJECTED: &str = "bayeux_admissions_rejected_total";
    /// Total releases attempted on a zero counter.
    pub const COUNTER_UNDERFLOWS: &str = "bayeux_admission_underflows_total";
    /// Number of currently suspended connections.
    pub const SUSPENDED_ACTIVE: &str = "bayeux_suspended_connections";
    /// Total sweep passes.
    pub const SWEEPS_TOTAL: &str = "bayeux_sweeps_total";
    /// Total idle browsers evicted by sweeps.
    pub const BROWSERS_SWEPT: &str = "bayeux_browsers_swept_total";
    /// Total requests handled, labeled by transport and outcome.
    pub const REQUESTS_TOTAL: &str = "bayeux_requests_total";
    /// Total malformed message batches received.
    pub const MALFORMED_TOTAL: &str = "bayeux_malformed_batches_total";
}

/// Record a granted admission.
#[inline]
pub fn admission_granted() {
    metrics::counter!(names::ADMISSIONS_GRANTED).increment(1);
}

/// Record a rejected admission.
#[inline]
pub fn admission_rejected() {
    metrics::counter!(names::ADMISSIONS_REJECTED).increment(1);
}

/// Record an unpaired release.
#[inline]
pub fn counter_underflow() {
    metrics::counter!(names::COUNTER_UNDERFLOWS).increment(1);
}

/// Record a connection being suspended.
#[inline]
pub fn connection_suspended() {
    metrics::gauge!(names::SUSPENDED_ACTIVE).increment(1);
}

/// Record a suspended connection being resumed.
#[inline]
pub fn connection_resumed() {
    metrics::gauge!(names::SUSPENDED_ACTIVE).decrement(1);
}

/// Record a completed sweep pass.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub fn sweep_completed(evicted: usize) {
    metrics::counter!(names::SWEEPS_TOTAL).increment(1);
    metrics::counter!(names::BROWSERS_SWEPT).increment(evicted as u64);
}

/// Record a handled request.
#[inline]
pub fn request_handled(transport: &'static str, outcome: &'static str) {
    metrics::counter!(names::REQUESTS_TOTAL, "transport" => transport, "outcome" => outcome)
        .increment(1);
}

/// Record a malformed batch.
#[inline]
pub fn malformed_batch() {
    metrics::counter!(names::MALFORMED_TOTAL).increment(1);
}
