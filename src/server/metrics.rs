//! Prometheus metrics for the compile server.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

/// Requests handled, labelled by HTTP status code.
pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kiln_requests_total",
        "Total number of compile requests served",
        &["status"]
    )
    .expect("metric registration")
});

/// Cache lifecycle outcomes, labelled created/updated/cached.
pub static COMPILE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kiln_compile_outcomes_total",
        "Cache engine outcomes per request",
        &["status"]
    )
    .expect("metric registration")
});

/// Requests currently in flight.
pub static INFLIGHT_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kiln_inflight_requests",
        "Number of compile requests currently being handled"
    )
    .expect("metric registration")
});
