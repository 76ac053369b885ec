//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Intake Metrics
    pub static ref NOTIFICATIONS_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mailrelay_notifications_received_total", "Total number of push notifications received"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref EMAILS_FETCHED_TOTAL: IntCounter = IntCounter::new(
        "mailrelay_emails_fetched_total",
        "Total number of emails fetched from the mail provider"
    ).expect("metric can be created");
    pub static ref EMAIL_FETCH_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "mailrelay_email_fetch_failures_total",
        "Total number of emails that could not be fetched or decoded"
    ).expect("metric can be created");

    // Dispatch Metrics
    pub static ref DISPATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mailrelay_dispatches_total", "Total number of dispatch outcomes"),
        &["status"]
    ).expect("metric can be created");
    pub static ref TRANSPORT_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "mailrelay_transport_request_duration_seconds",
            "Delivery transport request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mailrelay_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(NOTIFICATIONS_RECEIVED_TOTAL.clone()))
        .expect("NOTIFICATIONS_RECEIVED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(EMAILS_FETCHED_TOTAL.clone()))
        .expect("EMAILS_FETCHED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(EMAIL_FETCH_FAILURES_TOTAL.clone()))
        .expect("EMAIL_FETCH_FAILURES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DISPATCHES_TOTAL.clone()))
        .expect("DISPATCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(TRANSPORT_REQUEST_DURATION_SECONDS.clone()))
        .expect("TRANSPORT_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record one delivery transport call.
pub fn observe_transport_call(result: &str, elapsed: Duration) {
    TRANSPORT_REQUEST_DURATION_SECONDS
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64());
}
