//! Prometheus metrics for registry activity
//!
//! Counters are process-wide; every registry instance reports into the same
//! series.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref MAKE_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("photon_registry_make_requests_total", "Make requests by result"),
        &["result"]
    ).unwrap();

    pub static ref UNMAKE_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("photon_registry_unmake_requests_total", "Unmake requests by result"),
        &["result"]
    ).unwrap();

    pub static ref BUILDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photon_registry_builds_total", "Resource builds by status"),
        &["status"]
    ).unwrap();

    pub static ref BUILD_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "photon_registry_build_duration_seconds",
            "Time spent in Lifetime::create"
        ).buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
    ).unwrap();

    pub static ref DESTROYS_TOTAL: IntCounter = IntCounter::new(
        "photon_registry_destroys_total",
        "Resources handed back to the lifetime policy"
    ).unwrap();

    pub static ref FLUSHES_TOTAL: IntCounter = IntCounter::new(
        "photon_registry_flushes_total",
        "Flush calls that did work"
    ).unwrap();

    pub static ref SLOT_EXHAUSTION: IntCounter = IntCounter::new(
        "photon_registry_slot_exhaustion_total",
        "Make requests refused because the slot pool was full"
    ).unwrap();

    pub static ref PENDING_OPERATIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("photon_registry_pending_operations", "Queued operations awaiting flush"),
        &["queue"]
    ).unwrap();

    pub static ref LIVE_SLOTS: IntGauge = IntGauge::new(
        "photon_registry_live_slots",
        "Slots currently owned by a key"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(MAKE_REQUESTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(UNMAKE_REQUESTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BUILDS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BUILD_DURATION.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DESTROYS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(FLUSHES_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SLOT_EXHAUSTION.clone())).ok();
    METRICS_REGISTRY.register(Box::new(PENDING_OPERATIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(LIVE_SLOTS.clone())).ok();

    info!("Metrics initialized successfully");
}

pub fn record_make(result: &str) {
    MAKE_REQUESTS.with_label_values(&[result]).inc();
}

pub fn record_unmake(result: &str) {
    UNMAKE_REQUESTS.with_label_values(&[result]).inc();
}

/// Record one `Lifetime::create` call
pub fn record_build(success: bool, elapsed: Duration) {
    let status = if success { "success" } else { "error" };
    BUILDS_TOTAL.with_label_values(&[status]).inc();
    BUILD_DURATION.observe(elapsed.as_secs_f64());
}

pub fn record_destroy() {
    DESTROYS_TOTAL.inc();
}

/// Record a flush pass and the queue depths it left behind
pub fn record_flush(makes: usize, unmakes: usize, live_slots: usize) {
    FLUSHES_TOTAL.inc();
    PENDING_OPERATIONS.with_label_values(&["makes"]).set(makes as i64);
    PENDING_OPERATIONS.with_label_values(&["unmakes"]).set(unmakes as i64);
    LIVE_SLOTS.set(live_slots as i64);
}

pub fn record_exhaustion() {
    SLOT_EXHAUSTION.inc();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
