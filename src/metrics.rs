// SPDX-License-Identifier: Apache-2.0
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

/// A collection of Prometheus metrics for this application.
pub struct Metrics;

impl Metrics {
    /// Force initialization of all static metrics.
    /// Called once from `main()` so they're registered before the
    /// first request, matching the teacher's init-by-touching-statics
    /// pattern.
    pub fn init() {
        let _ = &*REQUEST_COUNT;
        let _ = &*REQUEST_LATENCY;
        let _ = &*IN_FLIGHT_REQUESTS;
        let _ = &*GLOBAL_TAIL;
        let _ = &*LEASE_BOUNDARY;
        let _ = &*LEASE_RENEWALS;
        let _ = &*TXN_ABORTS;
        let _ = &*CONFLICT_CACHE_SIZE;
        let _ = &*STREAM_COUNT;

        let runtime_running = tokio::runtime::Handle::try_current().is_ok();
        if runtime_running {
            prometheus::default_registry()
                .register(Box::new(tokio_metrics_collector::default_runtime_collector()))
                .unwrap();
        }
    }
}

/// Tracks the count of requests by path (grant, query, txn_commit, txn_abort).
pub static REQUEST_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sequencer_requests_total",
        "Total NextToken requests received, labeled by resolution path",
        &["type"]
    )
    .expect("cannot create metric: sequencer_requests_total")
});

/// Tracks the latency of requests, labeled by path.
pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sequencer_request_latency_seconds",
        "NextToken request latency distribution",
        &["type"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .expect("cannot create metric: sequencer_request_latency_seconds")
});

pub static IN_FLIGHT_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sequencer_in_flight_requests", "Number of in-flight requests")
        .expect("cannot create metric: sequencer_in_flight_requests")
});

/// The current global tail `T`.
pub static GLOBAL_TAIL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sequencer_global_tail", "Next global position to be issued")
        .expect("cannot create metric: sequencer_global_tail")
});

/// The current persisted lease boundary `L`.
pub static LEASE_BOUNDARY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sequencer_lease_boundary", "Last durably persisted lease start")
        .expect("cannot create metric: sequencer_lease_boundary")
});

pub static LEASE_RENEWALS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("sequencer_lease_renewals_total", "Number of lease renewals performed")
        .expect("cannot create metric: sequencer_lease_renewals_total")
});

pub static TXN_ABORTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("sequencer_txn_aborts_total", "Number of transactions aborted at resolution")
        .expect("cannot create metric: sequencer_txn_aborts_total")
});

/// A gauge of how many entries are currently in the conflict cache.
pub static CONFLICT_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sequencer_conflict_cache_size", "Number of entries in the conflict cache")
        .expect("cannot create metric: sequencer_conflict_cache_size")
});

/// A gauge of how many distinct streams have ever been granted a token.
pub static STREAM_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sequencer_stream_count", "Number of distinct streams with at least one grant")
        .expect("cannot create metric: sequencer_stream_count")
});
