// SPDX-License-Identifier: Apache-2.0
mod allocator;
mod conflict_cache;
mod error;
mod lease_manager;
mod lease_store;
mod metrics;
mod sequencer_service;
mod stream_index;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tower_http::metrics::InFlightRequestsLayer;

use allocator::{Allocator, AllocatorConfig};
use lease_store::FileLeaseStore;
use sequencer_service::SequencerServiceImpl;

use prometheus::{Encoder, TextEncoder};
use axum::{routing::get, Router};

mod sequencerpb {
    tonic::include_proto!("sequencerpb");
}

use sequencerpb::sequencer_service_server::SequencerServiceServer;

#[derive(Parser, Debug)]
#[command(name = "sequencer", version, about = "Token-issuing sequencer for a shared log", long_about = None)]
struct Cli {
    /// gRPC listen port
    #[arg(long = "port", env = "SEQUENCER_PORT", default_value_t = 9090)]
    port: u16,

    /// Metrics port
    #[arg(long = "metrics-port", env = "SEQUENCER_METRICS_PORT", default_value_t = 9091)]
    metrics_port: u16,

    /// Directory holding the durable lease file
    #[arg(long = "lease-dir", env = "SEQUENCER_LEASE_DIR", default_value = "./lease")]
    lease_dir: PathBuf,

    /// Size of each lease, in tokens, acquired from the store at a time
    #[arg(long = "lease-length", env = "SEQUENCER_LEASE_LENGTH", default_value_t = 100_000)]
    lease_length: i64,

    /// How many tokens before the lease boundary a renewal is triggered
    #[arg(long = "lease-renewal-notice", env = "SEQUENCER_LEASE_RENEWAL_NOTICE", default_value_t = 10_000)]
    lease_renewal_notice: i64,

    /// Maximum number of entries retained in the conflict cache
    #[arg(long = "conflict-cache-size", env = "SEQUENCER_CONFLICT_CACHE_SIZE", default_value_t = 10_000)]
    conflict_cache_size: usize,

    /// Administrative override of the starting token, bypassing the
    /// usual skip-forward-on-restart rule. Absent by default.
    #[arg(long = "initial-token", env = "SEQUENCER_INITIAL_TOKEN")]
    initial_token: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let addr: SocketAddr = format!("[::]:{}", cli.port).parse()?;

    metrics::Metrics::init();

    let lease_store = FileLeaseStore::new(&cli.lease_dir)?;
    let config = AllocatorConfig {
        lease_length: cli.lease_length,
        lease_renewal_notice: cli.lease_renewal_notice,
        max_conflict_cache_size: cli.conflict_cache_size,
        initial_token: cli.initial_token,
    };
    let allocator = match Allocator::new(Box::new(lease_store), config) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            log::error!("failed to initialize allocator: {e}");
            return Err(e.into());
        }
    };
    log::info!(
        "sequencer initialized: tail={}, lease_boundary={}",
        allocator.global_tail(),
        allocator.lease_boundary()
    );

    let sequencer_service = SequencerServiceServer::new(SequencerServiceImpl::new(Arc::clone(&allocator)));

    let metrics_allocator = Arc::clone(&allocator);
    let metrics_app = Router::new().route(
        "/metrics",
        get(move || {
            let allocator = Arc::clone(&metrics_allocator);
            async move {
                metrics::GLOBAL_TAIL.set(allocator.global_tail());
                metrics::LEASE_BOUNDARY.set(allocator.lease_boundary());

                let metric_families = prometheus::gather();
                let mut buf = Vec::new();
                let encoder = TextEncoder::new();
                encoder.encode(&metric_families, &mut buf).unwrap();
                String::from_utf8(buf).unwrap()
            }
        }),
    );

    let metrics_listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.metrics_port)).await?;
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app).await.unwrap();
    });

    let (in_flight_requests_layer, in_flight_requests_counter) = InFlightRequestsLayer::pair();
    tokio::spawn(
        in_flight_requests_counter.run_emitter(std::time::Duration::from_secs(5), |counter| async move {
            metrics::IN_FLIGHT_REQUESTS.set(counter as i64);
        }),
    );

    log::info!("starting gRPC server on {addr}");
    Server::builder()
        .max_concurrent_streams(100)
        .http2_adaptive_window(Some(true))
        .layer(in_flight_requests_layer)
        .add_service(sequencer_service)
        .serve(addr)
        .await?;

    Ok(())
}
