// SPDX-License-Identifier: Apache-2.0
use clap::Parser;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tonic::Request;

mod sequencerpb {
    tonic::include_proto!("sequencerpb");
}

use sequencerpb::sequencer_service_client::SequencerServiceClient;
use sequencerpb::{StreamSet, TokenRequest};

/// Load-generator for the sequencer's NextToken RPC.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Sequencer address to connect to.
    #[arg(long, default_value = "http://localhost:5679")]
    addr: String,

    /// Number of distinct streams to spread requests over.
    #[arg(long, default_value_t = 64)]
    streams: usize,

    /// Number of grant requests to issue in total.
    #[arg(long, default_value_t = 100_000)]
    requests: usize,

    /// Number of concurrent client connections.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    #[arg(long, default_value_t = false)]
    prompt: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut clients = Vec::new();
    for _ in 0..args.clients {
        clients.push(SequencerServiceClient::connect(args.addr.clone()).await?);
    }

    let stream_ids: Vec<Vec<u8>> = (0..args.streams)
        .map(|i| {
            let mut id = vec![0u8; 16];
            id[..8].copy_from_slice(&(i as u64).to_be_bytes());
            id
        })
        .collect();

    println!("Issuing {} grants over {} streams with {} clients", args.requests, args.streams, args.clients);
    let concurrency_limit = 200;
    let start = std::time::Instant::now();

    stream::iter(0..args.requests)
        .for_each_concurrent(concurrency_limit, |i| {
            let mut client = clients[i % clients.len()].clone();
            let stream_id = stream_ids[rand::thread_rng().gen_range(0..stream_ids.len())].clone();
            async move {
                let request = Request::new(TokenRequest {
                    num_tokens: 1,
                    streams: Some(StreamSet { ids: vec![stream_id.into()] }),
                    overwrite: false,
                    replex_overwrite: false,
                    txn_resolution: false,
                    read_timestamp: 0,
                    read_set: vec![],
                    conflict_keys: vec![],
                });
                if let Err(e) = client.next_token(request).await {
                    eprintln!("Error: {:?}", e);
                }
            }
        })
        .await;

    let duration = start.elapsed();
    println!(
        "Done issuing {} grants in {:?} ({:.0} req/s)",
        args.requests,
        duration,
        args.requests as f64 / duration.as_secs_f64()
    );

    if args.prompt {
        println!("Press Enter to continue...");
        let _ = std::io::stdin().read_line(&mut String::new());
    }

    Ok(())
}
