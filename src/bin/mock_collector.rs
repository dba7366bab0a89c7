//! Mock analytics collector
//!
//! Stands in for the remote durations endpoint during local testing. Accepts
//! POSTed record chunks, checks the API key and logs every chunk.
//!
//! Usage:
//!   cargo run --bin mock-collector -- --port 8088 --api-key secret
//!   cargo run --bin mock-collector -- --fail-on 3

use clap::Parser;
use presence_counter::io::mock_collector::{serve, CollectorState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-collector")]
#[command(about = "Mock analytics collector for local export testing")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "8088")]
    port: u16,

    /// Required API key (any key accepted when omitted)
    #[arg(long)]
    api_key: Option<String>,

    /// Answer 500 to the nth chunk (1-based)
    #[arg(long)]
    fail_on: Option<usize>,

    /// Answer with a JSON array instead of an object
    #[arg(long)]
    reply_array: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut state = CollectorState::new(args.api_key.as_deref());
    if let Some(n) = args.fail_on {
        state = state.failing_on(n);
    }
    if args.reply_array {
        state = state.replying_with_array();
    }
    let state = Arc::new(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        endpoint = %format!("http://{addr}/durations/"),
        api_key_required = args.api_key.is_some(),
        "mock_collector_listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(listener, state.clone(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    server.await?;

    info!(chunks = state.chunk_sizes().len(), records = state.records_total(), "mock_collector_stopped");
    Ok(())
}
