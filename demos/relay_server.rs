//! Ingest server that re-publishes its stream to a remote server
//!
//! Run with: cargo run --example relay_server [INGEST_ADDR] [REMOTE_ADDR]
//!
//! Examples:
//!   cargo run --example relay_server
//!       # ingest on localhost:1935, stream live/<generated key>, no relay
//!   cargo run --example relay_server localhost:1936/live/cam
//!   cargo run --example relay_server localhost:1936/live/cam rtmp://a.rtmp.youtube.com/live2/KEY
//!
//! ## Publishing
//!
//! With ffmpeg:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost:1936/live/cam
//!
//! ## Playing
//!
//! With ffplay:
//!   ffplay rtmp://localhost:1936/live/cam
//!
//! The relay waits for the publish and starts as soon as it begins. Stopping
//! the publisher puts the relay back to pending until the next publish.

use rtmp_ingest::protocol::message::ConnectParams;
use rtmp_ingest::session::SessionContext;
use rtmp_ingest::{AuthResult, IngestController, RtmpHandler, ServerConfig, StreamKey};

/// Handler that logs every session event
#[derive(Clone)]
struct LoggingHandler;

impl RtmpHandler for LoggingHandler {
    async fn on_connect(&self, ctx: &SessionContext, params: &ConnectParams) -> AuthResult {
        println!(
            "[{}] Connect from {}: app={}, tcUrl={:?}",
            ctx.session_id, ctx.peer_addr, params.app, params.tc_url
        );
        AuthResult::Accept
    }

    async fn on_publish(&self, ctx: &SessionContext, key: &StreamKey) -> AuthResult {
        println!("[{}] Publish: {}", ctx.session_id, key);
        AuthResult::Accept
    }

    async fn on_play(&self, ctx: &SessionContext, key: &StreamKey) -> AuthResult {
        println!("[{}] Play: {}", ctx.session_id, key);
        AuthResult::Accept
    }

    async fn on_disconnect(&self, ctx: &SessionContext) {
        println!("[{}] Disconnected", ctx.session_id);
    }
}

fn print_usage() {
    eprintln!("Usage: relay_server [INGEST_ADDR] [REMOTE_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  INGEST_ADDR  host:port/app/key to ingest on (default: localhost:1935/live/<random>)");
    eprintln!("  REMOTE_ADDR  rtmp://host:port/app/key to relay the ingest stream to");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_ingest=debug".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    let ingest = args.get(1).map(String::as_str).unwrap_or("localhost:1935");
    let control = IngestController::new(ServerConfig::default(), LoggingHandler);

    let ack = control.start_ingest(ingest).await;
    if !ack.success {
        eprintln!("Error: {}", ack.message);
        std::process::exit(1);
    }

    if let Some(addr) = control.ingest_addr().await {
        println!("Ingesting on {}", addr);
        println!("ffmpeg: ffmpeg -re -i input.mp4 -c copy -f flv {}", addr);
    }

    if let Some(remote) = args.get(2) {
        let ack = control.forward(remote).await;
        println!("Relay to {}: {}", remote, ack.message);
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    control.shutdown().await;

    Ok(())
}
