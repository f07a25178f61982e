use clap::Parser;
use client::network::Walker;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short = 'u', long, default_value = "ws://127.0.0.1:3001")]
    url: String,

    /// Space to join
    #[arg(short = 's', long)]
    space: String,

    /// Signed session token
    #[arg(short = 't', long, env = "SPACE_TOKEN", hide_env_values = true)]
    token: String,

    /// Number of random steps to take
    #[arg(short = 'n', long, default_value = "20")]
    steps: u32,

    /// Delay between steps in milliseconds
    #[arg(short = 'i', long, default_value = "250")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.url);
    let mut walker = Walker::connect(&args.url).await?;

    let spawn = walker.join(&args.space, &args.token).await?;
    info!("Spawned in {} at {}", args.space, spawn);

    let summary = walker
        .walk(args.steps, Duration::from_millis(args.interval_ms.max(1)))
        .await?;
    info!(
        "Walk finished at {}: {} confirmed, {} rejected, {} peer(s) in view",
        summary.position,
        summary.confirmed,
        summary.rejected,
        walker.view().peers.len()
    );

    walker.close().await?;
    Ok(())
}
