use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use confab::{default_relays, SessionManager, SmConfig};

#[derive(Parser, Debug)]
#[command(name = "confab")]
#[command(author, version, about = "Conference signaling session manager", long_about = None)]
struct Args {
    /// UDP listen address for signaling traffic.
    #[arg(short, long, default_value = "0.0.0.0:20005")]
    bind: SocketAddr,

    /// Relay address to fan out to (repeatable). Defaults to the built-in
    /// relay fleet.
    #[arg(short, long = "relay", value_name = "ADDR")]
    relays: Vec<SocketAddr>,

    /// Seconds between presence re-registrations to the relays.
    #[arg(long, default_value = "200")]
    register_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = SmConfig {
        bind_addr: args.bind,
        relays: if args.relays.is_empty() {
            default_relays()
        } else {
            args.relays
        },
        register_interval: Duration::from_secs(args.register_interval),
        sid_seed: None,
    };

    let manager = SessionManager::start(config).await?;

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = terminate.recv() => {
            info!("received terminate, shutting down");
        }
    }

    manager.stop().await;
    Ok(())
}
