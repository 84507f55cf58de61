use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use replay_relay::bookkeeping::{LocalInfoSource, ReplaySaver};
use replay_relay::config::{MergeStrategyKind, Settings};
use replay_relay::registry::Server;

/// Main-method of the application.
/// Parses command-line arguments, binds the listener and runs the accept
/// loop until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "15000")]
        port: u16,
        /// Seconds a replay stays open after its last writer disconnects
        #[clap(long, default_value = "30")]
        grace_period: u64,
        /// Hard cap in seconds on a replay's total lifetime
        #[clap(long, default_value = "18000")]
        forced_end: u64,
        /// Seconds spectators lag behind the live merged stream
        #[clap(long, default_value = "300")]
        delay: u64,
        /// Merge strategy: "follow" or "quorum"
        #[clap(long, default_value = "quorum")]
        merge: String,
        /// Writer streams that must agree before quorum publishes bytes
        #[clap(long, default_value = "2")]
        quorum: usize,
        /// Directory finished replays are written to
        #[clap(long, default_value = "replays")]
        storage: PathBuf,
    }

    env_logger::init();
    let args = Args::parse();

    let merge_strategy = match args.merge.as_str() {
        "follow" => MergeStrategyKind::Follow,
        "quorum" => MergeStrategyKind::Quorum,
        other => return Err(format!("unknown merge strategy {other:?}").into()),
    };
    let settings = Settings {
        listen_addr: format!("{}:{}", args.host, args.port),
        grace_period: Duration::from_secs(args.grace_period),
        forced_end_timeout: Duration::from_secs(args.forced_end),
        spectator_delay: Duration::from_secs(args.delay),
        desired_quorum: args.quorum,
        merge_strategy,
        storage_root: args.storage.clone(),
        ..Settings::default()
    };

    let saver = ReplaySaver::new(args.storage, Box::new(LocalInfoSource));
    let server = Server::bind(settings, saver).await?;
    let replays = server.replays();

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, closing live replays");
            replays.close_all();
            // Give the closed sessions a moment to drain and persist.
            for _ in 0..50 {
                if replays.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            // Sessions leave the map just before their save runs.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    Ok(())
}
