//! tsp-aggregator combines many host feeds into a single site feed.

use std::path::PathBuf;

use clap::Parser;

use tsp_config::{Config, Role};

const ROLE: Role = Role::Aggregator;

/// Telemetry aggregator: accepts network ingress and fans out to relays.
#[derive(Parser, Debug)]
#[command(name = "tsp-aggregator", version, about)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', value_name = "PATH", default_value = "/etc/tsp/aggregator.toml")]
    config: PathBuf,

    /// Verbose debug logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Validate the configuration, dump it, and exit
    #[arg(short = 't')]
    test_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match Config::load(&args.config, ROLE) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("tsp-aggregator: {err}");
            std::process::exit(1);
        }
    };
    if args.test_config {
        print!("{}", config.dump());
        return Ok(());
    }
    let _log_guard = tsp_logging::init(args.verbose, config.log_path.as_deref())?;
    tracing::info!(pid = std::process::id(), "start");

    tsp_engine::run(ROLE, config, args.config).await?;
    Ok(())
}
