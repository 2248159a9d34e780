//! tsp-poller is like tsp-forwarder except its plugins poll remote
//! devices; its relays typically spread load over many connections per
//! downstream host.

use std::path::PathBuf;

use clap::Parser;

use tsp_config::{Config, Role};

const ROLE: Role = Role::Poller;

/// Telemetry poller: runs remote-polling plugins and relays their points.
#[derive(Parser, Debug)]
#[command(name = "tsp-poller", version, about)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', value_name = "PATH", default_value = "/etc/tsp/poller.toml")]
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
            eprintln!("tsp-poller: {err}");
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
