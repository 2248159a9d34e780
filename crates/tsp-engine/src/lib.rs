//! Role wiring: compose the pipeline stages and run until restart.
//!
//! Forwarder and poller: plugin pool -> join(self-metrics) -> filter ->
//! relay broadcast. Aggregator: ingress server -> join(self-metrics) ->
//! filter -> relay broadcast. Control (SIGHUP or a valid config change)
//! crosses the pipeline out of band: the collector pool is torn down, every
//! child reaped, and the process re-execs itself.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use tsp_config::{Config, ConfigError, ConfigHandle, Role};
use tsp_filter::{Filter, FilterError};
use tsp_relay::{RelayError, RelayPool};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run the engine in the given role. Returns only on a fatal setup error;
/// otherwise the process runs until a restart replaces it.
pub async fn run(role: Role, config: Config, config_path: PathBuf) -> Result<(), EngineError> {
    match role {
        Role::Forwarder | Role::Poller => run_collector_role(role, config, config_path).await,
        Role::Aggregator => run_aggregator(config, config_path).await,
    }
}

async fn run_collector_role(
    role: Role,
    config: Config,
    config_path: PathBuf,
) -> Result<(), EngineError> {
    let filter = Filter::new(&config.filter)?;
    let relays = RelayPool::new(&config.relay)?;
    let collect_path = config
        .collect_path
        .clone()
        .ok_or(ConfigError::MissingCollectPath)?;

    let mut pool = tsp_collect::Pool::new(collect_path);
    let plugins = pool.take_points();
    let self_metrics = tsp_stats::self_series(&role.metric_prefix());
    let joined = tsp_wire::join(plugins, self_metrics);
    let finished = tsp_filter::filtered(filter, joined);

    tokio::select! {
        () = relays.broadcast(finished) => {
            tracing::warn!("point stream ended");
        }
        cause = reload_trigger(role, config, config_path) => {
            tracing::info!(%cause, "restarting...");
            pool.kill().await;
            tsp_app::restart();
        }
    }
    Ok(())
}

async fn run_aggregator(config: Config, config_path: PathBuf) -> Result<(), EngineError> {
    let role = Role::Aggregator;
    let filter = Filter::new(&config.filter)?;
    let relays = RelayPool::new(&config.relay)?;
    let addr = config
        .listen_addr
        .clone()
        .ok_or(ConfigError::MissingListenAddr)?;

    let banner = tsp_server::banner(role.name(), env!("CARGO_PKG_VERSION"));
    let mut ingress = tsp_server::listen(&addr, banner)
        .await
        .map_err(|source| EngineError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let inbound = ingress.take_points();
    let self_metrics = tsp_stats::self_series(&role.metric_prefix());
    let joined = tsp_wire::join(inbound, self_metrics);
    let finished = tsp_filter::filtered(filter, joined);

    tokio::select! {
        () = relays.broadcast(finished) => {
            tracing::warn!("point stream ended");
        }
        cause = reload_trigger(role, config, config_path) => {
            tracing::info!(%cause, "restarting...");
            tsp_app::restart();
        }
    }
    Ok(())
}

/// Resolve with the restart cause: SIGHUP, or the config file changing to a
/// new valid payload.
async fn reload_trigger(role: Role, config: Config, config_path: PathBuf) -> String {
    let handle = Arc::new(ConfigHandle::new(config));
    let mut changes = tsp_config::watch(config_path, role, handle);
    tokio::select! {
        () = tsp_app::reload_signal() => "got SIGHUP".to_string(),
        cause = changes.recv() => cause.unwrap_or_else(|| "config watcher stopped".to_string()),
    }
}
