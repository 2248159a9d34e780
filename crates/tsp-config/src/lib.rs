//! Role configuration: loading, validation, and change notification.
//!
//! Each role reads one TOML file. Validation happens entirely at load time;
//! the pipeline itself never consults the file again. A change notifier
//! polls the file and, once a *valid* replacement appears, fires the reload
//! channel; the process restarts rather than hot-swapping state. An invalid
//! replacement is counted and logged and the previous configuration stays
//! in force.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use tsp_filter::{Filter, FilterError, Rule};
use tsp_relay::{RelayConfig, RelayError};

/// Upper bound on relay destinations per role.
pub const MAX_RELAYS: usize = 8;

const DEFAULT_PORT: u16 = 4242;
const WATCH_INTERVAL: Duration = Duration::from_secs(1);
const WATCH_ERROR_INTERVAL: Duration = Duration::from_secs(60);

/// The engine role a process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Forwarder,
    Poller,
    Aggregator,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Forwarder => "forwarder",
            Role::Poller => "poller",
            Role::Aggregator => "aggregator",
        }
    }

    /// Default `-f` path.
    pub fn default_config_path(&self) -> &'static str {
        match self {
            Role::Forwarder => "/etc/tsp/forwarder.toml",
            Role::Poller => "/etc/tsp/poller.toml",
            Role::Aggregator => "/etc/tsp/aggregator.toml",
        }
    }

    /// Metric prefix for this role's self-metrics.
    pub fn metric_prefix(&self) -> String {
        format!("tsp.{}.", self.name())
    }
}

/// One role's configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Append-only process log. Stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Directory watched for collector executables (forwarder, poller).
    #[serde(default)]
    pub collect_path: Option<PathBuf>,
    /// Ingress bind address (aggregator).
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Rewrite/block rules, in order. Defaults to a single block-all rule:
    /// forwarding anything is an explicit decision.
    #[serde(default)]
    pub filter: Vec<Rule>,
    /// Relay destinations by name.
    #[serde(default)]
    pub relay: HashMap<String, RelayConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("error creating filter: {0}")]
    Filter(#[from] FilterError),
    #[error("missing setting: relay")]
    MissingRelay,
    #[error("too many relays defined: {0} > {MAX_RELAYS}")]
    TooManyRelays(usize),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("missing setting: collect_path")]
    MissingCollectPath,
    #[error("missing setting: listen_addr")]
    MissingListenAddr,
    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),
}

impl Config {
    /// Read and validate the file for the given role.
    pub fn load(path: &Path, role: Role) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        config.validate(role)?;
        Ok(config)
    }

    /// Validate and normalise in place.
    pub fn validate(&mut self, role: Role) -> Result<(), ConfigError> {
        if self.filter.is_empty() {
            self.filter = vec![Rule::block_all()];
        }
        Filter::new(&self.filter)?;

        if self.relay.is_empty() {
            return Err(ConfigError::MissingRelay);
        }
        if self.relay.len() > MAX_RELAYS {
            return Err(ConfigError::TooManyRelays(self.relay.len()));
        }
        for config in self.relay.values() {
            config.validate()?;
        }

        match role {
            Role::Forwarder | Role::Poller => {
                if self.collect_path.is_none() {
                    return Err(ConfigError::MissingCollectPath);
                }
            }
            Role::Aggregator => {
                let addr = self
                    .listen_addr
                    .as_deref()
                    .ok_or(ConfigError::MissingListenAddr)?;
                self.listen_addr = Some(normalize_listen_addr(addr)?);
            }
        }
        Ok(())
    }

    /// Effective configuration as TOML, for `-t` output.
    pub fn dump(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Accept `host:port`, `host` (default port added), or `:port` (all
/// interfaces).
pub fn normalize_listen_addr(addr: &str) -> Result<String, ConfigError> {
    if addr.is_empty() {
        return Err(ConfigError::InvalidListenAddr(addr.to_string()));
    }
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::InvalidListenAddr(addr.to_string()))?;
            (host, port)
        }
        None => (addr, DEFAULT_PORT),
    };
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

/// Shared holder for the loaded configuration.
pub struct ConfigHandle {
    inner: ArcSwap<Config>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    pub fn store(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }
}

/// Watch the config file. When a changed file revalidates cleanly the new
/// config is stored in `handle` and a cause string is delivered; a broken
/// replacement keeps the old config, counts, and is retried at a slower
/// cadence.
pub fn watch(path: PathBuf, role: Role, handle: Arc<ConfigHandle>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let stat_errors = tsp_metrics::counter("config.Errors", "type=Reload");
        let mut last_modified = modified(&path);
        let mut interval = WATCH_INTERVAL;
        loop {
            tokio::time::sleep(interval).await;
            let now_modified = modified(&path);
            if now_modified == last_modified {
                continue;
            }
            last_modified = now_modified;
            match Config::load(&path, role) {
                Ok(config) => {
                    interval = WATCH_INTERVAL;
                    handle.store(config);
                    if tx.send("config updated".to_string()).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    stat_errors.incr();
                    tracing::warn!(path = %path.display(), %err, "config reload error, keeping previous");
                    interval = WATCH_ERROR_INTERVAL;
                }
            }
        }
    });
    rx
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
