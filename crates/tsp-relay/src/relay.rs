//! A named relay: configuration, drop accounting, client wiring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tsp_wire::Point;

use crate::client::{Client, ClientConfig, DropFn};

const MAX_CONNS_PER_HOST: usize = 16;

/// Policy for lines that do not fit the submit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnQueueFull {
    /// Count the loss and move on.
    #[default]
    Drop,
    /// Count and additionally log every lost line.
    DropAndLog,
}

/// Configuration of one relay destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Comma-separated `host[:port]` list; port defaults to 4242.
    pub host: String,
    /// Enable per-series repeat suppression.
    #[serde(default)]
    pub drop_repeats: bool,
    /// Connections dialed per host, 1..=16. Pollers use a high value to
    /// spread series across downstream nodes.
    #[serde(default)]
    pub max_conns_per_host: Option<usize>,
    #[serde(default)]
    pub on_queue_full: OnQueueFull,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.host.is_empty() {
            return Err(RelayError::MissingHost);
        }
        let conns = self.max_conns();
        if !(1..=MAX_CONNS_PER_HOST).contains(&conns) {
            return Err(RelayError::ConnsOutOfRange(conns));
        }
        Ok(())
    }

    pub fn max_conns(&self) -> usize {
        self.max_conns_per_host.unwrap_or(1)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay: missing host")]
    MissingHost,
    #[error("max_conns_per_host out of range: {0}")]
    ConnsOutOfRange(usize),
    #[error("relay {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: Box<RelayError>,
    },
}

/// One outbound relay. Submission is non-blocking; losses are counted under
/// `relay.Errors type=Drop relay=<name>` and, with
/// [`OnQueueFull::DropAndLog`], logged line by line.
pub struct Relay {
    name: String,
    client: Client,
}

impl Relay {
    pub fn new(name: &str, config: &RelayConfig) -> Result<Relay, RelayError> {
        config.validate().map_err(|source| RelayError::Invalid {
            name: name.to_string(),
            source: Box::new(source),
        })?;
        let client = Client::new(
            &config.host,
            ClientConfig {
                drop_repeats: config.drop_repeats,
                max_conns_per_host: config.max_conns(),
            },
            Some(drop_hook(name, config.on_queue_full)),
        );
        Ok(Relay {
            name: name.to_string(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit the point. Not safe for concurrent use; each relay is owned by
    /// the broadcast task.
    pub fn submit(&mut self, point: &Point) {
        self.client.put(point);
    }

    pub fn queue_len(&self) -> usize {
        self.client.queue_len()
    }

    /// Gauge closure for the submit queue length.
    pub fn queue_watch(&self) -> impl Fn() -> i64 + Send + Sync + 'static {
        self.client.queue_watch()
    }
}

/// Build the drop hook for a relay. Always counts; optionally logs.
fn drop_hook(name: &str, policy: OnQueueFull) -> DropFn {
    let stat_drop = tsp_metrics::counter("relay.Errors", &format!("type=Drop relay={name}"));
    let name = name.to_string();
    let log = policy == OnQueueFull::DropAndLog;
    Arc::new(move |lines: &[u8]| {
        let count = lines.iter().filter(|&&c| c == b'\n').count();
        stat_drop.add(count as i64);
        if log {
            for line in lines.split(|&c| c == b'\n') {
                if line.is_empty() {
                    continue;
                }
                tracing::warn!(
                    relay = %name,
                    line = %String::from_utf8_lossy(line),
                    "lost"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str) -> RelayConfig {
        RelayConfig {
            host: host.to_string(),
            drop_repeats: false,
            max_conns_per_host: None,
            on_queue_full: OnQueueFull::Drop,
        }
    }

    #[test]
    fn test_validate() {
        assert!(config("tsd1,tsd2:4243").validate().is_ok());
        assert!(matches!(
            config("").validate(),
            Err(RelayError::MissingHost)
        ));
        let mut c = config("tsd");
        c.max_conns_per_host = Some(0);
        assert!(matches!(
            c.validate(),
            Err(RelayError::ConnsOutOfRange(0))
        ));
        c.max_conns_per_host = Some(16);
        assert!(c.validate().is_ok());
        c.max_conns_per_host = Some(17);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_default_policy() {
        let parsed: RelayConfig = toml::from_str(r#"host = "tsd""#).unwrap();
        assert_eq!(parsed.on_queue_full, OnQueueFull::Drop);
        assert_eq!(parsed.max_conns(), 1);
        assert!(!parsed.drop_repeats);
    }

    #[test]
    fn test_policy_parse() {
        let parsed: RelayConfig = toml::from_str(
            r#"
            host = "tsd"
            drop_repeats = true
            max_conns_per_host = 12
            on_queue_full = "DropAndLog"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.on_queue_full, OnQueueFull::DropAndLog);
        assert_eq!(parsed.max_conns(), 12);
        assert!(parsed.drop_repeats);
    }

    #[tokio::test]
    async fn test_new_relay_rejects_bad_config() {
        assert!(Relay::new("main", &config("")).is_err());
    }
}
