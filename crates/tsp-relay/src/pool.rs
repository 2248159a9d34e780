//! Fan-out of the final point stream to every configured relay.

use std::collections::HashMap;

use tokio::sync::mpsc;

use tsp_wire::Point;

use crate::relay::{Relay, RelayConfig, RelayError};

/// The set of relays a role forwards to. Repeat suppression and queueing
/// are per-relay, so one slow destination never affects another.
pub struct RelayPool {
    relays: Vec<Relay>,
}

impl RelayPool {
    pub fn new(configs: &HashMap<String, RelayConfig>) -> Result<RelayPool, RelayError> {
        let mut relays = Vec::with_capacity(configs.len());
        for (name, config) in configs {
            let relay = Relay::new(name, config)?;
            tsp_metrics::register_gauge("relay.Queue", &format!("relay={name}"), relay.queue_watch());
            relays.push(relay);
        }
        Ok(RelayPool { relays })
    }

    /// Consume the point stream, submitting every point to every relay.
    /// Returns when the stream closes.
    pub async fn broadcast(mut self, mut points: mpsc::Receiver<Point>) {
        while let Some(point) = points.recv().await {
            for relay in &mut self.relays {
                relay.submit(&point);
            }
        }
    }
}
