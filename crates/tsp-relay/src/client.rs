//! Relay client: bounded queue, dispatcher, connection supervision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;

use tsp_metrics::Counter;
use tsp_wire::Point;

use crate::cmd;
use crate::conn::{addr_full, Conn};
use crate::repeat::RepeatTester;

const MAX_QUEUE: usize = 100_000;
const DIAL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_SLEEP_START: Duration = Duration::from_secs(1);
const RETRY_SLEEP_MAX: Duration = Duration::from_secs(10 * 60);
const LOOKUP_RETRY: Duration = Duration::from_secs(1);

/// Hook invoked with newline-terminated lines that will never reach the
/// destination: queue overflow and unacknowledged bytes of a torn-down
/// connection.
pub type DropFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub drop_repeats: bool,
    pub max_conns_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            drop_repeats: false,
            max_conns_per_host: 1,
        }
    }
}

/// A connection pool to one downstream host list.
///
/// `put` never blocks on the network: lines go through a bounded queue to a
/// dispatcher task, which routes each line to `connections[hash % live]`.
/// Network failures remove the connection, hand its pending bytes to the
/// drop hook, and respawn a dialer with exponential backoff.
pub struct Client {
    hosts: String,
    config: ClientConfig,
    tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    repeat: RepeatTester,
    started: bool,
}

struct Shared {
    up: RwLock<Vec<Arc<Conn>>>,
    drop_hook: Option<DropFn>,
    /// Next backoff delay per address; absent means dial immediately.
    backoff: Mutex<HashMap<String, Duration>>,
    /// Global dial pacing, one attempt per tick across all addresses.
    dial_rate: tokio::sync::Mutex<tokio::time::Interval>,
    stat_dial_errors: Counter,
}

impl Client {
    pub fn new(hosts: &str, config: ClientConfig, drop_hook: Option<DropFn>) -> Client {
        Client::with_queue(hosts, config, drop_hook, MAX_QUEUE)
    }

    fn with_queue(
        hosts: &str,
        config: ClientConfig,
        drop_hook: Option<DropFn>,
        queue: usize,
    ) -> Client {
        let (tx, rx) = mpsc::channel(queue);
        let mut dial_rate = tokio::time::interval(DIAL_INTERVAL);
        dial_rate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shared = Arc::new(Shared {
            up: RwLock::new(Vec::new()),
            drop_hook,
            backoff: Mutex::new(HashMap::new()),
            dial_rate: tokio::sync::Mutex::new(dial_rate),
            stat_dial_errors: tsp_metrics::counter("client.Errors", "type=Dial"),
        });
        tokio::spawn(dispatch(rx, shared.clone()));
        Client {
            hosts: hosts.to_string(),
            config,
            tx,
            shared,
            repeat: RepeatTester::new(),
            started: false,
        }
    }

    /// Submit a point. Never blocks on I/O; a full queue routes the line to
    /// the drop hook instead.
    pub fn put(&mut self, point: &Point) {
        if !self.started {
            self.started = true;
            self.dial_all();
        }
        if self.config.drop_repeats {
            let (is_repeat, held) = self.repeat.test(point);
            if let Some(held) = held {
                self.send(held);
            }
            if is_repeat {
                return;
            }
        }
        self.send(cmd::put_cmd(point));
    }

    /// Points currently waiting for the dispatcher.
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// A detached closure reporting the queue length, for gauge
    /// registration. Holds a sender clone, so it keeps the dispatcher alive.
    pub fn queue_watch(&self) -> impl Fn() -> i64 + Send + Sync + 'static {
        let tx = self.tx.clone();
        move || (tx.max_capacity() - tx.capacity()) as i64
    }

    /// Live connection count.
    pub fn conn_count(&self) -> usize {
        self.shared.up.read().len()
    }

    fn send(&self, command: Vec<u8>) {
        if let Err(err) = self.tx.try_send(command) {
            let command = match err {
                TrySendError::Full(command) | TrySendError::Closed(command) => command,
            };
            self.shared.drop_lines(cmd::cmd_line(&command));
        }
    }

    fn dial_all(&self) {
        for addr in self.hosts.split(',') {
            let addr = addr_full(addr.trim());
            for _ in 0..self.config.max_conns_per_host {
                tokio::spawn(dial(self.shared.clone(), addr.clone()));
            }
        }
    }
}

impl Shared {
    /// Pick the connection owning this series hash, if any is live.
    fn pick(&self, hash: usize) -> Option<Arc<Conn>> {
        let up = self.up.read();
        if up.is_empty() {
            return None;
        }
        Some(up[hash % up.len()].clone())
    }

    fn publish(&self, conn: Arc<Conn>) {
        self.up.write().push(conn);
    }

    fn drop_lines(&self, lines: &[u8]) {
        if let Some(hook) = &self.drop_hook {
            hook(lines);
        }
    }

    /// Sleep out the backoff for `addr`. The first attempt per address is
    /// immediate; each retry multiplies the delay by a random factor in
    /// [1, 2), capped at ten minutes. A successful dial clears the state.
    async fn backoff_sleep(&self, addr: &str) {
        let delay = {
            let mut backoff = self.backoff.lock();
            match backoff.get_mut(addr) {
                None => {
                    backoff.insert(addr.to_string(), RETRY_SLEEP_START);
                    None
                }
                Some(delay) => {
                    let factor = 1.0 + rand::random::<f64>();
                    let next = delay.mul_f64(factor).min(RETRY_SLEEP_MAX);
                    *delay = next;
                    Some(next)
                }
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn backoff_clear(&self, addr: &str) {
        self.backoff.lock().remove(addr);
    }
}

/// Dispatcher: drain the queue, routing each command by its series hash.
/// While no connection is live, the queue absorbs the backlog and overflow
/// goes to the drop hook via `send`.
async fn dispatch(mut rx: mpsc::Receiver<Vec<u8>>, shared: Arc<Shared>) {
    while let Some(command) = rx.recv().await {
        let conn = loop {
            match shared.pick(cmd::series_hash(&command)) {
                Some(conn) => break conn,
                None => tokio::time::sleep(LOOKUP_RETRY).await,
            }
        };
        if let Err(err) = conn.put_and_ack(&command).await {
            teardown(&shared, &conn, &err);
        }
    }
}

/// Tear a failed connection down: out of the live list, pending bytes to
/// the drop hook, and a fresh dialer for its address. The socket closes
/// when the last reference drops.
fn teardown(shared: &Arc<Shared>, conn: &Arc<Conn>, err: &std::io::Error) {
    {
        let mut up = shared.up.write();
        up.retain(|c| !Arc::ptr_eq(c, conn));
    }
    tracing::warn!(addr = conn.addr(), %err, "relay connection error");
    let pending = conn.take_pending();
    shared.drop_lines(&pending);
    tokio::spawn(dial(shared.clone(), conn.addr().to_string()));
}

/// Dial until one connection to `addr` is established and verified.
async fn dial(shared: Arc<Shared>, addr: String) {
    loop {
        shared.dial_rate.lock().await.tick().await;
        shared.backoff_sleep(&addr).await;
        let conn = match Conn::connect(&addr).await {
            Ok(conn) => conn,
            Err(err) => {
                shared.stat_dial_errors.incr();
                tracing::warn!(%addr, %err, "relay dial error");
                continue;
            }
        };
        // The banner handshake weeds out things that answer TCP but do not
        // speak the protocol.
        if let Err(err) = conn.ack(true).await {
            shared.stat_dial_errors.incr();
            tracing::warn!(%addr, %err, "relay probe error");
            continue;
        }
        shared.backoff_clear(&addr);
        shared.publish(Arc::new(conn));
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, UNIX_EPOCH};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as AsyncMutex;
    use tsp_wire::Value;

    fn point(metric: &str, secs: u64, value: i64) -> Point {
        Point::new(
            UNIX_EPOCH + Duration::from_secs(secs),
            Value::Int(value),
            metric,
            &[("host", "a")],
        )
        .unwrap()
    }

    /// A banner-speaking server that records put lines across connections,
    /// optionally closing each connection after `close_after` puts.
    struct MockServer {
        addr: std::net::SocketAddr,
        lines: Arc<AsyncMutex<Vec<String>>>,
        accepts: Arc<AtomicUsize>,
    }

    impl MockServer {
        async fn start(close_after: Option<usize>) -> MockServer {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let lines = Arc::new(AsyncMutex::new(Vec::new()));
            let accepts = Arc::new(AtomicUsize::new(0));
            let lines2 = lines.clone();
            let accepts2 = accepts.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    accepts2.fetch_add(1, Ordering::SeqCst);
                    let lines = lines2.clone();
                    tokio::spawn(async move {
                        let (read_half, mut write_half) = stream.into_split();
                        let mut reader = BufReader::new(read_half);
                        let mut line = String::new();
                        let mut puts = 0usize;
                        loop {
                            line.clear();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            let trimmed = line.trim_end();
                            if trimmed == "version" {
                                if write_half.write_all(b"Built on test\n").await.is_err() {
                                    return;
                                }
                                continue;
                            }
                            lines.lock().await.push(trimmed.to_string());
                            puts += 1;
                            if let Some(limit) = close_after {
                                if puts >= limit {
                                    return; // drop the connection mid-stream
                                }
                            }
                        }
                    });
                }
            });
            MockServer {
                addr,
                lines,
                accepts,
            }
        }
    }

    async fn wait_for<F: FnMut() -> bool>(mut cond: F, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_flows_to_server() {
        let server = MockServer::start(None).await;
        let mut client = Client::new(&server.addr.to_string(), ClientConfig::default(), None);
        client.put(&point("a", 1, 1));
        client.put(&point("a", 2, 2));

        assert!(
            wait_for(|| client.conn_count() == 1, Duration::from_secs(5)).await,
            "connection never came up"
        );
        let lines = server.lines.clone();
        let ok = wait_for(
            || lines.try_lock().map(|l| l.len() == 2).unwrap_or(false),
            Duration::from_secs(5),
        )
        .await;
        assert!(ok, "puts never arrived");
        let lines = server.lines.lock().await;
        assert_eq!(lines[0], "put a 1 1 host=a");
        assert_eq!(lines[1], "put a 2 2 host=a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_overflow_hits_drop_hook() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped2 = dropped.clone();
        let hook: DropFn = Arc::new(move |lines: &[u8]| {
            dropped2.fetch_add(lines.iter().filter(|&&c| c == b'\n').count(), Ordering::SeqCst);
        });
        // No server: nothing drains the queue past the dispatcher's one
        // in-flight command.
        let mut client = Client::with_queue(
            "127.0.0.1:1",
            ClientConfig::default(),
            Some(hook),
            4,
        );
        for i in 0..32u64 {
            client.put(&point("a", 1 + i, i as i64));
        }
        assert!(dropped.load(Ordering::SeqCst) >= 20, "drop hook not invoked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeats_suppressed_end_to_end() {
        let server = MockServer::start(None).await;
        let config = ClientConfig {
            drop_repeats: true,
            ..ClientConfig::default()
        };
        let mut client = Client::new(&server.addr.to_string(), config, None);
        for (secs, value) in [(1, 1), (2, 1000), (3, 1000), (4, 1000), (5, 1000000)] {
            client.put(&point("s", secs, value));
        }
        let lines = server.lines.clone();
        let ok = wait_for(
            || lines.try_lock().map(|l| l.len() == 5).unwrap_or(false),
            Duration::from_secs(5),
        )
        .await;
        assert!(ok, "expected lines never arrived");
        let lines = server.lines.lock().await;
        assert_eq!(
            *lines,
            vec![
                "put s 1 1 host=a",
                "put s 2 1000 host=a",
                "put s 3 1000 host=a",
                "put s 4 1000 host=a", // held segment closing the run
                "put s 5 1000000 host=a",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnect_after_server_drop() {
        // The server kills each connection after two puts. The producer must
        // never block, pending bytes go to the drop hook, and later points
        // flow over a fresh connection without duplicates.
        let server = MockServer::start(Some(2)).await;
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped2 = dropped.clone();
        let hook: DropFn = Arc::new(move |lines: &[u8]| {
            dropped2.fetch_add(lines.iter().filter(|&&c| c == b'\n').count(), Ordering::SeqCst);
        });
        let mut client = Client::new(&server.addr.to_string(), ClientConfig::default(), Some(hook));

        for i in 0..4u64 {
            client.put(&point("a", 1 + i, i as i64));
        }
        let lines = server.lines.clone();
        assert!(
            wait_for(
                || lines.try_lock().map(|l| l.len() >= 2).unwrap_or(false),
                Duration::from_secs(5),
            )
            .await
        );
        // The third put hits the dead connection, gets dropped, and a dialer
        // comes back. Keep submitting until the new connection carries one.
        let accepts = server.accepts.clone();
        assert!(
            wait_for(|| accepts.load(Ordering::SeqCst) >= 1, Duration::from_secs(5)).await
        );
        let mut next = 10u64;
        let ok = wait_for(
            || {
                // keep producing; reconnect takes a dialing cycle
                next += 1;
                client.put(&point("a", next, 0));
                std::thread::sleep(std::time::Duration::from_millis(50));
                accepts.load(Ordering::SeqCst) >= 2
                    && server.lines.try_lock().map(|l| l.len() > 2).unwrap_or(false)
            },
            Duration::from_secs(15),
        )
        .await;
        assert!(ok, "never reconnected");

        let lines = server.lines.lock().await;
        // No duplicates ever.
        let mut seen = std::collections::HashSet::new();
        for line in lines.iter() {
            assert!(seen.insert(line.clone()), "duplicate line {line}");
        }
    }
}
