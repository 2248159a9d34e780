//! Aggregation ingress: fan-in from forwarders and pollers.
//!
//! A long-lived TCP connection carries newline-terminated commands:
//! `put <line>` feeds a point into the pipeline, `version` answers with the
//! build banner (the batch-ack clients key on), anything else gets
//! `error: invalid command`. Inbound points skip the per-series order check
//! because data joined from many hosts interleaves arbitrarily; syntax
//! errors are answered and survived, never fatal to the connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tsp_metrics::Counter;
use tsp_wire::{Decoder, Point};

/// Max points queued between the ingress and the pipeline.
pub const MAX_QUEUE: usize = 100_000;

const ACCEPT_RETRY: Duration = Duration::from_secs(5);

/// Build the identifier line sent in response to `version`. Clients match
/// on the `Built on ` prefix.
pub fn banner(role: &str, version: &str) -> String {
    format!("Built on {version} (tsp-{role})")
}

/// A bound ingress listener and its point stream.
pub struct Ingress {
    local_addr: SocketAddr,
    points: Option<mpsc::Receiver<Point>>,
}

impl Ingress {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The inbound point stream. May be taken once.
    pub fn take_points(&mut self) -> mpsc::Receiver<Point> {
        self.points.take().expect("point stream already taken")
    }
}

/// Bind `addr` and serve connections until the process exits. A bind
/// failure is returned (fatal at startup); accept failures are logged and
/// retried.
pub async fn listen(addr: &str, banner: String) -> io::Result<Ingress> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "ingress listening");
    let (tx, rx) = mpsc::channel(MAX_QUEUE);
    let queue_tx = tx.clone();
    tsp_metrics::register_gauge("server.Queue", "", move || {
        (queue_tx.max_capacity() - queue_tx.capacity()) as i64
    });
    tokio::spawn(accept_loop(listener, tx, banner));
    Ok(Ingress {
        local_addr,
        points: Some(rx),
    })
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Point>, banner: String) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "ingress connection");
                tokio::spawn(conn_loop(stream, tx.clone(), banner.clone()));
            }
            Err(err) => {
                tracing::warn!(%err, "accept error");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
}

/// Counts one established connection for as long as it lives.
struct Established(Counter);

impl Established {
    fn new() -> Established {
        let counter = tsp_metrics::counter("server.CurrEstab", "");
        counter.incr();
        Established(counter)
    }
}

impl Drop for Established {
    fn drop(&mut self) {
        self.0.add(-1);
    }
}

async fn conn_loop(stream: TcpStream, tx: mpsc::Sender<Point>, banner: String) {
    let _established = Established::new();
    let stat_invalid = tsp_metrics::counter("server.Errors", "type=InvalidCommand");
    let stat_syntax = tsp_metrics::counter("server.Errors", "type=Syntax");
    let stat_enqueue = tsp_metrics::counter("server.Errors", "type=Enqueue");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut decoder = Decoder::new();
    decoder.disable_order_check();
    let mut line = Vec::with_capacity(1024);

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if line.last() != Some(&b'\n') {
            return; // truncated final line from a dying peer
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if line == b"version" {
            if write_half
                .write_all(format!("{banner}\n").as_bytes())
                .await
                .is_err()
            {
                return;
            }
            continue;
        }
        let Some(body) = line.strip_prefix(b"put ".as_slice()) else {
            stat_invalid.incr();
            if write_half.write_all(b"error: invalid command\n").await.is_err() {
                return;
            }
            continue;
        };
        let point = match decoder.decode_line(body) {
            Ok(point) => point,
            Err(_) => {
                stat_syntax.incr();
                if write_half.write_all(b"error: invalid syntax\n").await.is_err() {
                    return;
                }
                continue;
            }
        };
        match tx.try_send(point) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(point)) => {
                // Queue full: hold the connection (backpressure to the
                // sender) rather than drop the point.
                stat_enqueue.incr();
                if tx.send(point).await.is_err() {
                    return;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsp_wire::Value;

    struct TestClient {
        reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> TestClient {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            TestClient {
                reader: BufReader::new(read_half),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line
        }
    }

    async fn start() -> (Ingress, mpsc::Receiver<Point>) {
        let mut ingress = listen("127.0.0.1:0", banner("aggregator", "0.1.0"))
            .await
            .unwrap();
        let points = ingress.take_points();
        (ingress, points)
    }

    #[tokio::test]
    async fn test_version_command() {
        let (ingress, _points) = start().await;
        let mut client = TestClient::connect(ingress.local_addr()).await;
        client.send("version\n").await;
        let reply = client.read_line().await;
        assert!(reply.starts_with("Built on "), "got {reply:?}");
        assert!(reply.contains("tsp-aggregator"));
    }

    #[tokio::test]
    async fn test_put_feeds_pipeline() {
        let (ingress, mut points) = start().await;
        let mut client = TestClient::connect(ingress.local_addr()).await;
        client.send("put foo 1000000001 1 host=a\n").await;
        let point = points.recv().await.unwrap();
        assert_eq!(point.metric(), b"foo");
        assert_eq!(point.value(), Value::Int(1));
        assert_eq!(point.tag(b"host"), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn test_out_of_order_put_accepted() {
        let (ingress, mut points) = start().await;
        let mut client = TestClient::connect(ingress.local_addr()).await;
        client.send("put foo 1000000002 1 host=a\n").await;
        client.send("put foo 1000000001 2 host=a\n").await;
        client.send("put foo 1000000001 3 host=a\n").await;
        for want in [1, 2, 3] {
            let point = points.recv().await.unwrap();
            assert_eq!(point.value(), Value::Int(want));
        }
    }

    #[tokio::test]
    async fn test_invalid_syntax_answered_and_survived() {
        let (ingress, mut points) = start().await;
        let mut client = TestClient::connect(ingress.local_addr()).await;
        client.send("put not!a@point\n").await;
        assert_eq!(client.read_line().await, "error: invalid syntax\n");
        // The connection is still usable.
        client.send("put foo 1000000001 1\n").await;
        assert_eq!(points.recv().await.unwrap().metric(), b"foo");
    }

    #[tokio::test]
    async fn test_invalid_command_answered() {
        let (ingress, _points) = start().await;
        let mut client = TestClient::connect(ingress.local_addr()).await;
        client.send("stats\n").await;
        assert_eq!(client.read_line().await, "error: invalid command\n");
        client.send("version\n").await;
        assert!(client.read_line().await.starts_with("Built on "));
    }

    #[tokio::test]
    async fn test_eof_closes_quietly() {
        let (ingress, mut points) = start().await;
        {
            let mut client = TestClient::connect(ingress.local_addr()).await;
            client.send("put foo 1000000001 1\n").await;
            client.send("put truncated 10000000").await; // no newline
        }
        assert_eq!(points.recv().await.unwrap().metric(), b"foo");
        // Server side must have dropped the truncated tail without panic;
        // a fresh connection still works.
        let mut client = TestClient::connect(ingress.local_addr()).await;
        client.send("put bar 1000000001 1\n").await;
        assert_eq!(points.recv().await.unwrap().metric(), b"bar");
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let first = listen("127.0.0.1:0", banner("aggregator", "0.1.0"))
            .await
            .unwrap();
        let addr = first.local_addr().to_string();
        assert!(listen(&addr, banner("aggregator", "0.1.0")).await.is_err());
    }
}
