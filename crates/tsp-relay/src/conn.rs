//! A single connection to a downstream ingest host.
//!
//! Writes are unacknowledged `put` lines; every five seconds the client
//! sends `version\n` and waits for the banner, which doubles as a batch
//! acknowledgement of everything written since the previous one. Until that
//! ack arrives, a byte copy of every line sits in the pending buffer; on
//! connection failure the pending bytes go to the drop hook, never back
//! onto the wire.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use tsp_metrics::Counter;

use crate::cmd;

pub(crate) const DEFAULT_PORT: u16 = 4242;
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const ACK_INTERVAL: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

const BANNER: &[u8] = b"Built on ";
const BANNER_PREAMBLE: &[u8] = b"net.opentsdb built at revision ";

pub(crate) struct Conn {
    addr: String,
    reader: tokio::sync::Mutex<BufReader<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<BytesMut>,
    ack_time: Mutex<Option<Instant>>,
    stat_network: Counter,
    stat_server: Counter,
    stat_bytes: Counter,
}

impl Conn {
    /// Open a TCP connection. Nagle stays enabled: the write path relies on
    /// the kernel to coalesce small put lines.
    pub(crate) async fn connect(addr: &str) -> io::Result<Conn> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(false)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Conn {
            addr: addr.to_string(),
            reader: tokio::sync::Mutex::new(BufReader::new(read_half)),
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(BytesMut::new()),
            ack_time: Mutex::new(None),
            stat_network: tsp_metrics::counter("client.Errors", "type=Network"),
            stat_server: tsp_metrics::counter("client.Errors", "type=Server"),
            stat_bytes: tsp_metrics::counter("encoder.Bytes", ""),
        })
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Write one put command and run the periodic ack.
    pub(crate) async fn put_and_ack(&self, command: &[u8]) -> io::Result<()> {
        self.put(command).await?;
        self.ack(false).await
    }

    /// Send a put line. There is no immediate response; the line is copied
    /// into the pending buffer until the next batch ack clears it.
    async fn put(&self, command: &[u8]) -> io::Result<()> {
        if let Err(err) = self.writer.lock().await.write_all(command).await {
            self.stat_network.incr();
            return Err(err);
        }
        let line = cmd::cmd_line(command);
        self.pending.lock().extend_from_slice(line);
        self.stat_bytes.add(line.len() as i64);
        Ok(())
    }

    /// Run the version handshake if one is due (or `force`d). Success clears
    /// the pending buffer.
    pub(crate) async fn ack(&self, force: bool) -> io::Result<()> {
        if !force {
            let last = *self.ack_time.lock();
            if let Some(last) = last {
                if last.elapsed() < ACK_INTERVAL {
                    return Ok(());
                }
            }
        }
        self.version().await?;
        *self.ack_time.lock() = Some(Instant::now());
        self.pending.lock().clear();
        Ok(())
    }

    /// Send `version\n` and await the banner line.
    async fn version(&self) -> io::Result<()> {
        if let Err(err) = self.writer.lock().await.write_all(b"version\n").await {
            self.stat_network.incr();
            return Err(err);
        }
        self.read_version_response().await
    }

    async fn read_version_response(&self) -> io::Result<()> {
        let mut reader = self.reader.lock().await;
        let mut line = Vec::with_capacity(256);
        loop {
            line.clear();
            let read = timeout(ACK_TIMEOUT, reader.read_until(b'\n', &mut line)).await;
            let n = match read {
                Err(_) => {
                    self.stat_network.incr();
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "ack timed out"));
                }
                Ok(Err(err)) => {
                    self.stat_network.incr();
                    return Err(err);
                }
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                self.stat_network.incr();
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.starts_with(BANNER) {
                return Ok(());
            }
            if line.starts_with(BANNER_PREAMBLE) {
                continue;
            }
            // Anything else is a server complaint about an earlier put.
            self.stat_server.incr();
        }
    }

    /// Detach the unacknowledged bytes, e.g. to hand them to a drop hook.
    pub(crate) fn take_pending(&self) -> Bytes {
        self.pending.lock().split().freeze()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Complete `host[:port]` with the default ingest port.
pub(crate) fn addr_full(addr: &str) -> String {
    let has_port = match addr.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn banner_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut lines = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let trimmed = line.trim_end().to_string();
                if trimmed == "version" {
                    write_half
                        .write_all(b"net.opentsdb built at revision abc\nBuilt on test\n")
                        .await
                        .unwrap();
                } else {
                    lines.push(trimmed);
                }
            }
            lines
        });
        (addr, handle)
    }

    #[test]
    fn test_addr_full() {
        assert_eq!(addr_full("host"), "host:4242");
        assert_eq!(addr_full("host:1234"), "host:1234");
        assert_eq!(addr_full("10.0.0.1"), "10.0.0.1:4242");
    }

    #[tokio::test]
    async fn test_put_and_ack_round_trip() {
        let (addr, server) = banner_server().await;
        let conn = Conn::connect(&addr.to_string()).await.unwrap();

        conn.put(b"put x 1 1\n").await.unwrap();
        assert_eq!(conn.pending_len(), "x 1 1\n".len());

        // Forced ack drains the banner and clears pending.
        conn.ack(true).await.unwrap();
        assert_eq!(conn.pending_len(), 0);

        // A second ack right away is a no-op.
        conn.put(b"put x 2 1\n").await.unwrap();
        conn.ack(false).await.unwrap();
        assert_eq!(conn.pending_len(), "x 2 1\n".len());

        drop(conn);
        let lines = server.await.unwrap();
        assert_eq!(lines, vec!["put x 1 1", "put x 2 1"]);
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        // A server that accepts but never answers version.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let conn = Conn::connect(&addr.to_string()).await.unwrap();
        let t0 = std::time::Instant::now();
        let err = conn.ack(true).await.unwrap_err();
        assert!(t0.elapsed() >= ACK_TIMEOUT);
        assert!(matches!(
            err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(Conn::connect(&addr.to_string()).await.is_err());
    }
}
