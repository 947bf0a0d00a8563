//! Per-connection relay state machine
//!
//! Each accepted client socket moves through `Buffering -> Connecting ->
//! Relaying -> Closed`, with a `Buffering -> Closed` shortcut for status
//! probes. Bytes arriving before the upstream socket exists are appended to
//! a buffer and flushed FIFO the moment the upstream is writable; nothing
//! is ever dropped or reordered.

use crate::messages::HostCommand;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Fixed response to a status probe: written, then the write side is closed
const PROBE_RESPONSE: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";

/// Marker header that makes a request a liveness probe
const PROBE_HEADER: &str = "status";

/// At most one idle-timer reset per connection per second
const ACTIVITY_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle reports from a connection task back to its worker
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// The upstream socket is live
    Connected { key: String },
    /// Terminal; the worker drops the table entry
    Closed { key: String },
}

/// Everything one connection task needs, handed over by the worker
pub(crate) struct ClientConn {
    /// Remote `addr:port`, unique per live connection
    pub key: String,
    pub service: String,
    pub stream: TcpStream,
    pub backend: SocketAddr,
    /// Worker-maintained view of the host lifecycle
    pub host_up: watch::Receiver<bool>,
    /// Fires when the controller wants upstream sockets gone
    pub destroy: broadcast::Receiver<()>,
    pub controller_tx: mpsc::Sender<HostCommand>,
    /// Hard bound on the ensure-started wait
    pub start_timeout: Duration,
    pub events: mpsc::Sender<ConnEvent>,
}

pub(crate) async fn handle_client(mut conn: ClientConn) {
    run_connection(&mut conn).await;
    let _ = conn
        .events
        .send(ConnEvent::Closed {
            key: conn.key.clone(),
        })
        .await;
}

async fn run_connection(conn: &mut ClientConn) {
    let mut chunk = [0u8; 8192];
    let n = match conn.stream.read(&mut chunk).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            debug!(key = %conn.key, error = %e, "Client read failed before any data");
            return;
        }
    };

    let header = parse_header_block(&chunk[..n]);
    let origin = header.as_ref().and_then(HeaderBlock::origin_hint);
    if let Some(origin) = &origin {
        debug!(key = %conn.key, service = %conn.service, origin = %origin, "Client origin hint");
    }

    if header.as_ref().is_some_and(HeaderBlock::is_status_probe) && !*conn.host_up.borrow() {
        debug!(key = %conn.key, service = %conn.service, "Status probe while host is down");
        if conn.stream.write_all(PROBE_RESPONSE).await.is_ok() {
            let _ = conn.stream.shutdown().await;
        }
        return;
    }

    // Buffering: hold the client's bytes until the host answers probes
    let mut buffer = Vec::with_capacity(n.max(4096));
    buffer.extend_from_slice(&chunk[..n]);
    let _ = conn.controller_tx.try_send(HostCommand::RecordActivity);

    let (reply_tx, mut reply_rx) = oneshot::channel();
    if conn
        .controller_tx
        .send(HostCommand::EnsureStarted {
            origin,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let deadline = tokio::time::sleep(conn.start_timeout);
    tokio::pin!(deadline);

    let started = loop {
        tokio::select! {
            reply = &mut reply_rx => break reply.unwrap_or(false),
            read = conn.stream.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(key = %conn.key, "Client closed while buffering");
                    return;
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!(key = %conn.key, error = %e, "Client read failed while buffering");
                    return;
                }
            },
            _ = &mut deadline => {
                warn!(key = %conn.key, service = %conn.service,
                    timeout_secs = conn.start_timeout.as_secs(),
                    "Host start timed out; abandoning connection");
                return;
            }
        }
    };

    if !started {
        debug!(key = %conn.key, service = %conn.service, "Host did not start; closing connection");
        return;
    }

    // Connecting
    let mut upstream = match TcpStream::connect(conn.backend).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(key = %conn.key, backend = %conn.backend, error = %e, "Upstream dial failed");
            return;
        }
    };

    if let Err(e) = upstream.write_all(&buffer).await {
        debug!(key = %conn.key, error = %e, "Flushing buffered bytes failed");
        return;
    }
    debug!(key = %conn.key, service = %conn.service, buffered = buffer.len(), "Upstream connected, buffer flushed");
    drop(buffer);

    let _ = conn
        .events
        .send(ConnEvent::Connected {
            key: conn.key.clone(),
        })
        .await;

    relay(conn, upstream).await;
}

/// Steady-state bidirectional pump. Ends when either side closes or errors,
/// or when the destroy signal fires.
async fn relay(conn: &mut ClientConn, upstream: TcpStream) {
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let (mut client_read, mut client_write) = conn.stream.split();

    let mut client_buf = [0u8; 16384];
    let mut upstream_buf = [0u8; 16384];
    let mut client_to_upstream: u64 = 0;
    let mut upstream_to_client: u64 = 0;
    let mut last_report: Option<Instant> = None;

    loop {
        tokio::select! {
            read = client_read.read(&mut client_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if upstream_write.write_all(&client_buf[..n]).await.is_err() {
                        break;
                    }
                    client_to_upstream += n as u64;
                    report_activity(&conn.controller_tx, &mut last_report);
                }
            },
            read = upstream_read.read(&mut upstream_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&upstream_buf[..n]).await.is_err() {
                        break;
                    }
                    upstream_to_client += n as u64;
                    report_activity(&conn.controller_tx, &mut last_report);
                }
            },
            // any resolution (signal, lag, worker gone) tears the relay down
            _ = conn.destroy.recv() => {
                debug!(key = %conn.key, service = %conn.service, "Upstream destroyed by controller");
                break;
            }
        }
    }

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    debug!(
        key = %conn.key,
        service = %conn.service,
        client_to_upstream,
        upstream_to_client,
        "Relay closed"
    );
}

fn report_activity(controller_tx: &mpsc::Sender<HostCommand>, last_report: &mut Option<Instant>) {
    match last_report {
        Some(at) if at.elapsed() < ACTIVITY_REPORT_INTERVAL => {}
        _ => {
            *last_report = Some(Instant::now());
            let _ = controller_tx.try_send(HostCommand::RecordActivity);
        }
    }
}

/// A tokenized header block from the first bytes of a connection
#[derive(Debug, PartialEq)]
pub(crate) struct HeaderBlock {
    /// Lowercased names, trimmed values, in arrival order
    fields: Vec<(String, String)>,
}

impl HeaderBlock {
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn is_status_probe(&self) -> bool {
        self.get(PROBE_HEADER) == Some("true")
    }

    /// Originating-IP hint, for logging and notifications only
    pub(crate) fn origin_hint(&self) -> Option<String> {
        if let Some(ip) = self.get("x-real-ip") {
            return Some(ip.to_string());
        }
        self.get("x-forwarded-for")
            .and_then(|list| list.split(',').next())
            .map(|ip| ip.trim().to_string())
    }
}

/// Tokenize a line-based header block: a request line, `name: value` lines,
/// then a blank line. Returns `None` when the data does not contain a
/// complete, well-formed block; callers treat that as opaque pass-through
/// data, never as an error.
pub(crate) fn parse_header_block(data: &[u8]) -> Option<HeaderBlock> {
    let head_len = find_blank_line(data)?;
    let head = std::str::from_utf8(&data[..head_len]).ok()?;

    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));
    // request line ("GET / HTTP/1.1"), inspected by nobody
    lines.next()?;

    let mut fields = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        fields.push((
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        ));
    }
    Some(HeaderBlock { fields })
}

/// Offset of the first blank line, i.e. the length of the header section
fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| data.windows(2).position(|w| w == b"\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_request_has_no_probe_marker() {
        let block = parse_header_block(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert!(!block.is_status_probe());
        assert_eq!(block.get("host"), Some("example.com"));
    }

    #[test]
    fn test_status_probe_marker() {
        let block = parse_header_block(b"GET / HTTP/1.1\r\nstatus: true\r\n\r\n").unwrap();
        assert!(block.is_status_probe());

        let block = parse_header_block(b"GET / HTTP/1.1\r\nStatus:  TRUE \r\n\r\n").unwrap();
        // values are trimmed but not case-folded
        assert!(!block.is_status_probe());
    }

    #[test]
    fn test_origin_hint_prefers_x_real_ip() {
        let block = parse_header_block(
            b"GET / HTTP/1.1\r\nx-forwarded-for: 10.0.0.1, 10.0.0.2\r\nx-real-ip: 192.168.1.9\r\n\r\n",
        )
        .unwrap();
        assert_eq!(block.origin_hint(), Some("192.168.1.9".to_string()));
    }

    #[test]
    fn test_origin_hint_from_forwarded_for() {
        let block =
            parse_header_block(b"GET / HTTP/1.1\r\nX-Forwarded-For: 10.0.0.1, 10.0.0.2\r\n\r\n")
                .unwrap();
        assert_eq!(block.origin_hint(), Some("10.0.0.1".to_string()));
    }

    #[test]
    fn test_incomplete_block_is_opaque() {
        assert_eq!(parse_header_block(b"GET / HTTP/1.1\r\nHost: exa"), None);
    }

    #[test]
    fn test_binary_data_is_opaque() {
        assert_eq!(parse_header_block(&[0x00, 0x2a, 0xff, 0x17, 0x03]), None);
        // blank line present but the head is not UTF-8
        assert_eq!(parse_header_block(b"\xff\xfe\r\nbad: x\r\n\r\n"), None);
    }

    #[test]
    fn test_header_line_without_colon_is_opaque() {
        assert_eq!(
            parse_header_block(b"GET / HTTP/1.1\r\nnot a header line\r\n\r\n"),
            None
        );
    }

    #[test]
    fn test_bare_newline_framing() {
        let block = parse_header_block(b"GET / HTTP/1.1\nstatus: true\n\n").unwrap();
        assert!(block.is_status_probe());
    }
}
