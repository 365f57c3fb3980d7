//! Per-client request loop.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects, ConnectionHandler spawned
//!        │
//!        ▼
//! 2. ┌────────────────────────────────────┐
//!    │  Main Loop                         │
//!    │                                    │
//!    │  read bytes (per-request deadline) │
//!    │        │                           │
//!    │        ▼                           │
//!    │  decode frame ── protocol error ───┼──> close, no reply
//!    │        │                           │
//!    │        ▼                           │
//!    │  Session::handle (queue or run)    │
//!    │        │                           │
//!    │        ▼                           │
//!    │  write reply, loop back            │
//!    └────────────────────────────────────┘
//!        │
//!        ▼
//! 3. Disconnect, idle timeout or error: task ends
//! ```
//!
//! Requests on one connection are answered strictly in order. Several
//! frames arriving in one read are handled one after another from the
//! buffer before the socket is read again.

use crate::commands::{CommandHandler, Request};
use crate::protocol::{ParseError, RespParser, RespValue, MAX_FRAME_SIZE};
use crate::transaction::Session;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Inactivity deadline applied when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Written to a client just before an idle connection is closed.
const TIMEOUT_NOTICE: &[u8] = b"+timeout\r\n";

const INVALID_REQUEST: &str = "ERR invalid request format";

/// Server-wide connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Connections closed by the idle deadline
    pub idle_timeouts: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Emits the current totals at `info` level.
    pub fn log_summary(&self) {
        info!(
            accepted = self.connections_accepted.load(Ordering::Relaxed),
            active = self.active_connections.load(Ordering::Relaxed),
            commands = self.commands_processed.load(Ordering::Relaxed),
            bytes_in = self.bytes_read.load(Ordering::Relaxed),
            bytes_out = self.bytes_written.load(Ordering::Relaxed),
            idle_timeouts = self.idle_timeouts.load(Ordering::Relaxed),
            "Connection statistics"
        );
    }
}

/// Handles a single client connection.
///
/// Owns the read buffer and the client's transaction [`Session`]; the
/// [`CommandHandler`] is shared with every other connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    command_handler: CommandHandler,
    parser: RespParser,
    session: Session,
    idle_timeout: Duration,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::new(),
            session: Session::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stats,
        }
    }

    /// Replaces the inactivity deadline.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Serves the client until it disconnects, idles out, or breaks the
    /// protocol.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::IdleTimeout(after)) => {
                info!(client = %self.addr, idle_secs = after.as_secs(), "Closing idle connection")
            }
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        if self.session.queued() > 0 {
            debug!(
                client = %self.addr,
                dropped = self.session.queued(),
                "Open transaction dropped with connection"
            );
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        // One deadline per request: partial reads do not extend it.
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            while let Some(frame) = self.try_parse_frame()? {
                let response = self.process(frame);
                self.stats.command_processed();
                self.send_response(&response).await?;
                deadline = Instant::now() + self.idle_timeout;
            }

            self.read_before(deadline).await?;
        }
    }

    fn process(&mut self, frame: RespValue) -> RespValue {
        match Request::from_frame(frame) {
            Ok(request) => {
                trace!(client = %self.addr, command = request.name(), "Handling request");
                self.session.handle(request, &self.command_handler)
            }
            Err(e) => {
                debug!(client = %self.addr, error = %e, "Rejected request");
                RespValue::error(INVALID_REQUEST)
            }
        }
    }

    fn try_parse_frame(&mut self) -> Result<Option<RespValue>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed frame"
                );
                Ok(Some(value))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete frame, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Protocol error, closing connection");
                Err(ConnectionError::Parse(e))
            }
        }
    }

    /// Reads once, giving up at `deadline`. On timeout the client is told
    /// before the connection is dropped.
    async fn read_before(&mut self, deadline: Instant) -> Result<(), ConnectionError> {
        match tokio::time::timeout_at(deadline, self.read_more_data()).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.idle_timeout();
                // Best effort: the peer may already be gone.
                if self.stream.write_all(TIMEOUT_NOTICE).await.is_ok()
                    && self.stream.flush().await.is_ok()
                {
                    self.stats.bytes_written(TIMEOUT_NOTICE.len());
                }
                Err(ConnectionError::IdleTimeout(self.idle_timeout))
            }
        }
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        // Complete frames have already been drained, so the buffer starts
        // with an unfinished one. The parser rejects declared sizes past the
        // frame limit; this catches header lines that never terminate.
        if self.buffer.len() >= MAX_FRAME_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }
}

/// Ways a connection ends other than a clean close.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Undecodable bytes on the wire; the connection is dropped unanswered.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Client disconnected")]
    ClientDisconnected,

    /// Peer closed mid-frame
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// An unfinished frame already exceeds the frame size limit
    #[error("Buffer size limit exceeded")]
    BufferFull,

    #[error("No request within {0:?}")]
    IdleTimeout(Duration),
}

/// Runs a [`ConnectionHandler`] with the default idle deadline.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    serve_connection(stream, addr, command_handler, stats, DEFAULT_IDLE_TIMEOUT).await
}

/// Runs a [`ConnectionHandler`] to completion, swallowing the expected
/// ways a connection ends.
pub async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Duration,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats)
        .with_idle_timeout(idle_timeout);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected | ConnectionError::IdleTimeout(_) => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn create_test_server(
        idle_timeout: Duration,
    ) -> (SocketAddr, Arc<Store>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Store::new());
        let stats = Arc::new(ConnectionStats::new());

        let store_clone = Arc::clone(&store);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = CommandHandler::new(Arc::clone(&store_clone));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(serve_connection(
                    stream,
                    client_addr,
                    handler,
                    stats,
                    idle_timeout,
                ));
            }
        });

        (addr, store, stats)
    }

    /// Sends one request and reads until exactly `expected.len()` bytes
    /// have arrived.
    async fn roundtrip(client: &mut TcpStream, request: &[u8], expected: &[u8]) {
        client.write_all(request).await.unwrap();
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("reply timed out")
            .unwrap();
        assert_eq!(
            buf,
            expected,
            "got {:?}",
            String::from_utf8_lossy(&buf)
        );
    }

    fn encode(parts: &[&'static str]) -> Vec<u8> {
        RespValue::command(parts.iter().copied()).serialize()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;
        roundtrip(&mut client, &encode(&["ping", "hello"]), b"$5\r\nhello\r\n").await;
    }

    #[tokio::test]
    async fn test_set_get() {
        let (addr, store, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n",
            b"+OK\r\n",
        )
        .await;
        roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n", b"$4\r\nAriz\r\n").await;
        roundtrip(&mut client, &encode(&["GET", "missing"]), b"$-1\r\n").await;

        assert_eq!(
            store.snapshot().keyspace.get_string(b"name"),
            Some(Bytes::from("Ariz"))
        );
    }

    #[tokio::test]
    async fn test_hset_hget_hgetall() {
        let (addr, _, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, &encode(&["HSET", "user", "name", "ann"]), b"$2\r\nOK\r\n").await;
        roundtrip(&mut client, &encode(&["HSET", "user", "age", "7"]), b"$2\r\nOK\r\n").await;
        roundtrip(&mut client, &encode(&["HGET", "user", "name"]), b"$3\r\nann\r\n").await;
        roundtrip(
            &mut client,
            &encode(&["HGETALL", "user"]),
            b"*4\r\n$3\r\nage\r\n$1\r\n7\r\n$4\r\nname\r\n$3\r\nann\r\n",
        )
        .await;
        roundtrip(&mut client, &encode(&["HGETALL", "nobody"]), b"$12\r\nno such hash\r\n").await;
    }

    #[tokio::test]
    async fn test_multi_exec_over_tcp() {
        let (addr, _, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, &encode(&["MULTI"]), b"+OK\r\n").await;
        roundtrip(&mut client, &encode(&["SET", "a", "1"]), b"$10\r\n<<Queued>>\r\n").await;
        roundtrip(&mut client, &encode(&["EXEC"]), b"*1\r\n+OK\r\n").await;
        roundtrip(&mut client, &encode(&["GET", "a"]), b"$1\r\n1\r\n").await;
    }

    #[tokio::test]
    async fn test_pipelined_requests() {
        let (addr, _, stats) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut batch = encode(&["SET", "k", "v"]);
        batch.extend(encode(&["GET", "k"]));
        batch.extend(encode(&["PING"]));
        roundtrip(&mut client, &batch, b"+OK\r\n$1\r\nv\r\n+PONG\r\n").await;

        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_connection_open() {
        let (addr, _, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"+PING\r\n", b"-ERR invalid request format\r\n").await;
        roundtrip(&mut client, b"*0\r\n", b"-ERR invalid request format\r\n").await;
        roundtrip(&mut client, &encode(&["PING"]), b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn test_protocol_error_closes_connection() {
        let (addr, _, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"!bogus\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server did not close")
            .unwrap_or(0);
        assert_eq!(n, 0, "expected EOF, got {:?}", &buf[..n]);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (addr, _, stats) = create_test_server(Duration::from_millis(100)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("server did not close idle connection")
            .unwrap();
        assert_eq!(buf, TIMEOUT_NOTICE);
        assert_eq!(stats.idle_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_activity_resets_idle_deadline() {
        let (addr, _, _) = create_test_server(Duration::from_millis(300)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            roundtrip(&mut client, &encode(&["PING"]), b"+PONG\r\n").await;
        }
    }

    #[tokio::test]
    async fn test_partial_frame_does_not_extend_deadline() {
        let (addr, _, stats) = create_test_server(Duration::from_millis(400)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let started = tokio::time::Instant::now();

        // "*1\r\n" one byte at a time; each read used to restart the clock.
        for byte in b"*1\r\n" {
            client.write_all(&[*byte]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("server did not close slow connection")
            .unwrap();
        assert_eq!(buf, TIMEOUT_NOTICE);
        assert!(
            started.elapsed() < Duration::from_millis(650),
            "closed after {:?}",
            started.elapsed()
        );
        assert_eq!(stats.idle_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_value_larger_than_read_chunk() {
        let (addr, store, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let value = "x".repeat(100 * 1024);
        let set = RespValue::command(["SET".to_string(), "big".to_string(), value.clone()]);
        roundtrip(&mut client, &set.serialize(), b"+OK\r\n").await;

        let expected = RespValue::bulk_string(value.clone()).serialize();
        roundtrip(&mut client, &encode(&["GET", "big"]), &expected).await;
        assert_eq!(
            store.snapshot().keyspace.get_string(b"big"),
            Some(Bytes::from(value))
        );
    }

    #[tokio::test]
    async fn test_frame_over_size_limit_closes_connection() {
        let (addr, store, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let header = format!("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n${}\r\n", MAX_FRAME_SIZE);
        client.write_all(header.as_bytes()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server did not close")
            .unwrap_or(0);
        assert_eq!(n, 0, "expected EOF, got {:?}", &buf[..n]);
        assert!(store.snapshot().keyspace.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transaction_is_isolated_from_other_clients() {
        let (addr, _, _) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        let mut writer = TcpStream::connect(addr).await.unwrap();
        let mut reader = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut writer, &encode(&["SET", "k", "v0"]), b"+OK\r\n").await;

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..200 {
                reader.write_all(&encode(&["GET", "k"])).await.unwrap();
                let mut buf = [0u8; 8]; // "$2\r\nvN\r\n"
                reader.read_exact(&mut buf).await.unwrap();
                seen.push(buf[4..6].to_vec());
            }
            seen
        });

        for _ in 0..20 {
            roundtrip(&mut writer, &encode(&["MULTI"]), b"+OK\r\n").await;
            roundtrip(&mut writer, &encode(&["SET", "k", "v1"]), b"$10\r\n<<Queued>>\r\n").await;
            roundtrip(&mut writer, &encode(&["SET", "k", "v2"]), b"$10\r\n<<Queued>>\r\n").await;
            roundtrip(&mut writer, &encode(&["EXEC"]), b"*2\r\n+OK\r\n+OK\r\n").await;
        }

        let seen = observer.await.unwrap();
        for value in &seen {
            assert!(
                value.as_slice() == b"v0" || value.as_slice() == b"v2",
                "observer saw {:?}",
                String::from_utf8_lossy(value)
            );
        }
    }

    #[tokio::test]
    async fn test_stats_track_connections() {
        let (addr, _, stats) = create_test_server(DEFAULT_IDLE_TIMEOUT).await;
        {
            let mut client = TcpStream::connect(addr).await.unwrap();
            roundtrip(&mut client, &encode(&["PING"]), b"+PONG\r\n").await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while stats.active_connections.load(Ordering::Relaxed) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
