//! Echo Handler
//!
//! The reference [`ConnectionHandler`]: every `\n`-terminated line a client
//! sends is written back verbatim, in order.
//!
//! ## Shutdown
//!
//! ```text
//!   close()
//!     │
//!     ├─ closing = true          (new connections are dropped unprocessed)
//!     │
//!     └─ for each registered client, concurrently:
//!          wait for its drain token (at most `drain_timeout`)
//!          then tell its task to drop the connection
//! ```
//!
//! A write that is still in flight when the drain timeout expires is aborted,
//! so the client may receive a truncated line. The timeout is ten seconds by
//! default, which only matters for clients that stop reading.

use crate::handler::{ConnectionContext, ConnectionHandler};
use crate::sync::DrainToken;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long `close()` waits for a client's in-flight write.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors that end an echo session.
#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    /// I/O error on the connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The client sent nothing for longer than the idle timeout
    #[error("idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// The handler closed the connection during shutdown
    #[error("connection closed by handler shutdown")]
    Closed,
}

/// A connection registered with an [`EchoHandler`].
///
/// The stream itself stays with the connection task; this record carries
/// what `close()` needs to close it safely.
#[derive(Debug)]
pub struct EchoClient {
    ctx: ConnectionContext,
    waiting: DrainToken,
    closed: CancellationToken,
}

impl EchoClient {
    fn new(ctx: ConnectionContext) -> Self {
        Self {
            ctx,
            waiting: DrainToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> ConnectionContext {
        self.ctx
    }

    /// In-flight writes on this connection.
    pub fn waiting(&self) -> &DrainToken {
        &self.waiting
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits up to `drain_timeout` for in-flight writes, then closes the
    /// connection whether or not they finished.
    pub async fn close(&self, drain_timeout: Duration) {
        if !self.waiting.wait_timeout(drain_timeout).await {
            warn!(
                conn = self.ctx.id,
                in_flight = self.waiting.count(),
                "Drain timed out, forcing close"
            );
        }
        self.closed.cancel();
    }
}

/// Echoes newline-delimited lines and tracks its live clients.
#[derive(Debug)]
pub struct EchoHandler {
    /// Registered clients, keyed by connection id
    active: Mutex<HashMap<u64, Arc<EchoClient>>>,

    /// Set once by `close()`, never cleared
    closing: AtomicBool,

    drain_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoHandler {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            idle_timeout: None,
        }
    }

    /// Overrides how long `close()` waits for each client's in-flight write.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Ends connections that send nothing for `idle_timeout`. Zero disables it.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = (!idle_timeout.is_zero()).then_some(idle_timeout);
        self
    }

    /// Number of currently registered clients.
    pub fn active_connections(&self) -> usize {
        self.lock_active().len()
    }

    /// Snapshot of the currently registered clients.
    pub fn clients(&self) -> Vec<Arc<EchoClient>> {
        self.lock_active().values().cloned().collect()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<u64, Arc<EchoClient>>> {
        // The map stays consistent even if a holder panicked.
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a client unless the handler is closing.
    ///
    /// The flag is read under the lock that `close()` takes to sweep the
    /// set, so a client is either swept or never registered.
    fn register(&self, ctx: ConnectionContext) -> Option<Arc<EchoClient>> {
        let mut active = self.lock_active();
        if self.is_closing() {
            return None;
        }
        let client = Arc::new(EchoClient::new(ctx));
        active.insert(ctx.id, Arc::clone(&client));
        Some(client)
    }

    fn deregister(&self, id: u64) {
        self.lock_active().remove(&id);
    }
}

impl<C> ConnectionHandler<C> for EchoHandler
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&self, ctx: ConnectionContext, conn: C) {
        let Some(client) = self.register(ctx) else {
            debug!(conn = ctx.id, peer = %ctx.peer, "Handler closing, rejecting connection");
            drop(conn);
            return;
        };
        debug!(conn = ctx.id, peer = %ctx.peer, "Client registered");

        let result = echo_lines(conn, &client, self.idle_timeout).await;

        // Removed on every exit path; a broken connection has nothing left
        // for close() to do.
        self.deregister(ctx.id);

        match result {
            Ok(()) => info!(conn = ctx.id, peer = %ctx.peer, "Connection closed"),
            Err(EchoError::Closed) => {
                debug!(conn = ctx.id, peer = %ctx.peer, "Connection closed by shutdown")
            }
            Err(e) => warn!(conn = ctx.id, peer = %ctx.peer, error = %e, "Connection error"),
        }
    }

    async fn close(&self) {
        info!("Handler shutting down...");

        let clients: Vec<Arc<EchoClient>> = {
            let mut active = self.lock_active();
            self.closing.store(true, Ordering::SeqCst);
            active.drain().map(|(_, client)| client).collect()
        };

        let count = clients.len();
        let mut closing = JoinSet::new();
        for client in clients {
            let drain_timeout = self.drain_timeout;
            closing.spawn(async move { client.close(drain_timeout).await });
        }
        while closing.join_next().await.is_some() {}

        info!(clients = count, "Handler closed");
    }
}

/// Echo loop for one connection. `Ok(())` means the client closed its side.
async fn echo_lines<C>(
    mut conn: C,
    client: &EchoClient,
    idle_timeout: Option<Duration>,
) -> Result<(), EchoError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut scanned = 0;

    loop {
        while let Some(line) = split_line(&mut buffer, &mut scanned) {
            let _in_flight = client.waiting.enter();
            tokio::select! {
                biased;
                result = write_line(&mut conn, &line) => result?,
                _ = client.closed.cancelled() => return Err(EchoError::Closed),
            }
            trace!(conn = client.ctx.id, bytes = line.len(), "Echoed line");
        }

        if buffer.capacity() - buffer.len() < 1024 {
            buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = tokio::select! {
            biased;
            _ = client.closed.cancelled() => return Err(EchoError::Closed),
            result = read_more(&mut conn, &mut buffer, idle_timeout) => result?,
        };

        if n == 0 {
            if !buffer.is_empty() {
                debug!(
                    conn = client.ctx.id,
                    discarded = buffer.len(),
                    "Dropping unterminated line at end of stream"
                );
            }
            return Ok(());
        }
    }
}

/// Splits the first complete line, newline included, off the buffer.
///
/// `scanned` remembers how much of the buffer is known to hold no newline.
fn split_line(buffer: &mut BytesMut, scanned: &mut usize) -> Option<Bytes> {
    match buffer[*scanned..].iter().position(|&b| b == b'\n') {
        Some(offset) => {
            let end = *scanned + offset;
            *scanned = 0;
            Some(buffer.split_to(end + 1).freeze())
        }
        None => {
            *scanned = buffer.len();
            None
        }
    }
}

async fn write_line<C>(conn: &mut C, line: &[u8]) -> io::Result<()>
where
    C: AsyncWrite + Unpin,
{
    conn.write_all(line).await?;
    conn.flush().await
}

async fn read_more<C>(
    conn: &mut C,
    buffer: &mut BytesMut,
    idle_timeout: Option<Duration>,
) -> Result<usize, EchoError>
where
    C: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, conn.read_buf(buffer))
            .await
            .map_err(|_| EchoError::IdleTimeout(limit))?
            .map_err(EchoError::from),
        None => Ok(conn.read_buf(buffer).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_test::io::Builder;

    fn ctx(id: u64) -> ConnectionContext {
        ConnectionContext {
            id,
            peer: SocketAddr::from(([127, 0, 0, 1], 40000 + id as u16)),
        }
    }

    fn spawn_handle(handler: &Arc<EchoHandler>, id: u64, conn: DuplexStream) -> JoinHandle<()> {
        let handler = Arc::clone(handler);
        tokio::spawn(async move { handler.handle(ctx(id), conn).await })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_split_line() {
        let mut buffer = BytesMut::from(&b"one\ntwo\nthr"[..]);
        let mut scanned = 0;
        assert_eq!(split_line(&mut buffer, &mut scanned), Some(Bytes::from("one\n")));
        assert_eq!(split_line(&mut buffer, &mut scanned), Some(Bytes::from("two\n")));
        assert_eq!(split_line(&mut buffer, &mut scanned), None);
        assert_eq!(&buffer[..], b"thr");
        assert_eq!(scanned, 3);

        buffer.extend_from_slice(b"ee\n");
        assert_eq!(split_line(&mut buffer, &mut scanned), Some(Bytes::from("three\n")));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_echoes_lines_in_order() {
        let handler = EchoHandler::new();
        let conn = Builder::new()
            .read(b"hello\n")
            .write(b"hello\n")
            .read(b"42\n")
            .write(b"42\n")
            .build();

        handler.handle(ctx(1), conn).await;

        assert_eq!(handler.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_lines_split_across_reads() {
        let handler = EchoHandler::new();
        let conn = Builder::new()
            .read(b"a\nb")
            .write(b"a\n")
            .read(b"c\nd\n")
            .write(b"bc\n")
            .write(b"d\n")
            .build();

        handler.handle(ctx(1), conn).await;
    }

    #[tokio::test]
    async fn test_unterminated_line_dropped_at_eof() {
        let handler = EchoHandler::new();
        let conn = Builder::new().read(b"one\ntwo").write(b"one\n").build();

        handler.handle(ctx(1), conn).await;

        assert_eq!(handler.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_read_error_deregisters() {
        let handler = EchoHandler::new();
        let conn = Builder::new()
            .read(b"ping\n")
            .write(b"ping\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        handler.handle(ctx(1), conn).await;

        assert_eq!(handler.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_rejects_connections_after_close() {
        let handler = EchoHandler::new();
        ConnectionHandler::<DuplexStream>::close(&handler).await;
        assert!(handler.is_closing());

        let (mut client, server) = duplex(64);
        handler.handle(ctx(1), server).await;

        assert_eq!(handler.active_connections(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_without_clients() {
        let handler = EchoHandler::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            ConnectionHandler::<DuplexStream>::close(&handler),
        )
        .await
        .unwrap();
        assert_eq!(handler.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_idle_clients() {
        for count in [1u64, 5] {
            let handler = Arc::new(EchoHandler::new());
            let mut clients = Vec::new();
            let mut tasks = Vec::new();
            for id in 1..=count {
                let (client, server) = duplex(64);
                clients.push(client);
                tasks.push(spawn_handle(&handler, id, server));
            }
            wait_until(|| handler.active_connections() == count as usize).await;

            tokio::time::timeout(
                Duration::from_secs(1),
                ConnectionHandler::<DuplexStream>::close(handler.as_ref()),
            )
            .await
            .unwrap();
            assert_eq!(handler.active_connections(), 0);

            for task in tasks {
                task.await.unwrap();
            }
            for mut client in clients {
                let mut buf = [0u8; 8];
                assert_eq!(client.read(&mut buf).await.unwrap(), 0);
            }
        }
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_write() {
        let handler = Arc::new(EchoHandler::new().with_drain_timeout(Duration::from_secs(5)));
        // A tiny pipe so the echo blocks until the client reads it.
        let (mut client, server) = duplex(4);
        let task = spawn_handle(&handler, 1, server);

        let line = b"hello world\n";
        client.write_all(line).await.unwrap();

        wait_until(|| {
            handler
                .clients()
                .first()
                .is_some_and(|c| c.waiting().count() == 1)
        })
        .await;

        let closer = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                ConnectionHandler::<DuplexStream>::close(handler.as_ref()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished());

        let mut echoed = vec![0u8; line.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, line);

        closer.await.unwrap();
        task.await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_forces_close() {
        let handler =
            Arc::new(EchoHandler::new().with_drain_timeout(Duration::from_millis(100)));
        let (mut client, server) = duplex(4);
        let task = spawn_handle(&handler, 1, server);

        client.write_all(b"this line never drains\n").await.unwrap();
        wait_until(|| {
            handler
                .clients()
                .first()
                .is_some_and(|c| c.waiting().count() == 1)
        })
        .await;

        tokio::time::timeout(
            Duration::from_secs(2),
            ConnectionHandler::<DuplexStream>::close(handler.as_ref()),
        )
        .await
        .unwrap();
        task.await.unwrap();

        // Only what fit in the pipe arrives before the connection drops.
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"this");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_connection() {
        let handler =
            Arc::new(EchoHandler::new().with_idle_timeout(Duration::from_secs(30)));
        let (_client, server) = duplex(64);
        let task = spawn_handle(&handler, 1, server);

        task.await.unwrap();
        assert_eq!(handler.active_connections(), 0);
    }
}
