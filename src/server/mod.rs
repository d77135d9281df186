//! Server Lifecycle Module
//!
//! This module owns the listener, runs the accept loop, spawns one task per
//! connection and coordinates shutdown.
//!
//! ## Lifecycle
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!              │               Running                    │
//!              │                                          │
//!              │   accept() ──ok──> spawn handle(conn)    │
//!              │      │                                   │
//!              │      ├─ transient error: sleep 5ms, retry│
//!              │      │                                   │
//!              └──────┼───────────────────────────────────┘
//!                     │ shutdown future fires
//!                     │   OR terminal accept error
//!                     ▼       (first one wins)
//!              ┌──────────────────────────────────────────┐
//!              │               Closing                    │
//!              │  1. drop listener   (new dials refused)  │
//!              │  2. handler.close() (exactly once)       │
//!              │  3. join every connection task           │
//!              └──────────────────────┬───────────────────┘
//!                                     ▼
//!                                  Stopped
//! ```
//!
//! There is no overall shutdown timeout. A handler whose `handle` never
//! returns keeps [`Server::serve`] from returning.
//!
//! ## Example
//!
//! ```no_run
//! use gracetcp::handler::EchoHandler;
//! use gracetcp::server::Server;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let shutdown = CancellationToken::new();
//! let server = Server::new(Arc::new(EchoHandler::new()));
//!
//! // Elsewhere: shutdown.cancel();
//! let cause = server.serve(listener, shutdown.cancelled()).await?;
//! println!("stopped: {cause}");
//! # Ok(())
//! # }
//! ```

pub mod listener;
pub mod signal;
pub mod stats;

pub use listener::{is_transient, Listener};
pub use signal::{Termination, TerminationSignals};
pub use stats::{ActiveConnection, ServerStats};

use crate::config::Config;
use crate::handler::{ConnectionContext, ConnectionHandler};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause before retrying a transient accept error.
pub const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Lifecycle state of a [`Server`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Closing,
    Stopped,
}

/// What ended the accept loop.
#[derive(Debug)]
pub enum ShutdownCause {
    /// The shutdown future completed
    Signal,
    /// The listener failed with a non-transient error
    AcceptError(io::Error),
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal => f.write_str("shutdown signal"),
            ShutdownCause::AcceptError(e) => write!(f, "accept error: {e}"),
        }
    }
}

/// Setup errors returned by [`Server::serve`] and
/// [`Server::listen_and_serve_with_signal`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Termination signal handlers could not be installed
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    /// The server already served a listener
    #[error("server has already been started")]
    AlreadyStarted,
}

/// The server lifecycle engine.
///
/// Owns the handler, the connection counters and the state channel. A server
/// serves exactly one listener; later calls are refused with
/// [`ServerError::AlreadyStarted`], so the state never moves backwards.
pub struct Server<H> {
    handler: Arc<H>,
    stats: Arc<ServerStats>,
    state: watch::Sender<ServerState>,
    started: AtomicBool,
    next_id: AtomicU64,
}

impl<H> Server<H> {
    pub fn new(handler: Arc<H>) -> Self {
        let (state, _) = watch::channel(ServerState::Running);
        Self {
            handler,
            stats: Arc::new(ServerStats::new()),
            state,
            started: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Accepts connections from `listener` until `shutdown` completes or
    /// accept fails with a terminal error.
    ///
    /// Returns only after the listener is closed, the handler is closed and
    /// every connection task has finished. Fails with
    /// [`ServerError::AlreadyStarted`] if this server has served before; the
    /// listener is then dropped and the handler left untouched.
    pub async fn serve<L, F>(
        &self,
        listener: L,
        shutdown: F,
    ) -> Result<ShutdownCause, ServerError>
    where
        L: Listener,
        H: ConnectionHandler<L::Conn>,
        F: Future<Output = ()> + Send,
    {
        self.start()?;
        Ok(self.run(listener, shutdown).await)
    }

    /// Claims the single run of this server.
    fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(state = ?self.state(), "Server already started, refusing to serve again");
            return Err(ServerError::AlreadyStarted);
        }
        Ok(())
    }

    async fn run<L, F>(&self, mut listener: L, shutdown: F) -> ShutdownCause
    where
        L: Listener,
        H: ConnectionHandler<L::Conn>,
        F: Future<Output = ()> + Send,
    {
        let workers = TaskTracker::new();
        tokio::pin!(shutdown);

        let cause = loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break ShutdownCause::Signal,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => self.dispatch(&workers, conn, peer),
                    Err(e) if is_transient(&e) => {
                        self.stats.accept_retried();
                        info!(
                            error = %e,
                            retry_ms = ACCEPT_RETRY_BACKOFF.as_millis(),
                            "Accept occurs temporary error, retrying"
                        );
                        tokio::time::sleep(ACCEPT_RETRY_BACKOFF).await;
                    }
                    Err(e) => break ShutdownCause::AcceptError(e),
                },
            }
        };

        self.state.send_replace(ServerState::Closing);
        match &cause {
            ShutdownCause::Signal => info!("Get exit signal"),
            ShutdownCause::AcceptError(e) => warn!(error = %e, "Accept error"),
        }
        info!(active = self.stats.active(), "Shutting down...");

        drop(listener);
        ConnectionHandler::<L::Conn>::close(self.handler.as_ref()).await;

        workers.close();
        workers.wait().await;

        self.state.send_replace(ServerState::Stopped);
        info!(
            accepted = self.stats.accepted(),
            cause = %cause,
            "Server stopped"
        );
        cause
    }

    /// Binds `config.address` and serves until a termination signal arrives
    /// or accept fails with a terminal error.
    ///
    /// Only setup failures are returned as errors: [`ServerError::Signal`]
    /// when the termination signal handlers cannot be installed,
    /// [`ServerError::Bind`] when the address cannot be bound, and
    /// [`ServerError::AlreadyStarted`] when this server has served before.
    /// The server counts as started even when a later setup step fails.
    /// Everything after the listener is bound is reported through logs and
    /// the returned cause.
    pub async fn listen_and_serve_with_signal(
        &self,
        config: &Config,
    ) -> Result<ShutdownCause, ServerError>
    where
        H: ConnectionHandler<TcpStream>,
    {
        self.start()?;
        let signals = TerminationSignals::install().map_err(ServerError::Signal)?;

        let listener = TcpListener::bind(&config.address)
            .await
            .map_err(|source| ServerError::Bind {
                address: config.address.clone(),
                source,
            })?;

        match listener.local_addr() {
            Ok(addr) => info!(
                address = %addr,
                max_connections = config.max_connections,
                "Bind: start listening..."
            ),
            Err(_) => info!(address = %config.address, "Bind: start listening..."),
        }

        let shutdown = async move {
            let signal = signals.recv().await;
            info!(%signal, "Received termination signal");
        };

        Ok(self.run(listener, shutdown).await)
    }

    fn dispatch<C>(&self, workers: &TaskTracker, conn: C, peer: SocketAddr)
    where
        H: ConnectionHandler<C>,
        C: Send + 'static,
    {
        let ctx = ConnectionContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
        };
        debug!(conn = ctx.id, peer = %peer, "Accept link");

        let active = self.stats.track();
        let handler = Arc::clone(&self.handler);
        workers.spawn(async move {
            // Dropped on return and on panic alike.
            let _active = active;
            handler.handle(ctx, conn).await;
        });
    }
}

/// Serves `listener` with `handler` until `shutdown` completes.
///
/// Shorthand for [`Server::new`] followed by [`Server::serve`].
pub async fn serve<L, H, F>(
    listener: L,
    handler: Arc<H>,
    shutdown: F,
) -> Result<ShutdownCause, ServerError>
where
    L: Listener,
    H: ConnectionHandler<L::Conn>,
    F: Future<Output = ()> + Send,
{
    Server::new(handler).serve(listener, shutdown).await
}
