//! Connection Handler Module
//!
//! This module defines the contract every protocol implementation must
//! satisfy to be hosted by the [`Server`](crate::server::Server), plus the
//! line-echo reference implementation.
//!
//! ## Contract
//!
//! ```text
//!            accept()
//!               │
//!               ▼
//!   ┌───────────────────────┐      close()  (exactly once, on shutdown)
//!   │ handle(ctx, conn)     │ <──────────────────────┐
//!   │  one task per conn    │                        │
//!   │  returns on EOF,      │   - stop taking new connections
//!   │  error or close()     │   - close registered ones in finite time
//!   └───────────────────────┘                        │
//! ```
//!
//! The connection type is a parameter so the same handler can serve a
//! `TcpStream` in production and an in-memory duplex stream in tests.

pub mod echo;

pub use echo::{EchoClient, EchoError, EchoHandler, DEFAULT_DRAIN_TIMEOUT};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

/// Per-connection information handed to [`ConnectionHandler::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Identifier unique within one server instance, starting at 1.
    pub id: u64,
    /// Remote address of the client.
    pub peer: SocketAddr,
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.peer)
    }
}

/// A pluggable protocol implementation consuming accepted connections.
///
/// Implementations are shared across connection tasks behind an `Arc`, so
/// both methods take `&self` and must return `Send` futures.
pub trait ConnectionHandler<C>: Send + Sync + 'static {
    /// Serves one connection for its entire lifetime.
    ///
    /// Must return once the connection reaches end-of-stream, fails, or is
    /// closed by [`close`](Self::close), and must not keep the connection
    /// afterwards. Once `close` has started, new connections are dropped
    /// without being processed.
    fn handle(&self, ctx: ConnectionContext, conn: C) -> impl Future<Output = ()> + Send + '_;

    /// Moves the handler into its closing state.
    ///
    /// The transition is one-way. Every registered connection is closed in
    /// finite time and this call never blocks indefinitely.
    fn close(&self) -> impl Future<Output = ()> + Send + '_;
}
