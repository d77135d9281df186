//! Listener Abstraction
//!
//! The accept capability the server engine drives. Production code uses
//! `tokio::net::TcpListener`; tests can plug in listeners that replay
//! scripted accept results.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// A source of inbound connections.
///
/// Dropping the listener closes it.
pub trait Listener: Send {
    /// The connection type handed to the handler.
    type Conn: Send + 'static;

    /// Waits for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send + '_;

    /// Returns the address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_ {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Whether an accept error is worth retrying.
///
/// Timeouts and interruptions are transient, and so are connections that the
/// peer aborted or reset before we got to accept them. Anything else means the
/// listener itself is unusable.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
