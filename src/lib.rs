//! # gracetcp - A TCP Server Framework with Graceful Shutdown
//!
//! gracetcp hosts connection-oriented protocol handlers behind a uniform
//! lifecycle: bind, accept, one task per connection, and a coordinated
//! shutdown that closes the listener, closes the handler exactly once and
//! waits for every connection task.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            gracetcp                              │
//! │                                                                  │
//! │  ┌──────────────┐  accept   ┌──────────────────────────────────┐ │
//! │  │   Listener   │──────────>│  Server (lifecycle engine)       │ │
//! │  │ TcpListener  │           │  - accept loop, 5ms retry        │ │
//! │  └──────────────┘           │  - one task per connection       │ │
//! │                             │  - Running → Closing → Stopped   │ │
//! │  ┌──────────────┐  trigger  │                                  │ │
//! │  │ SIGHUP/QUIT/ │──────────>│                                  │ │
//! │  │ TERM/INT     │           └──────┬──────────────────┬────────┘ │
//! │  └──────────────┘                  │ handle(ctx,conn) │ close()  │
//! │                                    ▼                  ▼          │
//! │                      ┌──────────────────────────────────────┐    │
//! │                      │ ConnectionHandler (e.g. EchoHandler) │    │
//! │                      │  active set + closing flag           │    │
//! │                      │  DrainToken per client               │    │
//! │                      └──────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use gracetcp::config::Config;
//! use gracetcp::handler::EchoHandler;
//! use gracetcp::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let server = Server::new(Arc::new(EchoHandler::new()));
//!
//!     // Returns after SIGINT/SIGTERM/SIGHUP/SIGQUIT and a full drain.
//!     let cause = server.listen_and_serve_with_signal(&config).await?;
//!     println!("stopped: {cause}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`server`]: lifecycle engine, listener abstraction, signals, statistics
//! - [`handler`]: the handler contract and the line-echo handler
//! - [`sync`]: the per-connection drain token
//! - [`config`]: CLI and TOML configuration
//!
//! ## Shutdown Guarantees
//!
//! - The first trigger wins; later triggers are ignored and the handler's
//!   `close()` runs exactly once.
//! - Once the listener is dropped, new dials are refused.
//! - [`Server::serve`](server::Server::serve) does not return while any
//!   connection task is still running.

pub mod config;
pub mod handler;
pub mod server;
pub mod sync;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError};
pub use handler::{ConnectionContext, ConnectionHandler, EchoHandler};
pub use server::{serve, Server, ServerError, ServerState, ShutdownCause};
pub use sync::DrainToken;

/// Version of gracetcp
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
