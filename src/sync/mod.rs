//! Synchronization Primitives
//!
//! Small building blocks shared by the server engine and the handlers.
//!
//! - [`DrainToken`]: counts in-flight writes on a connection so a shutdown
//!   sweep can wait for them before closing the connection.

pub mod wait;

pub use wait::{DrainToken, InFlight};
