//! Termination Signals
//!
//! SIGHUP, SIGQUIT, SIGTERM and SIGINT all request the same graceful
//! shutdown. On platforms without Unix signals only Ctrl-C is watched.

use std::fmt;
use std::io;

/// The signal that requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Hangup,
    Quit,
    Terminate,
    Interrupt,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Termination::Hangup => "SIGHUP",
            Termination::Quit => "SIGQUIT",
            Termination::Terminate => "SIGTERM",
            Termination::Interrupt => "SIGINT",
        };
        f.write_str(name)
    }
}

/// Installed termination signal handlers.
///
/// Handlers are registered by [`install`](Self::install), so signals that
/// arrive before [`recv`](Self::recv) is awaited are not lost.
#[cfg(unix)]
#[derive(Debug)]
pub struct TerminationSignals {
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Waits for the first termination signal. Consumes the handlers.
    pub async fn recv(mut self) -> Termination {
        tokio::select! {
            _ = self.hangup.recv() => Termination::Hangup,
            _ = self.quit.recv() => Termination::Quit,
            _ = self.terminate.recv() => Termination::Terminate,
            _ = self.interrupt.recv() => Termination::Interrupt,
        }
    }
}

#[cfg(not(unix))]
#[derive(Debug)]
pub struct TerminationSignals {
    _private: (),
}

#[cfg(not(unix))]
impl TerminationSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self { _private: () })
    }

    pub async fn recv(self) -> Termination {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Termination::Interrupt,
            // Without a Ctrl-C handler nothing can ever request shutdown.
            Err(_) => std::future::pending().await,
        }
    }
}
