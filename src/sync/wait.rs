//! Drain Token
//!
//! A counter of in-flight work with a bounded wait for it to reach zero.
//!
//! ```text
//!   writer task                      close()
//!   ───────────                      ───────
//!   add(1) ──────┐
//!   write line   │  count > 0        wait_timeout(10s) ... blocks
//!   done() ──────┘  count == 0  ───> wakes, closes the connection
//! ```
//!
//! The count lives in a `watch` channel, so waiters observe every transition
//! without polling and a wake-up cannot be missed between the check and the
//! wait.

use std::time::Duration;
use tokio::sync::watch;

/// Counter of in-flight operations on one connection.
#[derive(Debug)]
pub struct DrainToken {
    count: watch::Sender<usize>,
}

impl Default for DrainToken {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainToken {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Marks `n` more operations as in flight.
    pub fn add(&self, n: usize) {
        self.count.send_modify(|count| *count += n);
    }

    /// Marks one in-flight operation as finished.
    ///
    /// Must be paired with a prior [`add`](Self::add).
    pub fn done(&self) {
        self.count.send_modify(|count| {
            debug_assert!(*count > 0, "DrainToken::done called without add");
            *count = count.saturating_sub(1);
        });
    }

    /// Returns the number of operations currently in flight.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Brackets one operation: increments now, decrements when the guard drops.
    pub fn enter(&self) -> InFlight<'_> {
        self.add(1);
        InFlight { token: self }
    }

    /// Waits until no operation is in flight.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Waits until no operation is in flight, for at most `timeout`.
    ///
    /// Returns `true` if the token drained, `false` if the wait timed out.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Guard returned by [`DrainToken::enter`].
#[derive(Debug)]
pub struct InFlight<'a> {
    token: &'a DrainToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.token.done();
    }
}
