//! Broadcast shutdown requests for the queue and its workers.

use tokio::sync::watch;

/// Shutdown level reached by a queue or pipeline.
///
/// Levels only move forward: a graceful request can be escalated to an immediate one, never
/// the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    /// Normal operation.
    Running,
    /// No new transactions are accepted; open transactions finish and channels drain.
    Graceful,
    /// Every waiter is interrupted and partial transactions are discarded.
    Immediate,
}

/// Sending side of the shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<ShutdownState>);

impl ShutdownTx {
    /// Requests a shutdown, escalating the current level if needed.
    ///
    /// Returns `true` if the level changed.
    pub fn shutdown(&self, immediate: bool) -> bool {
        let requested = if immediate {
            ShutdownState::Immediate
        } else {
            ShutdownState::Graceful
        };

        self.0.send_if_modified(|state| {
            if requested > *state {
                *state = requested;
                return true;
            }

            false
        })
    }

    /// Returns the current level.
    pub fn state(&self) -> ShutdownState {
        *self.0.borrow()
    }

    /// Creates a new receiver observing this broadcast.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<ShutdownState>);

impl ShutdownRx {
    /// Returns the current level.
    pub fn state(&self) -> ShutdownState {
        *self.0.borrow()
    }

    /// Waits until the shutdown level reaches at least `level`.
    ///
    /// Stays pending forever if the sender is dropped before that happens.
    pub async fn reached(&mut self, level: ShutdownState) {
        if self.0.wait_for(|state| *state >= level).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Creates a new shutdown broadcast in the [`ShutdownState::Running`] state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(ShutdownState::Running);
    (ShutdownTx(tx), ShutdownRx(rx))
}
