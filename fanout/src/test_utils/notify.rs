use std::time::Duration;
use std::{fmt, sync::Arc};

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default timeout for notifications.
///
/// Most conditions in tests are reached well within a few seconds.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// A wrapper around [`Arc<Notify>`] that fails the test when the notification never comes.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    /// Creates a new [`TimedNotify`] with the default timeout.
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    /// Creates a new [`TimedNotify`] with a custom timeout.
    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits for the notification.
    ///
    /// # Panics
    ///
    /// Panics if the timeout elapses before the notification is received.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "Test notification timed out after {:?}. \
                 The expected condition was never reached.",
                self.timeout_duration
            );
        }
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
