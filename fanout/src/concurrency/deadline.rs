use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

pin_project! {
    /// Sleep that resolves at an optional deadline.
    ///
    /// Without a deadline the future stays pending forever, which lets callers keep a single
    /// `select!` arm for both bounded and unbounded waits.
    #[derive(Debug)]
    pub struct Deadline {
        #[pin]
        sleep: Option<Sleep>,
    }
}

impl Deadline {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            sleep: deadline.map(sleep_until),
        }
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().sleep.as_pin_mut() {
            Some(sleep) => sleep.poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Returns a [`Deadline`] for `deadline`.
#[inline]
pub fn deadline(deadline: Option<Instant>) -> Deadline {
    Deadline::new(deadline)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn missing_deadline_never_fires() {
        let result = tokio::time::timeout(Duration::from_secs(60), deadline(None)).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_at_instant() {
        let start = Instant::now();
        deadline(Some(start + Duration::from_millis(250))).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
