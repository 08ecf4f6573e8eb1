use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

use crate::applier::Applier;
use crate::bail;
use crate::error::{ErrorKind, FanoutResult};
use crate::test_utils::notify::TimedNotify;
use crate::types::{ControlEvent, Seqno, TransactionEvent};

/// Transaction committed through a [`TestApplierWrapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub channel: usize,
    pub seqno: Seqno,
}

type CommitCondition = Box<dyn Fn(&[Committed]) -> bool + Send + Sync>;
type ControlCondition = Box<dyn Fn(&[(usize, ControlEvent)]) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    committed: Vec<Committed>,
    controls: Vec<(usize, ControlEvent)>,
    commit_conditions: Vec<(CommitCondition, Arc<Notify>)>,
    control_conditions: Vec<(ControlCondition, Arc<Notify>)>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let committed = &self.committed;
        self.commit_conditions.retain(|(condition, notify)| {
            let should_retain = !condition(committed);
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });

        let controls = &self.controls;
        self.control_conditions.retain(|(condition, notify)| {
            let should_retain = !condition(controls);
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Test wrapper for [`Applier`] implementations that records commits.
///
/// Tests can wait for commit conditions, make the apply of one transaction fail and slow
/// every apply down to widen race windows.
#[derive(Clone)]
pub struct TestApplierWrapper<A> {
    wrapped: A,
    inner: Arc<RwLock<Inner>>,
    fail_on: Option<Seqno>,
    apply_delay: Option<Duration>,
}

impl<A> std::fmt::Debug for TestApplierWrapper<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestApplierWrapper")
            .field("fail_on", &self.fail_on)
            .field("apply_delay", &self.apply_delay)
            .finish()
    }
}

impl<A> TestApplierWrapper<A> {
    pub fn wrap(applier: A) -> Self {
        Self {
            wrapped: applier,
            inner: Arc::new(RwLock::new(Inner::default())),
            fail_on: None,
            apply_delay: None,
        }
    }

    /// Makes applying any fragment of transaction `seqno` fail with [`ErrorKind::ApplyFailed`].
    pub fn fail_on(mut self, seqno: Seqno) -> Self {
        self.fail_on = Some(seqno);
        self
    }

    /// Sleeps for `delay` before applying every fragment.
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }

    pub fn wrapped(&self) -> &A {
        &self.wrapped
    }

    /// Returns every commit in the order it happened.
    pub async fn committed(&self) -> Vec<Committed> {
        self.inner.read().await.committed.clone()
    }

    pub async fn controls(&self) -> Vec<(usize, ControlEvent)> {
        self.inner.read().await.controls.clone()
    }

    /// Registers a notification that fires once `condition` holds on the commits so far.
    pub async fn notify_on_commits<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&[Committed]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .commit_conditions
            .push((Box::new(condition), notify.clone()));

        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Registers a notification that fires once `condition` holds on the control events so far.
    pub async fn notify_on_controls<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&[(usize, ControlEvent)]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .control_conditions
            .push((Box::new(condition), notify.clone()));

        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Registers a notification that fires once `count` transactions were committed.
    pub async fn wait_for_commits(&self, count: usize) -> TimedNotify {
        self.notify_on_commits(move |committed| committed.len() >= count)
            .await
    }
}

impl<A> Applier for TestApplierWrapper<A>
where
    A: Applier + Send + Sync,
{
    async fn apply(&self, channel: usize, event: &TransactionEvent) -> FanoutResult<()> {
        if let Some(delay) = self.apply_delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_on == Some(event.seqno) {
            bail!(
                ErrorKind::ApplyFailed,
                "Injected apply failure",
                format!("transaction {} on channel {channel}", event.seqno)
            );
        }

        self.wrapped.apply(channel, event).await
    }

    async fn commit(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        self.wrapped.commit(channel, seqno).await?;

        let mut inner = self.inner.write().await;
        inner.committed.push(Committed { channel, seqno });
        inner.check_conditions();

        Ok(())
    }

    async fn rollback(&self, channel: usize, seqno: Seqno) -> FanoutResult<()> {
        self.wrapped.rollback(channel, seqno).await
    }

    async fn control(&self, channel: usize, event: &ControlEvent) -> FanoutResult<()> {
        self.wrapped.control(channel, event).await?;

        let mut inner = self.inner.write().await;
        inner.controls.push((channel, event.clone()));
        inner.check_conditions();

        Ok(())
    }
}
