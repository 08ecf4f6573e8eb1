use std::sync::Arc;

use fanout_config::shared::PipelineConfig;
use tracing::{error, info, warn};

use crate::applier::Applier;
use crate::bail;
use crate::concurrency::shutdown::{ShutdownState, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, FanoutResult};
use crate::log::LogReader;
use crate::store::parallel::{ParallelQueue, QueueStatus};
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::channel::{ChannelWorker, ChannelWorkerHandle, ChannelWorkerState};
use crate::workers::feeder::{FeederState, FeederWorker, FeederWorkerHandle};

pub type PipelineId = u64;

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        feeder: FeederWorkerHandle,
        channels: Vec<ChannelWorkerHandle>,
    },
}

/// Handle requesting the shutdown of a running pipeline.
///
/// A graceful request stops the feeder at the next transaction boundary and lets every channel
/// drain. An immediate one interrupts every worker and discards what was not handed out yet.
#[derive(Debug, Clone)]
pub struct PipelineShutdown {
    shutdown_tx: ShutdownTx,
    queue: ParallelQueue,
}

impl PipelineShutdown {
    pub fn shutdown(&self, immediate: bool) {
        if self.shutdown_tx.shutdown(immediate) {
            info!(immediate, "shutting down the pipeline");
        }

        self.queue.shutdown(immediate);
    }
}

/// Distribution pipeline: one feeder reading the log into a [`ParallelQueue`] and one channel
/// worker per channel applying what the queue hands out.
#[derive(Debug)]
pub struct Pipeline<L, A> {
    id: PipelineId,
    config: Arc<PipelineConfig>,
    queue: ParallelQueue,
    reader: Option<L>,
    applier: A,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<L, A> Pipeline<L, A>
where
    L: LogReader + Send + 'static,
    A: Applier + Clone + Send + Sync + 'static,
{
    pub fn new(config: PipelineConfig, reader: L, applier: A) -> FanoutResult<Self> {
        config.validate()?;

        let queue = ParallelQueue::from_config(&config.queue)?;
        let (shutdown_tx, _) = create_shutdown_channel();

        Ok(Self {
            id: config.id,
            config: Arc::new(config),
            queue,
            reader: Some(reader),
            applier,
            state: PipelineState::NotStarted,
            shutdown_tx,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn queue(&self) -> &ParallelQueue {
        &self.queue
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub fn shutdown_handle(&self) -> PipelineShutdown {
        PipelineShutdown {
            shutdown_tx: self.shutdown_tx.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Returns the progress of the feeder, `None` before the pipeline is started.
    pub fn feeder_state(&self) -> Option<FeederState> {
        match &self.state {
            PipelineState::NotStarted => None,
            PipelineState::Started { feeder, .. } => Some(feeder.state()),
        }
    }

    pub fn channel_states(&self) -> Vec<ChannelWorkerState> {
        match &self.state {
            PipelineState::NotStarted => Vec::new(),
            PipelineState::Started { channels, .. } => {
                channels.iter().map(|handle| handle.state()).collect()
            }
        }
    }

    pub fn start(&mut self) -> FanoutResult<()> {
        let Some(reader) = self.reader.take() else {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline already started",
                format!("pipeline {} can only be started once", self.id)
            );
        };

        info!(
            pipeline_id = self.id,
            channels = self.queue.channels(),
            "starting pipeline"
        );

        let channels = (0..self.queue.channels())
            .map(|channel| {
                ChannelWorker::new(
                    self.id,
                    channel,
                    self.queue.clone(),
                    self.applier.clone(),
                    self.shutdown_tx.clone(),
                )
                .start()
            })
            .collect();

        let feeder = FeederWorker::new(
            self.id,
            reader,
            self.queue.clone(),
            self.config.idle_wait(),
            self.shutdown_tx.subscribe(),
        )
        .start();

        self.state = PipelineState::Started { feeder, channels };

        Ok(())
    }

    /// Waits for every worker to complete.
    ///
    /// Once a graceful shutdown is requested the workers have the configured shutdown timeout
    /// to finish. After that the shutdown is escalated to an immediate one.
    pub async fn wait(self) -> FanoutResult<()> {
        let PipelineState::Started { feeder, channels } = self.state else {
            info!("pipeline was not started, nothing to wait for");
            return Ok(());
        };

        let shutdown = PipelineShutdown {
            shutdown_tx: self.shutdown_tx.clone(),
            queue: self.queue.clone(),
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_timeout = self.config.shutdown_timeout();

        let workers = async move {
            let mut errors = Vec::new();

            info!("waiting for the feeder worker to complete");
            if let Err(err) = feeder.wait().await {
                error!(error = %err, "feeder worker completed with an error");
                errors.push(err);
            }

            info!("waiting for channel workers to complete");
            for handle in channels {
                let channel = handle.channel();
                if let Err(err) = handle.wait().await {
                    error!(channel, error = %err, "channel worker completed with an error");
                    errors.push(err);
                }
            }

            errors
        };
        tokio::pin!(workers);

        let escalation = async {
            shutdown_rx.reached(ShutdownState::Graceful).await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        let errors = tokio::select! {
            errors = &mut workers => errors,
            _ = escalation => {
                warn!(
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "graceful shutdown timed out, shutting down immediately"
                );
                shutdown.shutdown(true);

                workers.await
            }
        };

        if !errors.is_empty() {
            return Err(errors.into());
        }

        info!(pipeline_id = self.id, "pipeline completed");

        Ok(())
    }

    pub fn shutdown(&self, immediate: bool) {
        self.shutdown_handle().shutdown(immediate);
    }

    pub async fn shutdown_and_wait(self, immediate: bool) -> FanoutResult<()> {
        self.shutdown(immediate);
        self.wait().await
    }
}
