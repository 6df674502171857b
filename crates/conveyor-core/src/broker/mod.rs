pub mod command;
pub mod config;
mod scheduler;
pub mod stats;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::info;
use uuid::Uuid;

use crate::dead_letter::DeadLetterReason;
use crate::error::{
    AckError, BrokerError, BrokerResult, CreateQueueError, DeadLetterError, EnqueueError,
    ListQueuesError, ReceiveError, ReplayError, StatsError,
};
use crate::event::Event;
use crate::message::{QueueMessage, ReceiptHandle, StoredMessage};
use crate::queue::QueueConfig;
use crate::storage::Storage;

pub use command::SchedulerCommand;
pub use config::SchedulerConfig;
pub use stats::QueueStats;

use scheduler::Scheduler;

/// Largest batch a single `receive` may return.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// The broker owns the scheduler thread and the inbound command channel.
/// Async callers send commands through `send_command()` and await the
/// oneshot reply; the single-threaded scheduler processes them sequentially.
pub struct Broker {
    command_tx: crossbeam_channel::Sender<SchedulerCommand>,
    scheduler_thread: Option<thread::JoinHandle<()>>,
}

impl Broker {
    /// Create a new broker, spawning the scheduler on a dedicated OS thread.
    #[tracing::instrument(skip_all, fields(capacity = config.command_channel_capacity))]
    pub fn new(config: &SchedulerConfig, storage: Arc<dyn Storage>) -> BrokerResult<Self> {
        let (tx, rx) =
            crossbeam_channel::bounded::<SchedulerCommand>(config.command_channel_capacity);

        let scheduler_config = config.clone();

        let handle = thread::Builder::new()
            .name("conveyor-scheduler".to_string())
            .spawn(move || {
                let mut scheduler = Scheduler::new(storage, rx, &scheduler_config);
                scheduler.run();
            })
            .map_err(|e| BrokerError::SchedulerSpawn(e.to_string()))?;

        info!("broker started");

        Ok(Self {
            command_tx: tx,
            scheduler_thread: Some(handle),
        })
    }

    /// Send a command to the scheduler. Returns an error if the channel is full
    /// or disconnected.
    pub fn send_command(&self, cmd: SchedulerCommand) -> BrokerResult<()> {
        self.command_tx.try_send(cmd).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => BrokerError::ChannelFull,
            crossbeam_channel::TrySendError::Disconnected(_) => BrokerError::ChannelDisconnected,
        })
    }

    async fn request<T, E>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, E>>) -> SchedulerCommand,
    ) -> Result<T, E>
    where
        E: From<BrokerError>,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(build(reply_tx))?;
        reply_rx.await.map_err(|_| BrokerError::ReplyDropped)?
    }

    #[tracing::instrument(skip_all, fields(queue = %config.name))]
    pub async fn create_queue(&self, config: QueueConfig) -> Result<String, CreateQueueError> {
        self.request(|reply| SchedulerCommand::CreateQueue { config, reply })
            .await
    }

    /// Create the queue unless it already exists. Existing queues keep their
    /// stored configuration.
    pub async fn ensure_queue(&self, config: QueueConfig) -> Result<(), CreateQueueError> {
        match self.create_queue(config).await {
            Ok(_) | Err(CreateQueueError::QueueAlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn enqueue(&self, queue_id: &str, event: Event) -> Result<Uuid, EnqueueError> {
        let message = StoredMessage::new(queue_id, event, crate::time::now_ns());
        self.request(|reply| SchedulerCommand::Enqueue { message, reply })
            .await
    }

    /// Receive up to `max_messages` (1..=10) visible messages, long-polling
    /// for at most `wait` (queue default when `None`) if none are visible.
    pub async fn receive(
        &self,
        queue_id: &str,
        max_messages: usize,
        wait: Option<Duration>,
    ) -> Result<Vec<QueueMessage>, ReceiveError> {
        self.request(|reply| SchedulerCommand::Receive {
            queue_id: queue_id.to_string(),
            max_messages,
            wait,
            reply,
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(receipt = %receipt))]
    pub async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), AckError> {
        self.request(|reply| SchedulerCommand::Ack {
            receipt: receipt.clone(),
            reply,
        })
        .await
    }

    /// Atomically remove the message from its queue and write a dead-letter
    /// record. Returns the record id.
    #[tracing::instrument(skip_all, fields(receipt = %receipt, %reason))]
    pub async fn dead_letter(
        &self,
        receipt: &ReceiptHandle,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Result<Uuid, DeadLetterError> {
        let error = error.into();
        self.request(|reply| SchedulerCommand::DeadLetter {
            receipt: receipt.clone(),
            reason,
            error,
            reply,
        })
        .await
    }

    /// Re-enqueue a queue-sourced dead-letter record. Returns the new message id.
    pub async fn replay(&self, record_id: Uuid) -> Result<Uuid, ReplayError> {
        self.request(|reply| SchedulerCommand::Replay { record_id, reply })
            .await
    }

    pub async fn stats(&self, queue_id: &str) -> Result<QueueStats, StatsError> {
        self.request(|reply| SchedulerCommand::GetStats {
            queue_id: queue_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueStats>, ListQueuesError> {
        self.request(|reply| SchedulerCommand::ListQueues { reply })
            .await
    }

    /// Initiate graceful shutdown: send the shutdown command and wait for the
    /// scheduler thread to finish.
    #[tracing::instrument(skip_all)]
    pub fn shutdown(mut self) -> BrokerResult<()> {
        info!("initiating broker shutdown");

        // Ignore the error if the channel is already closed
        let _ = self.command_tx.send(SchedulerCommand::Shutdown);

        if let Some(handle) = self.scheduler_thread.take() {
            handle.join().map_err(|_| BrokerError::SchedulerPanicked)?;
        }

        info!("broker shutdown complete");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // If shutdown wasn't called explicitly, attempt to stop the scheduler
        if self.scheduler_thread.is_some() {
            let _ = self.command_tx.send(SchedulerCommand::Shutdown);
            if let Some(handle) = self.scheduler_thread.take() {
                let _ = handle.join();
            }
        }
    }
}
