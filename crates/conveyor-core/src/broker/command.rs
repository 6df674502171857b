use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::broker::stats::QueueStats;
use crate::dead_letter::DeadLetterReason;
use crate::error::{
    AckError, CreateQueueError, DeadLetterError, EnqueueError, ListQueuesError, ReceiveError,
    ReplayError, StatsError,
};
use crate::message::{QueueMessage, ReceiptHandle, StoredMessage};
use crate::queue::QueueConfig;

/// Commands sent from async callers to the single-threaded scheduler core.
///
/// Each variant that expects a response includes a `tokio::sync::oneshot::Sender`
/// for the reply.
pub enum SchedulerCommand {
    CreateQueue {
        config: QueueConfig,
        reply: oneshot::Sender<Result<String, CreateQueueError>>,
    },
    Enqueue {
        message: StoredMessage,
        reply: oneshot::Sender<Result<Uuid, EnqueueError>>,
    },
    /// Long-poll receive. `wait: None` uses the queue's `receive_wait_ms`.
    Receive {
        queue_id: String,
        max_messages: usize,
        wait: Option<Duration>,
        reply: oneshot::Sender<Result<Vec<QueueMessage>, ReceiveError>>,
    },
    Ack {
        receipt: ReceiptHandle,
        reply: oneshot::Sender<Result<(), AckError>>,
    },
    DeadLetter {
        receipt: ReceiptHandle,
        reason: DeadLetterReason,
        error: String,
        reply: oneshot::Sender<Result<Uuid, DeadLetterError>>,
    },
    /// Move a queue-sourced dead-letter record back onto its queue.
    Replay {
        record_id: Uuid,
        reply: oneshot::Sender<Result<Uuid, ReplayError>>,
    },
    GetStats {
        queue_id: String,
        reply: oneshot::Sender<Result<QueueStats, StatsError>>,
    },
    ListQueues {
        reply: oneshot::Sender<Result<Vec<QueueStats>, ListQueuesError>>,
    },
    Shutdown,
}
