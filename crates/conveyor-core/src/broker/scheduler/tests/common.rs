use super::*;

use crate::error::{AckError, EnqueueError, ReceiveError};

pub(super) type Sender = crossbeam_channel::Sender<SchedulerCommand>;

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        command_channel_capacity: 256,
        idle_timeout_ms: 10,
        retention_sweep_interval_ms: 60_000,
    }
}

pub(super) fn test_setup() -> (Sender, Scheduler, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
    let (tx, scheduler) = test_setup_with_storage(storage);
    (tx, scheduler, dir)
}

/// Helper: create a scheduler sharing an existing storage (for restart tests).
pub(super) fn test_setup_with_storage(storage: Arc<dyn Storage>) -> (Sender, Scheduler) {
    let config = test_config();
    let (tx, rx) = crossbeam_channel::bounded(config.command_channel_capacity);
    let scheduler = Scheduler::new(storage, rx, &config);
    (tx, scheduler)
}

pub(super) fn test_message(queue_id: &str) -> StoredMessage {
    StoredMessage::new(queue_id, Event::new(vec![1, 2, 3]), crate::time::now_ns())
}

/// Helper: a message that claims to have been enqueued at `enqueued_at` (ns).
pub(super) fn test_message_at(queue_id: &str, enqueued_at: u64) -> StoredMessage {
    StoredMessage::new(queue_id, Event::new(vec![1, 2, 3]), enqueued_at)
}

pub(super) fn send_create_queue(tx: &Sender, name: &str) {
    send_create_queue_with(tx, QueueConfig::new(name));
}

pub(super) fn send_create_queue_with(tx: &Sender, config: QueueConfig) {
    let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();
    tx.send(SchedulerCommand::CreateQueue {
        config,
        reply: reply_tx,
    })
    .unwrap();
}

pub(super) fn send_enqueue(
    tx: &Sender,
    message: StoredMessage,
) -> tokio::sync::oneshot::Receiver<Result<Uuid, EnqueueError>> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    tx.send(SchedulerCommand::Enqueue {
        message,
        reply: reply_tx,
    })
    .unwrap();
    reply_rx
}

/// Helper: non-blocking receive (zero wait).
pub(super) fn send_receive(
    tx: &Sender,
    queue_id: &str,
    max_messages: usize,
) -> tokio::sync::oneshot::Receiver<Result<Vec<QueueMessage>, ReceiveError>> {
    send_receive_wait(tx, queue_id, max_messages, Duration::ZERO)
}

pub(super) fn send_receive_wait(
    tx: &Sender,
    queue_id: &str,
    max_messages: usize,
    wait: Duration,
) -> tokio::sync::oneshot::Receiver<Result<Vec<QueueMessage>, ReceiveError>> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    tx.send(SchedulerCommand::Receive {
        queue_id: queue_id.to_string(),
        max_messages,
        wait: Some(wait),
        reply: reply_tx,
    })
    .unwrap();
    reply_rx
}

pub(super) fn send_ack(
    tx: &Sender,
    receipt: &ReceiptHandle,
) -> tokio::sync::oneshot::Receiver<Result<(), AckError>> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    tx.send(SchedulerCommand::Ack {
        receipt: receipt.clone(),
        reply: reply_tx,
    })
    .unwrap();
    reply_rx
}

/// Helper: handle every buffered command without entering the run loop, so
/// tests can interleave commands with time-driven work.
impl Scheduler {
    pub(super) fn handle_all_pending(&mut self) {
        while let Ok(cmd) = self.inbound.try_recv() {
            self.handle_command(cmd);
        }
    }
}

/// Helper: receive exactly one message through the command channel.
pub(super) fn receive_one(tx: &Sender, scheduler: &mut Scheduler, queue_id: &str) -> QueueMessage {
    let mut rx = send_receive(tx, queue_id, 1);
    scheduler.handle_all_pending();
    let mut batch = rx.try_recv().unwrap().unwrap();
    assert_eq!(batch.len(), 1, "expected exactly one message");
    batch.remove(0)
}
