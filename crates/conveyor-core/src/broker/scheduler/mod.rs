use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::command::SchedulerCommand;
use crate::broker::config::SchedulerConfig;
use crate::error::ReceiveError;
use crate::message::QueueMessage;
use crate::metrics::Metrics;
use crate::queue::QueueConfig;
use crate::storage::{keys, Storage, WriteBatchOp};

mod delivery;
mod handlers;
mod metrics_recording;
mod recovery;

type ReceiveReply = oneshot::Sender<Result<Vec<QueueMessage>, ReceiveError>>;

/// A receiver parked in a long poll until a message arrives or `deadline`.
pub(super) struct Waiter {
    pub(super) max_messages: usize,
    pub(super) deadline: Instant,
    pub(super) reply: ReceiveReply,
}

/// In-memory view of one persisted lease.
#[derive(Debug, Clone)]
pub(super) struct LeaseEntry {
    pub(super) queue_id: String,
    pub(super) expiry_ns: u64,
}

/// Single-threaded scheduler core. Owns all mutable queue state and
/// processes commands from async callers via a crossbeam channel.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    inbound: Receiver<SchedulerCommand>,
    idle_timeout: Duration,
    retention_sweep_interval: Duration,
    running: bool,
    /// Queue configs, mirrored from the `queues` CF.
    queues: HashMap<String, QueueConfig>,
    /// Per-queue FIFO of visible (unleased) message ids.
    pending: HashMap<String, VecDeque<Uuid>>,
    /// In-flight messages, keyed by message id.
    leased: HashMap<Uuid, LeaseEntry>,
    /// Per-queue long-poll waiters, oldest first.
    waiters: HashMap<String, VecDeque<Waiter>>,
    last_reclaim: Instant,
    last_retention_sweep: Instant,
    metrics: Metrics,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        inbound: Receiver<SchedulerCommand>,
        config: &SchedulerConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            storage,
            inbound,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            retention_sweep_interval: Duration::from_millis(config.retention_sweep_interval_ms),
            running: true,
            queues: HashMap::new(),
            pending: HashMap::new(),
            leased: HashMap::new(),
            waiters: HashMap::new(),
            last_reclaim: now,
            last_retention_sweep: now,
            metrics: Metrics::new(),
        }
    }

    /// Run the scheduler event loop. This blocks the current thread until
    /// a `Shutdown` command is received or the inbound channel is disconnected.
    pub fn run(&mut self) {
        info!("scheduler started");
        self.recover();

        while self.running {
            // Phase 1: Drain all buffered commands (non-blocking)
            let mut drained = 0;
            while let Ok(cmd) = self.inbound.try_recv() {
                self.handle_command(cmd);
                drained += 1;
                if !self.running {
                    break;
                }
            }

            if !self.running {
                break;
            }

            // Phase 2: Time-driven work: lease reclaim, retention, poll deadlines
            self.run_periodic();
            self.record_gauges();

            // Phase 3: Park until next command, next waiter deadline, or idle tick
            if drained == 0 {
                match self.inbound.recv_timeout(self.park_timeout()) {
                    Ok(cmd) => self.handle_command(cmd),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        info!("inbound channel disconnected, shutting down");
                        self.running = false;
                    }
                }
            }
        }

        self.release_all_waiters();

        // Flush the WAL to ensure all writes are durable before exit
        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "failed to flush WAL during shutdown");
        }

        info!("scheduler stopped");
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::CreateQueue { config, reply } => {
                info!(queue = %config.name, "create queue command received");
                let result = self.handle_create_queue(config);
                let _ = reply.send(result);
            }
            SchedulerCommand::Enqueue { message, reply } => {
                debug!(queue_id = %message.queue_id, msg_id = %message.id, "enqueue command received");
                let queue_id = message.queue_id.clone();
                let result = self.handle_enqueue(message);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    // Answer parked receivers immediately
                    self.serve_waiters(&queue_id);
                }
            }
            SchedulerCommand::Receive {
                queue_id,
                max_messages,
                wait,
                reply,
            } => {
                debug!(%queue_id, max_messages, "receive command received");
                self.handle_receive(&queue_id, max_messages, wait, reply);
            }
            SchedulerCommand::Ack { receipt, reply } => {
                debug!(%receipt, "ack command received");
                let result = self.handle_ack(&receipt);
                let _ = reply.send(result);
            }
            SchedulerCommand::DeadLetter {
                receipt,
                reason,
                error,
                reply,
            } => {
                debug!(%receipt, %reason, %error, "dead-letter command received");
                let result = self.handle_dead_letter(&receipt, reason, error);
                let _ = reply.send(result);
            }
            SchedulerCommand::Replay { record_id, reply } => {
                info!(%record_id, "replay command received");
                let result = self.handle_replay(record_id);
                let _ = reply.send(result);
            }
            SchedulerCommand::GetStats { queue_id, reply } => {
                let result = self.handle_get_stats(&queue_id);
                let _ = reply.send(result);
            }
            SchedulerCommand::ListQueues { reply } => {
                let result = self.handle_list_queues();
                let _ = reply.send(result);
            }
            SchedulerCommand::Shutdown => {
                info!("shutdown command received");
                self.running = false;
            }
        }
    }

    fn run_periodic(&mut self) {
        if self.last_reclaim.elapsed() >= self.idle_timeout {
            self.last_reclaim = Instant::now();
            self.reclaim_expired_leases();
        }
        if self.last_retention_sweep.elapsed() >= self.retention_sweep_interval {
            self.last_retention_sweep = Instant::now();
            self.sweep_retention();
        }
        self.expire_waiters(Instant::now());
    }

    /// Park no longer than the idle timeout, and wake in time for the
    /// earliest long-poll deadline.
    fn park_timeout(&self) -> Duration {
        let now = Instant::now();
        self.waiters
            .values()
            .flatten()
            .map(|w| w.deadline.saturating_duration_since(now))
            .min()
            .map_or(self.idle_timeout, |d| d.min(self.idle_timeout))
    }

    fn pending_push_back(&mut self, queue_id: &str, msg_id: Uuid) {
        self.pending
            .entry(queue_id.to_string())
            .or_default()
            .push_back(msg_id);
    }

    fn pending_remove(&mut self, queue_id: &str, msg_id: &Uuid) {
        if let Some(entries) = self.pending.get_mut(queue_id) {
            entries.retain(|id| id != msg_id);
        }
    }

    /// Delete a message together with any lease it holds.
    fn delete_message_ops(&self, queue_id: &str, msg_id: &Uuid) -> Vec<WriteBatchOp> {
        let mut ops = vec![WriteBatchOp::DeleteMessage {
            key: keys::message_key(queue_id, msg_id),
        }];
        if let Some(lease) = self.leased.get(msg_id) {
            ops.push(WriteBatchOp::DeleteLease {
                key: keys::lease_key(queue_id, msg_id),
            });
            ops.push(WriteBatchOp::DeleteLeaseExpiry {
                key: keys::lease_expiry_key(lease.expiry_ns, queue_id, msg_id),
            });
        }
        ops
    }

    /// Access the storage layer (used by tests).
    #[cfg(test)]
    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }
}

#[cfg(test)]
mod tests;
