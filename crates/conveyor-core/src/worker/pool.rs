use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::consumer::Worker;
use super::{MessageHandler, UtilizationTracker, WorkerPoolConfig};
use crate::broker::Broker;
use crate::metrics::Metrics;

struct WorkerHandle {
    id: usize,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs `desired_count` workers against one queue and measures how busy
/// they are.
///
/// The pool never decides its own size: it realizes whatever count arrives
/// on the watch channel handed to [`WorkerPool::run`].
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    broker: Arc<Broker>,
    handler: Arc<dyn MessageHandler>,
    workers: Vec<WorkerHandle>,
    /// Stopped workers still finishing their last batch.
    retiring: Vec<JoinHandle<()>>,
    next_id: usize,
    busy: Arc<AtomicUsize>,
    utilization: Arc<UtilizationTracker>,
    metrics: Metrics,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<Broker>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::with_metrics(config, broker, handler, Metrics::new())
    }

    pub fn with_metrics(
        config: WorkerPoolConfig,
        broker: Arc<Broker>,
        handler: Arc<dyn MessageHandler>,
        metrics: Metrics,
    ) -> Self {
        let utilization = Arc::new(UtilizationTracker::new(config.utilization_smoothing));
        Self {
            config: Arc::new(config),
            broker,
            handler,
            workers: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
            busy: Arc::new(AtomicUsize::new(0)),
            utilization,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Workers processing a batch right now.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Smoothed utilization, shared with the autoscaler.
    pub fn utilization(&self) -> Arc<UtilizationTracker> {
        Arc::clone(&self.utilization)
    }

    /// Start or stop workers until exactly `desired` are running. The newest
    /// workers are stopped first; each finishes its current batch.
    pub fn resize(&mut self, desired: usize) {
        let before = self.workers.len();
        while self.workers.len() < desired {
            self.spawn_worker();
        }
        while self.workers.len() > desired {
            if let Some(handle) = self.workers.pop() {
                let _ = handle.stop.send(true);
                self.retiring.push(handle.task);
                info!(pool = %self.config.name, worker = handle.id, "worker retiring");
            }
        }
        self.retiring.retain(|task| !task.is_finished());

        if before != desired {
            info!(pool = %self.config.name, from = before, to = desired, "worker pool resized");
        }
        self.metrics
            .set_pool_running(&self.config.name, self.workers.len() as u64);
    }

    fn spawn_worker(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            id,
            broker: Arc::clone(&self.broker),
            handler: Arc::clone(&self.handler),
            config: Arc::clone(&self.config),
            busy: Arc::clone(&self.busy),
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(worker.run(stop_rx));
        self.workers.push(WorkerHandle {
            id,
            stop: stop_tx,
            task,
        });
    }

    /// Respawn workers whose task ended without being stopped, i.e. a
    /// handler panicked.
    fn replace_failed_workers(&mut self) {
        let before = self.workers.len();
        let pool = self.config.name.as_str();
        self.workers.retain(|handle| {
            let failed = handle.task.is_finished();
            if failed {
                warn!(pool, worker = handle.id, "worker task ended unexpectedly, replacing it");
            }
            !failed
        });
        while self.workers.len() < before {
            self.spawn_worker();
        }
    }

    /// Take one utilization sample (busy ÷ running) and fold it into the
    /// smoothed value. An empty pool reports full utilization so a pool
    /// scaled to zero is never stuck there.
    pub fn sample_utilization(&self) -> f64 {
        let running = self.workers.len();
        let raw = if running == 0 {
            1.0
        } else {
            self.busy().min(running) as f64 / running as f64
        };
        let smoothed = self.utilization.record(raw);
        self.metrics
            .set_pool_utilization(&self.config.name, smoothed);
        smoothed
    }

    /// Drive the pool: apply every `desired` update, sample utilization on
    /// a fixed interval, and stop all workers once `shutdown` flips.
    pub async fn run(
        mut self,
        mut desired: watch::Receiver<u32>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.resize(*desired.borrow_and_update() as usize);
        let mut sampler =
            tokio::time::interval(Duration::from_millis(self.config.utilization_sample_interval_ms));
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = desired.changed() => {
                    if changed.is_err() {
                        warn!(pool = %self.config.name, "desired count sender dropped, keeping current size");
                        // Nothing will resize the pool again; wait for shutdown only.
                        let _ = shutdown.wait_for(|stop| *stop).await;
                        break;
                    }
                    let target = *desired.borrow_and_update() as usize;
                    self.resize(target);
                }
                _ = sampler.tick() => {
                    self.replace_failed_workers();
                    self.sample_utilization();
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }

        self.shutdown().await;
    }

    /// Stop every worker and wait for in-progress batches to finish.
    pub async fn shutdown(mut self) {
        info!(pool = %self.config.name, running = self.workers.len(), "stopping worker pool");
        self.resize(0);
        for task in self.retiring.drain(..) {
            if let Err(e) = task.await {
                warn!(pool = %self.config.name, error = %e, "worker task failed");
            }
        }
    }
}
