//! Starts every component from one [`ConveyorConfig`] and routes
//! dead-letter replays back to the path that gave up on the event.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::autoscale::{Autoscaler, UtilizationSource, WorkerPoolState};
use crate::broker::Broker;
use crate::bus::{FunctionSubscriber, PublishReport, QueueSubscriber, Topic, TopicBuilder};
use crate::config::{ConveyorConfig, SubscriptionConfig};
use crate::dead_letter::{DeadLetterSource, DeadLetterStore};
use crate::error::{BrokerError, NotificationError, ReplayError, StartError, TriggerError};
use crate::event::Event;
use crate::function::{FunctionExecutor, FunctionHandler};
use crate::metrics::Metrics;
use crate::results::ResultStore;
use crate::storage::Storage;
use crate::trigger::{
    parse_notifications, ObjectProcessor, ObjectStore, ObjectTriggerPipeline, TriggerOutcome,
};
use crate::worker::{MessageHandler, WorkerPool};

/// The pluggable business logic.
pub struct Handlers {
    pub worker: Arc<dyn MessageHandler>,
    pub function: Arc<dyn FunctionHandler>,
    pub object_store: Arc<dyn ObjectStore>,
    pub object_processor: Arc<dyn ObjectProcessor>,
}

/// What `replay` did with a dead-letter record.
#[derive(Debug)]
pub enum ReplayOutcome {
    /// Re-enqueued to the original queue as a new message.
    Requeued { message_id: Uuid },
    /// Accepted by the function executor again.
    Redispatched { event_id: Uuid },
    /// Re-run through the object-trigger pipeline, one entry per
    /// notification in the stored payload.
    Reprocessed {
        results: Vec<Result<TriggerOutcome, TriggerError>>,
    },
}

pub struct Conveyor {
    broker: Arc<Broker>,
    topic: Topic,
    executor: FunctionExecutor,
    pipeline: Arc<ObjectTriggerPipeline>,
    dead_letters: DeadLetterStore,
    results: ResultStore,
    metrics: Metrics,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Conveyor {
    /// Validate `config`, open the broker, declare the queues and start the
    /// worker pool and its autoscaler.
    #[tracing::instrument(skip_all, fields(topic = %config.topic.name))]
    pub async fn start(
        config: &ConveyorConfig,
        storage: Arc<dyn Storage>,
        handlers: Handlers,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let metrics = Metrics::new();

        let broker = Arc::new(Broker::new(&config.scheduler, Arc::clone(&storage))?);
        for queue in &config.queues {
            broker.ensure_queue(queue.clone()).await?;
        }

        let dead_letters = DeadLetterStore::with_metrics(Arc::clone(&storage), metrics.clone());
        let results = ResultStore::new(Arc::clone(&storage));

        let executor = FunctionExecutor::with_metrics(
            config.function.clone(),
            handlers.function,
            dead_letters.clone(),
            metrics.clone(),
        );

        let mut topic = TopicBuilder::new(config.topic.name.clone()).with_metrics(metrics.clone());
        for subscription in &config.topic.subscriptions {
            topic = match subscription {
                SubscriptionConfig::Queue { queue } => {
                    topic.subscribe(QueueSubscriber::new(Arc::clone(&broker), queue.clone()))
                }
                SubscriptionConfig::Function { .. } => {
                    topic.subscribe(FunctionSubscriber::new(executor.clone()))
                }
            };
        }
        let topic = topic.build();

        let pool = WorkerPool::with_metrics(
            config.worker_pool.clone(),
            Arc::clone(&broker),
            handlers.worker,
            metrics.clone(),
        );
        let source: Arc<dyn UtilizationSource> = pool.utilization();
        let (autoscaler, desired_rx) = Autoscaler::new(
            config.worker_pool.name.clone(),
            config.autoscaling.clone(),
            WorkerPoolState::new(&config.autoscaling),
            source,
        );
        let autoscaler = autoscaler.with_metrics(metrics.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(pool.run(desired_rx, shutdown_rx.clone())),
            tokio::spawn(autoscaler.run(shutdown_rx)),
        ];

        let pipeline = Arc::new(
            ObjectTriggerPipeline::new(
                config.object_trigger.clone(),
                handlers.object_store,
                handlers.object_processor,
                results.clone(),
                dead_letters.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        info!(
            queues = config.queues.len(),
            subscribers = config.topic.subscriptions.len(),
            "conveyor started"
        );
        Ok(Self {
            broker,
            topic,
            executor,
            pipeline,
            dead_letters,
            results,
            metrics,
            shutdown_tx,
            tasks,
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn executor(&self) -> &FunctionExecutor {
        &self.executor
    }

    pub fn pipeline(&self) -> &Arc<ObjectTriggerPipeline> {
        &self.pipeline
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub async fn publish(&self, event: Event) -> PublishReport {
        self.topic.publish(event).await
    }

    /// Parse a raw notification body and run each object-created record
    /// through the pipeline.
    pub async fn handle_object_created(
        &self,
        body: &[u8],
    ) -> Result<Vec<Result<TriggerOutcome, TriggerError>>, NotificationError> {
        let notifications = parse_notifications(body)?;
        let mut outcomes = Vec::with_capacity(notifications.len());
        for notification in &notifications {
            outcomes.push(self.pipeline.handle(notification).await);
        }
        Ok(outcomes)
    }

    /// Hand a dead-letter record back to the consumer path named by its
    /// source. The record is removed once the hand-off succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn replay(&self, id: Uuid) -> Result<ReplayOutcome, ReplayError> {
        let record = self
            .dead_letters
            .get(&id)?
            .ok_or(ReplayError::RecordNotFound(id))?;

        match &record.source {
            DeadLetterSource::Queue { .. } => {
                let message_id = self.dead_letters.replay_to_queue(&self.broker, id).await?;
                Ok(ReplayOutcome::Requeued { message_id })
            }
            DeadLetterSource::Function { function } => {
                if function != self.executor.name() {
                    return Err(ReplayError::Unsupported {
                        id,
                        reason: format!("no executor for function {function}"),
                    });
                }
                let ticket = self.executor.dispatch(record.original_message.event.clone())?;
                self.dead_letters.remove(&id)?;
                self.metrics.record_replay(record.source.kind());
                info!(event_id = %ticket.event_id, "dead-letter record re-dispatched");
                Ok(ReplayOutcome::Redispatched {
                    event_id: ticket.event_id,
                })
            }
            DeadLetterSource::ObjectTrigger { pipeline } => {
                if pipeline != self.pipeline.name() {
                    return Err(ReplayError::Unsupported {
                        id,
                        reason: format!("no pipeline named {pipeline}"),
                    });
                }
                let notifications = parse_notifications(&record.original_message.event.payload)?;
                let mut results = Vec::with_capacity(notifications.len());
                for notification in &notifications {
                    match self.pipeline.handle(notification).await {
                        Err(TriggerError::Storage(e)) => return Err(e.into()),
                        settled => results.push(settled),
                    }
                }
                // Every notification reached a terminal state; a fresh
                // quarantine writes its own record.
                self.dead_letters.remove(&id)?;
                self.metrics.record_replay(record.source.kind());
                Ok(ReplayOutcome::Reprocessed { results })
            }
        }
    }

    /// Stop the pool and autoscaler, drain the executor, then stop the
    /// broker.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        info!("conveyor shutting down");
        let Conveyor {
            broker,
            topic,
            executor,
            pipeline,
            shutdown_tx,
            tasks,
            ..
        } = self;

        let _ = shutdown_tx.send(true);
        drop(topic);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        executor.shutdown().await;
        drop(executor);
        drop(pipeline);

        match Arc::try_unwrap(broker) {
            Ok(broker) => tokio::task::spawn_blocking(move || broker.shutdown())
                .await
                .map_err(|_| BrokerError::SchedulerPanicked)?,
            Err(_) => {
                warn!("broker still referenced elsewhere, it stops when the last handle drops");
                Ok(())
            }
        }
    }
}
