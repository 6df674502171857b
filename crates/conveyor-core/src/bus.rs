//! Fan-out topic. Every subscriber receives its own clone of each
//! published event; subscribers never observe each other's failures.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::DeliveryError;
use crate::event::Event;
use crate::function::FunctionExecutor;
use crate::metrics::Metrics;

/// A destination attached to a topic.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn deliver(&self, event: Event) -> Result<(), DeliveryError>;
}

/// Enqueues into a durable queue; the worker pool reads from there.
pub struct QueueSubscriber {
    name: String,
    broker: Arc<Broker>,
    queue: String,
}

impl QueueSubscriber {
    pub fn new(broker: Arc<Broker>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            name: format!("queue:{queue}"),
            broker,
            queue,
        }
    }
}

#[async_trait]
impl Subscriber for QueueSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: Event) -> Result<(), DeliveryError> {
        self.broker.enqueue(&self.queue, event).await?;
        Ok(())
    }
}

/// Hands the event to a bounded function executor. Delivery succeeds once
/// the executor accepts the invocation; attempts run in the background.
pub struct FunctionSubscriber {
    name: String,
    executor: FunctionExecutor,
}

impl FunctionSubscriber {
    pub fn new(executor: FunctionExecutor) -> Self {
        Self {
            name: format!("function:{}", executor.name()),
            executor,
        }
    }
}

#[async_trait]
impl Subscriber for FunctionSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: Event) -> Result<(), DeliveryError> {
        self.executor.dispatch(event)?;
        Ok(())
    }
}

/// Per-subscriber delivery failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDelivery {
    pub subscriber: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub delivered: Vec<String>,
    pub failed: Vec<FailedDelivery>,
}

impl PublishReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Collects subscriptions before the topic is sealed.
pub struct TopicBuilder {
    name: String,
    subscribers: Vec<Arc<dyn Subscriber>>,
    metrics: Option<Metrics>,
}

impl TopicBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Vec::new(),
            metrics: None,
        }
    }

    pub fn subscribe<S: Subscriber>(self, subscriber: S) -> Self {
        self.subscribe_arc(Arc::new(subscriber))
    }

    pub fn subscribe_arc(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Topic {
        if self.subscribers.is_empty() {
            warn!(topic = %self.name, "topic has no subscribers, events will be dropped");
        }
        Topic {
            name: self.name,
            subscribers: self.subscribers,
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}

pub struct Topic {
    name: String,
    subscribers: Vec<Arc<dyn Subscriber>>,
    metrics: Metrics,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_names(&self) -> Vec<&str> {
        self.subscribers.iter().map(|s| s.name()).collect()
    }

    /// Deliver `event` to every subscriber concurrently.
    #[tracing::instrument(skip_all, fields(topic = %self.name, event_id = %event.id))]
    pub async fn publish(&self, event: Event) -> PublishReport {
        self.metrics.record_publish(&self.name);
        let event_id = event.id;

        let deliveries = self.subscribers.iter().map(|subscriber| {
            let event = event.clone();
            async move { (subscriber.name(), subscriber.deliver(event).await) }
        });
        let results = join_all(deliveries).await;

        let mut report = PublishReport {
            event_id,
            delivered: Vec::with_capacity(results.len()),
            failed: Vec::new(),
        };
        for (subscriber, result) in results {
            match result {
                Ok(()) => report.delivered.push(subscriber.to_string()),
                Err(e) => {
                    warn!(subscriber, error = %e, "delivery to subscriber failed");
                    self.metrics.record_delivery_failure(&self.name, subscriber);
                    report.failed.push(FailedDelivery {
                        subscriber: subscriber.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "event published"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::broker::SchedulerConfig;
    use crate::error::{EnqueueError, InvokeError};
    use crate::queue::QueueConfig;
    use crate::storage::RocksDbStorage;

    struct Recording {
        name: String,
        seen: Mutex<Vec<Event>>,
        fail: bool,
    }

    impl Recording {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl Subscriber for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn deliver(&self, event: Event) -> Result<(), DeliveryError> {
            self.seen.lock().unwrap().push(event);
            if self.fail {
                return Err(DeliveryError::Invoke(InvokeError::ShutDown(
                    self.name.clone(),
                )));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let a = Recording::new("a", false);
        let b = Recording::new("b", false);
        let topic = TopicBuilder::new("orders")
            .subscribe_arc(a.clone())
            .subscribe_arc(b.clone())
            .build();

        let event = Event::new(b"order-1".to_vec()).with_attribute("type", "order");
        let report = topic.publish(event.clone()).await;

        assert!(report.all_delivered());
        assert_eq!(report.delivered, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.seen.lock().unwrap().as_slice(), &[event.clone()]);
        assert_eq!(b.seen.lock().unwrap().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn one_failing_subscriber_does_not_affect_the_others() {
        let harness = crate::metrics::test_harness::MetricTestHarness::new();
        let broken = Recording::new("broken", true);
        let healthy = Recording::new("healthy", false);
        let topic = TopicBuilder::new("orders")
            .subscribe_arc(broken)
            .subscribe_arc(healthy.clone())
            .with_metrics(harness.metrics())
            .build();

        let report = topic.publish(Event::new(b"x".to_vec())).await;

        assert_eq!(report.delivered, vec!["healthy".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].subscriber, "broken");
        assert_eq!(healthy.seen.lock().unwrap().len(), 1);
        harness.assert_counter(
            "conveyor.topic.delivery_failures",
            &[("topic", "orders"), ("subscriber", "broken")],
            1,
        );
        harness.assert_counter("conveyor.topic.published", &[("topic", "orders")], 1);
    }

    #[tokio::test]
    async fn queue_subscriber_enqueues_and_reports_unknown_queue() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
        let broker = Arc::new(Broker::new(&SchedulerConfig::default(), storage).unwrap());
        broker.create_queue(QueueConfig::new("orders")).await.unwrap();

        let subscriber = QueueSubscriber::new(Arc::clone(&broker), "orders");
        assert_eq!(subscriber.name(), "queue:orders");
        subscriber.deliver(Event::new(b"a".to_vec())).await.unwrap();

        let batch = broker
            .receive("orders", 10, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.payload, b"a");

        let missing = QueueSubscriber::new(broker, "nope");
        assert!(matches!(
            missing.deliver(Event::new(vec![])).await,
            Err(DeliveryError::Enqueue(EnqueueError::QueueNotFound(_)))
        ));
    }
}
