use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conveyor_core::autoscale::{evaluate, ScaleDirection};
use conveyor_core::bus::{FunctionSubscriber, QueueSubscriber};
use conveyor_core::config::SubscriptionConfig;
use conveyor_core::function::FinalDisposition;
use conveyor_core::trigger::{
    ImageConfig, ImageMetadataProcessor, LocalObjectStore, ObjectTriggerConfig,
};
use conveyor_core::*;

struct FailingWorker {
    calls: AtomicU32,
}

#[async_trait]
impl MessageHandler for FailingWorker {
    async fn handle(&self, _message: &QueueMessage) -> Result<(), ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProcessingError::transient("inventory service unavailable"))
    }
}

struct CountingFunction {
    calls: AtomicU32,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl CountingFunction {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl FunctionHandler for CountingFunction {
    async fn invoke(&self, _ctx: &InvocationContext, _event: &Event) -> Result<(), ProcessingError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::RgbImage::new(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn fast_config(object_root: &std::path::Path) -> ConveyorConfig {
    let mut config = ConveyorConfig::default();
    config.scheduler.idle_timeout_ms = 10;
    config.queues = vec![QueueConfig::new("orders").with_visibility_timeout_ms(150)];
    config.worker_pool.long_poll_ms = 20;
    config.worker_pool.processing_timeout_ms = 100;
    config.worker_pool.max_delivery_count = 3;
    config.autoscaling.min_tasks = 1;
    config.autoscaling.max_tasks = 1;
    config.function.retry_delay_ms = 1;
    config.object_trigger.retry_delay_ms = 1;
    config.server.object_root = object_root.display().to_string();
    config
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn always_failing_order_is_dead_lettered_after_three_deliveries() {
    let db = tempfile::tempdir().unwrap();
    let objects = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(db.path()).unwrap());
    let worker = Arc::new(FailingWorker {
        calls: AtomicU32::new(0),
    });
    let function = CountingFunction::new(Duration::ZERO);

    let conveyor = Conveyor::start(
        &fast_config(objects.path()),
        storage,
        Handlers {
            worker: worker.clone(),
            function: function.clone(),
            object_store: Arc::new(LocalObjectStore::new(objects.path())),
            object_processor: Arc::new(ImageMetadataProcessor::new(ImageConfig::default())),
        },
    )
    .await
    .unwrap();

    let event = Event::new(br#"{"order_id":"E1"}"#.to_vec());
    let report = conveyor.publish(event.clone()).await;
    assert!(report.all_delivered());

    let dead_letters = conveyor.dead_letters().clone();
    wait_until("dead-letter record", || {
        !dead_letters.list().unwrap().is_empty()
    })
    .await;

    let records = dead_letters.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::MaxRetriesExceeded);
    assert_eq!(records[0].original_message.event, event);
    assert_eq!(records[0].original_message.delivery_count, 3);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);

    let stats = conveyor.broker().stats("orders").await.unwrap();
    assert_eq!(stats.depth, 0);
    assert_eq!(stats.in_flight, 0);

    // The function path got the same event independently and succeeded.
    wait_until("function invocation", || {
        function.calls.load(Ordering::SeqCst) == 1
    })
    .await;

    // Replay puts it back on the queue as a fresh message.
    let outcome = conveyor.replay(records[0].id).await.unwrap();
    assert!(matches!(outcome, ReplayOutcome::Requeued { .. }));
    assert!(dead_letters.get(&records[0].id).unwrap().is_none());

    conveyor.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_photo_notification_is_processed_once() {
    let db = tempfile::tempdir().unwrap();
    let objects = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(db.path()).unwrap());
    let store = LocalObjectStore::new(objects.path());
    store.put_object("uploads", "photo1.jpg", &png(40, 30)).await.unwrap();

    let conveyor = Conveyor::start(
        &fast_config(objects.path()),
        storage,
        Handlers {
            worker: Arc::new(FailingWorker {
                calls: AtomicU32::new(0),
            }),
            function: CountingFunction::new(Duration::ZERO),
            object_store: Arc::new(store),
            object_processor: Arc::new(ImageMetadataProcessor::new(ImageConfig {
                long_tail_probability: 0.0,
                ..Default::default()
            })),
        },
    )
    .await
    .unwrap();

    let body = br#"{"Records":[{"eventName":"ObjectCreated:Put","eventTime":"2024-05-01T00:00:00Z",
        "s3":{"bucket":{"name":"uploads"},"object":{"key":"photo1.jpg"}}}]}"#;

    let first = conveyor.handle_object_created(body).await.unwrap();
    let second = conveyor.handle_object_created(body).await.unwrap();

    let first = first.into_iter().next().unwrap().unwrap();
    let second = second.into_iter().next().unwrap().unwrap();
    assert!(matches!(first, TriggerOutcome::Processed(_)));
    assert!(matches!(second, TriggerOutcome::Duplicate(_)));

    let stored = conveyor.results().get("photo1.jpg").unwrap().unwrap();
    assert_eq!(stored.status, ResultStatus::Success);
    assert_eq!(stored.data["width"], 40);
    assert_eq!(stored.data["height"], 30);
    assert_eq!(stored.data["format"], "PNG");
    assert_eq!(&stored, first.result());

    conveyor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_for_one_key_commit_one_result() {
    let db = tempfile::tempdir().unwrap();
    let objects = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(db.path()).unwrap());
    let store = LocalObjectStore::new(objects.path());
    store.put_object("uploads", "shared.png", &png(10, 10)).await.unwrap();

    let pipeline = Arc::new(ObjectTriggerPipeline::new(
        ObjectTriggerConfig::default(),
        Arc::new(store),
        Arc::new(ImageMetadataProcessor::new(ImageConfig::default())),
        ResultStore::new(Arc::clone(&storage)),
        DeadLetterStore::new(Arc::clone(&storage)),
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .handle(&ObjectCreatedNotification::new("uploads", "shared.png"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut processed = 0;
    let mut results = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if matches!(outcome, TriggerOutcome::Processed(_)) {
            processed += 1;
        }
        results.push(outcome.result().clone());
    }

    assert_eq!(processed, 1);
    let stored = pipeline.results().get("shared.png").unwrap().unwrap();
    assert!(results.iter().all(|r| *r == stored));
}

#[test]
fn ninety_percent_against_seventy_target_scales_two_to_three_then_holds() {
    let config = ScalingConfig {
        min_tasks: 1,
        max_tasks: 4,
        target_utilization_percent: 70.0,
        scale_out_cooldown_ms: 300_000,
        ..Default::default()
    };
    let mut state = WorkerPoolState::with_desired(&config, 2);
    let t0 = Instant::now();

    let decision = evaluate(&state, &config, 0.9, t0).unwrap();
    assert_eq!(decision, ScalingDecision::ScaleOut { from: 2, to: 3 });
    state.apply(&decision, 0.9, t0);
    assert_eq!(state.desired_count, 3);

    let later = t0 + Duration::from_secs(60);
    let decision = evaluate(&state, &config, 0.95, later).unwrap();
    assert!(matches!(
        decision,
        ScalingDecision::Suppressed {
            direction: ScaleDirection::Out,
            ..
        }
    ));
    state.apply(&decision, 0.95, later);
    assert_eq!(state.desired_count, 3);
}

#[tokio::test]
async fn executor_never_exceeds_reserved_concurrency_and_throttles_overflow() {
    let db = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(db.path()).unwrap());
    let function = CountingFunction::new(Duration::from_millis(30));
    let executor = FunctionExecutor::new(
        FunctionConfig {
            reserved_concurrency: 2,
            max_queued_invocations: 8,
            ..Default::default()
        },
        function.clone(),
        DeadLetterStore::new(storage),
    );

    let mut tickets = Vec::new();
    let mut throttled = 0;
    for i in 0..15 {
        match executor.dispatch(Event::new(format!("order-{i}"))) {
            Ok(ticket) => tickets.push(ticket),
            Err(_) => throttled += 1,
        }
    }
    assert_eq!(tickets.len(), 10);
    assert_eq!(throttled, 5);

    for ticket in tickets {
        let report = ticket.wait().await.unwrap();
        assert_eq!(report.disposition, FinalDisposition::Succeeded);
    }
    assert!(function.peak.load(Ordering::SeqCst) <= 2);
    assert!(executor.peak_active() <= 2);
    assert_eq!(function.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn a_failing_subscriber_does_not_block_the_queue() {
    let db = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(db.path()).unwrap());
    let broker = Arc::new(Broker::new(&SchedulerConfig::default(), Arc::clone(&storage)).unwrap());
    broker.create_queue(QueueConfig::new("orders")).await.unwrap();

    let executor = FunctionExecutor::new(
        FunctionConfig::default(),
        CountingFunction::new(Duration::ZERO),
        DeadLetterStore::new(storage),
    );
    executor.shutdown().await;

    let topic = TopicBuilder::new("orders")
        .subscribe(FunctionSubscriber::new(executor))
        .subscribe(QueueSubscriber::new(Arc::clone(&broker), "orders"))
        .build();

    let report = topic.publish(Event::new(b"order-7".to_vec())).await;
    assert_eq!(report.delivered, vec!["queue:orders".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].subscriber, "function:order-processor");
    assert_eq!(broker.stats("orders").await.unwrap().depth, 1);
}

#[test]
fn default_configuration_wires_queue_and_function() {
    let config = ConveyorConfig::default();
    assert!(config.validate().is_ok());
    assert!(config
        .topic
        .subscriptions
        .contains(&SubscriptionConfig::Queue {
            queue: "orders".to_string()
        }));
}
