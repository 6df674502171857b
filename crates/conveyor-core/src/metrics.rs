use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// OTel instruments for every pipeline component. Each component creates its
/// own `Metrics` once at construction; with no meter provider installed the
/// instruments are no-op.
#[derive(Clone)]
pub struct Metrics {
    pub messages_enqueued: Counter<u64>,
    pub messages_received: Counter<u64>,
    pub messages_acked: Counter<u64>,
    pub messages_redelivered: Counter<u64>,
    pub messages_expired: Counter<u64>,
    pub messages_dead_lettered: Counter<u64>,
    pub queue_depth: Gauge<u64>,
    pub queue_in_flight: Gauge<u64>,
    pub topic_published: Counter<u64>,
    pub topic_delivery_failures: Counter<u64>,
    pub dead_letters_recorded: Counter<u64>,
    pub dead_letters_replayed: Counter<u64>,
    pub function_invocations: Counter<u64>,
    pub function_throttles: Counter<u64>,
    pub function_cold_starts: Counter<u64>,
    pub function_active: Gauge<u64>,
    pub worker_messages: Counter<u64>,
    pub pool_running: Gauge<u64>,
    pub pool_utilization: Gauge<f64>,
    pub pool_desired_count: Gauge<u64>,
    pub scaling_decisions: Counter<u64>,
    pub trigger_outcomes: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured (OTel disabled), the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("conveyor");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_enqueued: meter
                .u64_counter("conveyor.queue.enqueued")
                .with_description("Total messages enqueued")
                .build(),
            messages_received: meter
                .u64_counter("conveyor.queue.received")
                .with_description("Total messages handed to receivers")
                .build(),
            messages_acked: meter
                .u64_counter("conveyor.queue.acked")
                .with_description("Total messages acknowledged")
                .build(),
            messages_redelivered: meter
                .u64_counter("conveyor.queue.redelivered")
                .with_description("Leases that expired and made a message visible again")
                .build(),
            messages_expired: meter
                .u64_counter("conveyor.queue.expired")
                .with_description("Messages dropped after exceeding retention")
                .build(),
            messages_dead_lettered: meter
                .u64_counter("conveyor.queue.dead_lettered")
                .with_description("Messages moved from a queue to the dead-letter store")
                .build(),
            queue_depth: meter
                .u64_gauge("conveyor.queue.depth")
                .with_description("Visible messages waiting in a queue")
                .build(),
            queue_in_flight: meter
                .u64_gauge("conveyor.queue.in_flight")
                .with_description("Received messages not yet acknowledged")
                .build(),
            topic_published: meter
                .u64_counter("conveyor.topic.published")
                .with_description("Events published to a topic")
                .build(),
            topic_delivery_failures: meter
                .u64_counter("conveyor.topic.delivery_failures")
                .with_description("Failed deliveries to a single subscriber")
                .build(),
            dead_letters_recorded: meter
                .u64_counter("conveyor.dead_letter.recorded")
                .with_description("Records written to the dead-letter store")
                .build(),
            dead_letters_replayed: meter
                .u64_counter("conveyor.dead_letter.replayed")
                .with_description("Dead-letter records handed back for reprocessing")
                .build(),
            function_invocations: meter
                .u64_counter("conveyor.function.invocations")
                .with_description("Function invocation attempts by outcome")
                .build(),
            function_throttles: meter
                .u64_counter("conveyor.function.throttles")
                .with_description("Dispatches rejected because the backlog was full")
                .build(),
            function_cold_starts: meter
                .u64_counter("conveyor.function.cold_starts")
                .with_description("Invocations that needed a fresh execution slot")
                .build(),
            function_active: meter
                .u64_gauge("conveyor.function.active")
                .with_description("Currently running invocations")
                .build(),
            worker_messages: meter
                .u64_counter("conveyor.worker.messages")
                .with_description("Messages handled by the worker pool by outcome")
                .build(),
            pool_running: meter
                .u64_gauge("conveyor.pool.running")
                .with_description("Running worker tasks")
                .build(),
            pool_utilization: meter
                .f64_gauge("conveyor.pool.utilization")
                .with_description("Smoothed fraction of workers busy processing")
                .build(),
            pool_desired_count: meter
                .u64_gauge("conveyor.autoscaler.desired_count")
                .with_description("Worker count requested by the autoscaler")
                .build(),
            scaling_decisions: meter
                .u64_counter("conveyor.autoscaler.decisions")
                .with_description("Autoscaler evaluations by decision")
                .build(),
            trigger_outcomes: meter
                .u64_counter("conveyor.trigger.outcomes")
                .with_description("Object notifications by outcome")
                .build(),
        }
    }

    pub fn record_enqueue(&self, queue_id: &str) {
        self.messages_enqueued.add(1, &[queue_attr(queue_id)]);
    }

    pub fn record_receive(&self, queue_id: &str, count: u64) {
        self.messages_received.add(count, &[queue_attr(queue_id)]);
    }

    pub fn record_ack(&self, queue_id: &str) {
        self.messages_acked.add(1, &[queue_attr(queue_id)]);
    }

    pub fn record_redelivery(&self, queue_id: &str) {
        self.messages_redelivered.add(1, &[queue_attr(queue_id)]);
    }

    pub fn record_expired(&self, queue_id: &str) {
        self.messages_expired.add(1, &[queue_attr(queue_id)]);
    }

    pub fn record_queue_dead_letter(&self, queue_id: &str) {
        self.messages_dead_lettered.add(1, &[queue_attr(queue_id)]);
    }

    pub fn set_queue_depth(&self, queue_id: &str, depth: u64) {
        self.queue_depth.record(depth, &[queue_attr(queue_id)]);
    }

    pub fn set_in_flight(&self, queue_id: &str, count: u64) {
        self.queue_in_flight.record(count, &[queue_attr(queue_id)]);
    }

    pub fn record_publish(&self, topic: &str) {
        self.topic_published
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }

    pub fn record_delivery_failure(&self, topic: &str, subscriber: &str) {
        self.topic_delivery_failures.add(
            1,
            &[
                KeyValue::new("topic", topic.to_string()),
                KeyValue::new("subscriber", subscriber.to_string()),
            ],
        );
    }

    pub fn record_dead_letter(&self, source: &str) {
        self.dead_letters_recorded
            .add(1, &[KeyValue::new("source", source.to_string())]);
    }

    pub fn record_replay(&self, source: &str) {
        self.dead_letters_replayed
            .add(1, &[KeyValue::new("source", source.to_string())]);
    }

    pub fn record_invocation(&self, function: &str, outcome: &str) {
        self.function_invocations.add(
            1,
            &[
                function_attr(function),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }

    pub fn record_throttle(&self, function: &str) {
        self.function_throttles.add(1, &[function_attr(function)]);
    }

    pub fn record_cold_start(&self, function: &str) {
        self.function_cold_starts.add(1, &[function_attr(function)]);
    }

    pub fn set_function_active(&self, function: &str, active: u64) {
        self.function_active.record(active, &[function_attr(function)]);
    }

    pub fn record_worker_outcome(&self, queue_id: &str, outcome: &str) {
        self.worker_messages.add(
            1,
            &[
                queue_attr(queue_id),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }

    pub fn set_pool_running(&self, pool: &str, running: u64) {
        self.pool_running.record(running, &[pool_attr(pool)]);
    }

    pub fn set_pool_utilization(&self, pool: &str, utilization: f64) {
        self.pool_utilization.record(utilization, &[pool_attr(pool)]);
    }

    pub fn set_desired_count(&self, pool: &str, desired: u64) {
        self.pool_desired_count.record(desired, &[pool_attr(pool)]);
    }

    pub fn record_scaling_decision(&self, pool: &str, decision: &str) {
        self.scaling_decisions.add(
            1,
            &[
                pool_attr(pool),
                KeyValue::new("decision", decision.to_string()),
            ],
        );
    }

    pub fn record_trigger_outcome(&self, pipeline: &str, outcome: &str) {
        self.trigger_outcomes.add(
            1,
            &[
                KeyValue::new("pipeline", pipeline.to_string()),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }
}

fn queue_attr(queue_id: &str) -> KeyValue {
    KeyValue::new("queue_id", queue_id.to_string())
}

fn function_attr(function: &str) -> KeyValue {
    KeyValue::new("function", function.to_string())
}

fn pool_attr(pool: &str) -> KeyValue {
    KeyValue::new("pool", pool.to_string())
}
