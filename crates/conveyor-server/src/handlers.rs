use async_trait::async_trait;
use conveyor_core::function::{FunctionHandler, InvocationContext};
use conveyor_core::{Event, MessageHandler, ProcessingError, QueueMessage};
use serde::Deserialize;
use tracing::info;

/// Attribute that makes the order processor fail on purpose, for exercising
/// retry and dead-letter paths: `transient` or `permanent`.
pub const SIMULATE_FAILURE_ATTR: &str = "simulate_failure";

#[derive(Debug, Deserialize)]
struct Order {
    order_id: String,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Validates and "fulfils" an order event. Shared by the worker pool and the
/// function executor; both paths see the same event stream.
#[derive(Debug, Default)]
pub struct OrderProcessor;

impl OrderProcessor {
    fn process(&self, consumer: &str, event: &Event) -> Result<Order, ProcessingError> {
        match event.attributes.get(SIMULATE_FAILURE_ATTR).map(String::as_str) {
            Some("transient") => return Err(ProcessingError::transient("simulated transient failure")),
            Some("permanent") => return Err(ProcessingError::permanent("simulated permanent failure")),
            _ => {}
        }

        let order: Order = serde_json::from_slice(&event.payload)
            .map_err(|e| ProcessingError::permanent(format!("malformed order: {e}")))?;
        if order.order_id.is_empty() {
            return Err(ProcessingError::permanent("order_id must not be empty"));
        }
        info!(consumer, event_id = %event.id, order_id = %order.order_id, items = order.items.len(), "order processed");
        Ok(order)
    }
}

#[async_trait]
impl MessageHandler for OrderProcessor {
    async fn handle(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        self.process("worker", &message.event).map(|_| ())
    }
}

#[async_trait]
impl FunctionHandler for OrderProcessor {
    async fn invoke(&self, ctx: &InvocationContext, event: &Event) -> Result<(), ProcessingError> {
        if ctx.cold_start {
            info!(invocation_id = %ctx.invocation_id, "cold start");
        }
        self.process("function", event).map(|_| ())
    }
}
