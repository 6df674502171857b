pub mod autoscale;
pub mod broker;
pub mod bus;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod function;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod results;
pub mod runtime;
pub mod storage;
pub mod telemetry;
pub mod time;
pub mod trigger;
pub mod worker;

pub use autoscale::{Autoscaler, ScalingConfig, ScalingDecision, WorkerPoolState};
pub use broker::{Broker, QueueStats, SchedulerConfig};
pub use bus::{PublishReport, Subscriber, Topic, TopicBuilder};
pub use config::ConveyorConfig;
pub use dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSource, DeadLetterStore};
pub use error::{ProcessingError, StorageError, StorageResult};
pub use event::Event;
pub use function::{FunctionConfig, FunctionExecutor, FunctionHandler, InvocationContext};
pub use message::{QueueMessage, ReceiptHandle};
pub use queue::QueueConfig;
pub use results::{ProcessingResult, PutOutcome, ResultStatus, ResultStore};
pub use runtime::{Conveyor, Handlers, ReplayOutcome};
pub use storage::{RocksDbStorage, Storage, WriteBatchOp};
pub use trigger::{ObjectCreatedNotification, ObjectTriggerPipeline, TriggerOutcome};
pub use worker::{MessageHandler, WorkerPool, WorkerPoolConfig};
