//! Bounded, on-demand function consumer.
//!
//! Each dispatched event becomes one asynchronous invocation: up to
//! `1 + max_retry_attempts` attempts, each under its own timeout, with no
//! more than `reserved_concurrency` attempts active at once across the
//! process. Events that still fail are written verbatim to the dead-letter
//! store.

mod executor;
mod limiter;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ConfigError, ProcessingError};
use crate::event::Event;

pub use executor::FunctionExecutor;
pub use limiter::{ConcurrencyLimiter, ExecutionPermit};

/// The function body. Must not rely on state shared across invocations.
#[async_trait]
pub trait FunctionHandler: Send + Sync + 'static {
    async fn invoke(&self, ctx: &InvocationContext, event: &Event) -> Result<(), ProcessingError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub name: String,
    pub memory_size_mb: u32,
    pub timeout_ms: u64,
    pub reserved_concurrency: usize,
    /// Attempts after the first one.
    pub max_retry_attempts: u32,
    /// Invocations allowed to wait for a slot; beyond this `dispatch` is
    /// throttled.
    pub max_queued_invocations: usize,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_delay_ms: u64,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            name: "order-processor".to_string(),
            memory_size_mb: 128,
            timeout_ms: 30_000,
            reserved_concurrency: 10,
            max_retry_attempts: 2,
            max_queued_invocations: 100,
            retry_delay_ms: 1_000,
        }
    }
}

impl FunctionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "function.name must not be empty".into(),
            ));
        }
        if self.memory_size_mb < 128 {
            return Err(ConfigError::InvalidValue(
                "function.memory_size_mb must be >= 128".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "function.timeout_ms must be > 0".into(),
            ));
        }
        if self.reserved_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "function.reserved_concurrency must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retry_attempts.saturating_add(1)
    }

    /// Backoff before attempt `next_attempt` (2, 3, ...).
    pub(crate) fn retry_delay(&self, next_attempt: u32) -> Duration {
        let exp = next_attempt.saturating_sub(2).min(16);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << exp))
    }
}

/// What one attempt knows about itself. Everything an attempt emits should
/// carry `invocation_id`.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub invocation_id: Uuid,
    pub function: String,
    pub event_id: Uuid,
    pub attempt: u32,
    pub cold_start: bool,
    pub memory_limit_mb: u32,
    pub deadline: Instant,
}

impl InvocationContext {
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success,
    Failure,
    Timeout,
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOutcome::Success => f.write_str("success"),
            InvocationOutcome::Failure => f.write_str("failure"),
            InvocationOutcome::Timeout => f.write_str("timeout"),
        }
    }
}

/// One attempt.
#[derive(Debug, Clone)]
pub struct FunctionInvocation {
    pub invocation_id: Uuid,
    pub event_id: Uuid,
    pub attempt: u32,
    /// Nanoseconds since the Unix epoch.
    pub started_at: u64,
    pub duration: Duration,
    pub cold_start: bool,
    pub outcome: InvocationOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalDisposition {
    Succeeded,
    DeadLettered { record_id: Uuid },
    /// Every attempt failed and the dead-letter write failed too.
    Lost { error: String },
}

/// Everything that happened to one dispatched event.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub function: String,
    pub event_id: Uuid,
    pub attempts: Vec<FunctionInvocation>,
    pub disposition: FinalDisposition,
}

impl InvocationReport {
    pub fn succeeded(&self) -> bool {
        self.disposition == FinalDisposition::Succeeded
    }
}

/// Handle to an accepted invocation. Dropping it does not cancel anything.
#[derive(Debug)]
pub struct InvocationTicket {
    pub event_id: Uuid,
    handle: JoinHandle<InvocationReport>,
}

impl InvocationTicket {
    /// Wait for the invocation to finish. Errors only if the task panicked.
    pub async fn wait(self) -> Result<InvocationReport, tokio::task::JoinError> {
        self.handle.await
    }
}
