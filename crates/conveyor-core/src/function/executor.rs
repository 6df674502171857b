use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::{
    ConcurrencyLimiter, FinalDisposition, FunctionConfig, FunctionHandler, FunctionInvocation,
    InvocationContext, InvocationOutcome, InvocationReport, InvocationTicket,
};
use crate::dead_letter::{DeadLetterReason, DeadLetterSource, DeadLetterStore, OriginalMessage};
use crate::error::{InvokeError, ProcessingError};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::time::now_ns;

struct Inner {
    config: FunctionConfig,
    handler: Arc<dyn FunctionHandler>,
    limiter: Arc<ConcurrencyLimiter>,
    dead_letters: DeadLetterStore,
    metrics: Metrics,
    accepting: AtomicBool,
    /// Accepted invocations that have not finished, running or waiting.
    admitted: AtomicUsize,
    idle: Notify,
}

/// Runs a [`FunctionHandler`] under reserved concurrency, per-attempt
/// timeouts and a bounded retry budget. Cheap to clone; clones share the
/// same slots.
#[derive(Clone)]
pub struct FunctionExecutor {
    inner: Arc<Inner>,
}

impl FunctionExecutor {
    pub fn new(
        config: FunctionConfig,
        handler: Arc<dyn FunctionHandler>,
        dead_letters: DeadLetterStore,
    ) -> Self {
        Self::with_metrics(config, handler, dead_letters, Metrics::new())
    }

    pub fn with_metrics(
        config: FunctionConfig,
        handler: Arc<dyn FunctionHandler>,
        dead_letters: DeadLetterStore,
        metrics: Metrics,
    ) -> Self {
        let limiter = Arc::new(ConcurrencyLimiter::new(config.reserved_concurrency));
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                limiter,
                dead_letters,
                metrics,
                accepting: AtomicBool::new(true),
                admitted: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &FunctionConfig {
        &self.inner.config
    }

    /// Attempts running right now. Never above `reserved_concurrency`.
    pub fn active(&self) -> usize {
        self.inner.limiter.in_flight()
    }

    pub fn peak_active(&self) -> usize {
        self.inner.limiter.peak_in_flight()
    }

    /// Accepted invocations not yet finished.
    pub fn admitted(&self) -> usize {
        self.inner.admitted.load(Ordering::SeqCst)
    }

    /// Accept `event` for asynchronous invocation.
    ///
    /// Fails with `Throttled` when every reserved slot is busy and
    /// `max_queued_invocations` more are already waiting.
    pub fn dispatch(&self, event: Event) -> Result<InvocationTicket, InvokeError> {
        let inner = &self.inner;
        let function = inner.config.name.as_str();
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(InvokeError::ShutDown(function.to_string()));
        }

        let capacity = inner.config.reserved_concurrency + inner.config.max_queued_invocations;
        let admit = inner
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            });
        if let Err(admitted) = admit {
            inner.metrics.record_throttle(function);
            let active = inner.limiter.in_flight();
            warn!(function, event_id = %event.id, active, admitted, "invocation throttled");
            return Err(InvokeError::Throttled {
                function: function.to_string(),
                active,
                limit: inner.config.reserved_concurrency,
                queued: admitted.saturating_sub(active),
            });
        }

        let event_id = event.id;
        let span = tracing::info_span!("invocation", function, %event_id);
        let admission = Admission(Arc::clone(inner));
        let handle = tokio::spawn(
            async move {
                let admission = admission;
                admission.0.invoke(event).await
            }
            .instrument(span),
        );
        Ok(InvocationTicket { event_id, handle })
    }

    /// Stop accepting work and wait for every admitted invocation to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        info!(function = %inner.config.name, admitted = self.admitted(), "function executor draining");
        loop {
            let idle = inner.idle.notified();
            if inner.admitted.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        info!(function = %inner.config.name, "function executor stopped");
    }
}

/// One admitted invocation. Dropping it frees the admission slot, also when
/// the handler panics and the task unwinds.
struct Admission(Arc<Inner>);

impl Drop for Admission {
    fn drop(&mut self) {
        if self.0.admitted.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Inner {
    async fn invoke(&self, event: Event) -> InvocationReport {
        let function = self.config.name.as_str();
        let max_attempts = self.config.max_attempts();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempts: Vec<FunctionInvocation> = Vec::new();
        let mut last_error = ProcessingError::transient("no attempt ran");

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }

            let permit = match self.limiter.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    last_error = ProcessingError::transient(e.to_string());
                    break;
                }
            };
            self.metrics
                .set_function_active(function, self.limiter.in_flight() as u64);
            if permit.is_cold_start() {
                self.metrics.record_cold_start(function);
            }

            let ctx = InvocationContext {
                invocation_id: Uuid::now_v7(),
                function: function.to_string(),
                event_id: event.id,
                attempt,
                cold_start: permit.is_cold_start(),
                memory_limit_mb: self.config.memory_size_mb,
                deadline: Instant::now() + timeout,
            };
            let started_at = now_ns();
            let clock = Instant::now();
            let result = match tokio::time::timeout(timeout, self.handler.invoke(&ctx, &event)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProcessingError::Timeout(timeout)),
            };
            drop(permit);
            self.metrics
                .set_function_active(function, self.limiter.in_flight() as u64);

            let outcome = match &result {
                Ok(()) => InvocationOutcome::Success,
                Err(ProcessingError::Timeout(_)) => InvocationOutcome::Timeout,
                Err(_) => InvocationOutcome::Failure,
            };
            self.metrics
                .record_invocation(function, &outcome.to_string());
            attempts.push(FunctionInvocation {
                invocation_id: ctx.invocation_id,
                event_id: event.id,
                attempt,
                started_at,
                duration: clock.elapsed(),
                cold_start: ctx.cold_start,
                outcome,
                error: result.as_ref().err().map(ToString::to_string),
            });

            match result {
                Ok(()) => {
                    debug!(invocation_id = %ctx.invocation_id, attempt, "invocation succeeded");
                    return InvocationReport {
                        function: function.to_string(),
                        event_id: event.id,
                        attempts,
                        disposition: FinalDisposition::Succeeded,
                    };
                }
                Err(e) => {
                    warn!(invocation_id = %ctx.invocation_id, attempt, max_attempts, error = %e, "invocation attempt failed");
                    let retryable = e.is_retryable();
                    last_error = e;
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let reason = if last_error.is_retryable() {
            DeadLetterReason::MaxRetriesExceeded
        } else {
            DeadLetterReason::ProcessingError
        };
        let original = OriginalMessage {
            event: event.clone(),
            delivery_count: attempts.len() as u32,
            first_received_at: attempts.first().map(|a| a.started_at),
            receipt_handle: None,
        };
        let source = DeadLetterSource::Function {
            function: function.to_string(),
        };
        let disposition = match self
            .dead_letters
            .record(source, original, reason, last_error.to_string())
        {
            Ok(record) => FinalDisposition::DeadLettered {
                record_id: record.id,
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to dead-letter event");
                FinalDisposition::Lost {
                    error: e.to_string(),
                }
            }
        };

        InvocationReport {
            function: function.to_string(),
            event_id: event.id,
            attempts,
            disposition,
        }
    }
}
