//! Target-tracking autoscaling for a worker pool.
//!
//! [`evaluate`] is a pure function of the pool state, one utilization sample
//! and the clock. The [`Autoscaler`] control loop owns the only
//! [`WorkerPoolState`], applies decisions to it and publishes the resulting
//! `desired_count` on a watch channel for the pool to realize.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ScalingError};
use crate::metrics::Metrics;

/// Anything that can report the current smoothed utilization as a fraction
/// in `[0, 1]`.
pub trait UtilizationSource: Send + Sync {
    fn sample(&self) -> Result<f64, ScalingError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_tasks: u32,
    pub max_tasks: u32,
    pub target_utilization_percent: f64,
    pub scale_in_cooldown_ms: u64,
    pub scale_out_cooldown_ms: u64,
    pub evaluation_interval_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_tasks: 1,
            max_tasks: 4,
            target_utilization_percent: 70.0,
            scale_in_cooldown_ms: 300_000,
            scale_out_cooldown_ms: 300_000,
            evaluation_interval_ms: 60_000,
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_tasks == 0 {
            return Err(ConfigError::InvalidValue(
                "autoscaling.min_tasks must be >= 1".into(),
            ));
        }
        if self.min_tasks > self.max_tasks {
            return Err(ConfigError::InvalidValue(format!(
                "autoscaling.min_tasks ({}) must not exceed max_tasks ({})",
                self.min_tasks, self.max_tasks
            )));
        }
        let target = self.target_utilization_percent;
        if !(target > 0.0 && target <= 100.0) {
            return Err(ConfigError::InvalidValue(format!(
                "autoscaling.target_utilization_percent must be in (0, 100], got {target}"
            )));
        }
        if self.evaluation_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "autoscaling.evaluation_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn target_fraction(&self) -> f64 {
        self.target_utilization_percent / 100.0
    }
}

/// Scaling state of one pool. Invariant: `min_count <= desired_count <= max_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolState {
    pub desired_count: u32,
    pub min_count: u32,
    pub max_count: u32,
    pub current_utilization: f64,
    pub last_scale_in: Option<Instant>,
    pub last_scale_out: Option<Instant>,
}

impl WorkerPoolState {
    /// Fresh state at the minimum size, with no scaling history.
    pub fn new(config: &ScalingConfig) -> Self {
        Self::with_desired(config, config.min_tasks)
    }

    /// State starting at `desired`, clamped into the configured bounds.
    pub fn with_desired(config: &ScalingConfig, desired: u32) -> Self {
        Self {
            desired_count: desired.clamp(config.min_tasks, config.max_tasks),
            min_count: config.min_tasks,
            max_count: config.max_tasks,
            current_utilization: 0.0,
            last_scale_in: None,
            last_scale_out: None,
        }
    }

    /// Record a decision. Only `ScaleOut`/`ScaleIn` change the count.
    pub fn apply(&mut self, decision: &ScalingDecision, utilization: f64, now: Instant) {
        self.current_utilization = utilization;
        match *decision {
            ScalingDecision::ScaleOut { to, .. } => {
                self.desired_count = to;
                self.last_scale_out = Some(now);
            }
            ScalingDecision::ScaleIn { to, .. } => {
                self.desired_count = to;
                self.last_scale_in = Some(now);
            }
            ScalingDecision::NoChange { .. } | ScalingDecision::Suppressed { .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    In,
    Out,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::In => f.write_str("in"),
            ScaleDirection::Out => f.write_str("out"),
        }
    }
}

/// Result of one evaluation. At most one direction per evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    NoChange {
        desired: u32,
    },
    ScaleOut {
        from: u32,
        to: u32,
    },
    ScaleIn {
        from: u32,
        to: u32,
    },
    /// A change was warranted but the cooldown for that direction has not
    /// elapsed yet.
    Suppressed {
        direction: ScaleDirection,
        proposed: u32,
        remaining: Duration,
    },
}

impl ScalingDecision {
    pub fn label(&self) -> &'static str {
        match self {
            ScalingDecision::NoChange { .. } => "no_change",
            ScalingDecision::ScaleOut { .. } => "scale_out",
            ScalingDecision::ScaleIn { .. } => "scale_in",
            ScalingDecision::Suppressed { .. } => "suppressed",
        }
    }
}

/// Desired count for `utilization` (a fraction) before cooldowns:
/// `clamp(round(current * utilization / target), min, max)`.
pub fn proposed_count(state: &WorkerPoolState, config: &ScalingConfig, utilization: f64) -> u32 {
    let raw = (state.desired_count as f64 * utilization / config.target_fraction()).round();
    // `raw` is finite and non-negative here; the cast saturates at u32::MAX.
    (raw as u32).clamp(state.min_count, state.max_count)
}

/// Decide what the pool size should be. Does not touch `state`.
pub fn evaluate(
    state: &WorkerPoolState,
    config: &ScalingConfig,
    utilization: f64,
    now: Instant,
) -> Result<ScalingDecision, ScalingError> {
    if !utilization.is_finite() || utilization < 0.0 {
        return Err(ScalingError::InvalidSample(utilization));
    }

    let current = state.desired_count;
    let proposed = proposed_count(state, config, utilization);
    if proposed == current {
        return Ok(ScalingDecision::NoChange { desired: current });
    }

    let (direction, last, cooldown) = if proposed > current {
        (
            ScaleDirection::Out,
            state.last_scale_out,
            Duration::from_millis(config.scale_out_cooldown_ms),
        )
    } else {
        (
            ScaleDirection::In,
            state.last_scale_in,
            Duration::from_millis(config.scale_in_cooldown_ms),
        )
    };

    if let Some(last) = last {
        let elapsed = now.saturating_duration_since(last);
        if elapsed < cooldown {
            return Ok(ScalingDecision::Suppressed {
                direction,
                proposed,
                remaining: cooldown - elapsed,
            });
        }
    }

    Ok(match direction {
        ScaleDirection::Out => ScalingDecision::ScaleOut {
            from: current,
            to: proposed,
        },
        ScaleDirection::In => ScalingDecision::ScaleIn {
            from: current,
            to: proposed,
        },
    })
}

/// The control loop for one pool.
pub struct Autoscaler {
    pool: String,
    config: ScalingConfig,
    state: WorkerPoolState,
    source: Arc<dyn UtilizationSource>,
    desired_tx: watch::Sender<u32>,
    metrics: Metrics,
}

impl Autoscaler {
    /// Create the loop and the channel the pool listens on. The channel
    /// starts at `state.desired_count`.
    pub fn new(
        pool: impl Into<String>,
        config: ScalingConfig,
        state: WorkerPoolState,
        source: Arc<dyn UtilizationSource>,
    ) -> (Self, watch::Receiver<u32>) {
        let (desired_tx, desired_rx) = watch::channel(state.desired_count);
        let autoscaler = Self {
            pool: pool.into(),
            config,
            state,
            source,
            desired_tx,
            metrics: Metrics::new(),
        };
        (autoscaler, desired_rx)
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> &WorkerPoolState {
        &self.state
    }

    /// Sample, evaluate, apply, publish. On error nothing changes.
    #[tracing::instrument(skip(self), fields(pool = %self.pool))]
    pub fn evaluate_once(&mut self, now: Instant) -> Result<ScalingDecision, ScalingError> {
        let utilization = self.source.sample()?;
        let decision = evaluate(&self.state, &self.config, utilization, now)?;

        let changes = matches!(
            decision,
            ScalingDecision::ScaleOut { .. } | ScalingDecision::ScaleIn { .. }
        );
        if changes && self.desired_tx.is_closed() {
            return Err(ScalingError::ReceiverClosed);
        }

        self.state.apply(&decision, utilization, now);
        if changes {
            self.desired_tx.send_replace(self.state.desired_count);
            info!(
                utilization,
                desired = self.state.desired_count,
                decision = decision.label(),
                "scaling decision applied"
            );
        } else {
            debug!(utilization, ?decision, "scaling evaluated");
        }

        self.metrics
            .record_scaling_decision(&self.pool, decision.label());
        self.metrics
            .set_desired_count(&self.pool, self.state.desired_count as u64);
        Ok(decision)
    }

    /// Evaluate every `evaluation_interval_ms` until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.evaluation_interval_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(pool = %self.pool, desired = self.state.desired_count, "autoscaler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_once(Instant::now()) {
                        // Retried on the next tick.
                        warn!(pool = %self.pool, error = %e, "scaling evaluation failed");
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        info!(pool = %self.pool, "autoscaler stopped");
    }
}
