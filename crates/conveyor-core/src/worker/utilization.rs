use std::sync::Mutex;

use crate::autoscale::UtilizationSource;
use crate::error::ScalingError;

/// Exponentially smoothed busy ratio of a worker pool.
///
/// The pool feeds it one raw sample (busy ÷ running) per sampling interval;
/// the autoscaler reads the smoothed value.
#[derive(Debug)]
pub struct UtilizationTracker {
    smoothing: f64,
    current: Mutex<Option<f64>>,
}

impl UtilizationTracker {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            current: Mutex::new(None),
        }
    }

    /// Fold a raw sample into the smoothed value and return it.
    pub fn record(&self, sample: f64) -> f64 {
        let sample = sample.clamp(0.0, 1.0);
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match *current {
            None => sample,
            Some(prev) => self.smoothing * sample + (1.0 - self.smoothing) * prev,
        };
        *current = Some(next);
        next
    }

    pub fn current(&self) -> Option<f64> {
        match self.current.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl UtilizationSource for UtilizationTracker {
    fn sample(&self) -> Result<f64, ScalingError> {
        self.current().ok_or(ScalingError::NoSamples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_taken_verbatim() {
        let tracker = UtilizationTracker::new(0.5);
        assert!(matches!(tracker.sample(), Err(ScalingError::NoSamples)));
        assert_eq!(tracker.record(0.8), 0.8);
        assert_eq!(tracker.sample().unwrap(), 0.8);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let tracker = UtilizationTracker::new(0.5);
        tracker.record(1.0);
        let smoothed = tracker.record(0.0);
        assert!((smoothed - 0.5).abs() < 1e-9);
        let smoothed = tracker.record(0.0);
        assert!((smoothed - 0.25).abs() < 1e-9);
    }

    #[test]
    fn samples_are_clamped_to_unit_range() {
        let tracker = UtilizationTracker::new(1.0);
        assert_eq!(tracker.record(3.0), 1.0);
        assert_eq!(tracker.record(-1.0), 0.0);
    }
}
