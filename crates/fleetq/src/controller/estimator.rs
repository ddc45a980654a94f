use std::collections::VecDeque;

use crate::controller::config::{ScalingConfig, ScalingPolicyKind};

/// Turns backlog samples observed by the controller into the number of jobs that the fleet
/// should be sized for.
pub trait BacklogEstimator {
    fn estimate(&mut self, sample: u64) -> u64;
}

/// Uses the last observed sample as is.
#[derive(Debug, Default)]
pub struct ReactiveEstimator;

impl BacklogEstimator for ReactiveEstimator {
    fn estimate(&mut self, sample: u64) -> u64 {
        sample
    }
}

/// Averages the last `window` samples, rounding up.
#[derive(Debug)]
pub struct SmoothedEstimator {
    samples: VecDeque<u64>,
    window: usize,
}

impl SmoothedEstimator {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }
}

impl BacklogEstimator for SmoothedEstimator {
    fn estimate(&mut self, sample: u64) -> u64 {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        let sum: u64 = self.samples.iter().sum();
        sum.div_ceil(self.samples.len() as u64)
    }
}

pub fn create_estimator(config: &ScalingConfig) -> Box<dyn BacklogEstimator> {
    match config.policy {
        ScalingPolicyKind::Reactive => Box::new(ReactiveEstimator),
        ScalingPolicyKind::Smoothed => Box::new(SmoothedEstimator::new(config.smoothing_window)),
    }
}

#[cfg(test)]
mod tests {
    use super::{BacklogEstimator, ReactiveEstimator, SmoothedEstimator};

    #[test]
    fn reactive_follows_samples() {
        let mut estimator = ReactiveEstimator;
        assert_eq!(estimator.estimate(3), 3);
        assert_eq!(estimator.estimate(0), 0);
    }

    #[test]
    fn smoothed_dampens_spikes() {
        let mut estimator = SmoothedEstimator::new(3);
        assert_eq!(estimator.estimate(0), 0);
        assert_eq!(estimator.estimate(9), 5);
        assert_eq!(estimator.estimate(0), 3);
        // The first sample falls out of the window
        assert_eq!(estimator.estimate(0), 3);
        assert_eq!(estimator.estimate(0), 0);
    }

    #[test]
    fn smoothed_window_of_one_is_reactive() {
        let mut estimator = SmoothedEstimator::new(0);
        assert_eq!(estimator.estimate(4), 4);
        assert_eq!(estimator.estimate(1), 1);
    }
}
