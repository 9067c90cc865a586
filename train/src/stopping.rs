use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::StoppingConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    MaxIterations(usize),
    NoImprovement(usize),
    TimeLimit(f64),
    TargetReached(f32),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxIterations(n) => write!(f, "reached max iteration count ({n})"),
            StopReason::NoImprovement(n) => write!(f, "no improvement for {n} epochs"),
            StopReason::TimeLimit(minutes) => write!(f, "exceeded max training time ({minutes} minutes)"),
            StopReason::TargetReached(loss) => write!(f, "validation loss reached target ({loss})"),
        }
    }
}

/// Decides after every epoch whether training should end.
pub struct StopMonitor {
    config: StoppingConfig,
    best: f32,
    since_improvement: usize,
    start: Instant,
}

impl StopMonitor {
    pub fn new(config: StoppingConfig) -> Self {
        Self {
            config,
            best: f32::MAX,
            since_improvement: 0,
            start: Instant::now(),
        }
    }

    pub fn started_at(mut self, start: Instant) -> Self {
        self.start = start;
        self
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn elapsed_minutes(&self) -> f64 {
        self.start.elapsed().as_secs_f64() / 60.0
    }

    /// Records the validation loss of `epoch` (counted from 1). Limits are checked
    /// in a fixed order and the first one that triggers wins.
    pub fn update(&mut self, epoch: usize, val_loss: f32) -> Option<StopReason> {
        if val_loss < self.best {
            self.best = val_loss;
            self.since_improvement = 0;
        } else {
            self.since_improvement += 1;
        }

        let config = &self.config;
        if config.max_iterations > 0 && epoch >= config.max_iterations {
            return Some(StopReason::MaxIterations(config.max_iterations));
        }
        if config.patience > 0 && self.since_improvement >= config.patience {
            return Some(StopReason::NoImprovement(config.patience));
        }
        if config.max_minutes > 0.0 && self.elapsed_minutes() >= config.max_minutes {
            return Some(StopReason::TimeLimit(config.max_minutes));
        }
        if config.target_loss > 0.0 && val_loss <= config.target_loss {
            return Some(StopReason::TargetReached(config.target_loss));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn patience_triggers_before_max_iterations() {
        let config = StoppingConfig::new().with_max_iterations(5).with_patience(2);
        let mut monitor = StopMonitor::new(config);

        assert_eq!(monitor.update(1, 0.5), None);
        assert_eq!(monitor.update(2, 0.5), None);
        assert_eq!(monitor.update(3, 0.5), Some(StopReason::NoImprovement(2)));
    }

    #[test]
    fn only_strict_improvements_reset_patience() {
        let config = StoppingConfig::new().with_max_iterations(0).with_patience(3);
        let mut monitor = StopMonitor::new(config);
        for (epoch, loss) in [(1, 1.0), (2, 0.9), (3, 0.9), (4, 0.8), (5, 0.85), (6, 0.8)] {
            assert_eq!(monitor.update(epoch, loss), None);
        }
        assert_eq!(monitor.update(7, 0.8), Some(StopReason::NoImprovement(3)));
        assert_eq!(monitor.best(), 0.8);
    }

    #[test]
    fn max_iterations_wins_over_target() {
        let config = StoppingConfig::new().with_max_iterations(2).with_target_loss(0.1);
        let mut monitor = StopMonitor::new(config);
        assert_eq!(monitor.update(1, 0.2), None);
        assert_eq!(monitor.update(2, 0.05), Some(StopReason::MaxIterations(2)));

        let config = StoppingConfig::new().with_max_iterations(0).with_target_loss(0.1);
        let mut monitor = StopMonitor::new(config);
        assert_eq!(monitor.update(7, 0.1), Some(StopReason::TargetReached(0.1)));
    }

    #[test]
    fn time_limit() {
        let Some(start) = Instant::now().checked_sub(Duration::from_secs(120)) else {
            return;
        };
        let config = StoppingConfig::new().with_max_iterations(0).with_max_minutes(1.0);
        let mut monitor = StopMonitor::new(config).started_at(start);
        assert_eq!(monitor.update(1, 1.0), Some(StopReason::TimeLimit(1.0)));
    }
}
