use burn::lr_scheduler::exponential::{ExponentialLrScheduler, ExponentialLrSchedulerConfig};
use burn::lr_scheduler::LrScheduler;

use crate::config::LrScheduleConfig;
use crate::error::{Result, TrainError};

/// Relative improvement the plateau schedule needs to reset its patience.
const PLATEAU_THRESHOLD: f64 = 1e-4;

/// Epoch-level learning rate schedule.
pub enum LrSchedule {
    Constant {
        lr: f64,
    },
    Step {
        initial: f64,
        step_size: usize,
        gamma: f64,
        epochs: usize,
        lr: f64,
    },
    Exponential {
        scheduler: ExponentialLrScheduler,
        lr: f64,
    },
    Plateau {
        lr: f64,
        patience: usize,
        factor: f64,
        min_lr: f64,
        best: f64,
        bad_epochs: usize,
    },
}

impl LrSchedule {
    pub fn new(config: &LrScheduleConfig, lr: f64) -> Result<Self> {
        Ok(match *config {
            LrScheduleConfig::Constant => Self::Constant { lr },
            LrScheduleConfig::Step { step_size, gamma } => Self::Step {
                initial: lr,
                step_size: step_size.max(1),
                gamma,
                epochs: 0,
                lr,
            },
            LrScheduleConfig::Exponential { gamma } => {
                let mut scheduler = ExponentialLrSchedulerConfig::new(lr, gamma)
                    .init()
                    .map_err(|e| TrainError::Schedule(format!("{e:?}")))?;
                // The first step yields the start rate.
                let lr = scheduler.step();
                Self::Exponential { scheduler, lr }
            }
            LrScheduleConfig::Plateau {
                patience,
                factor,
                min_lr,
            } => Self::Plateau {
                lr,
                patience,
                factor,
                min_lr,
                best: f64::MAX,
                bad_epochs: 0,
            },
        })
    }

    /// Learning rate for the next epoch.
    pub fn lr(&self) -> f64 {
        match self {
            Self::Constant { lr }
            | Self::Step { lr, .. }
            | Self::Exponential { lr, .. }
            | Self::Plateau { lr, .. } => *lr,
        }
    }

    /// Advances one epoch. Only the plateau schedule looks at the training loss.
    pub fn step(&mut self, train_loss: f64) -> f64 {
        match self {
            Self::Constant { .. } => {}
            Self::Step {
                initial,
                step_size,
                gamma,
                epochs,
                lr,
            } => {
                *epochs += 1;
                *lr = *initial * gamma.powi((*epochs / *step_size) as i32);
            }
            Self::Exponential { scheduler, lr } => *lr = scheduler.step(),
            Self::Plateau {
                lr,
                patience,
                factor,
                min_lr,
                best,
                bad_epochs,
            } => {
                if train_loss < *best * (1.0 - PLATEAU_THRESHOLD) {
                    *best = train_loss;
                    *bad_epochs = 0;
                } else {
                    *bad_epochs += 1;
                }
                if *bad_epochs > *patience {
                    let reduced = (*lr * *factor).max(*min_lr);
                    if reduced < *lr {
                        log::info!("Reducing learning rate to {reduced:.8}");
                    }
                    *lr = reduced;
                    *bad_epochs = 0;
                }
            }
        }
        self.lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decays_every_step_size_epochs() {
        let config = LrScheduleConfig::Step {
            step_size: 2,
            gamma: 0.5,
        };
        let mut schedule = LrSchedule::new(&config, 1.0).unwrap();
        let rates = (0..5).map(|_| schedule.step(0.0)).collect::<Vec<_>>();
        assert_eq!(rates, vec![1.0, 0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn exponential_starts_at_initial_rate() {
        let config = LrScheduleConfig::Exponential { gamma: 0.5 };
        let mut schedule = LrSchedule::new(&config, 0.1).unwrap();
        assert!((schedule.lr() - 0.1).abs() < 1e-12);
        assert!((schedule.step(0.0) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn plateau_reduces_on_stalled_loss() {
        let config = LrScheduleConfig::Plateau {
            patience: 1,
            factor: 0.5,
            min_lr: 0.3,
        };
        let mut schedule = LrSchedule::new(&config, 1.0).unwrap();
        assert_eq!(schedule.step(1.0), 1.0);
        assert_eq!(schedule.step(1.0), 1.0);
        assert_eq!(schedule.step(1.0), 0.5);
        assert_eq!(schedule.step(0.5), 0.5);
        assert_eq!(schedule.step(0.5), 0.5);
        assert_eq!(schedule.step(0.5), 0.3);
    }

    #[test]
    fn constant_ignores_loss() {
        let mut schedule = LrSchedule::new(&LrScheduleConfig::Constant, 0.01).unwrap();
        assert_eq!(schedule.step(10.0), 0.01);
    }
}
