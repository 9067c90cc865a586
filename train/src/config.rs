use burn::prelude::Config;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// SGD with momentum and weight decay tied to the learning rate.
    Sgd,
    Adam,
}

/// How the learning rate evolves after every epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LrScheduleConfig {
    Constant,
    /// Multiply by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f64 },
    /// Multiply by `gamma` every epoch.
    Exponential { gamma: f64 },
    /// Multiply by `factor` once the training loss stalls for more than `patience` epochs.
    Plateau {
        patience: usize,
        factor: f64,
        min_lr: f64,
    },
}

#[derive(Config, Debug)]
pub struct StoppingConfig {
    /// Stop after this many epochs. 0 disables the limit.
    #[config(default = 100)]
    pub max_iterations: usize,

    /// Stop after this many epochs without a lower validation loss. 0 disables the check.
    #[config(default = 0)]
    pub patience: usize,

    /// Wall clock limit in minutes. 0 disables the limit.
    #[config(default = 0.0)]
    pub max_minutes: f64,

    /// Stop once the validation loss is at or below this value. 0 disables the check.
    #[config(default = 0.0)]
    pub target_loss: f32,
}

#[derive(Config, Debug)]
pub struct TrainConfig {
    #[config(default = "OptimizerKind::Sgd")]
    pub optimizer: OptimizerKind,

    /// Start learning rate.
    #[config(default = 0.05)]
    pub lr: f64,

    /// SGD momentum.
    #[config(default = 0.9)]
    pub momentum: f64,

    /// Weight decay as a fraction of the start learning rate.
    #[config(default = 0.1)]
    pub weight_decay_ratio: f64,

    #[config(default = "LrScheduleConfig::Step { step_size: 15, gamma: 0.75 }")]
    pub schedule: LrScheduleConfig,

    #[config(default = "StoppingConfig::new()")]
    pub stopping: StoppingConfig,

    /// Save a checkpoint every this many epochs. 0 only saves at the end.
    #[config(default = 0)]
    pub checkpoint_every: usize,

    /// Tiles per batch. Estimated from the available memory when not set.
    pub batch_size: Option<usize>,

    /// Memory budget for the batch size estimate, in bytes.
    #[config(default = 4294967296)]
    pub available_memory: u64,

    /// Train in half precision. Only affects the batch size estimate.
    #[config(default = false)]
    pub half_precision: bool,

    #[config(default = 42)]
    pub seed: u64,
}

impl TrainConfig {
    pub fn weight_decay(&self) -> f64 {
        self.lr * self.weight_decay_ratio
    }
}
