use serde::{Deserialize, Serialize};

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Summary of one finished epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub learning_rate: f64,
}

impl LossReport {
    /// Losses are kept to 5 decimals, the learning rate to 8.
    pub fn new(epoch: usize, train_loss: f32, val_loss: f32, learning_rate: f64) -> Self {
        Self {
            epoch,
            train_loss: round_to(train_loss as f64, 5) as f32,
            val_loss: round_to(val_loss as f64, 5) as f32,
            learning_rate: round_to(learning_rate, 8),
        }
    }
}
