use std::path::PathBuf;
use thiserror::Error;

use dataset::DatasetError;
use model::ModelError;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Invalid model configuration: {0}")]
    Model(#[from] ModelError),

    #[error("Failed to load training data: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid learning rate schedule: {0}")]
    Schedule(String),

    #[error("Prediction is {prediction:?} but the ground truth is {truth:?}.")]
    MetricSize {
        prediction: (u32, u32),
        truth: (u32, u32),
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("{0:?} does not follow the model_{{timestamp}}.bin naming convention.")]
    NamingConvention(PathBuf),

    #[error("File IO error: {0}")]
    File(#[from] std::io::Error),

    #[error("Failed to record model weights: {0}")]
    Record(String),

    #[error("Failed to read model settings {path:?}: {reason}")]
    Settings { path: PathBuf, reason: String },

    #[error("Stored model settings are invalid: {0}")]
    Model(#[from] ModelError),
}
