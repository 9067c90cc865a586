use thiserror::Error;

use dataset::{DatasetError, TilingError};
use model::ModelError;
use train::{CheckpointError, TrainError};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load dataset: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Failed to tile image: {0}")]
    Tiling(#[from] TilingError),

    #[error("Invalid model: {0}")]
    Model(#[from] ModelError),

    #[error("Training failed: {0}")]
    Train(#[from] TrainError),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("File IO error: {0}")]
    File(#[from] std::io::Error),
}
