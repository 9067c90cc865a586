use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum TilingError {
    #[error("Tile size must be greater than zero.")]
    ZeroTileSize,

    #[error("Expected {expected} tiles for the grid, got {actual}.")]
    TileCount { expected: usize, actual: usize },

    #[error("Tile {index} is {actual:?}, expected {expected:?}.")]
    TileSize {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Tile {index} has pixel layout {actual:?}, expected {expected:?}.")]
    TileColor {
        index: usize,
        expected: image::ColorType,
        actual: image::ColorType,
    },
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Tiling failed: {0}")]
    Tiling(#[from] TilingError),

    #[error("File IO error: {0}")]
    File(#[from] std::io::Error),

    #[error("Image error: {0}")]
    InvalidImage(#[from] image::ImageError),

    #[error("No training data: {0}")]
    NoTrainingData(String),

    #[error("Image {0} has no matching mask.")]
    MissingMask(String),

    #[error("Found {images} images but {masks} masks in {dir:?}.")]
    PairCount {
        dir: PathBuf,
        images: usize,
        masks: usize,
    },

    #[error("Image {id} is {image:?} but its mask is {mask:?}.")]
    MaskSize {
        id: String,
        image: (u32, u32),
        mask: (u32, u32),
    },

    #[error("Expected {expected} channels of normalization statistics, got {actual}.")]
    Channels { expected: usize, actual: usize },

    #[error("Loader task failed: {0}")]
    Task(String),
}
