pub mod augment;
pub mod config;
pub mod convert;
pub mod error;
pub mod filesystem;
pub mod loader;
pub mod slicer;
pub mod tiling;

pub use augment::{Augmenter, EpochSample};
pub use config::{AugmentConfig, AugmentMode, PreprocessConfig};
pub use convert::Normalization;
pub use error::{DatasetError, Result, TilingError};
pub use filesystem::{Filesystem, ImagePair};
pub use loader::{SegBatch, TileDataset, TileLoader};
pub use tiling::TileGrid;
