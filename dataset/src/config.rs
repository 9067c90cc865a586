use burn::prelude::Config;
use serde::{Deserialize, Serialize};

#[derive(Config, Debug)]
pub struct PreprocessConfig {
    /// Convert images to a single grey channel before slicing.
    #[config(default = true)]
    pub greyscale: bool,

    /// Number of times images are halved before slicing.
    #[config(default = 1)]
    pub down_sample: u32,

    /// Pad partial border tiles instead of dropping them.
    #[config(default = true)]
    pub border_padding: bool,

    /// Only keep training tiles that contain at least one foreground pixel.
    #[config(default = false)]
    pub train_only_features: bool,

    /// Edge length of the square tiles fed to the network.
    #[config(default = 96)]
    pub slice_size: u32,

    /// Number of feature classes, one mask folder per class.
    #[config(default = 1)]
    pub num_classes: usize,
}

impl PreprocessConfig {
    pub fn channels(&self) -> usize {
        if self.greyscale { 1 } else { 3 }
    }
}

/// How augmented samples are mixed into an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AugmentMode {
    /// Every sample is seen once per epoch and augmented on the fly.
    Standard,
    /// Every sample is repeated `copies` extra times, each augmented independently.
    Duplication,
    /// Only samples that contain foreground get extra augmented copies.
    FeatureAware,
}

#[derive(Config, Debug)]
pub struct AugmentConfig {
    #[config(default = false)]
    pub enabled: bool,

    #[config(default = "AugmentMode::Standard")]
    pub mode: AugmentMode,

    /// Extra copies per sample for the duplicating modes.
    #[config(default = 1)]
    pub copies: usize,

    #[config(default = 0.5)]
    pub horizontal_flip: f64,

    #[config(default = 0.5)]
    pub vertical_flip: f64,

    /// Max additive brightness shift, in normalized units.
    #[config(default = 0.1)]
    pub brightness: f32,

    /// Max relative contrast change.
    #[config(default = 0.1)]
    pub contrast: f32,

    /// Standard deviation of additive gaussian noise.
    #[config(default = 0.0)]
    pub noise: f64,
}
