use burn::prelude::Config;

#[derive(Config, Debug)]
pub struct PipelineConfig {
    /// Random seed.
    #[config(default = 42)]
    pub seed: u64,

    /// Location to put model artifacts. By default uses the cwd.
    ///
    /// This path can be set to be relative to the CWD.
    #[config(default = "String::from('.')")]
    pub export_path: String,

    #[config(default = "String::from(\"train\")")]
    pub train_split: String,

    #[config(default = "String::from(\"validation\")")]
    pub valid_split: String,

    /// Tiles per forward pass during inference.
    #[config(default = 8)]
    pub infer_batch_size: usize,

    /// Probability at or above which a pixel counts as foreground for metrics.
    #[config(default = 0.5)]
    pub metric_threshold: f32,

    /// Prediction values at or below this are dropped from the heatmap.
    #[config(default = 127)]
    pub heatmap_threshold: u8,

    #[config(default = "String::from(\"heatmaps\")")]
    pub heatmap_dir: String,

    #[config(default = "String::from(\"overlays\")")]
    pub overlay_dir: String,

    /// Whether training runs on a GPU. Only affects the batch size estimate.
    #[config(default = false)]
    pub gpu: bool,
}
