use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};

use dataset::Normalization;
use model::{ModelConfig, SegmentationModel};

use crate::error::CheckpointError;

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

const MODEL_PREFIX: &str = "model_";
const SETTINGS_PREFIX: &str = "settings_";

/// Everything needed to rebuild a trained network and feed it like during training.
#[derive(Config, Debug)]
pub struct ModelMetadata {
    pub model: ModelConfig,
    pub normalization: Normalization,
    pub slice_size: u32,
    pub greyscale: bool,
    pub down_sample: u32,
    /// Whether partial border tiles were padded during slicing. Inference slices the same way.
    #[config(default = true)]
    pub border_padding: bool,
    /// Creation time in unix milliseconds. Also names the artifact files.
    pub created_ms: u64,
}

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn model_path(dir: &Path, timestamp: u64) -> PathBuf {
    dir.join(format!("{MODEL_PREFIX}{timestamp}.bin"))
}

/// Settings sidecar of a `model_{timestamp}.bin` weights file.
pub fn metadata_path_for(model_path: &Path) -> Result<PathBuf> {
    let invalid = || CheckpointError::NamingConvention(model_path.to_path_buf());

    if model_path.extension().and_then(|e| e.to_str()) != Some("bin") {
        return Err(invalid());
    }
    let stem = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(invalid)?;
    let timestamp = stem.strip_prefix(MODEL_PREFIX).ok_or_else(invalid)?;
    if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(model_path.with_file_name(format!("{SETTINGS_PREFIX}{timestamp}.json")))
}

/// Writes the weights and the settings sidecar into `dir`, returning the weights path.
pub fn save_checkpoint<B: Backend>(
    model: &SegmentationModel<B>,
    metadata: &ModelMetadata,
    dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = model_path(dir, metadata.created_ms);

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path.clone(), &recorder)
        .map_err(|e| CheckpointError::Record(format!("{e:?}")))?;
    metadata.save(metadata_path_for(&path)?)?;

    log::info!("Saved model to {}", path.display());
    Ok(path)
}

/// Rebuilds the network from the sidecar next to `model_path` and loads its weights.
pub fn load_checkpoint<B: Backend>(
    model_path: &Path,
    device: &B::Device,
) -> Result<(SegmentationModel<B>, ModelMetadata)> {
    let settings = metadata_path_for(model_path)?;
    let metadata = ModelMetadata::load(&settings).map_err(|e| CheckpointError::Settings {
        path: settings.clone(),
        reason: format!("{e:?}"),
    })?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = metadata
        .model
        .init::<B>(device)?
        .load_file(model_path.to_path_buf(), &recorder, device)
        .map_err(|e| CheckpointError::Record(format!("{e:?}")))?;
    Ok((model, metadata))
}
