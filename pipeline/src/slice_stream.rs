use std::path::PathBuf;

use anyhow::Context;
use async_fn_stream::TryStreamEmitter;
use async_trait::async_trait;
use burn::config::Config;
use tokio_util::sync::CancellationToken;

use dataset::filesystem::{masks_dir, IMAGES_DIR};
use dataset::slicer::{slice_pair, split_statistics, SliceOutcome};
use dataset::{DatasetError, Filesystem, PreprocessConfig};

use crate::config::PipelineConfig;
use crate::message::{percent, PipelineMessage};
use crate::pipeline_stream::PipelineStream;

pub const NORMALIZATION_FILE: &str = "normalization.json";

/// Cuts the train and validation images of a dataset into network sized tiles and
/// stores the training image statistics next to them.
pub struct SliceStream {
    root: PathBuf,
    preprocess: PreprocessConfig,
    pipeline_config: PipelineConfig,
    cancel: CancellationToken,
}

impl SliceStream {
    pub fn new(root: PathBuf, preprocess: PreprocessConfig, cancel: CancellationToken) -> Self {
        Self {
            root,
            preprocess,
            pipeline_config: PipelineConfig::new(),
            cancel,
        }
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }
}

#[async_trait]
impl PipelineStream for SliceStream {
    async fn run(&mut self, emitter: TryStreamEmitter<PipelineMessage, anyhow::Error>) -> anyhow::Result<()> {
        let fs = Filesystem::new(self.root.clone());
        let config = self.preprocess.clone();
        let classes = config.num_classes.max(1);

        let train_split = self.pipeline_config.train_split.clone();
        let valid_split = self.pipeline_config.valid_split.clone();
        let train = fs.pairs(&train_split, IMAGES_DIR, masks_dir, classes, true)?;
        let valid = fs.pairs(&valid_split, IMAGES_DIR, masks_dir, classes, true)?;
        if train.is_empty() {
            return Err(DatasetError::NoTrainingData(format!(
                "no images in {:?}",
                fs.split(&train_split).join(IMAGES_DIR)
            ))
            .into());
        }

        let stats_pairs = train.clone();
        let stats_config = config.clone();
        let normalization = tokio::task::spawn_blocking(move || split_statistics(&stats_pairs, &stats_config))
            .await
            .context("Statistics task panicked.")??;
        log::info!(
            "Training images have mean {:?} and std {:?}",
            normalization.mean,
            normalization.std
        );
        normalization
            .save(self.root.join(NORMALIZATION_FILE))
            .context("Failed to save normalization statistics.")?;

        let jobs = train
            .into_iter()
            .map(|pair| (pair, train_split.clone(), config.train_only_features))
            .chain(valid.into_iter().map(|pair| (pair, valid_split.clone(), false)))
            .collect::<Vec<_>>();
        let total = jobs.len();
        let mut outcome = SliceOutcome::default();

        for (index, (pair, split, skip_background)) in jobs.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                emitter.emit(PipelineMessage::Cancelled).await;
                return Ok(());
            }

            let split_dir = fs.split(&split);
            let config = config.clone();
            let id = pair.id.clone();
            let sliced = tokio::task::spawn_blocking(move || slice_pair(&pair, &config, &split_dir, skip_background))
                .await
                .context("Slicing task panicked.")?
                .with_context(|| format!("Failed to slice image {id}"))?;

            outcome.written += sliced.written;
            outcome.skipped += sliced.skipped;
            emitter
                .emit(PipelineMessage::SliceProgress {
                    percent: percent(index, total),
                })
                .await;
        }

        log::info!(
            "Sliced {total} images into {} tiles, skipped {} background tiles",
            outcome.written,
            outcome.skipped
        );
        emitter.emit(PipelineMessage::Finished).await;
        Ok(())
    }
}
