use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_fn_stream::TryStreamEmitter;
use async_trait::async_trait;
use burn::config::Config;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use tokio_util::sync::CancellationToken;

use dataset::filesystem::{sliced_masks_dir, IMAGES_DIR, SLICED_IMAGES_DIR};
use dataset::slicer::split_statistics;
use dataset::{
    AugmentConfig, Augmenter, DatasetError, Filesystem, Normalization, PreprocessConfig, TileDataset, TileLoader,
};
use model::{ModelConfig, SegmentationModel};
use train::batch_size::{estimate_batch_size, ComputeDevice};
use train::checkpoint::{save_checkpoint, timestamp_ms, ModelMetadata};
use train::config::{OptimizerKind, TrainConfig};
use train::train::{adam_optimizer, sgd_optimizer, EpochOutcome, SegTrainer};

use crate::config::PipelineConfig;
use crate::message::PipelineMessage;
use crate::pipeline_stream::PipelineStream;
use crate::slice_stream::NORMALIZATION_FILE;

/// Trains a network on the sliced tiles of a dataset and checkpoints it.
pub struct TrainStream<B: AutodiffBackend> {
    root: PathBuf,
    preprocess: PreprocessConfig,
    model_config: ModelConfig,
    train_config: TrainConfig,
    augment_config: AugmentConfig,
    pipeline_config: PipelineConfig,
    cancel: CancellationToken,
    device: B::Device,
    last_timestamp: u64,
}

impl<B: AutodiffBackend> TrainStream<B> {
    pub fn new(root: PathBuf, cancel: CancellationToken, device: B::Device) -> Self {
        Self {
            root,
            preprocess: PreprocessConfig::new(),
            model_config: ModelConfig::new(),
            train_config: TrainConfig::new(),
            augment_config: AugmentConfig::new(),
            pipeline_config: PipelineConfig::new(),
            cancel,
            device,
            last_timestamp: 0,
        }
    }

    pub fn with_preprocess(mut self, config: PreprocessConfig) -> Self {
        self.preprocess = config;
        self
    }

    pub fn with_model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = config;
        self
    }

    pub fn with_train_config(mut self, config: TrainConfig) -> Self {
        self.train_config = config;
        self
    }

    pub fn with_augment_config(mut self, config: AugmentConfig) -> Self {
        self.augment_config = config;
        self
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }

    async fn load_split(&self, split: &str, norm: &Normalization) -> anyhow::Result<TileDataset> {
        let split_dir = Filesystem::new(self.root.clone()).split(split);
        let mask_dirs = (0..self.preprocess.num_classes.max(1))
            .map(|class| split_dir.join(sliced_masks_dir(class)))
            .collect();
        TileDataset::load_dir(split_dir.join(SLICED_IMAGES_DIR), mask_dirs, norm.clone())
            .await
            .with_context(|| format!("Failed to load {split} tiles"))
    }

    /// Statistics saved by the slicing step, or freshly computed from the raw training images.
    fn normalization(&self) -> anyhow::Result<Normalization> {
        let path = self.root.join(NORMALIZATION_FILE);
        if let Ok(norm) = Normalization::load(&path) {
            return Ok(norm);
        }
        log::warn!("No statistics at {path:?}, computing them from the training images.");
        let pairs = Filesystem::new(self.root.clone()).pairs(
            &self.pipeline_config.train_split,
            IMAGES_DIR,
            dataset::filesystem::masks_dir,
            self.preprocess.num_classes.max(1),
            false,
        )?;
        Ok(split_statistics(&pairs, &self.preprocess)?)
    }

    fn save(&mut self, model: &SegmentationModel<B>, metadata: &ModelMetadata) -> anyhow::Result<PathBuf> {
        // Keep artifact names unique when two saves land in the same millisecond.
        let created = timestamp_ms().max(self.last_timestamp + 1);
        self.last_timestamp = created;
        let mut metadata = metadata.clone();
        metadata.created_ms = created;
        let dir = Path::new(&self.pipeline_config.export_path);
        Ok(save_checkpoint(model, &metadata, dir)?)
    }

    /// Runs epochs until the stopping policy or the cancellation token ends training.
    /// Always leaves a final checkpoint behind.
    async fn fit<O>(
        &mut self,
        emitter: &TryStreamEmitter<PipelineMessage, anyhow::Error>,
        mut model: SegmentationModel<B>,
        optim: O,
        mut train: TileLoader,
        mut valid: TileLoader,
        metadata: ModelMetadata,
    ) -> anyhow::Result<()>
    where
        O: Optimizer<SegmentationModel<B>, B>,
    {
        let mut trainer = SegTrainer::<B, O>::new(&self.train_config, optim, self.device.clone())?;
        let checkpoint_every = self.train_config.checkpoint_every;

        log::info!("Start training loop.");
        let mut epoch = 1;
        loop {
            if self.cancel.is_cancelled() {
                let path = self.save(&model, &metadata)?;
                emitter.emit(PipelineMessage::Checkpoint { path }).await;
                emitter.emit(PipelineMessage::Cancelled).await;
                return Ok(());
            }

            let (next, outcome) = trainer.run_epoch(epoch, model, &mut train, &mut valid, &self.cancel);
            model = next;

            match outcome {
                EpochOutcome::Cancelled => continue,
                EpochOutcome::Completed { report, stop } => {
                    emitter.emit(PipelineMessage::Epoch(report)).await;

                    if let Some(reason) = stop {
                        let path = self.save(&model, &metadata)?;
                        emitter.emit(PipelineMessage::Checkpoint { path }).await;
                        emitter.emit(PipelineMessage::Stopped { reason }).await;
                        emitter.emit(PipelineMessage::Finished).await;
                        return Ok(());
                    }
                    if checkpoint_every > 0 && epoch % checkpoint_every == 0 {
                        let path = self.save(&model, &metadata)?;
                        emitter.emit(PipelineMessage::Checkpoint { path }).await;
                    }
                }
            }
            epoch += 1;
        }
    }
}

#[async_trait]
impl<B: AutodiffBackend> PipelineStream for TrainStream<B> {
    async fn run(&mut self, emitter: TryStreamEmitter<PipelineMessage, anyhow::Error>) -> anyhow::Result<()> {
        let pipeline_config = self.pipeline_config.clone();
        let train_config = self.train_config.clone();

        let norm = self.normalization()?;
        let train_set = self.load_split(&pipeline_config.train_split, &norm).await?;
        if train_set.is_empty() {
            return Err(DatasetError::NoTrainingData(format!(
                "no sliced tiles for split {}",
                pipeline_config.train_split
            ))
            .into());
        }
        let train_set = Arc::new(train_set);
        let valid_set = match self.load_split(&pipeline_config.valid_split, &norm).await? {
            set if set.is_empty() => {
                log::warn!("Validation split is empty, validating on the training tiles.");
                train_set.clone()
            }
            set => Arc::new(set),
        };

        let model_config = self
            .model_config
            .clone()
            .with_in_channels(self.preprocess.channels())
            .with_num_classes(self.preprocess.num_classes.max(1));

        log::info!("Using seed {}", pipeline_config.seed);
        B::seed(pipeline_config.seed);

        let tile = train_set.tile_size().x as usize;
        let batch_size = match train_config.batch_size {
            Some(size) => size.max(1),
            None => estimate_batch_size(
                &model_config,
                tile,
                train_config.available_memory,
                if pipeline_config.gpu { ComputeDevice::Gpu } else { ComputeDevice::Cpu },
                train_config.half_precision,
            ),
        };
        log::info!(
            "Training on {} tiles, validating on {}, batch size {batch_size}",
            train_set.len(),
            valid_set.len()
        );

        let augmenter = self
            .augment_config
            .enabled
            .then(|| Augmenter::new(self.augment_config.clone(), pipeline_config.seed));
        let train = TileLoader::new(train_set, batch_size, pipeline_config.seed).with_augmenter(augmenter);
        let valid = TileLoader::new(valid_set, batch_size, pipeline_config.seed).with_shuffle(false);

        let model = model_config.init::<B>(&self.device)?;
        let metadata = ModelMetadata::new(
            model_config,
            norm,
            self.preprocess.slice_size,
            self.preprocess.greyscale,
            self.preprocess.down_sample,
            0,
        )
        .with_border_padding(self.preprocess.border_padding);

        match train_config.optimizer {
            OptimizerKind::Sgd => {
                let optim = sgd_optimizer::<B>(&train_config);
                self.fit(&emitter, model, optim, train, valid, metadata).await
            }
            OptimizerKind::Adam => {
                let optim = adam_optimizer::<B>(&train_config);
                self.fit(&emitter, model, optim, train, valid, metadata).await
            }
        }
    }
}
