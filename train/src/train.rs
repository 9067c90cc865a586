use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use tokio_util::sync::CancellationToken;
use tracing::trace_span;

use dataset::TileLoader;
use model::SegmentationModel;

use crate::config::{StoppingConfig, TrainConfig};
use crate::error::Result;
use crate::loss::combined_loss;
use crate::msg::LossReport;
use crate::schedule::LrSchedule;
use crate::stopping::{StopMonitor, StopReason};

/// SGD with the configured momentum and weight decay.
pub fn sgd_optimizer<B: AutodiffBackend>(config: &TrainConfig) -> impl Optimizer<SegmentationModel<B>, B> {
    let momentum = (config.momentum > 0.0).then(|| {
        MomentumConfig::new()
            .with_momentum(config.momentum)
            .with_dampening(0.0)
    });
    let decay = (config.weight_decay() > 0.0).then(|| WeightDecayConfig::new(config.weight_decay() as f32));
    SgdConfig::new()
        .with_momentum(momentum)
        .with_weight_decay(decay)
        .init::<B, SegmentationModel<B>>()
}

pub fn adam_optimizer<B: AutodiffBackend>(config: &TrainConfig) -> impl Optimizer<SegmentationModel<B>, B> {
    let decay = (config.weight_decay() > 0.0).then(|| WeightDecayConfig::new(config.weight_decay() as f32));
    AdamConfig::new()
        .with_weight_decay(decay)
        .init::<B, SegmentationModel<B>>()
}

fn to_f32<B: Backend>(loss: Tensor<B, 1>) -> f32 {
    loss.into_scalar().elem()
}

/// Result of a full train + validation pass.
#[derive(Clone, Debug)]
pub enum EpochOutcome {
    Completed {
        report: LossReport,
        stop: Option<StopReason>,
    },
    Cancelled,
}

/// Owns the optimizer, learning rate schedule and stopping state of one training run.
pub struct SegTrainer<B: AutodiffBackend, O> {
    optim: O,
    schedule: LrSchedule,
    monitor: StopMonitor,
    device: B::Device,
}

impl<B, O> SegTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SegmentationModel<B>, B>,
{
    pub fn new(config: &TrainConfig, optim: O, device: B::Device) -> Result<Self> {
        Ok(Self {
            optim,
            schedule: LrSchedule::new(&config.schedule, config.lr)?,
            monitor: StopMonitor::new(config.stopping.clone()),
            device,
        })
    }

    /// Replaces the stopping policy, restarting its clock.
    pub fn with_stopping(mut self, config: StoppingConfig) -> Self {
        self.monitor = StopMonitor::new(config);
        self
    }

    pub fn learning_rate(&self) -> f64 {
        self.schedule.lr()
    }

    pub fn best_val_loss(&self) -> f32 {
        self.monitor.best()
    }

    /// One pass over the training batches. Returns the mean loss, or `None` when
    /// cancelled between batches.
    pub fn train_epoch(
        &mut self,
        mut model: SegmentationModel<B>,
        loader: &mut TileLoader,
        cancel: &CancellationToken,
    ) -> (SegmentationModel<B>, Option<f32>) {
        let lr = self.schedule.lr();
        let mut total = 0.0;
        let mut batches = 0;

        for samples in loader.epoch_plan() {
            if cancel.is_cancelled() {
                return (model, None);
            }
            let batch = loader.batch::<B>(&samples, &self.device);

            let loss = trace_span!("Forward").in_scope(|| combined_loss(model.forward(batch.images), batch.masks));
            total += to_f32(loss.clone());
            batches += 1;

            let grads = trace_span!("Backward pass").in_scope(|| loss.backward());
            let grads = GradientsParams::from_grads(grads, &model);
            model = trace_span!("Optimizer step").in_scope(|| self.optim.step(lr, model, grads));
        }
        (model, Some(if batches > 0 { total / batches as f32 } else { 0.0 }))
    }

    /// Mean loss over the validation batches, without gradient tracking.
    pub fn valid_epoch(
        &self,
        model: &SegmentationModel<B::InnerBackend>,
        loader: &mut TileLoader,
        cancel: &CancellationToken,
    ) -> Option<f32> {
        let _span = trace_span!("Validation").entered();
        let mut total = 0.0;
        let mut batches = 0;

        for samples in loader.epoch_plan() {
            if cancel.is_cancelled() {
                return None;
            }
            let batch = loader.batch::<B::InnerBackend>(&samples, &self.device);
            total += to_f32(combined_loss(model.forward(batch.images), batch.masks));
            batches += 1;
        }
        Some(if batches > 0 { total / batches as f32 } else { 0.0 })
    }

    /// Trains and validates epoch `epoch` (from 1), then steps the schedule and
    /// asks the stopping policy.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        model: SegmentationModel<B>,
        train: &mut TileLoader,
        valid: &mut TileLoader,
        cancel: &CancellationToken,
    ) -> (SegmentationModel<B>, EpochOutcome) {
        let lr = self.schedule.lr();
        let (model, train_loss) = self.train_epoch(model, train, cancel);
        let Some(train_loss) = train_loss else {
            return (model, EpochOutcome::Cancelled);
        };
        let Some(val_loss) = self.valid_epoch(&model.valid(), valid, cancel) else {
            return (model, EpochOutcome::Cancelled);
        };

        self.schedule.step(train_loss as f64);
        let report = LossReport::new(epoch, train_loss, val_loss, lr);
        log::info!(
            "Epoch {epoch}: train loss {:.5}, validation loss {:.5}, learning rate {:.8}",
            report.train_loss,
            report.val_loss,
            report.learning_rate
        );

        let stop = self.monitor.update(epoch, val_loss);
        if let Some(reason) = &stop {
            log::info!("Training stopped: {reason}");
        }
        (model, EpochOutcome::Completed { report, stop })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{save_checkpoint, ModelMetadata};
    use crate::config::LrScheduleConfig;
    use burn::backend::{Autodiff, NdArray};
    use dataset::loader::TileSample;
    use dataset::{Normalization, TileDataset};
    use glam::uvec2;
    use model::{Architecture, ModelConfig};
    use std::sync::Arc;

    type TestBackend = Autodiff<NdArray>;

    const TILE: usize = 96;

    fn disk_dataset(count: usize, offset: usize) -> Arc<TileDataset> {
        let samples = (0..count)
            .map(|i| {
                let centre = 20 + (i + offset) * 10;
                let mut image = vec![0.0; TILE * TILE];
                let mut mask = vec![0.0; TILE * TILE];
                for y in 0..TILE {
                    for x in 0..TILE {
                        let dx = x as isize - centre as isize;
                        let dy = y as isize - 48;
                        if dx * dx + dy * dy < 225 {
                            image[y * TILE + x] = 1.0;
                            mask[y * TILE + x] = 1.0;
                        }
                    }
                }
                TileSample {
                    id: format!("disk_{i}"),
                    image,
                    mask,
                    has_foreground: true,
                }
            })
            .collect();
        Arc::new(TileDataset::from_samples(samples, 1, 1, uvec2(TILE as u32, TILE as u32)))
    }

    #[test]
    fn short_run_lowers_loss_and_writes_artifacts() {
        let device = Default::default();
        TestBackend::seed(42);

        let model_config = ModelConfig::new().with_depth(2).with_first_filter(16);
        let config = TrainConfig::new()
            .with_lr(0.01)
            .with_momentum(0.0)
            .with_weight_decay_ratio(0.0)
            .with_schedule(LrScheduleConfig::Constant)
            .with_stopping(StoppingConfig::new().with_max_iterations(3));

        let mut model = model_config.init::<TestBackend>(&device).unwrap();
        let mut trainer =
            SegTrainer::<TestBackend, _>::new(&config, sgd_optimizer::<TestBackend>(&config), device).unwrap();
        let mut train = TileLoader::new(disk_dataset(4, 0), 4, 42);
        let mut valid = TileLoader::new(disk_dataset(2, 4), 4, 42).with_shuffle(false);
        let cancel = CancellationToken::new();

        let mut losses = vec![];
        for epoch in 1..=3 {
            let (next, outcome) = trainer.run_epoch(epoch, model, &mut train, &mut valid, &cancel);
            model = next;
            match outcome {
                EpochOutcome::Completed { report, stop } => {
                    assert!(report.val_loss.is_finite());
                    losses.push(report.train_loss);
                    assert_eq!(stop.is_some(), epoch == 3);
                }
                EpochOutcome::Cancelled => panic!("not cancelled"),
            }
        }
        for pair in losses.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-3, "losses {losses:?}");
        }

        let dir = tempfile::tempdir().unwrap();
        let metadata = ModelMetadata::new(model_config, Normalization::identity(1), TILE as u32, true, 1, 7);
        let path = save_checkpoint(&model, &metadata, dir.path()).unwrap();
        assert!(path.exists());

        let stored = ModelMetadata::load(dir.path().join("settings_7.json")).unwrap();
        assert_eq!(stored.model.depth, 2);
        assert_eq!(stored.model.first_filter, 16);
    }

    fn block_dataset(count: usize, tile: usize) -> Arc<TileDataset> {
        let samples = (0..count)
            .map(|i| {
                let plane = (0..tile * tile)
                    .map(|p| if p % tile > tile / 2 + i { 1.0 } else { 0.0 })
                    .collect::<Vec<f32>>();
                TileSample {
                    id: format!("block_{i}"),
                    image: plane.clone(),
                    mask: plane,
                    has_foreground: true,
                }
            })
            .collect();
        Arc::new(TileDataset::from_samples(samples, 1, 1, uvec2(tile as u32, tile as u32)))
    }

    #[test]
    fn trains_on_tiles_not_divisible_by_the_depth() {
        let device = Default::default();
        let config = TrainConfig::new().with_stopping(StoppingConfig::new().with_max_iterations(1));
        for architecture in [Architecture::Baseline, Architecture::Attention, Architecture::Nested] {
            let model = ModelConfig::new()
                .with_architecture(architecture)
                .with_depth(2)
                .with_first_filter(8)
                .init::<TestBackend>(&device)
                .unwrap();
            let mut trainer =
                SegTrainer::<TestBackend, _>::new(&config, sgd_optimizer::<TestBackend>(&config), device.clone())
                    .unwrap();
            let mut train = TileLoader::new(block_dataset(3, 18), 2, 1);
            let mut valid = TileLoader::new(block_dataset(2, 18), 2, 1).with_shuffle(false);

            let (_, outcome) = trainer.run_epoch(1, model, &mut train, &mut valid, &CancellationToken::new());
            match outcome {
                EpochOutcome::Completed { report, .. } => {
                    assert!(report.train_loss.is_finite(), "{architecture:?}");
                    assert!(report.val_loss.is_finite(), "{architecture:?}");
                }
                EpochOutcome::Cancelled => panic!("not cancelled"),
            }
        }
    }

    #[test]
    fn cancelled_epoch_reports_cancellation() {
        let device = Default::default();
        let config = TrainConfig::new();
        let model = ModelConfig::new()
            .with_depth(1)
            .with_first_filter(4)
            .init::<TestBackend>(&device)
            .unwrap();
        let mut trainer =
            SegTrainer::<TestBackend, _>::new(&config, adam_optimizer::<TestBackend>(&config), device).unwrap();
        let mut loader = TileLoader::new(disk_dataset(2, 0), 2, 0);
        let mut valid = TileLoader::new(disk_dataset(1, 0), 2, 0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_, outcome) = trainer.run_epoch(1, model, &mut loader, &mut valid, &cancel);
        assert!(matches!(outcome, EpochOutcome::Cancelled));
    }
}
