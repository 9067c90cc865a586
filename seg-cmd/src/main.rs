use std::path::{Path, PathBuf};
use std::pin::pin;

use anyhow::anyhow;
use burn::config::Config;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use dataset::{AugmentConfig, PreprocessConfig};
use model::{MainBackend, ModelComplexity, TrainBackend};
use pipeline::{InferStream, PipelineConfig, PipelineMessage, PipelineStream, SliceStream, TrainStream};
use train::config::TrainConfig;

/// CLI for slicing datasets, training U-Net segmentation models and running them on images.
#[derive(Parser)]
struct Args {
    /// Pipeline settings as JSON (splits, export folder, inference thresholds)
    #[arg(long, global = true)]
    pipeline: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cut the train and validation images of a dataset into tiles
    Slice {
        /// Dataset root with train/ and validation/ splits
        #[arg(short, long)]
        root: PathBuf,

        /// Preprocessing settings as JSON
        #[arg(long)]
        preprocess: Option<PathBuf>,
    },
    /// Train a network on a sliced dataset
    Train {
        /// Dataset root with sliced train/ and validation/ splits
        #[arg(short, long)]
        root: PathBuf,

        /// Preprocessing settings as JSON, must match the ones used for slicing
        #[arg(long)]
        preprocess: Option<PathBuf>,

        /// Network settings as JSON. Takes precedence over --complexity
        #[arg(long)]
        model: Option<PathBuf>,

        /// Preset network size
        #[arg(long, value_enum, default_value_t = Complexity::Medium)]
        complexity: Complexity,

        /// Optimizer, schedule and stopping settings as JSON
        #[arg(long)]
        train: Option<PathBuf>,

        /// Augmentation settings as JSON
        #[arg(long)]
        augment: Option<PathBuf>,

        /// Folder for checkpoints, overrides the pipeline settings
        #[arg(short, long)]
        export: Option<PathBuf>,
    },
    /// Segment a folder of images with a trained network
    Infer {
        /// Path to a saved model_<timestamp>.bin
        #[arg(short, long)]
        model: PathBuf,

        /// Folder of images to segment
        #[arg(short, long)]
        images: PathBuf,

        /// Optional folder of ground truth masks, matched to the images by name
        #[arg(long)]
        masks: Option<PathBuf>,

        /// Folder for heatmaps and overlays
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Complexity {
    Low,
    Medium,
    High,
}

impl From<Complexity> for ModelComplexity {
    fn from(value: Complexity) -> Self {
        match value {
            Complexity::Low => ModelComplexity::Low,
            Complexity::Medium => ModelComplexity::Medium,
            Complexity::High => ModelComplexity::High,
        }
    }
}

fn load_config<C: Config>(path: Option<&Path>, default: impl FnOnce() -> C) -> anyhow::Result<C> {
    match path {
        Some(path) => C::load(path).map_err(|e| anyhow!("Failed to read config {path:?}: {e:?}")),
        None => Ok(default()),
    }
}

fn report(message: &PipelineMessage) {
    match message {
        PipelineMessage::SliceProgress { percent } => log::info!("Sliced {percent}%"),
        PipelineMessage::Epoch(report) => log::info!(
            "Epoch {}: train loss {}, validation loss {}, learning rate {}",
            report.epoch,
            report.train_loss,
            report.val_loss,
            report.learning_rate
        ),
        PipelineMessage::Checkpoint { path } => log::info!("Saved checkpoint {path:?}"),
        PipelineMessage::InferProgress { percent, id, stats } => match stats {
            Some(stats) => log::info!(
                "[{percent}%] {id}: IoU {:.4}, Dice {:.4}, precision {:.4}, recall {:.4}",
                stats.iou,
                stats.dice,
                stats.precision,
                stats.recall
            ),
            None => log::info!("[{percent}%] {id}"),
        },
        PipelineMessage::Stopped { reason } => log::info!("Training stopped: {reason}"),
        PipelineMessage::Cancelled => log::warn!("Cancelled"),
        PipelineMessage::Finished => log::info!("Done"),
    }
}

async fn drive(stream: impl Stream<Item = anyhow::Result<PipelineMessage>>) -> anyhow::Result<()> {
    let mut stream = pin!(stream);
    while let Some(message) = stream.next().await {
        report(&message?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, finishing the current step.");
                cancel.cancel();
            }
        }
    });

    let pipeline_config = load_config(args.pipeline.as_deref(), PipelineConfig::new)?;

    match args.command {
        Command::Slice { root, preprocess } => {
            let preprocess = load_config(preprocess.as_deref(), PreprocessConfig::new)?;
            let mut stream = SliceStream::new(root, preprocess, cancel).with_pipeline_config(pipeline_config);
            drive(stream.launch()).await
        }
        Command::Train {
            root,
            preprocess,
            model,
            complexity,
            train,
            augment,
            export,
        } => {
            let preprocess = load_config(preprocess.as_deref(), PreprocessConfig::new)?;
            let model_config = load_config(model.as_deref(), || {
                ModelComplexity::from(complexity).config(preprocess.channels(), preprocess.num_classes)
            })?;
            let train_config = load_config(train.as_deref(), TrainConfig::new)?;
            let augment_config = load_config(augment.as_deref(), AugmentConfig::new)?;
            let pipeline_config = match export {
                Some(dir) => pipeline_config.with_export_path(dir.to_string_lossy().into_owned()),
                None => pipeline_config,
            };

            let mut stream = TrainStream::<TrainBackend>::new(root, cancel, Default::default())
                .with_preprocess(preprocess)
                .with_model_config(model_config)
                .with_train_config(train_config)
                .with_augment_config(augment_config)
                .with_pipeline_config(pipeline_config);
            drive(stream.launch()).await
        }
        Command::Infer {
            model,
            images,
            masks,
            output,
        } => {
            let mut stream = InferStream::<MainBackend>::new(model, images, output, cancel, Default::default())
                .with_masks_dir(masks)
                .with_pipeline_config(pipeline_config);
            drive(stream.launch()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_train_command() {
        let args = Args::try_parse_from(["seg-cmd", "train", "-r", "data", "--complexity", "low"]).unwrap();
        match args.command {
            Command::Train { root, complexity, .. } => {
                assert_eq!(root, PathBuf::from("data"));
                assert!(matches!(complexity, Complexity::Low));
            }
            _ => panic!("expected train"),
        }
    }
}
