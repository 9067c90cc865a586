use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use async_fn_stream::TryStreamEmitter;
use async_trait::async_trait;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use glam::uvec2;
use image::{DynamicImage, GrayImage};
use tokio_util::sync::CancellationToken;
use tracing::trace_span;

use dataset::convert::{tensor_to_tiles, tiles_to_tensor};
use dataset::slicer::{load_image, load_mask};
use dataset::tiling::{compute_grid, crop_to, downsample, merge, pad_to, slice_dynamic, upsample};
use dataset::TileGrid;
use dataset::Filesystem;
use model::SegmentationModel;
use train::checkpoint::{load_checkpoint, ModelMetadata};
use train::metrics::{aggregate, compute_metrics};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::heatmap::save_heatmaps;
use crate::message::{percent, PipelineMessage};
use crate::pipeline_stream::PipelineStream;

/// Network output of every tile of one image, in batches of at most `batch_size` tiles.
pub struct TileOutputs<B: Backend> {
    batches: Vec<Tensor<B, 4>>,
    grid: TileGrid,
    size: (u32, u32),
}

/// Slices `image` like the training tiles were sliced and runs every tile through the
/// network. Only the forward passes happen here; reading the results back is async.
pub fn forward_tiles<B: Backend>(
    model: &SegmentationModel<B>,
    metadata: &ModelMetadata,
    image: &DynamicImage,
    batch_size: usize,
    device: &B::Device,
) -> Result<TileOutputs<B>> {
    let small = downsample(image, metadata.down_sample);
    let size = uvec2(small.width(), small.height());
    // Images smaller than one tile are always padded, otherwise nothing would be predicted.
    let pad = metadata.border_padding || compute_grid(size, metadata.slice_size, false)?.is_empty();
    let grid = compute_grid(size, metadata.slice_size, pad)?;
    let tiles = slice_dynamic(&small, metadata.slice_size, pad, grid);

    let batches = tiles
        .chunks(batch_size.max(1))
        .map(|chunk| -> Result<Tensor<B, 4>> {
            let input = tiles_to_tensor::<B>(chunk, &metadata.normalization, device)?;
            Ok(trace_span!("Forward").in_scope(|| sigmoid(model.forward(input))))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TileOutputs {
        batches,
        grid,
        size: (image.width(), image.height()),
    })
}

impl<B: Backend> TileOutputs<B> {
    /// Stitches the tiles back together, one probability image per class, at the size of
    /// the source image. Border pixels outside an unpadded grid are left at zero.
    pub async fn into_probability_maps(self, down_sample: u32) -> Result<Vec<GrayImage>> {
        let (width, height) = self.size;
        let mut per_class: Vec<Vec<GrayImage>> = vec![];
        for batch in self.batches {
            for sample in tensor_to_tiles(batch).await? {
                per_class.resize_with(sample.len(), || Vec::with_capacity(self.grid.len()));
                for (class, tile) in sample.into_iter().enumerate() {
                    per_class[class].push(tile);
                }
            }
        }

        per_class
            .into_iter()
            .map(|tiles| -> Result<GrayImage> {
                let merged = merge(&tiles, self.grid)?;
                let restored = upsample(&merged, down_sample);
                Ok(crop_to(&pad_to(&restored, width, height), width, height))
            })
            .collect()
    }
}

/// Segments one image tile by tile. Returns one probability image per class with
/// exactly the size of `image`.
pub async fn predict<B: Backend>(
    model: &SegmentationModel<B>,
    metadata: &ModelMetadata,
    image: &DynamicImage,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<GrayImage>> {
    forward_tiles(model, metadata, image, batch_size, device)?
        .into_probability_maps(metadata.down_sample)
        .await
}

/// Runs a trained network over a folder of images, writing heatmaps and overlays
/// and scoring every image that has a ground truth mask.
pub struct InferStream<B: Backend> {
    model_path: PathBuf,
    images_dir: PathBuf,
    masks_dir: Option<PathBuf>,
    output_dir: PathBuf,
    pipeline_config: PipelineConfig,
    cancel: CancellationToken,
    device: B::Device,
}

impl<B: Backend> InferStream<B> {
    pub fn new(
        model_path: PathBuf,
        images_dir: PathBuf,
        output_dir: PathBuf,
        cancel: CancellationToken,
        device: B::Device,
    ) -> Self {
        Self {
            model_path,
            images_dir,
            masks_dir: None,
            output_dir,
            pipeline_config: PipelineConfig::new(),
            cancel,
            device,
        }
    }

    pub fn with_masks_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.masks_dir = dir;
        self
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }
}

#[async_trait]
impl<B: Backend> PipelineStream for InferStream<B> {
    async fn run(&mut self, emitter: TryStreamEmitter<PipelineMessage, anyhow::Error>) -> anyhow::Result<()> {
        let config = self.pipeline_config.clone();
        let (model, metadata) = load_checkpoint::<B>(&self.model_path, &self.device)
            .with_context(|| format!("Failed to load model {:?}", self.model_path))?;

        let images = Filesystem::images_in(&self.images_dir);
        let masks = self
            .masks_dir
            .as_ref()
            .map(|dir| Filesystem::images_in(dir).into_iter().collect::<HashMap<_, _>>())
            .unwrap_or_default();
        if images.is_empty() {
            log::warn!("No images to segment in {:?}", self.images_dir);
        }

        let heatmap_dir = self.output_dir.join(&config.heatmap_dir);
        let overlay_dir = self.output_dir.join(&config.overlay_dir);
        let mut all_stats = vec![];

        for (index, (id, path)) in images.iter().enumerate() {
            if self.cancel.is_cancelled() {
                emitter.emit(PipelineMessage::Cancelled).await;
                return Ok(());
            }

            let start = Instant::now();
            let image = load_image(path, metadata.greyscale)?;
            let outputs = forward_tiles(&model, &metadata, &image, config.infer_batch_size, &self.device)?;
            let predictions = outputs
                .into_probability_maps(metadata.down_sample)
                .await
                .with_context(|| format!("Failed to segment {id}"))?;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            save_heatmaps(
                id,
                &image,
                &predictions,
                config.heatmap_threshold,
                &heatmap_dir,
                &overlay_dir,
            )?;

            let stats = match (masks.get(id), predictions.first()) {
                (Some(mask_path), Some(prediction)) => {
                    let truth = load_mask(mask_path)?;
                    let stats = compute_metrics(prediction, &truth, config.metric_threshold)?
                        .with_inference_ms(elapsed_ms);
                    log::info!("{id}: IoU {:.4}, Dice {:.4}", stats.iou, stats.dice);
                    all_stats.push(stats.clone());
                    Some(Box::new(stats))
                }
                _ => None,
            };

            emitter
                .emit(PipelineMessage::InferProgress {
                    percent: percent(index, images.len()),
                    id: id.clone(),
                    stats,
                })
                .await;
            B::sync(&self.device);
        }

        if !all_stats.is_empty() {
            let (macro_avg, micro_avg) = aggregate(&all_stats);
            log::info!(
                "Macro IoU {:.4} Dice {:.4}, micro IoU {:.4} Dice {:.4} over {} images",
                macro_avg.iou,
                macro_avg.dice,
                micro_avg.iou,
                micro_avg.dice,
                all_stats.len()
            );
        }

        emitter.emit(PipelineMessage::Finished).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use dataset::Normalization;
    use image::{Luma, RgbImage};
    use model::ModelConfig;
    use tokio_stream::StreamExt;
    use train::checkpoint::save_checkpoint;

    fn metadata(slice_size: u32, down_sample: u32, greyscale: bool) -> ModelMetadata {
        let channels = if greyscale { 1 } else { 3 };
        ModelMetadata::new(
            ModelConfig::new()
                .with_in_channels(channels)
                .with_depth(1)
                .with_first_filter(4),
            Normalization::identity(channels),
            slice_size,
            greyscale,
            down_sample,
            99,
        )
    }

    #[tokio::test]
    async fn output_matches_source_size() {
        let device = Default::default();
        for (slice_size, down_sample) in [(16, 0), (16, 1), (32, 2), (8, 1), (18, 0), (30, 1)] {
            let metadata = metadata(slice_size, down_sample, true);
            let model = metadata.model.init::<NdArray>(&device).unwrap();
            for (w, h) in [(50, 37), (16, 16), (7, 61)] {
                let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(w, h, Luma([90])));
                let out = predict(&model, &metadata, &image, 3, &device).await.unwrap();
                assert_eq!(out.len(), 1);
                assert_eq!(out[0].dimensions(), (w, h), "tile {slice_size} factor {down_sample}");
            }
        }
    }

    #[tokio::test]
    async fn unpadded_grid_leaves_border_empty() {
        let device = Default::default();
        let metadata = metadata(16, 0, true).with_border_padding(false);
        let model = metadata.model.init::<NdArray>(&device).unwrap();

        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(50, 37, Luma([90])));
        let out = predict(&model, &metadata, &image, 4, &device).await.unwrap();
        assert_eq!(out[0].dimensions(), (50, 37));
        // A 3x2 grid of 16px tiles covers 48x32.
        assert!((48..50).all(|x| (0..37).all(|y| out[0].get_pixel(x, y)[0] == 0)));
        assert!((0..50).all(|x| (32..37).all(|y| out[0].get_pixel(x, y)[0] == 0)));

        let tiny = DynamicImage::ImageLuma8(GrayImage::from_pixel(9, 5, Luma([90])));
        let out = predict(&model, &metadata, &tiny, 4, &device).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dimensions(), (9, 5));
    }

    #[tokio::test]
    async fn segments_folder_and_writes_heatmaps() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let metadata = metadata(16, 1, false);
        let model = metadata.model.init::<NdArray>(&device).unwrap();
        let model_path = save_checkpoint(&model, &metadata, &dir.path().join("models")).unwrap();

        let images = dir.path().join("images");
        let masks = dir.path().join("masks");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&masks).unwrap();
        for id in ["one", "two", "three"] {
            RgbImage::from_fn(30, 20, |x, _| image::Rgb([x as u8 * 8, 40, 90]))
                .save(images.join(format!("{id}.png")))
                .unwrap();
        }
        GrayImage::from_fn(30, 20, |x, _| Luma([if x < 10 { 255 } else { 0 }]))
            .save(masks.join("two.png"))
            .unwrap();

        let output = dir.path().join("output");
        let mut stream = InferStream::<NdArray>::new(
            model_path,
            images,
            output.clone(),
            CancellationToken::new(),
            device,
        )
        .with_masks_dir(Some(masks));

        let messages = stream
            .launch()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();

        let progress = messages
            .iter()
            .filter_map(|m| match m {
                PipelineMessage::InferProgress { percent, id, stats } => Some((*percent, id.clone(), stats.is_some())),
                _ => None,
            })
            .collect::<Vec<_>>();
        // Images are visited in name order.
        assert_eq!(
            progress,
            vec![
                (33, "one".to_owned(), false),
                (66, "three".to_owned(), false),
                (100, "two".to_owned(), true),
            ]
        );
        assert!(matches!(messages.last(), Some(PipelineMessage::Finished)));

        let heat = image::open(output.join("heatmaps/two.png")).unwrap();
        assert_eq!((heat.width(), heat.height()), (30, 20));
        assert!(output.join("overlays/one.png").exists());
    }
}
