use std::path::PathBuf;
use std::sync::Arc;

use burn::prelude::*;
use futures::{stream, StreamExt, TryStreamExt};
use glam::{uvec2, UVec2};
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace_span;

use crate::augment::{Augmenter, EpochSample};
use crate::convert::{masks_to_planes, stack_samples, Normalization};
use crate::error::{DatasetError, Result};
use crate::filesystem::ImagePair;

/// Decoded, normalized tile ready to be stacked into a batch.
pub struct TileSample {
    pub id: String,
    pub image: Vec<f32>,
    pub mask: Vec<f32>,
    pub has_foreground: bool,
}

/// Image and mask tensors of one batch.
#[derive(Clone, Debug)]
pub struct SegBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 4>,
}

/// All tiles of one split, decoded into memory.
pub struct TileDataset {
    samples: Vec<TileSample>,
    channels: usize,
    classes: usize,
    size: UVec2,
}

fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|x| x.get())
        .unwrap_or(4)
        .min(8)
}

fn decode(pair: ImagePair, norm: &Normalization, classes: usize) -> Result<(TileSample, UVec2)> {
    let image = image::open(&pair.image)?;
    let size = uvec2(image.width(), image.height());

    let masks = pair
        .masks
        .iter()
        .take(classes)
        .map(|path| -> Result<image::GrayImage> {
            let mask = image::open(path)?.to_luma8();
            if mask.dimensions() != (size.x, size.y) {
                return Err(DatasetError::MaskSize {
                    id: pair.id.clone(),
                    image: (size.x, size.y),
                    mask: mask.dimensions(),
                });
            }
            Ok(mask)
        })
        .collect::<Result<Vec<_>>>()?;
    if masks.len() < classes {
        return Err(DatasetError::MissingMask(pair.id));
    }

    let mask = masks_to_planes(&masks);
    Ok((
        TileSample {
            image: norm.image_to_chw(&image)?,
            has_foreground: mask.iter().any(|&v| v > 0.0),
            mask,
            id: pair.id,
        },
        size,
    ))
}

impl TileDataset {
    /// Decodes every pair on a small pool of blocking workers. Order follows `pairs`.
    pub async fn load(pairs: Vec<ImagePair>, norm: Normalization, classes: usize) -> Result<Self> {
        let channels = norm.channels();
        let norm = Arc::new(norm);
        let workers = worker_count();
        log::info!("Decoding {} tiles on {workers} workers", pairs.len());

        let decoded = stream::iter(pairs)
            .map(|pair| {
                let norm = norm.clone();
                tokio::task::spawn_blocking(move || decode(pair, &norm, classes))
            })
            .buffered(workers)
            .map(|joined| joined.map_err(|e| DatasetError::Task(e.to_string()))?)
            .try_collect::<Vec<_>>()
            .await?;

        let mut size = None;
        let mut samples = Vec::with_capacity(decoded.len());
        for (sample, sample_size) in decoded {
            let expected = *size.get_or_insert(sample_size);
            if expected != sample_size {
                return Err(crate::error::TilingError::TileSize {
                    index: samples.len(),
                    expected: (expected.x, expected.y),
                    actual: (sample_size.x, sample_size.y),
                }
                .into());
            }
            samples.push(sample);
        }

        Ok(Self {
            samples,
            channels,
            classes,
            size: size.unwrap_or(UVec2::ZERO),
        })
    }

    /// Loads every tile under `images_dir`, matched with the class mask folders by name.
    pub async fn load_dir(
        images_dir: PathBuf,
        mask_dirs: Vec<PathBuf>,
        norm: Normalization,
    ) -> Result<Self> {
        let classes = mask_dirs.len();
        let pairs = crate::filesystem::Filesystem::images_in(&images_dir)
            .into_iter()
            .map(|(id, image)| {
                let masks = mask_dirs.iter().map(|dir| dir.join(format!("{id}.png"))).collect();
                ImagePair { id, image, masks }
            })
            .collect();
        Self::load(pairs, norm, classes).await
    }

    pub fn from_samples(samples: Vec<TileSample>, channels: usize, classes: usize, size: UVec2) -> Self {
        Self {
            samples,
            channels,
            classes,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn tile_size(&self) -> UVec2 {
        self.size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn has_foreground(&self, index: usize) -> bool {
        self.samples[index].has_foreground
    }

    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> SegBatch<B> {
        let (h, w) = (self.size.y as usize, self.size.x as usize);
        let images = indices
            .iter()
            .map(|&i| self.samples[i].image.as_slice())
            .collect::<Vec<_>>();
        let masks = indices
            .iter()
            .map(|&i| self.samples[i].mask.as_slice())
            .collect::<Vec<_>>();
        SegBatch {
            images: stack_samples(&images, [self.channels, h, w], device),
            masks: stack_samples(&masks, [self.classes, h, w], device),
        }
    }
}

/// Yields shuffled, optionally augmented batches of a [`TileDataset`].
pub struct TileLoader {
    dataset: Arc<TileDataset>,
    batch_size: usize,
    shuffle: bool,
    augmenter: Option<Augmenter>,
    rng: StdRng,
}

impl TileLoader {
    pub fn new(dataset: Arc<TileDataset>, batch_size: usize, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: true,
            augmenter: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_augmenter(mut self, augmenter: Option<Augmenter>) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn dataset(&self) -> &TileDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Samples of the next epoch, chunked into batches. Without an augmenter nothing is
    /// marked for augmentation.
    pub fn epoch_plan(&mut self) -> Vec<Vec<EpochSample>> {
        let len = self.dataset.len();
        let mut samples = match &self.augmenter {
            Some(augmenter) => augmenter.epoch_samples(len, |i| self.dataset.has_foreground(i)),
            None => (0..len).map(|index| EpochSample::new(index, false)).collect(),
        };
        if self.shuffle {
            samples.shuffle(&mut self.rng);
        }
        samples.chunks(self.batch_size).map(<[EpochSample]>::to_vec).collect()
    }

    pub fn batch<B: Backend>(&mut self, samples: &[EpochSample], device: &B::Device) -> SegBatch<B> {
        let indices = samples.iter().map(|s| s.index).collect::<Vec<_>>();
        let batch = trace_span!("Load batch").in_scope(|| self.dataset.batch(&indices, device));
        match self.augmenter.as_mut() {
            Some(augmenter) => {
                let flags = samples.iter().map(|s| s.augmented).collect::<Vec<_>>();
                let (images, masks) = augmenter.apply(batch.images, batch.masks, &flags);
                SegBatch { images, masks }
            }
            None => batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AugmentConfig, AugmentMode};
    use burn::backend::NdArray;
    use image::{GrayImage, Luma};

    #[tokio::test(flavor = "multi_thread")]
    async fn loads_tiles_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("sliced_images");
        let masks = dir.path().join("sliced_masks");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&masks).unwrap();
        for i in 0..5u8 {
            GrayImage::from_pixel(8, 8, Luma([i * 50]))
                .save(images.join(format!("t_0_{i}.png")))
                .unwrap();
            GrayImage::from_pixel(8, 8, Luma([if i % 2 == 0 { 255 } else { 0 }]))
                .save(masks.join(format!("t_0_{i}.png")))
                .unwrap();
        }

        let dataset = TileDataset::load_dir(images, vec![masks], Normalization::identity(1))
            .await
            .unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.tile_size(), uvec2(8, 8));
        assert!(dataset.has_foreground(0));
        assert!(!dataset.has_foreground(1));

        let device = Default::default();
        let batch = dataset.batch::<NdArray>(&[2, 0], &device);
        assert_eq!(batch.images.dims(), [2, 1, 8, 8]);
        let first = batch.images.slice([0..1]).into_data().to_vec::<f32>().unwrap();
        assert!((first[0] - 100.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn epoch_plan_covers_every_sample() {
        let samples = (0..7)
            .map(|i| TileSample {
                id: i.to_string(),
                image: vec![0.0; 4],
                mask: vec![0.0; 4],
                has_foreground: false,
            })
            .collect();
        let dataset = Arc::new(TileDataset::from_samples(samples, 1, 1, uvec2(2, 2)));
        let mut loader = TileLoader::new(dataset, 3, 42);

        let plan = loader.epoch_plan();
        assert_eq!(plan.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let mut seen = plan.concat().iter().map(|s| s.index).collect::<Vec<_>>();
        seen.sort();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert!(plan.concat().iter().all(|s| !s.augmented));
    }

    #[test]
    fn duplication_keeps_one_untouched_copy() {
        let originals = (0..3)
            .map(|i| (0..4).map(|v| (i * 4 + v) as f32).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let samples = originals
            .iter()
            .enumerate()
            .map(|(i, image)| TileSample {
                id: i.to_string(),
                image: image.clone(),
                mask: vec![0.0; 4],
                has_foreground: false,
            })
            .collect();
        let dataset = Arc::new(TileDataset::from_samples(samples, 1, 1, uvec2(2, 2)));
        let config = AugmentConfig::new()
            .with_mode(AugmentMode::Duplication)
            .with_copies(2)
            .with_horizontal_flip(1.0)
            .with_vertical_flip(0.0)
            .with_brightness(0.0)
            .with_contrast(0.0)
            .with_noise(0.0);
        let mut loader = TileLoader::new(dataset, 4, 7).with_augmenter(Some(Augmenter::new(config, 7)));

        let device = Default::default();
        let mut tiles = Vec::new();
        for samples in loader.epoch_plan() {
            let batch = loader.batch::<NdArray>(&samples, &device);
            let values = batch.images.into_data().to_vec::<f32>().unwrap();
            tiles.extend(values.chunks(4).map(<[f32]>::to_vec));
        }

        assert_eq!(tiles.len(), 9);
        for original in &originals {
            let flipped = vec![original[1], original[0], original[3], original[2]];
            assert_eq!(tiles.iter().filter(|t| *t == original).count(), 1);
            assert_eq!(tiles.iter().filter(|t| **t == flipped).count(), 2);
        }
    }
}
