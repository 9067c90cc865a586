use burn::prelude::*;
use burn::tensor::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{AugmentConfig, AugmentMode};

/// A slot of an epoch: which sample, and whether it gets augmented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochSample {
    pub index: usize,
    pub augmented: bool,
}

impl EpochSample {
    pub fn new(index: usize, augmented: bool) -> Self {
        Self { index, augmented }
    }
}

/// Random paired geometric and photometric augmentation for training batches.
pub struct Augmenter {
    config: AugmentConfig,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(config: AugmentConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.config
    }

    /// Epoch sample order. Standard mode augments every sample on the fly. The duplicating
    /// modes keep every sample once untouched and add `copies` augmented repeats.
    pub fn epoch_samples(&self, len: usize, has_foreground: impl Fn(usize) -> bool) -> Vec<EpochSample> {
        if self.config.mode == AugmentMode::Standard {
            return (0..len).map(|index| EpochSample::new(index, true)).collect();
        }
        let mut samples = (0..len).map(|index| EpochSample::new(index, false)).collect::<Vec<_>>();
        for index in 0..len {
            let extra = match self.config.mode {
                AugmentMode::FeatureAware if !has_foreground(index) => 0,
                _ => self.config.copies,
            };
            samples.extend(std::iter::repeat_n(EpochSample::new(index, true), extra));
        }
        samples
    }

    /// Augments the samples of a batch whose `augment` flag is set. Flips are applied to
    /// image and mask alike, intensity changes to the image only.
    pub fn apply<B: Backend>(
        &mut self,
        images: Tensor<B, 4>,
        masks: Tensor<B, 4>,
        augment: &[bool],
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [n, _, _, _] = images.dims();
        let mut out_images = Vec::with_capacity(n);
        let mut out_masks = Vec::with_capacity(n);

        for i in 0..n {
            let mut image = images.clone().slice([i..i + 1]);
            let mut mask = masks.clone().slice([i..i + 1]);
            if !augment.get(i).copied().unwrap_or(true) {
                out_images.push(image);
                out_masks.push(mask);
                continue;
            }

            if self.rng.random_bool(self.config.horizontal_flip.clamp(0.0, 1.0)) {
                image = image.flip([3]);
                mask = mask.flip([3]);
            }
            if self.rng.random_bool(self.config.vertical_flip.clamp(0.0, 1.0)) {
                image = image.flip([2]);
                mask = mask.flip([2]);
            }
            out_images.push(self.photometric(image));
            out_masks.push(mask);
        }

        (Tensor::cat(out_images, 0), Tensor::cat(out_masks, 0))
    }

    fn photometric<B: Backend>(&mut self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut image = image;

        if self.config.contrast > 0.0 {
            let c = self.config.contrast;
            let factor = self.rng.random_range(1.0 - c..=1.0 + c);
            let mean = image.clone().mean();
            image = (image - mean.clone().unsqueeze()) * factor + mean.unsqueeze();
        }
        if self.config.brightness > 0.0 {
            let b = self.config.brightness;
            image = image + self.rng.random_range(-b..=b);
        }
        if self.config.noise > 0.0 {
            let noise = Tensor::random(
                image.shape(),
                Distribution::Normal(0.0, self.config.noise),
                &image.device(),
            );
            image = image + noise;
        }
        image
    }
}
