use burn::prelude::*;
use image::{DynamicImage, GrayImage, Luma};

use crate::error::{self, DatasetError};

const MIN_STD: f32 = 1e-6;

/// Pixel value above which a mask pixel counts as foreground.
pub const MASK_THRESHOLD: u8 = 127;

/// Per-channel statistics applied to every image before it enters the network.
#[derive(Config, Debug)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    /// Plain `v / 255` scaling.
    pub fn identity(channels: usize) -> Self {
        Self::new(vec![0.0; channels], vec![1.0; channels])
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Mean and std over every pixel of `images`, scaled to `[0, 1]`. Images must be
    /// un-padded and un-augmented.
    pub fn compute<'a>(images: impl IntoIterator<Item = &'a DynamicImage>, greyscale: bool) -> Self {
        let channels = if greyscale { 1 } else { 3 };
        let mut sum = vec![0.0f64; channels];
        let mut sum_sq = vec![0.0f64; channels];
        let mut count = 0u64;

        for image in images {
            let raw = pixels(image, greyscale);
            for px in raw.chunks_exact(channels) {
                for (c, &v) in px.iter().enumerate() {
                    let v = v as f64 / 255.0;
                    sum[c] += v;
                    sum_sq[c] += v * v;
                }
            }
            count += (raw.len() / channels) as u64;
        }

        if count == 0 {
            return Self::identity(channels);
        }

        let n = count as f64;
        let mean = sum.iter().map(|s| (s / n) as f32).collect::<Vec<_>>();
        let std = sum_sq
            .iter()
            .zip(&sum)
            .map(|(sq, s)| {
                let m = s / n;
                ((sq / n - m * m).max(0.0).sqrt() as f32).max(MIN_STD)
            })
            .collect();
        Self::new(mean, std)
    }

    /// Normalized CHW values of one image.
    pub fn image_to_chw(&self, image: &DynamicImage) -> error::Result<Vec<f32>> {
        let channels = self.channels();
        if channels != 1 && channels != 3 {
            return Err(DatasetError::Channels {
                expected: 3,
                actual: channels,
            });
        }
        let raw = pixels(image, channels == 1);
        let plane = raw.len() / channels;

        let mut chw = vec![0.0f32; raw.len()];
        for (i, px) in raw.chunks_exact(channels).enumerate() {
            for (c, &v) in px.iter().enumerate() {
                chw[c * plane + i] = (v as f32 / 255.0 - self.mean[c]) / self.std[c].max(MIN_STD);
            }
        }
        Ok(chw)
    }
}

fn pixels(image: &DynamicImage, greyscale: bool) -> Vec<u8> {
    if greyscale {
        image.to_luma8().into_raw()
    } else {
        image.to_rgb8().into_raw()
    }
}

/// Binary planes for one sample, one per class mask: foreground = 1.
pub fn masks_to_planes(masks: &[GrayImage]) -> Vec<f32> {
    masks
        .iter()
        .flat_map(|mask| {
            mask.as_raw()
                .iter()
                .map(|&v| if v > MASK_THRESHOLD { 1.0 } else { 0.0 })
        })
        .collect()
}

/// Stacks equally sized CHW samples into an `[N, C, H, W]` tensor.
pub fn stack_samples<B: Backend>(
    samples: &[&[f32]],
    shape: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [c, h, w] = shape;
    let mut data = Vec::with_capacity(samples.len() * c * h * w);
    for sample in samples {
        data.extend_from_slice(sample);
    }
    Tensor::from_data(TensorData::new(data, [samples.len(), c, h, w]), device)
}

/// Normalized `[N, C, T, T]` tensor for a list of equally sized tiles.
pub fn tiles_to_tensor<B: Backend>(
    tiles: &[DynamicImage],
    norm: &Normalization,
    device: &B::Device,
) -> error::Result<Tensor<B, 4>> {
    let Some(first) = tiles.first() else {
        return Err(DatasetError::NoTrainingData("no tiles to convert".to_owned()));
    };
    let (w, h) = (first.width() as usize, first.height() as usize);

    let samples = tiles
        .iter()
        .map(|tile| norm.image_to_chw(tile))
        .collect::<error::Result<Vec<_>>>()?;
    let views = samples.iter().map(Vec::as_slice).collect::<Vec<_>>();
    Ok(stack_samples(&views, [norm.channels(), h, w], device))
}

/// `[N, classes, T, T]` binary targets. Each sample holds one mask tile per class.
pub fn masks_to_tensor<B: Backend>(samples: &[Vec<GrayImage>], device: &B::Device) -> error::Result<Tensor<B, 4>> {
    let Some(first) = samples.first().and_then(|masks| masks.first()) else {
        return Err(DatasetError::NoTrainingData("no masks to convert".to_owned()));
    };
    let (w, h) = (first.width() as usize, first.height() as usize);
    let classes = samples[0].len();

    let planes = samples.iter().map(|masks| masks_to_planes(masks)).collect::<Vec<_>>();
    let views = planes.iter().map(Vec::as_slice).collect::<Vec<_>>();
    Ok(stack_samples(&views, [classes, h, w], device))
}

/// Converts `[N, classes, H, W]` probabilities into grey images, per sample and class.
pub async fn tensor_to_tiles<B: Backend>(probabilities: Tensor<B, 4>) -> error::Result<Vec<Vec<GrayImage>>> {
    let [n, classes, h, w] = probabilities.dims();
    let values = probabilities
        .into_data_async()
        .await
        .to_vec::<f32>()
        .map_err(|e| DatasetError::Task(format!("{e:?}")))?;

    let plane = h * w;
    Ok((0..n)
        .map(|sample| {
            (0..classes)
                .map(|class| {
                    let offset = (sample * classes + class) * plane;
                    let data = &values[offset..offset + plane];
                    GrayImage::from_fn(w as u32, h as u32, |x, y| {
                        let p = data[y as usize * w + x as usize];
                        Luma([(p * 255.0).round().clamp(0.0, 255.0) as u8])
                    })
                })
                .collect()
        })
        .collect())
}
