use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

use crate::blocks::{
    resize_bilinear, spatial, DoubleConv, DoubleConvConfig, DownSample, DownSampleConfig, UpSample,
    UpSampleConfig,
};
use crate::config::ModelConfig;

pub(crate) fn double_conv<B: Backend>(
    config: &ModelConfig,
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> DoubleConv<B> {
    DoubleConvConfig::new(in_channels, out_channels)
        .with_instance_norm(config.use_instance_norm)
        .with_dropout(config.use_dropout)
        .with_channel_attention(config.use_channel_attention)
        .init(device)
}

pub(crate) fn down_sample<B: Backend>(
    config: &ModelConfig,
    channels: usize,
    device: &B::Device,
) -> DownSample<B> {
    DownSampleConfig::new(channels)
        .with_pooling(config.use_pooling)
        .with_strided_conv(config.use_strided_conv)
        .with_interpolation(config.use_interpolation_down)
        .init(device)
}

pub(crate) fn up_sample_config(config: &ModelConfig, in_channels: usize, out_channels: usize) -> UpSampleConfig {
    UpSampleConfig::new(in_channels, out_channels).with_interpolation(config.use_interpolation_up)
}

pub(crate) fn output_head<B: Backend>(config: &ModelConfig, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([config.first_filter, config.num_classes], [1, 1]).init(device)
}

/// Contracting path shared by the baseline and attention networks.
#[derive(Module, Debug)]
pub(crate) struct Encoder<B: Backend> {
    stages: Vec<DoubleConv<B>>,
    down: Vec<DownSample<B>>,
    bottleneck: DoubleConv<B>,
}

impl<B: Backend> Encoder<B> {
    pub(crate) fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let filters = config.filters();
        let mut stages = Vec::with_capacity(config.depth);
        let mut down = Vec::with_capacity(config.depth);

        let mut in_channels = config.in_channels;
        for &out_channels in &filters[..config.depth] {
            stages.push(double_conv(config, in_channels, out_channels, device));
            down.push(down_sample(config, out_channels, device));
            in_channels = out_channels;
        }

        Self {
            stages,
            down,
            bottleneck: double_conv(config, in_channels, filters[config.depth], device),
        }
    }

    /// Returns the bottleneck output and the skips, shallowest first.
    pub(crate) fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut skips = Vec::with_capacity(self.stages.len());
        let mut x = input;
        for (stage, down) in self.stages.iter().zip(&self.down) {
            x = stage.forward(x);
            skips.push(x.clone());
            x = down.forward(x);
        }
        (self.bottleneck.forward(x), skips)
    }
}

/// One expanding step: up-sample, reconcile with the skip, concatenate, convolve.
#[derive(Module, Debug)]
pub(crate) struct DecoderStage<B: Backend> {
    up: UpSample<B>,
    conv: DoubleConv<B>,
}

impl<B: Backend> DecoderStage<B> {
    /// Stages ordered from the deepest to the shallowest level, together with the channel
    /// count of each up-sampled tensor.
    pub(crate) fn build_all(config: &ModelConfig, device: &B::Device) -> Vec<(Self, usize)> {
        let filters = config.filters();
        (0..config.depth)
            .rev()
            .map(|level| {
                let up = up_sample_config(config, filters[level + 1], filters[level]);
                let up_channels = up.output_channels();
                let stage = Self {
                    up: up.init(device),
                    conv: double_conv(config, up_channels + filters[level], filters[level], device),
                };
                (stage, up_channels)
            })
            .collect()
    }

    /// Up-samples `x` and resizes `skip` to match it when the spatial sizes differ.
    pub(crate) fn up(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let up = self.up.forward(x);
        let skip = resize_bilinear(skip, spatial(&up));
        (up, skip)
    }

    pub(crate) fn merge(&self, up: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(Tensor::cat(vec![up, skip], 1))
    }
}

#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    encoder: Encoder<B>,
    decoder: Vec<DecoderStage<B>>,
    output: Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        Self {
            encoder: Encoder::new(config, device),
            decoder: DecoderStage::build_all(config, device)
                .into_iter()
                .map(|(stage, _)| stage)
                .collect(),
            output: output_head(config, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let size = spatial(&input);
        let (mut x, mut skips) = self.encoder.forward(input);
        for stage in &self.decoder {
            let Some(skip) = skips.pop() else { break };
            let (up, skip) = stage.up(x, skip);
            x = stage.merge(up, skip);
        }
        // Sides not divisible by 2^depth lose pixels on the way down.
        self.output.forward(resize_bilinear(x, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn output_matches_input_resolution() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_depth(2)
            .with_first_filter(8)
            .with_num_classes(2)
            .with_architecture(Architecture::Baseline);
        let model = UNet::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [2, 2, 32, 32]);
    }

    #[test]
    fn interpolation_paths_handle_odd_sizes() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_in_channels(3)
            .with_depth(2)
            .with_first_filter(4)
            .with_use_pooling(false)
            .with_use_interpolation_down(true)
            .with_use_interpolation_up(true);
        let model = UNet::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 30, 30], &device);
        assert_eq!(model.forward(x).dims(), [1, 1, 30, 30]);
    }

    #[test]
    fn odd_tiles_come_back_at_input_size() {
        let device = Default::default();
        let config = ModelConfig::new().with_depth(2).with_first_filter(4);
        let model = UNet::<TestBackend>::new(&config, &device);
        for side in [18, 30, 13] {
            let x = Tensor::<TestBackend, 4>::zeros([1, 1, side, side + 3], &device);
            assert_eq!(model.forward(x).dims(), [1, 1, side, side + 3]);
        }
    }

    #[test]
    fn strided_convolution_downsampling() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_depth(3)
            .with_first_filter(4)
            .with_use_pooling(false)
            .with_use_strided_conv(true);
        let model = UNet::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 24, 24], &device);
        assert_eq!(model.forward(x).dims(), [1, 1, 24, 24]);
    }
}
