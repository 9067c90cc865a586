use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::Distribution;

use crate::attention::{ChannelAttention, ChannelAttentionConfig};

/// Dropout probability used by double convolution blocks.
pub const BLOCK_DROPOUT: f64 = 0.2;

/// `[to, from]` row-major bilinear weights with half-pixel centers, edges clamped.
fn interpolation_weights(from: usize, to: usize) -> Vec<f32> {
    let mut weights = vec![0.0; to * from];
    let scale = from as f32 / to as f32;
    let last = from.saturating_sub(1);
    for i in 0..to {
        let src = ((i as f32 + 0.5) * scale - 0.5).clamp(0.0, last as f32);
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(last);
        let frac = src - lo as f32;
        weights[i * from + lo] += 1.0 - frac;
        weights[i * from + hi] += frac;
    }
    weights
}

/// Bilinearly resize a feature map to `[height, width]`. Returns the input untouched when it
/// already has that size.
///
/// Written as `rows · x · colsᵀ` so the gradient only needs matmul, which every backend
/// differentiates.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    if [h, w] == size {
        return x;
    }
    let [out_h, out_w] = size;
    let device = x.device();

    let rows = Tensor::<B, 2>::from_data(
        TensorData::new(interpolation_weights(h, out_h), [out_h, h]),
        &device,
    )
    .unsqueeze::<4>()
    .expand([n, c, out_h, h]);
    let cols = Tensor::<B, 2>::from_data(
        TensorData::new(interpolation_weights(w, out_w), [out_w, w]),
        &device,
    )
    .transpose()
    .unsqueeze::<4>()
    .expand([n, c, w, out_w]);

    rows.matmul(x).matmul(cols)
}

/// Spatial size of a `[N, C, H, W]` tensor.
pub fn spatial<B: Backend>(x: &Tensor<B, 4>) -> [usize; 2] {
    let [_, _, h, w] = x.dims();
    [h, w]
}

#[derive(Module, Debug)]
pub enum Norm<B: Backend> {
    Batch(BatchNorm<B, 2>),
    Instance(InstanceNorm<B>),
}

impl<B: Backend> Norm<B> {
    fn new(channels: usize, instance: bool, device: &B::Device) -> Self {
        if instance {
            Norm::Instance(InstanceNormConfig::new(channels).init(device))
        } else {
            Norm::Batch(BatchNormConfig::new(channels).init(device))
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Norm::Batch(norm) => norm.forward(x),
            Norm::Instance(norm) => norm.forward(x),
        }
    }
}

/// Drops whole feature channels. Only active while gradients are tracked.
#[derive(Module, Clone, Debug)]
pub struct ChannelDropout {
    prob: f64,
}

impl ChannelDropout {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if !B::ad_enabled() || self.prob <= 0.0 {
            return x;
        }
        let [n, c, _, _] = x.dims();
        let keep = 1.0 - self.prob;
        let mask = Tensor::<B, 4>::random([n, c, 1, 1], Distribution::Bernoulli(keep), &x.device());
        x * mask / keep
    }
}

#[derive(Config, Debug)]
pub struct DoubleConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = false)]
    pub instance_norm: bool,
    #[config(default = false)]
    pub dropout: bool,
    #[config(default = false)]
    pub channel_attention: bool,
}

impl DoubleConvConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DoubleConv<B> {
        let conv = |c_in: usize| {
            Conv2dConfig::new([c_in, self.out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        DoubleConv {
            conv1: conv(self.in_channels),
            norm1: Norm::new(self.out_channels, self.instance_norm, device),
            conv2: conv(self.out_channels),
            norm2: Norm::new(self.out_channels, self.instance_norm, device),
            dropout: self.dropout.then(|| ChannelDropout::new(BLOCK_DROPOUT)),
            attention: self
                .channel_attention
                .then(|| ChannelAttentionConfig::new(self.out_channels).init(device)),
        }
    }
}

/// Two 3x3 conv -> norm -> relu stages that preserve the spatial size.
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    conv1: Conv2d<B>,
    norm1: Norm<B>,
    conv2: Conv2d<B>,
    norm2: Norm<B>,
    dropout: Option<ChannelDropout>,
    attention: Option<ChannelAttention<B>>,
}

impl<B: Backend> DoubleConv<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.norm1.forward(self.conv1.forward(x)));
        let x = relu(self.norm2.forward(self.conv2.forward(x)));
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        match &self.attention {
            Some(attention) => attention.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct DownSampleConfig {
    pub channels: usize,
    #[config(default = true)]
    pub pooling: bool,
    #[config(default = false)]
    pub strided_conv: bool,
    #[config(default = false)]
    pub interpolation: bool,
}

impl DownSampleConfig {
    /// Picks the first enabled strategy out of pooling, interpolation and strided convolution.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DownSample<B> {
        let mut down = DownSample {
            pool: None,
            strided: None,
            interpolate: false,
        };

        if self.pooling {
            down.pool = Some(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());
        } else if self.interpolation {
            down.interpolate = true;
        } else if self.strided_conv {
            down.strided = Some(
                Conv2dConfig::new([self.channels, self.channels], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
        }
        down
    }
}

#[derive(Module, Debug)]
pub struct DownSample<B: Backend> {
    pool: Option<MaxPool2d>,
    strided: Option<Conv2d<B>>,
    interpolate: bool,
}

impl<B: Backend> DownSample<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(pool) = &self.pool {
            return pool.forward(x);
        }
        if self.interpolate {
            let [h, w] = spatial(&x);
            return resize_bilinear(x, [(h / 2).max(1), (w / 2).max(1)]);
        }
        match &self.strided {
            Some(conv) => conv.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct UpSampleConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = false)]
    pub interpolation: bool,
}

impl UpSampleConfig {
    /// Channel count of the up-sampled tensor. Interpolation keeps the input channels.
    pub fn output_channels(&self) -> usize {
        if self.interpolation {
            self.in_channels
        } else {
            self.out_channels
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UpSample<B> {
        UpSample {
            transposed: (!self.interpolation).then(|| {
                ConvTranspose2dConfig::new([self.in_channels, self.out_channels], [2, 2])
                    .with_stride([2, 2])
                    .init(device)
            }),
        }
    }
}

#[derive(Module, Debug)]
pub struct UpSample<B: Backend> {
    transposed: Option<ConvTranspose2d<B>>,
}

impl<B: Backend> UpSample<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.transposed {
            Some(conv) => conv.forward(x),
            None => {
                let [h, w] = spatial(&x);
                resize_bilinear(x, [h * 2, w * 2])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn double_conv_keeps_spatial_size() {
        let device = Default::default();
        let block = DoubleConvConfig::new(3, 8)
            .with_instance_norm(true)
            .with_channel_attention(true)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 3, 12, 10], Distribution::Default, &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 12, 10]);
    }

    #[test]
    fn down_sampling_strategies_halve() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 16, 16], &device);

        let pool = DownSampleConfig::new(4).init::<TestBackend>(&device);
        assert_eq!(pool.forward(x.clone()).dims(), [1, 4, 8, 8]);

        let strided = DownSampleConfig::new(4)
            .with_pooling(false)
            .with_strided_conv(true)
            .init::<TestBackend>(&device);
        assert_eq!(strided.forward(x.clone()).dims(), [1, 4, 8, 8]);

        let interp = DownSampleConfig::new(4)
            .with_pooling(false)
            .with_interpolation(true)
            .init::<TestBackend>(&device);
        assert_eq!(interp.forward(x.clone()).dims(), [1, 4, 8, 8]);

        let identity = DownSampleConfig::new(4)
            .with_pooling(false)
            .init::<TestBackend>(&device);
        assert_eq!(identity.forward(x).dims(), [1, 4, 16, 16]);
    }

    #[test]
    fn up_sampling_channels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 4, 4], &device);

        let conv = UpSampleConfig::new(8, 4);
        assert_eq!(conv.output_channels(), 4);
        assert_eq!(conv.init::<TestBackend>(&device).forward(x.clone()).dims(), [1, 4, 8, 8]);

        let interp = UpSampleConfig::new(8, 4).with_interpolation(true);
        assert_eq!(interp.output_channels(), 8);
        assert_eq!(interp.init::<TestBackend>(&device).forward(x).dims(), [1, 8, 8, 8]);
    }

    #[test]
    fn bilinear_resize_keeps_constants_and_blends_neighbours() {
        let device = Default::default();
        let flat = Tensor::<TestBackend, 4>::full([2, 3, 9, 7], 0.25, &device);
        let resized = resize_bilinear(flat, [18, 4]);
        assert_eq!(resized.dims(), [2, 3, 18, 4]);
        for v in resized.into_data().to_vec::<f32>().unwrap() {
            assert!((v - 0.25).abs() < 1e-6);
        }

        // Halving a 2-wide ramp lands on the midpoint.
        let ramp = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device).reshape([1, 1, 1, 2]);
        let half = resize_bilinear(ramp, [1, 1]).into_data().to_vec::<f32>().unwrap();
        assert!((half[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn bilinear_resize_is_differentiable() {
        type AutodiffBackend = burn::backend::Autodiff<NdArray>;
        let device = Default::default();
        let x = Tensor::<AutodiffBackend, 4>::ones([1, 2, 5, 5], &device).require_grad();
        let grads = resize_bilinear(x.clone(), [8, 3]).sum().backward();
        let grad = x.grad(&grads).unwrap();
        assert_eq!(grad.dims(), [1, 2, 5, 5]);
        // Every output row and column distributes a total weight of one.
        let total = grad.sum().into_scalar();
        assert!((total - 48.0).abs() < 1e-4);
    }

    #[test]
    fn channel_dropout_is_inactive_without_autodiff() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);
        let out = ChannelDropout::new(0.5).forward(x.clone());
        out.into_data().assert_eq(&x.into_data(), true);
    }
}
