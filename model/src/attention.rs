use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid, softmax};

use crate::blocks::{resize_bilinear, spatial};
use crate::error::{self, ModelError};

fn pointwise<B: Backend>(c_in: usize, c_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([c_in, c_out], [1, 1]).init(device)
}

#[derive(Config, Debug)]
pub struct ChannelAttentionConfig {
    pub channels: usize,
    #[config(default = 16)]
    pub reduction: usize,
}

impl ChannelAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ChannelAttention<B> {
        let hidden = (self.channels / self.reduction.max(1)).max(1);
        ChannelAttention {
            fc1: LinearConfig::new(self.channels, hidden).init(device),
            fc2: LinearConfig::new(hidden, self.channels).init(device),
        }
    }
}

/// Squeeze-excite style per-channel gate.
#[derive(Module, Debug)]
pub struct ChannelAttention<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> ChannelAttention<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n, c, _, _] = x.dims();
        let pooled = x.clone().mean_dim(3).mean_dim(2).reshape([n, c]);
        let gate = sigmoid(self.fc2.forward(relu(self.fc1.forward(pooled))));
        x * gate.reshape([n, c, 1, 1])
    }
}

#[derive(Config, Debug)]
pub struct AttentionGateConfig {
    /// Channels of the skip connection being gated.
    pub skip_channels: usize,
    /// Channels of the decoder gating signal.
    pub gating_channels: usize,
    /// Shared projection width.
    pub inter_channels: usize,
}

impl AttentionGateConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionGate<B> {
        AttentionGate {
            theta: Conv2dConfig::new([self.skip_channels, self.inter_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            phi: pointwise(self.gating_channels, self.inter_channels, device),
            psi: pointwise(self.inter_channels, 1, device),
        }
    }
}

/// Learns a single channel spatial mask from the decoder state and applies it to a skip.
#[derive(Module, Debug)]
pub struct AttentionGate<B: Backend> {
    theta: Conv2d<B>,
    phi: Conv2d<B>,
    psi: Conv2d<B>,
}

impl<B: Backend> AttentionGate<B> {
    pub fn forward(&self, skip: Tensor<B, 4>, gating: Tensor<B, 4>) -> Tensor<B, 4> {
        let theta = self.theta.forward(skip.clone());
        let phi = resize_bilinear(self.phi.forward(gating), spatial(&theta));

        let mask = sigmoid(self.psi.forward(relu(theta + phi)));
        let mask = resize_bilinear(mask, spatial(&skip));
        skip * mask
    }
}

#[derive(Config, Debug)]
pub struct SelfAttentionConfig {
    pub channels: usize,
}

impl SelfAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SelfAttention<B> {
        let reduced = (self.channels / 8).max(1);
        SelfAttention {
            query: pointwise(self.channels, reduced, device),
            key: pointwise(self.channels, reduced, device),
            value: pointwise(self.channels, self.channels, device),
        }
    }
}

#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    query: Conv2d<B>,
    key: Conv2d<B>,
    value: Conv2d<B>,
}

impl<B: Backend> SelfAttention<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n, c, h, w] = x.dims();
        let positions = h * w;

        let q = self.query.forward(x.clone());
        let [_, reduced, _, _] = q.dims();
        let q = q.reshape([n, reduced, positions]);
        let k = self.key.forward(x.clone()).reshape([n, reduced, positions]);
        let v = self.value.forward(x.clone()).reshape([n, c, positions]);

        let attention = softmax(q.swap_dims(1, 2).matmul(k), 2);
        let out = v.matmul(attention.swap_dims(1, 2)).reshape([n, c, h, w]);
        out + x
    }
}

#[derive(Config, Debug)]
pub struct MultiHeadSelfAttentionConfig {
    pub channels: usize,
    pub heads: usize,
    /// Combine heads with a learned softmax weighting instead of concatenation.
    #[config(default = false)]
    pub adaptive_fusion: bool,
}

impl MultiHeadSelfAttentionConfig {
    /// Fails when the channel count can't be split evenly across the heads.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<MultiHeadSelfAttention<B>> {
        if self.heads == 0 || self.channels % self.heads != 0 {
            return Err(ModelError::HeadsNotDivisible {
                channels: self.channels,
                heads: self.heads,
            });
        }
        let head_channels = self.channels / self.heads;
        let projections = || {
            (0..self.heads)
                .map(|_| pointwise(self.channels, head_channels, device))
                .collect::<Vec<_>>()
        };

        Ok(MultiHeadSelfAttention {
            queries: projections(),
            keys: projections(),
            values: projections(),
            output: pointwise(self.channels, self.channels, device),
            fusion_weights: self
                .adaptive_fusion
                .then(|| Param::from_tensor(Tensor::ones([self.heads], device))),
            heads: self.heads,
            head_channels,
        })
    }
}

#[derive(Module, Debug)]
pub struct MultiHeadSelfAttention<B: Backend> {
    queries: Vec<Conv2d<B>>,
    keys: Vec<Conv2d<B>>,
    values: Vec<Conv2d<B>>,
    output: Conv2d<B>,
    fusion_weights: Option<Param<Tensor<B, 1>>>,
    heads: usize,
    head_channels: usize,
}

impl<B: Backend> MultiHeadSelfAttention<B> {
    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n, _, h, w] = x.dims();
        let positions = h * w;
        let hc = self.head_channels;
        let scale = 1.0 / (hc as f64).sqrt();

        let head_outputs = (0..self.heads)
            .map(|i| {
                let q = self.queries[i].forward(x.clone()).reshape([n, hc, positions]);
                let k = self.keys[i].forward(x.clone()).reshape([n, hc, positions]);
                let v = self.values[i].forward(x.clone()).reshape([n, hc, positions]);

                // [N, HW, HW]
                let attention = softmax(q.swap_dims(1, 2).matmul(k).mul_scalar(scale), 2);
                v.matmul(attention.swap_dims(1, 2)).reshape([n, hc, h, w])
            })
            .collect::<Vec<_>>();

        let combined = match &self.fusion_weights {
            Some(weights) => {
                // One scalar per head, replicated over the head's channels after the weighted sum.
                let weights = softmax(weights.val(), 0).reshape([self.heads, 1, 1, 1, 1]);
                let stacked: Tensor<B, 5> = Tensor::stack(head_outputs, 0);
                let fused: Tensor<B, 4> = (stacked * weights).sum_dim(0).squeeze(0);
                fused.repeat_dim(1, self.heads)
            }
            None => Tensor::cat(head_outputs, 1),
        };

        self.output.forward(combined) + x
    }
}
