use burn::nn::conv::Conv2d;
use burn::prelude::*;

use crate::attention::{
    AttentionGate, AttentionGateConfig, MultiHeadSelfAttention, MultiHeadSelfAttentionConfig,
    SelfAttention, SelfAttentionConfig,
};
use crate::blocks::{resize_bilinear, spatial};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::unet::{output_head, DecoderStage, Encoder};

#[derive(Module, Debug)]
pub enum BottleneckAttention<B: Backend> {
    Single(SelfAttention<B>),
    Multi(MultiHeadSelfAttention<B>),
}

impl<B: Backend> BottleneckAttention<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            BottleneckAttention::Single(attention) => attention.forward(x),
            BottleneckAttention::Multi(attention) => attention.forward(x),
        }
    }
}

/// UNet with a self-attention bottleneck and attention-gated skip connections.
#[derive(Module, Debug)]
pub struct AttentionUNet<B: Backend> {
    encoder: Encoder<B>,
    attention: BottleneckAttention<B>,
    decoder: Vec<DecoderStage<B>>,
    gates: Vec<AttentionGate<B>>,
    output: Conv2d<B>,
}

impl<B: Backend> AttentionUNet<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        let attention = if config.use_single_head_attention {
            BottleneckAttention::Single(SelfAttentionConfig::new(config.bottleneck_channels()).init(device))
        } else {
            BottleneckAttention::Multi(
                MultiHeadSelfAttentionConfig::new(config.bottleneck_channels(), config.attention_heads())
                    .with_adaptive_fusion(config.use_adaptive_attention_fusion)
                    .init(device)?,
            )
        };

        let filters = config.filters();
        let mut decoder = Vec::with_capacity(config.depth);
        let mut gates = Vec::with_capacity(config.depth);
        for ((stage, up_channels), level) in DecoderStage::build_all(config, device)
            .into_iter()
            .zip((0..config.depth).rev())
        {
            decoder.push(stage);
            gates.push(AttentionGateConfig::new(filters[level], up_channels, filters[level]).init(device));
        }

        Ok(Self {
            encoder: Encoder::new(config, device),
            attention,
            decoder,
            gates,
            output: output_head(config, device),
        })
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let size = spatial(&input);
        let (x, mut skips) = self.encoder.forward(input);
        let mut x = self.attention.forward(x);
        for (stage, gate) in self.decoder.iter().zip(&self.gates) {
            let Some(skip) = skips.pop() else { break };
            let (up, skip) = stage.up(x, skip);
            let gated = gate.forward(skip, up.clone());
            x = stage.merge(up, gated);
        }
        self.output.forward(resize_bilinear(x, size))
    }
}
