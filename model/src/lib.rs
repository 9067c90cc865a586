#![recursion_limit = "256"]

use burn::backend::Autodiff;
use burn::prelude::*;

pub mod attention;
pub mod blocks;
pub mod config;

mod attention_unet;
mod error;
mod nested_unet;
mod unet;

pub use attention_unet::AttentionUNet;
pub use config::{Architecture, ModelComplexity, ModelConfig, MAX_DEPTH};
pub use error::{ModelError, Result};
pub use nested_unet::NestedUNet;
pub use unet::UNet;

#[cfg(feature = "wgpu")]
pub type MainBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
pub type MainBackend = burn::backend::NdArray;

pub type TrainBackend = Autodiff<MainBackend>;

/// Any of the supported segmentation networks. All of them map `[N, C, H, W]` images to
/// `[N, classes, H', W']` logits.
#[derive(Module, Debug)]
pub enum SegmentationModel<B: Backend> {
    Baseline(UNet<B>),
    Attention(AttentionUNet<B>),
    Nested(NestedUNet<B>),
}

impl<B: Backend> SegmentationModel<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            SegmentationModel::Baseline(model) => model.forward(input),
            SegmentationModel::Attention(model) => model.forward(input),
            SegmentationModel::Nested(model) => model.forward(input),
        }
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            SegmentationModel::Baseline(_) => Architecture::Baseline,
            SegmentationModel::Attention(_) => Architecture::Attention,
            SegmentationModel::Nested(_) => Architecture::Nested,
        }
    }
}
