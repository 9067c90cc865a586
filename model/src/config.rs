use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{self, ModelError};
use crate::SegmentationModel;

/// Deepest supported encoder. A 2^8 downsampling already needs tiles of at least 256 pixels.
pub const MAX_DEPTH: usize = 8;

/// Network family to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// Encoder-decoder with plain skip connections.
    Baseline,
    /// Self-attention bottleneck and attention-gated skips.
    Attention,
    /// Dense triangular decoder grid (UNet++).
    Nested,
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Input channels, 1 for greyscale and 3 for RGB.
    #[config(default = 1)]
    pub in_channels: usize,
    /// Number of predicted feature classes.
    #[config(default = 1)]
    pub num_classes: usize,
    /// Number of encoder/decoder stages.
    #[config(default = 3)]
    pub depth: usize,
    /// Filters of the first stage. Stage i has `first_filter << i`.
    #[config(default = 64)]
    pub first_filter: usize,
    #[config(default = "Architecture::Baseline")]
    pub architecture: Architecture,
    #[config(default = true)]
    pub use_pooling: bool,
    #[config(default = false)]
    pub use_strided_conv: bool,
    /// Halve feature maps with bilinear resizing instead of a learned layer.
    #[config(default = false)]
    pub use_interpolation_down: bool,
    /// Double feature maps with bilinear resizing instead of a transposed convolution.
    #[config(default = false)]
    pub use_interpolation_up: bool,
    #[config(default = false)]
    pub use_instance_norm: bool,
    #[config(default = false)]
    pub use_dropout: bool,
    #[config(default = false)]
    pub use_channel_attention: bool,
    /// Combine attention heads with learned fusion weights.
    #[config(default = false)]
    pub use_adaptive_attention_fusion: bool,
    /// Use a single attention head in the bottleneck instead of multi-head attention.
    #[config(default = false)]
    pub use_single_head_attention: bool,
}

impl ModelConfig {
    pub fn filters(&self) -> Vec<usize> {
        (0..=self.depth).map(|i| self.first_filter << i).collect()
    }

    pub fn bottleneck_channels(&self) -> usize {
        self.first_filter << self.depth
    }

    /// Heads of the bottleneck self-attention, `2^(depth-1)` clamped to 2..=8.
    pub fn attention_heads(&self) -> usize {
        (1usize << self.depth.saturating_sub(1).min(4)).clamp(2, 8)
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.depth == 0 {
            return Err(ModelError::ZeroDepth);
        }
        if self.depth > MAX_DEPTH {
            return Err(ModelError::DepthTooLarge {
                depth: self.depth,
                max: MAX_DEPTH,
            });
        }
        if self.in_channels == 0 {
            return Err(ModelError::ZeroChannels("in_channels"));
        }
        if self.num_classes == 0 {
            return Err(ModelError::ZeroChannels("num_classes"));
        }
        if self.first_filter == 0 {
            return Err(ModelError::ZeroChannels("first_filter"));
        }
        if self.first_filter.checked_mul(1 << self.depth).is_none() {
            return Err(ModelError::FilterOverflow {
                first_filter: self.first_filter,
                depth: self.depth,
            });
        }
        // An even first filter times 2^depth is always divisible by the (at most 8) heads.
        if self.architecture == Architecture::Attention && self.first_filter % 2 != 0 {
            return Err(ModelError::OddFirstFilter(self.first_filter));
        }
        Ok(())
    }

    /// Builds the configured network. Configuration errors surface here, never in `forward`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<SegmentationModel<B>> {
        self.validate()?;
        let model = match self.architecture {
            Architecture::Baseline => SegmentationModel::Baseline(crate::unet::UNet::new(self, device)),
            Architecture::Attention => {
                SegmentationModel::Attention(crate::attention_unet::AttentionUNet::new(self, device)?)
            }
            Architecture::Nested => {
                SegmentationModel::Nested(crate::nested_unet::NestedUNet::new(self, device))
            }
        };
        log::info!(
            "Built {:?} network, depth {} first filter {} ({} parameters)",
            self.architecture,
            self.depth,
            self.first_filter,
            model.num_params()
        );
        Ok(model)
    }
}

/// Preset network sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelComplexity {
    Low,
    Medium,
    High,
}

impl ModelComplexity {
    pub fn config(self, in_channels: usize, num_classes: usize) -> ModelConfig {
        let (depth, first_filter) = match self {
            ModelComplexity::Low => (2, 32),
            ModelComplexity::Medium => (3, 64),
            ModelComplexity::High => (4, 96),
        };
        ModelConfig::new()
            .with_in_channels(in_channels)
            .with_num_classes(num_classes)
            .with_depth(depth)
            .with_first_filter(first_filter)
            .with_use_pooling(true)
            .with_use_interpolation_down(false)
            .with_use_interpolation_up(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_count_is_clamped() {
        let heads = |depth| ModelConfig::new().with_depth(depth).attention_heads();
        assert_eq!(heads(1), 2);
        assert_eq!(heads(2), 2);
        assert_eq!(heads(3), 4);
        assert_eq!(heads(4), 8);
        assert_eq!(heads(9), 8);
    }

    #[test]
    fn attention_requires_even_filters() {
        let config = ModelConfig::new()
            .with_architecture(Architecture::Attention)
            .with_first_filter(15);
        assert!(matches!(config.validate(), Err(ModelError::OddFirstFilter(15))));
    }

    #[test]
    fn even_filters_always_split_into_heads() {
        for depth in 1..=MAX_DEPTH {
            for first_filter in [2, 6, 10, 64, 96] {
                let config = ModelConfig::new()
                    .with_architecture(Architecture::Attention)
                    .with_depth(depth)
                    .with_first_filter(first_filter);
                assert!(config.validate().is_ok());
                assert_eq!(config.bottleneck_channels() % config.attention_heads(), 0);
            }
        }
    }

    #[test]
    fn depth_and_filters_are_bounded() {
        assert!(matches!(
            ModelConfig::new().with_depth(MAX_DEPTH + 1).validate(),
            Err(ModelError::DepthTooLarge { depth: 9, max: 8 })
        ));
        assert!(matches!(
            ModelConfig::new().with_depth(200).validate(),
            Err(ModelError::DepthTooLarge { .. })
        ));
        assert!(matches!(
            ModelConfig::new().with_depth(4).with_first_filter(usize::MAX / 4).validate(),
            Err(ModelError::FilterOverflow { depth: 4, .. })
        ));
        assert_eq!(ModelConfig::new().with_depth(MAX_DEPTH).with_first_filter(4).bottleneck_channels(), 1024);
    }

    #[test]
    fn filters_double_per_stage() {
        let config = ModelComplexity::Low.config(1, 1);
        assert_eq!(config.filters(), vec![32, 64, 128]);
        assert_eq!(config.bottleneck_channels(), 128);
        assert!(matches!(
            ModelConfig::new().with_depth(0).validate(),
            Err(ModelError::ZeroDepth)
        ));
    }
}
