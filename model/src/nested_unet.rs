use burn::nn::conv::Conv2d;
use burn::prelude::*;

use crate::blocks::{resize_bilinear, spatial, DoubleConv, DownSample, UpSample};
use crate::config::ModelConfig;
use crate::unet::{double_conv, down_sample, output_head, up_sample_config};

/// Decoder node (level, step) of the nested grid.
#[derive(Module, Debug)]
struct NestedNode<B: Backend> {
    up: UpSample<B>,
    conv: DoubleConv<B>,
}

/// UNet++: every decoder node sees all earlier nodes of its level.
#[derive(Module, Debug)]
pub struct NestedUNet<B: Backend> {
    encoder: Vec<DoubleConv<B>>,
    down: Vec<DownSample<B>>,
    // Indexed [step][level], step j holds depth - j nodes.
    nodes: Vec<Vec<NestedNode<B>>>,
    output: Conv2d<B>,
}

impl<B: Backend> NestedUNet<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let depth = config.depth;
        let filters = config.filters();

        let mut encoder = Vec::with_capacity(depth + 1);
        let mut down = Vec::with_capacity(depth);
        let mut in_channels = config.in_channels;
        for (level, &out_channels) in filters.iter().enumerate() {
            encoder.push(double_conv(config, in_channels, out_channels, device));
            if level < depth {
                down.push(down_sample(config, out_channels, device));
            }
            in_channels = out_channels;
        }

        let nodes = (0..depth)
            .map(|step| {
                (0..depth - step)
                    .map(|level| {
                        let up = up_sample_config(config, filters[level + 1], filters[level]);
                        let in_channels = up.output_channels() + (step + 1) * filters[level];
                        NestedNode {
                            up: up.init(device),
                            conv: double_conv(config, in_channels, filters[level], device),
                        }
                    })
                    .collect()
            })
            .collect();

        Self {
            encoder,
            down,
            nodes,
            output: output_head(config, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let depth = self.nodes.len();

        let mut features: Vec<Tensor<B, 4>> = Vec::with_capacity(self.encoder.len());
        let mut x = input;
        for (level, stage) in self.encoder.iter().enumerate() {
            x = stage.forward(x);
            features.push(x.clone());
            if let Some(down) = self.down.get(level) {
                x = down.forward(x);
            }
        }

        // grid[step][level], filled column by column so every input already exists.
        let mut grid: Vec<Vec<Tensor<B, 4>>> = Vec::with_capacity(depth);
        for (step, column) in self.nodes.iter().enumerate() {
            let mut outputs = Vec::with_capacity(column.len());
            for (level, node) in column.iter().enumerate() {
                let below = if step == 0 {
                    features[level + 1].clone()
                } else {
                    grid[step - 1][level + 1].clone()
                };
                let skip = features[level].clone();
                let up = resize_bilinear(node.up.forward(below), spatial(&skip));

                let mut inputs = Vec::with_capacity(step + 2);
                inputs.push(up);
                inputs.extend(grid.iter().map(|previous| previous[level].clone()));
                inputs.push(skip);
                outputs.push(node.conv.forward(Tensor::cat(inputs, 1)));
            }
            grid.push(outputs);
        }

        let top = grid
            .pop()
            .and_then(|mut last| last.pop())
            .unwrap_or_else(|| features.swap_remove(0));
        self.output.forward(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn forward_shape_across_depths() {
        let device = Default::default();
        for depth in 1..=3 {
            let config = ModelConfig::new()
                .with_architecture(Architecture::Nested)
                .with_depth(depth)
                .with_first_filter(4)
                .with_num_classes(3);
            let model = NestedUNet::<TestBackend>::new(&config, &device);
            let x = Tensor::<TestBackend, 4>::zeros([1, 1, 16, 16], &device);
            assert_eq!(model.forward(x).dims(), [1, 3, 16, 16]);
        }
    }

    #[test]
    fn odd_tiles_come_back_at_input_size() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_architecture(Architecture::Nested)
            .with_depth(2)
            .with_first_filter(4);
        let model = NestedUNet::<TestBackend>::new(&config, &device);
        for side in [18, 30] {
            let x = Tensor::<TestBackend, 4>::zeros([1, 1, side, side], &device);
            assert_eq!(model.forward(x).dims(), [1, 1, side, side]);
        }
    }

    #[test]
    fn grid_is_triangular() {
        let device = Default::default();
        let config = ModelConfig::new().with_depth(3).with_first_filter(4);
        let model = NestedUNet::<TestBackend>::new(&config, &device);
        let sizes = model.nodes.iter().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 2, 1]);
    }

    #[test]
    fn interpolated_upsampling() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_depth(2)
            .with_first_filter(4)
            .with_use_interpolation_up(true);
        let model = NestedUNet::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 8, 8], &device);
        assert_eq!(model.forward(x).dims(), [2, 1, 8, 8]);
    }
}
