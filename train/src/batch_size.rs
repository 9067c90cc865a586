use model::{Architecture, ModelConfig};

const GIB: u64 = 1024 * 1024 * 1024;
const CONVS_PER_BLOCK: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Gpu,
}

impl ComputeDevice {
    fn backward_multiplier(self) -> f64 {
        match self {
            ComputeDevice::Gpu => 5.0,
            ComputeDevice::Cpu => 3.0,
        }
    }
}

fn safety_fraction(memory: u64) -> f64 {
    if memory <= 4 * GIB {
        0.55
    } else if memory <= 6 * GIB {
        0.60
    } else if memory <= 12 * GIB {
        0.70
    } else {
        0.90
    }
}

/// Rough count of activation elements one `height`×`width` sample keeps alive
/// through a forward pass of the configured network.
fn activation_elements(config: &ModelConfig, height: usize, width: usize) -> f64 {
    let depth = config.depth.max(1);
    let first_filter = config.first_filter.max(4);
    let attention = config.architecture == Architecture::Attention;

    let (mut h, mut w) = (height as f64, width as f64);
    let mut sum = 0.0;

    for i in 0..depth {
        let c = (first_filter << i) as f64;
        sum += CONVS_PER_BLOCK * h * w * c;
        if config.use_channel_attention {
            sum += h * w * c * 1.2;
        }
        // Skip buffer.
        sum += h * w * c;
        if config.use_strided_conv {
            sum += h * w * c;
        }
        if config.use_interpolation_down {
            h = (h * 0.5).floor().max(1.0);
            w = (w * 0.5).floor().max(1.0);
        } else {
            h = ((h + 1.0) / 2.0).floor().max(1.0);
            w = ((w + 1.0) / 2.0).floor().max(1.0);
        }
    }

    let bottleneck = (first_filter << depth) as f64;
    sum += CONVS_PER_BLOCK * h * w * bottleneck;
    if attention {
        sum += h * w * bottleneck * 0.7;
    }

    for i in (0..depth).rev() {
        let c = (first_filter << i) as f64;
        if !config.use_interpolation_up {
            sum += h * w * c;
        }
        h *= 2.0;
        w *= 2.0;
        sum += h * w * 2.0 * c;
        sum += CONVS_PER_BLOCK * h * w * c;
        if attention {
            sum += h * w * c * 1.2;
        }
    }
    sum
}

/// Estimated training memory of one sample in bytes.
pub fn bytes_per_sample(
    config: &ModelConfig,
    tile: usize,
    device: ComputeDevice,
    half_precision: bool,
) -> f64 {
    let bytes_per_element = if half_precision { 2.0 } else { 4.0 };
    let pixels = (tile * tile) as f64;
    let input = pixels * config.in_channels as f64 * bytes_per_element;
    let output = pixels * config.num_classes as f64 * bytes_per_element;
    let io = (input + output) * 1.2;

    activation_elements(config, tile, tile) * bytes_per_element * device.backward_multiplier() + io
}

/// Largest batch that should fit into `available_memory` bytes, never below 1.
/// Large batches are rounded down to a multiple of 4, medium ones to a multiple of 2.
pub fn estimate_batch_size(
    config: &ModelConfig,
    tile: usize,
    available_memory: u64,
    device: ComputeDevice,
    half_precision: bool,
) -> usize {
    if tile == 0 || config.in_channels == 0 || available_memory == 0 {
        return 1;
    }

    let per_sample = bytes_per_sample(config, tile, device, half_precision);
    let usable = available_memory as f64 * safety_fraction(available_memory);
    let batch = (usable / per_sample).floor().max(1.0) as usize;

    let batch = if batch >= 16 {
        batch / 4 * 4
    } else if batch >= 8 {
        batch / 2 * 2
    } else {
        batch
    };
    log::info!("Estimated batch size {batch} for {tile}px tiles and {available_memory} bytes");
    batch.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::ModelComplexity;

    fn memory_for(config: &ModelConfig, samples: f64) -> u64 {
        let bytes = bytes_per_sample(config, 96, ComputeDevice::Gpu, false) * samples;
        (bytes / safety_fraction(bytes as u64)).ceil() as u64
    }

    #[test]
    fn rounds_to_clean_batch_sizes() {
        let config = ModelComplexity::Low.config(1, 1);
        let estimate = |samples| estimate_batch_size(&config, 96, memory_for(&config, samples), ComputeDevice::Gpu, false);
        assert_eq!(estimate(19.5), 16);
        assert_eq!(estimate(9.5), 8);
        assert_eq!(estimate(5.5), 5);
    }

    #[test]
    fn invalid_inputs_fall_back_to_one() {
        let config = ModelComplexity::Medium.config(1, 1);
        assert_eq!(estimate_batch_size(&config, 0, 1 << 30, ComputeDevice::Cpu, false), 1);
        assert_eq!(estimate_batch_size(&config, 96, 0, ComputeDevice::Cpu, false), 1);
        assert_eq!(estimate_batch_size(&config, 96, 1024, ComputeDevice::Cpu, false), 1);
    }

    #[test]
    fn half_precision_and_cpu_fit_more() {
        let config = ModelComplexity::Medium.config(1, 1);
        let memory = 8 * GIB;
        let full = estimate_batch_size(&config, 128, memory, ComputeDevice::Gpu, false);
        let half = estimate_batch_size(&config, 128, memory, ComputeDevice::Gpu, true);
        let cpu = estimate_batch_size(&config, 128, memory, ComputeDevice::Cpu, false);
        assert!(half > full);
        assert!(cpu > full);
    }
}
