use std::path::PathBuf;

use train::metrics::SegmentationStats;
use train::msg::LossReport;
use train::stopping::StopReason;

#[derive(Debug)]
pub enum PipelineMessage {
    /// Share of the dataset images that have been sliced.
    SliceProgress { percent: u32 },
    /// An epoch finished.
    Epoch(LossReport),
    /// Weights and settings were written.
    Checkpoint { path: PathBuf },
    /// An image was segmented. Stats are only present when a ground truth mask exists.
    InferProgress {
        percent: u32,
        id: String,
        stats: Option<Box<SegmentationStats>>,
    },
    /// The stopping policy ended training.
    Stopped { reason: StopReason },
    Cancelled,
    Finished,
}

/// Progress in percent after finishing item `index` of `total`. The last item is 100.
pub fn percent(index: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((index + 1) * 100 / total) as u32
}
