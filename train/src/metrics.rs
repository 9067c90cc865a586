use image::GrayImage;
use serde::{Deserialize, Serialize};

use dataset::convert::MASK_THRESHOLD;

use crate::error::{Result, TrainError};

const EPS: f64 = 1e-8;

/// Pixel-level agreement between a prediction and its ground truth.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationStats {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
    pub iou: f64,
    pub dice: f64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub false_positive_rate: f64,
    pub specificity: f64,
    pub inference_ms: f64,
}

impl SegmentationStats {
    pub fn from_counts(tp: u64, fp: u64, fn_: u64, tn: u64) -> Self {
        let (tpf, fpf, fnf, tnf) = (tp as f64, fp as f64, fn_ as f64, tn as f64);
        Self {
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            true_negatives: tn,
            iou: tpf / (tpf + fpf + fnf + EPS),
            dice: 2.0 * tpf / (2.0 * tpf + fpf + fnf + EPS),
            precision: tpf / (tpf + fpf + EPS),
            recall: tpf / (tpf + fnf + EPS),
            accuracy: (tpf + tnf) / (tpf + tnf + fpf + fnf + EPS),
            false_positive_rate: fpf / (fpf + tnf + EPS),
            specificity: tnf / (tnf + fpf + EPS),
            inference_ms: 0.0,
        }
    }

    pub fn with_inference_ms(mut self, ms: f64) -> Self {
        self.inference_ms = ms;
        self
    }
}

/// Compares a probability map against a mask. `threshold` (in `[0, 1]`) is scaled to an
/// 8-bit cut, 0.5 becoming 127, and prediction pixels above the cut are foreground. Mask
/// pixels above 127 are, so both sides binarize alike at the default.
pub fn compute_metrics(
    prediction: &GrayImage,
    truth: &GrayImage,
    threshold: f32,
) -> Result<SegmentationStats> {
    if prediction.dimensions() != truth.dimensions() {
        return Err(TrainError::MetricSize {
            prediction: prediction.dimensions(),
            truth: truth.dimensions(),
        });
    }
    let cut = (threshold.clamp(0.0, 1.0) * 255.0).floor() as u8;

    let (mut tp, mut fp, mut fn_, mut tn) = (0, 0, 0, 0);
    for (&p, &t) in prediction.as_raw().iter().zip(truth.as_raw()) {
        match (p > cut, t > MASK_THRESHOLD) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => tn += 1,
        }
    }
    Ok(SegmentationStats::from_counts(tp, fp, fn_, tn))
}

/// Macro average (mean of the per-image metrics) and micro average (metrics of the
/// summed counts). Counts are summed in both.
pub fn aggregate(stats: &[SegmentationStats]) -> (SegmentationStats, SegmentationStats) {
    if stats.is_empty() {
        return Default::default();
    }
    let n = stats.len() as f64;
    let sum = |f: fn(&SegmentationStats) -> u64| stats.iter().map(f).sum::<u64>();
    let mean = |f: fn(&SegmentationStats) -> f64| stats.iter().map(f).sum::<f64>() / n;

    let micro = SegmentationStats::from_counts(
        sum(|s| s.true_positives),
        sum(|s| s.false_positives),
        sum(|s| s.false_negatives),
        sum(|s| s.true_negatives),
    )
    .with_inference_ms(mean(|s| s.inference_ms));

    let macro_ = SegmentationStats {
        iou: mean(|s| s.iou),
        dice: mean(|s| s.dice),
        precision: mean(|s| s.precision),
        recall: mean(|s| s.recall),
        accuracy: mean(|s| s.accuracy),
        false_positive_rate: mean(|s| s.false_positive_rate),
        specificity: mean(|s| s.specificity),
        ..micro.clone()
    };
    (macro_, micro)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn counts_at_threshold() {
        let prediction = GrayImage::from_fn(4, 1, |x, _| Luma([[255, 200, 10, 127][x as usize]]));
        let truth = GrayImage::from_fn(4, 1, |x, _| Luma([[255, 0, 255, 0][x as usize]]));

        let stats = compute_metrics(&prediction, &truth, 0.5).unwrap();
        assert_eq!(
            (stats.true_positives, stats.false_positives, stats.false_negatives, stats.true_negatives),
            (1, 1, 1, 1)
        );
        assert!((stats.iou - 1.0 / 3.0).abs() < 1e-6);
        assert!((stats.dice - 0.5).abs() < 1e-6);
        assert!((stats.accuracy - 0.5).abs() < 1e-6);
        assert!((stats.specificity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn default_threshold_matches_mask_binarization() {
        let pixels = GrayImage::from_fn(4, 1, |x, _| Luma([[126, 127, 128, 129][x as usize]]));
        let stats = compute_metrics(&pixels, &pixels, 0.5).unwrap();
        assert_eq!((stats.true_positives, stats.true_negatives), (2, 2));
        assert_eq!((stats.false_positives, stats.false_negatives), (0, 0));
    }

    #[test]
    fn empty_masks_do_not_divide_by_zero() {
        let blank = GrayImage::new(3, 3);
        let stats = compute_metrics(&blank, &blank, 0.5).unwrap();
        assert_eq!(stats.iou, 0.0);
        assert!((stats.accuracy - 1.0).abs() < 1e-6);
        assert!(compute_metrics(&blank, &GrayImage::new(2, 3), 0.5).is_err());
    }

    #[test]
    fn macro_and_micro_differ() {
        let stats = [
            SegmentationStats::from_counts(1, 0, 0, 0),
            SegmentationStats::from_counts(0, 9, 0, 0),
        ];
        let (macro_, micro) = aggregate(&stats);
        assert!((macro_.precision - 0.5).abs() < 1e-6);
        assert!((micro.precision - 0.1).abs() < 1e-6);
        assert_eq!(macro_.false_positives, 9);
    }
}
