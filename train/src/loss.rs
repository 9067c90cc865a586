use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};

const DICE_SMOOTH: f32 = 1e-6;

/// `1 - dice` of the sigmoid probabilities against binary targets, over the whole batch.
pub fn dice_loss<B: Backend>(logits: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let probs = sigmoid(logits);
    let intersection = (probs.clone() * target.clone()).sum();
    let total = probs.sum() + target.sum();
    ((intersection * 2.0 + DICE_SMOOTH) / (total + DICE_SMOOTH)).neg() + 1.0f32
}

/// Mean binary cross entropy on raw logits, `max(x, 0) - x * t + log(1 + exp(-|x|))`.
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let softplus = logits.clone().abs().neg().exp().log1p();
    (relu(logits.clone()) - logits * target + softplus).mean()
}

pub fn combined_loss<B: Backend>(logits: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    dice_loss(logits.clone(), target.clone()) + bce_with_logits(logits, target)
}
