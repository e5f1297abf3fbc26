//! Contrastive, regression and supervised losses.
//!
//! All losses are generic over `B: Backend` and return a `(1,)` tensor.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;

use crate::error::{Result, TrainingError};
use crate::model::projection::l2_normalize;

/// NT-Xent (normalized temperature-scaled cross entropy) loss.
///
/// Both views are stacked into `2N` rows; for each row the positive is the
/// other view of the same image, every other row is a negative. Inputs are
/// expected to be L2-normalized, which makes the self-similarity of every
/// row exactly `exp(1 / temperature)`; that term is subtracted from the
/// denominator instead of masking.
///
/// # Arguments
/// - `z1`, `z2`: shape `(batch, dim)`, unit-norm embeddings of the two views
/// - `temperature`: softmax temperature
pub fn nt_xent_loss<B: Backend>(z1: Tensor<B, 2>, z2: Tensor<B, 2>, temperature: f64) -> Tensor<B, 1> {
    const EPS: f64 = 1e-6;

    let out = Tensor::cat(vec![z1.clone(), z2.clone()], 0); // (2N, D)
    let sim = out.clone().matmul(out.transpose()).div_scalar(temperature).exp(); // (2N, 2N)
    let self_sim = (1.0 / temperature).exp();
    let neg = sim.sum_dim(1).squeeze::<1>(1).sub_scalar(self_sim).clamp_min(EPS); // (2N,)

    let pos = (z1 * z2).sum_dim(1).squeeze::<1>(1).div_scalar(temperature).exp(); // (N,)
    let pos = Tensor::cat(vec![pos.clone(), pos], 0); // (2N,)

    (pos / neg.add_scalar(EPS)).log().neg().mean()
}

/// BYOL regression loss `2 - 2 * cos(p, z)`, averaged over the batch.
pub fn byol_regression_loss<B: Backend>(p: Tensor<B, 2>, z: Tensor<B, 2>) -> Tensor<B, 1> {
    let cos = (l2_normalize(p) * l2_normalize(z)).sum_dim(1).squeeze::<1>(1);
    cos.mul_scalar(-2.0).add_scalar(2.0).mean()
}

/// BYOL loss symmetrized over both view orderings.
pub fn symmetric_byol_loss<B: Backend>(
    p1: Tensor<B, 2>,
    z2: Tensor<B, 2>,
    p2: Tensor<B, 2>,
    z1: Tensor<B, 2>,
) -> Tensor<B, 1> {
    byol_regression_loss(p1, z2) + byol_regression_loss(p2, z1)
}

/// Reject a class-weight vector that does not have one entry per class.
pub fn check_class_weights(class_weights: Option<&[f32]>, num_classes: usize) -> Result<()> {
    match class_weights {
        Some(weights) if weights.len() != num_classes => Err(TrainingError::IncompatibleConfig(format!(
            "{} class weights given for {num_classes} classes",
            weights.len()
        ))),
        _ => Ok(()),
    }
}

/// Cross entropy over logits, optionally with per-class weights.
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    class_weights: Option<&[f32]>,
) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .with_weights(class_weights.map(|w| w.to_vec()))
        .init(&logits.device())
        .forward(logits, labels)
}

/// Fraction of rows whose arg-max matches the label.
pub fn accuracy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> f64 {
    let [batch, _] = logits.dims();
    if batch == 0 {
        return 0.0;
    }
    let predicted = logits.argmax(1).squeeze::<1>(1);
    let correct: i64 = predicted.equal(labels).int().sum().into_scalar().elem();
    correct as f64 / batch as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_nt_xent_known_value() {
        let device = Default::default();
        // two orthonormal images, identical views
        let z = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 0.0], [0.0, 1.0]]),
            &device,
        );
        let loss: f32 = nt_xent_loss(z.clone(), z, 0.5).into_scalar().elem();
        // -log(e^2 / (e^2 + 2)) = ln(1 + 2 e^-2)
        let expected = (1.0_f32 + 2.0 * (-2.0_f32).exp()).ln();
        assert!(
            (loss - expected).abs() < 1e-4,
            "expected {expected}, got {loss}"
        );
    }

    #[test]
    fn test_nt_xent_mismatched_views_cost_more() {
        let device = Default::default();
        let z1 = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 0.0], [0.0, 1.0]]),
            &device,
        );
        let swapped = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.0_f32, 1.0], [1.0, 0.0]]),
            &device,
        );
        let aligned: f32 = nt_xent_loss(z1.clone(), z1.clone(), 0.1).into_scalar().elem();
        let crossed: f32 = nt_xent_loss(z1, swapped, 0.1).into_scalar().elem();
        assert!(crossed > aligned, "crossed {crossed} should exceed aligned {aligned}");
    }

    #[test]
    fn test_byol_loss_bounds() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 2>::from_data(TensorData::from([[3.0_f32, 4.0]]), &device);
        let same: f32 = byol_regression_loss(a.clone(), a.clone().mul_scalar(2.0))
            .into_scalar()
            .elem();
        assert!(same.abs() < 1e-5, "parallel vectors give zero loss, got {same}");

        let opposite: f32 = byol_regression_loss(a.clone(), a.neg()).into_scalar().elem();
        assert!((opposite - 4.0).abs() < 1e-5, "antiparallel gives 4, got {opposite}");
    }

    #[test]
    fn test_weighted_cross_entropy_changes_with_weights() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[2.0_f32, 0.0], [0.0, 2.0], [2.0, 0.0]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 0, 1]), &device);
        let plain: f32 = weighted_cross_entropy(logits.clone(), labels.clone(), None)
            .into_scalar()
            .elem();
        let weighted: f32 = weighted_cross_entropy(logits, labels, Some(&[1.0, 5.0]))
            .into_scalar()
            .elem();
        assert!(plain.is_finite() && weighted.is_finite());
        assert!(weighted > plain, "upweighting the misclassified class raises the loss");
    }

    #[test]
    fn test_class_weights_must_match_class_count() {
        assert!(check_class_weights(None, 3).is_ok());
        assert!(check_class_weights(Some(&[1.0, 2.0, 1.0]), 3).is_ok());
        match check_class_weights(Some(&[1.0, 2.0]), 3) {
            Err(TrainingError::IncompatibleConfig(msg)) => assert!(msg.contains("2 class weights")),
            other => panic!("expected IncompatibleConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_accuracy() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[2.0_f32, 0.0], [0.0, 2.0], [2.0, 0.0], [0.0, 1.0]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 1, 1, 1]), &device);
        assert!((accuracy(logits, labels) - 0.75).abs() < 1e-12);
    }
}
