//! Linear (or one-hidden-layer) classifier trained on frozen representations.
//!
//! ```text
//! (batch, n_input)
//!   → Dropout → Linear(n_input→n_classes)                      (no hidden layer)
//!   → Dropout → Linear(n_input→n_hidden, no bias) → BatchNorm1d
//!     → ReLU → Dropout → Linear(n_hidden→n_classes)            (with hidden layer)
//! ```
//!
//! After [`SslEvaluator::convert_sync_batchnorm`] the hidden BatchNorm
//! normalizes with statistics averaged over every worker of a process group.

use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;

use crate::error::{Result, TrainingError};
use crate::training::distributed::ProcessGroup;

#[derive(Config, Debug)]
pub struct SslEvaluatorConfig {
    /// Representation width.
    pub n_input: usize,
    pub n_classes: usize,
    #[config(default = 0.2)]
    pub p: f64,
    #[config(default = "None")]
    pub n_hidden: Option<usize>,
}

#[derive(Module, Debug)]
pub struct HiddenBlock<B: Backend> {
    linear: Linear<B>,
    norm: BatchNorm<B, 0>,
    dropout: Dropout,
}

#[derive(Module, Debug)]
pub struct SslEvaluator<B: Backend> {
    dropout: Dropout,
    hidden: Option<HiddenBlock<B>>,
    output: Linear<B>,
    n_input: usize,
    sync_batch_norm: bool,
}

impl SslEvaluatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SslEvaluator<B> {
        let (hidden, output_in) = match self.n_hidden {
            Some(n_hidden) => (
                Some(HiddenBlock {
                    linear: LinearConfig::new(self.n_input, n_hidden)
                        .with_bias(false)
                        .init(device),
                    norm: BatchNormConfig::new(n_hidden).init(device),
                    dropout: DropoutConfig::new(self.p).init(),
                }),
                n_hidden,
            ),
            None => (None, self.n_input),
        };
        SslEvaluator {
            dropout: DropoutConfig::new(self.p).init(),
            hidden,
            output: LinearConfig::new(output_in, self.n_classes).init(device),
            n_input: self.n_input,
            sync_batch_norm: false,
        }
    }
}

impl<B: Backend> SslEvaluator<B> {
    /// Logits for a batch of representations, normalizing locally.
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        self.forward_with(x, None)
    }

    /// Logits, using cross-worker batch statistics when in sync form and a
    /// process group is given.
    pub fn forward_with(
        &self,
        x: Tensor<B, 2>,
        group: Option<&dyn ProcessGroup>,
    ) -> Result<Tensor<B, 2>> {
        let [_, width] = x.dims();
        if width != self.n_input {
            return Err(TrainingError::ShapeMismatch {
                context: "online evaluator input".to_string(),
                expected: self.n_input,
                actual: width,
            });
        }

        let mut x = self.dropout.forward(x);
        if let Some(hidden) = &self.hidden {
            x = hidden.linear.forward(x);
            x = match group {
                Some(group) if self.sync_batch_norm && B::ad_enabled() => {
                    sync_batch_norm(&hidden.norm, x, group)?
                }
                _ => hidden.norm.forward(x),
            };
            x = burn::tensor::activation::relu(x);
            x = hidden.dropout.forward(x);
        }
        Ok(self.output.forward(x))
    }

    /// Switch the hidden BatchNorm to cross-worker statistics.
    pub fn convert_sync_batchnorm(mut self) -> Self {
        self.sync_batch_norm = true;
        self
    }

    pub fn is_sync_batch_norm(&self) -> bool {
        self.sync_batch_norm
    }

    pub fn n_input(&self) -> usize {
        self.n_input
    }
}

/// Training-mode batch norm with mean and variance averaged across `group`.
///
/// Workers are assumed to hold equally sized batches, so the global mean is
/// the mean of the per-worker means. The returned tensor carries the local
/// statistics' gradient while its value uses the global statistics.
fn sync_batch_norm<B: Backend>(
    norm: &BatchNorm<B, 0>,
    x: Tensor<B, 2>,
    group: &dyn ProcessGroup,
) -> Result<Tensor<B, 2>> {
    let [_, features] = x.dims();
    let device = x.device();

    let local_mean = x.clone().mean_dim(0); // (1, F)
    let local_sq_mean = x.clone().powf_scalar(2.0).mean_dim(0); // (1, F)

    let mut stats: Vec<f32> = Tensor::cat(vec![local_mean.clone(), local_sq_mean.clone()], 1)
        .into_data()
        .iter::<f32>()
        .collect();
    group.all_reduce_mean(&mut stats)?;
    let global = Tensor::<B, 2>::from_data(TensorData::new(stats, [1, 2 * features]), &device);
    let global_mean = global.clone().slice([0..1, 0..features]);
    let global_sq_mean = global.slice([0..1, features..2 * features]);

    let global_var = (global_sq_mean.clone() - global_mean.clone().powf_scalar(2.0)).clamp_min(0.0);
    let momentum = norm.momentum;
    let running_mean = norm.running_mean.value_sync();
    let running_var = norm.running_var.value_sync();
    norm.running_mean.update(
        running_mean.mul_scalar(1.0 - momentum) + global_mean.clone().squeeze::<1>(0).mul_scalar(momentum),
    );
    norm.running_var.update(
        running_var.mul_scalar(1.0 - momentum) + global_var.squeeze::<1>(0).mul_scalar(momentum),
    );

    let mean = local_mean.clone() + (global_mean - local_mean).detach();
    let sq_mean = local_sq_mean.clone() + (global_sq_mean - local_sq_mean).detach();
    let var = (sq_mean - mean.clone().powf_scalar(2.0)).clamp_min(0.0);

    let normalized = (x - mean) / var.add_scalar(norm.epsilon).sqrt();
    let gamma = norm.gamma.val().unsqueeze_dim::<2>(0);
    let beta = norm.beta.val().unsqueeze_dim::<2>(0);
    Ok(normalized * gamma + beta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    use crate::training::distributed::InMemoryProcessGroup;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_linear_head_shape() {
        let device = Default::default();
        let head = SslEvaluatorConfig::new(8, 3).init::<TestBackend>(&device);
        let logits = head.forward(Tensor::ones([4, 8], &device)).unwrap();
        assert_eq!(logits.dims(), [4, 3]);
    }

    #[test]
    fn test_hidden_head_shape() {
        let device = Default::default();
        let head = SslEvaluatorConfig::new(8, 2)
            .with_n_hidden(Some(5))
            .init::<TestAutodiffBackend>(&device);
        let logits = head.forward(Tensor::ones([4, 8], &device)).unwrap();
        assert_eq!(logits.dims(), [4, 2]);
    }

    #[test]
    fn test_width_mismatch_is_an_error() {
        let device = Default::default();
        let head = SslEvaluatorConfig::new(8, 2).init::<TestBackend>(&device);
        match head.forward(Tensor::ones([4, 6], &device)) {
            Err(TrainingError::ShapeMismatch { expected: 8, actual: 6, .. }) => {}
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_batch_norm_single_worker_matches_local() {
        let device = Default::default();
        let head = SslEvaluatorConfig::new(4, 2)
            .with_p(0.0)
            .with_n_hidden(Some(3))
            .init::<TestAutodiffBackend>(&device);
        let synced = head.clone().convert_sync_batchnorm();
        assert!(synced.is_sync_batch_norm());
        assert!(!head.is_sync_batch_norm());

        let x = Tensor::<TestAutodiffBackend, 2>::from_data(
            TensorData::from([
                [0.1_f32, 0.2, 0.3, 0.4],
                [1.0, -1.0, 0.5, 0.0],
                [-0.3, 0.7, 0.2, 0.9],
            ]),
            &device,
        );
        let group = InMemoryProcessGroup::group(1).unwrap();
        let local: Vec<f32> = head.forward(x.clone()).unwrap().into_data().to_vec().unwrap();
        let global: Vec<f32> = synced
            .forward_with(x, Some(group[0].as_ref()))
            .unwrap()
            .into_data()
            .to_vec()
            .unwrap();
        for (a, b) in local.iter().zip(global.iter()) {
            assert!((a - b).abs() < 1e-3, "local {a} vs synced {b}");
        }
    }
}
