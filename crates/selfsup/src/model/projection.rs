//! Projection heads mapping encoder features into embedding space.

use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};
use burn::prelude::*;

/// SimCLR projection head configuration.
///
/// ```text
/// (batch, input_dim)
///   → Linear(input_dim→hidden_dim) → BatchNorm1d → ReLU
///   → Linear(hidden_dim→output_dim, no bias)
///   → L2-normalize
///   → (batch, output_dim)
/// ```
#[derive(Config, Debug)]
pub struct ProjectionConfig {
    pub input_dim: usize,
    #[config(default = 2048)]
    pub hidden_dim: usize,
    #[config(default = 128)]
    pub output_dim: usize,
}

#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    linear1: Linear<B>,
    norm: BatchNorm<B, 0>,
    linear2: Linear<B>,
}

impl ProjectionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Projection<B> {
        Projection {
            linear1: LinearConfig::new(self.input_dim, self.hidden_dim).init(device),
            norm: BatchNormConfig::new(self.hidden_dim).init(device),
            linear2: LinearConfig::new(self.hidden_dim, self.output_dim)
                .with_bias(false)
                .init(device),
        }
    }
}

impl<B: Backend> Projection<B> {
    /// Unit-norm embeddings, one row per input.
    pub fn forward(&self, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear1.forward(h);
        let x = burn::tensor::activation::relu(self.norm.forward(x));
        l2_normalize(self.linear2.forward(x))
    }
}

/// Row-wise L2 normalization with a small floor on the norm.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

/// Projector/predictor MLP used by BYOL (no output normalization).
#[derive(Config, Debug)]
pub struct MlpHeadConfig {
    pub input_dim: usize,
    #[config(default = 4096)]
    pub hidden_dim: usize,
    #[config(default = 256)]
    pub output_dim: usize,
}

#[derive(Module, Debug)]
pub struct MlpHead<B: Backend> {
    linear1: Linear<B>,
    norm: BatchNorm<B, 0>,
    linear2: Linear<B>,
}

impl MlpHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpHead<B> {
        MlpHead {
            linear1: LinearConfig::new(self.input_dim, self.hidden_dim).init(device),
            norm: BatchNormConfig::new(self.hidden_dim).init(device),
            linear2: LinearConfig::new(self.hidden_dim, self.output_dim).init(device),
        }
    }
}

impl<B: Backend> MlpHead<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear1.forward(x);
        let x = burn::tensor::activation::relu(self.norm.forward(x));
        self.linear2.forward(x)
    }
}
