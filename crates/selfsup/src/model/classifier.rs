//! Image classifier built on a pretrained encoder.
//!
//! ```text
//! images → SslEncoder → (detach if frozen) → Linear(feature_dim → num_classes)
//! ```

use burn::module::AutodiffModule;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::Result;
use crate::model::encoder::SslEncoder;
use crate::training::loss::{accuracy, check_class_weights, weighted_cross_entropy};
use crate::training::metrics::StepMetrics;
use crate::training::optimizer::{OptimizerSlot, ParamGroup};

#[derive(Module, Debug)]
pub struct SslClassifier<B: Backend> {
    encoder: SslEncoder<B>,
    linear: Linear<B>,
    freeze_encoder: bool,
}

impl<B: Backend> SslClassifier<B> {
    pub fn new(encoder: SslEncoder<B>, num_classes: usize, freeze_encoder: bool, device: &B::Device) -> Self {
        let linear = LinearConfig::new(encoder.feature_dim(), num_classes).init(device);
        Self {
            encoder,
            linear,
            freeze_encoder,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.encoder.forward(images);
        let features = if self.freeze_encoder {
            features.detach()
        } else {
            features
        };
        self.linear.forward(features)
    }

    pub fn encoder(&self) -> &SslEncoder<B> {
        &self.encoder
    }

    pub fn is_encoder_frozen(&self) -> bool {
        self.freeze_encoder
    }

    pub fn num_classes(&self) -> usize {
        self.linear.weight.dims()[1]
    }
}

/// A classifier together with its optimizer and class weights.
pub struct SslImageClassifier<B: AutodiffBackend> {
    model: ParamGroup<B, SslClassifier<B>>,
    class_weights: Option<Vec<f32>>,
}

impl<B: AutodiffBackend> SslImageClassifier<B> {
    pub fn new(
        model: SslClassifier<B>,
        class_weights: Option<Vec<f32>>,
        learning_rate: f64,
        device: &B::Device,
    ) -> Result<Self> {
        check_class_weights(class_weights.as_deref(), model.num_classes())?;
        Ok(Self {
            model: ParamGroup::adam("classifier", model, learning_rate, None, device),
            class_weights,
        })
    }

    pub fn model(&self) -> &SslClassifier<B> {
        self.model.module()
    }

    pub fn class_weights(&self) -> Option<&[f32]> {
        self.class_weights.as_deref()
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.module().forward(images)
    }

    /// One optimizer step on a labelled batch.
    pub fn train_step(&mut self, images: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> Result<StepMetrics> {
        let logits = self.model.module().forward(images);
        let loss = weighted_cross_entropy(logits.clone(), labels.clone(), self.class_weights.as_deref());
        let metrics = StepMetrics {
            loss: loss.clone().into_scalar().elem(),
            accuracy: accuracy(logits, labels),
        };
        self.model.zero_grad();
        self.model.backward(loss);
        self.model.step()?;
        Ok(metrics)
    }

    pub fn evaluate(&self, images: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> StepMetrics {
        let model = self.model.module().valid();
        let labels = labels.inner();
        let logits = model.forward(images.inner());
        let loss = weighted_cross_entropy(logits.clone(), labels.clone(), self.class_weights.as_deref());
        StepMetrics {
            loss: loss.into_scalar().elem(),
            accuracy: accuracy(logits, labels),
        }
    }
}
