//! Image encoder factory.
//!
//! Encoders are selected by name. Each name fixes the width of the pooled
//! representation; the backbone itself is a compact conv stack:
//!
//! ```text
//! (batch, C, H, W)
//!   → stem Conv2d (7x7/s2 or 3x3/s1) → ReLU
//!   → Conv2d(3x3/s2, stem_channels→feature_dim) → ReLU
//!   → global average pool → flatten
//!   → (batch, feature_dim)
//! ```

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;

use crate::error::{Result, TrainingError};

/// Encoder names accepted by [`create_ssl_encoder`], with their output widths.
pub const ENCODER_FEATURE_DIMS: [(&str, usize); 4] = [
    ("resnet18", 512),
    ("resnet50", 2048),
    ("resnet101", 2048),
    ("densenet121", 1024),
];

/// Output width for a recognized encoder name.
pub fn encoder_output_dim(encoder_name: &str) -> Result<usize> {
    ENCODER_FEATURE_DIMS
        .iter()
        .find(|(name, _)| *name == encoder_name)
        .map(|(_, dim)| *dim)
        .ok_or_else(|| TrainingError::UnknownEncoder(encoder_name.to_string()))
}

/// Configuration for an SSL image encoder.
#[derive(Config, Debug)]
pub struct SslEncoderConfig {
    /// One of `resnet18`, `resnet50`, `resnet101`, `densenet121`.
    pub encoder_name: String,
    /// Use a 7x7/stride-2 stem. With `false` the stem is 3x3/stride-1,
    /// which suits small images. Not available for `densenet121`.
    #[config(default = true)]
    pub use_7x7_first_conv_in_resnet: bool,
    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
    /// Channels produced by the stem convolution.
    #[config(default = 32)]
    pub stem_channels: usize,
}

/// Conv encoder producing `(batch, feature_dim)` representations.
#[derive(Module, Debug)]
pub struct SslEncoder<B: Backend> {
    stem: Conv2d<B>,
    block: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    feature_dim: usize,
}

impl SslEncoderConfig {
    /// Validate the name/flag combination and build the encoder.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SslEncoder<B>> {
        let feature_dim = encoder_output_dim(&self.encoder_name)?;
        if self.encoder_name == "densenet121" && !self.use_7x7_first_conv_in_resnet {
            return Err(TrainingError::IncompatibleConfig(
                "densenet121 does not support use_7x7_first_conv_in_resnet = false".to_string(),
            ));
        }

        let stem = if self.use_7x7_first_conv_in_resnet {
            Conv2dConfig::new([self.in_channels, self.stem_channels], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
        } else {
            Conv2dConfig::new([self.in_channels, self.stem_channels], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
        };

        Ok(SslEncoder {
            stem: stem.init(device),
            block: Conv2dConfig::new([self.stem_channels, feature_dim], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            feature_dim,
        })
    }
}

/// Build an encoder by name.
pub fn create_ssl_encoder<B: Backend>(
    encoder_name: &str,
    use_7x7_first_conv_in_resnet: bool,
    device: &B::Device,
) -> Result<SslEncoder<B>> {
    SslEncoderConfig::new(encoder_name.to_string())
        .with_use_7x7_first_conv_in_resnet(use_7x7_first_conv_in_resnet)
        .init(device)
}

impl<B: Backend> SslEncoder<B> {
    /// `(batch, C, H, W)` → `(batch, feature_dim)`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = burn::tensor::activation::relu(self.stem.forward(images));
        let x = burn::tensor::activation::relu(self.block.forward(x));
        self.pool.forward(x).flatten(1, 3)
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}
