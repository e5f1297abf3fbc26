//! Building downstream classifiers from pretraining checkpoints.

use std::path::Path;

use burn::tensor::backend::AutodiffBackend;

use crate::error::Result;
use crate::model::classifier::{SslClassifier, SslImageClassifier};
use crate::model::encoder::SslEncoder;
use crate::training::byol::Byol;
use crate::training::checkpoint::{
    checkpoint_size_bytes, read_checkpoint_meta, CheckpointMeta, MODEL_STATE_NAME,
};
use crate::training::module::SelfSupervisedModule;
use crate::training::simclr::SimClr;
use crate::types::SslTrainingType;

/// Learning rate of the classifier optimizer.
pub const CLASSIFIER_LEARNING_RATE: f64 = 1e-4;

/// Rebuild the pretrained encoder stored in a checkpoint directory.
///
/// SimCLR checkpoints yield their encoder, BYOL checkpoints the target arm's
/// encoder.
pub fn load_ssl_encoder<B: AutodiffBackend>(
    checkpoint_dir: &Path,
    device: &B::Device,
) -> Result<(SslTrainingType, SslEncoder<B>)> {
    let meta: CheckpointMeta = read_checkpoint_meta(checkpoint_dir)?;
    let ssl_type = meta.ssl_type()?;
    let hparams = meta.module_hyper_parameters();
    let weights = checkpoint_dir.join(MODEL_STATE_NAME);

    let encoder = match ssl_type {
        SslTrainingType::SimClr => {
            let mut module = SimClr::<B>::from_hyper_parameters(hparams, device)?;
            module.load_weights(&weights)?;
            module.encoder()
        }
        SslTrainingType::Byol => {
            let mut module = Byol::<B>::from_hyper_parameters(hparams, device)?;
            module.load_weights(&weights)?;
            module.target_encoder()
        }
    };
    Ok((ssl_type, encoder))
}

/// Classifier on top of the encoder pretrained in `checkpoint_dir`.
///
/// Fails with `UnknownSslType` when the checkpoint's `ssl_type` tag is
/// missing or not one of `SimCLR` / `BYOL`.
pub fn create_ssl_image_classifier<B: AutodiffBackend>(
    num_classes: usize,
    freeze_encoder: bool,
    checkpoint_dir: &Path,
    class_weights: Option<Vec<f32>>,
    device: &B::Device,
) -> Result<SslImageClassifier<B>> {
    let size_bytes = checkpoint_size_bytes(checkpoint_dir)?;
    tracing::info!(
        path = %checkpoint_dir.display(),
        size_mb = format!("{:.2}", size_bytes as f64 / (1024.0 * 1024.0)),
        "Loading SSL checkpoint"
    );

    let (ssl_type, encoder) = load_ssl_encoder::<B>(checkpoint_dir, device)?;
    let feature_dim = encoder.feature_dim();
    let model = SslClassifier::new(encoder, num_classes, freeze_encoder, device);

    tracing::info!(
        %ssl_type,
        feature_dim,
        num_classes,
        freeze_encoder,
        weighted = class_weights.is_some(),
        "Created SSL image classifier"
    );
    SslImageClassifier::new(model, class_weights, CLASSIFIER_LEARNING_RATE, device)
}
