//! Pretraining and classifier-building pipelines.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use selfsup::batch::{SslBatch, ViewPairBatch};
use selfsup::create_ssl_image_classifier;
use selfsup::training::module::SelfSupervisedModule;
use selfsup::training::online_evaluator::OnlineEvaluator;
use selfsup::training::trainer::{SharedCallback, Trainer};
use selfsup::SslTrainingType;

use crate::config::{load_ssl_toml, CliOverrides};

type RunBackend = Autodiff<NdArray<f32>>;

/// Arguments for the `pretrain` subcommand.
#[derive(Debug)]
pub struct PretrainArgs {
    /// Path to the SSL config TOML file.
    pub config: PathBuf,
    pub ssl_type: Option<SslTrainingType>,
    pub max_epochs: Option<usize>,
    pub checkpoint_dir: Option<PathBuf>,
    /// Checkpoint directory to resume from.
    pub resume_from: Option<PathBuf>,
}

/// Arguments for the `build-classifier` subcommand.
#[derive(Debug)]
pub struct BuildClassifierArgs {
    /// Pretraining checkpoint directory.
    pub checkpoint: PathBuf,
    pub num_classes: usize,
    pub freeze_encoder: bool,
    pub class_weights: Option<Vec<f32>>,
    /// Synthetic images for the smoke evaluation.
    pub batch_size: usize,
    pub image_size: usize,
}

/// Synthetic batches of random view pairs and labels.
struct SyntheticData {
    rng: StdRng,
    batch_size: usize,
    image_size: usize,
    num_classes: usize,
}

impl SyntheticData {
    fn new(seed: u64, batch_size: usize, image_size: usize, num_classes: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            batch_size,
            image_size,
            num_classes,
        }
    }

    fn images(&mut self, device: &<RunBackend as Backend>::Device) -> Tensor<RunBackend, 4> {
        let shape = [self.batch_size, 3, self.image_size, self.image_size];
        let values: Vec<f32> = (0..shape.iter().product::<usize>())
            .map(|_| self.rng.gen_range(-1.0..1.0))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    fn labels(&mut self, device: &<RunBackend as Backend>::Device) -> Tensor<RunBackend, 1, Int> {
        let values: Vec<i64> = (0..self.batch_size)
            .map(|_| self.rng.gen_range(0..self.num_classes as i64))
            .collect();
        Tensor::from_data(TensorData::new(values, [self.batch_size]), device)
    }

    fn view_pair(&mut self, device: &<RunBackend as Backend>::Device) -> ViewPairBatch<RunBackend> {
        let view1 = self.images(device);
        let view2 = self.images(device);
        let labels = self.labels(device);
        ViewPairBatch::new(view1, view2, labels)
    }

    /// Keyed batches: encoder views and labelled linear-head views.
    fn batches(&mut self, n: usize, device: &<RunBackend as Backend>::Device) -> Vec<SslBatch<RunBackend>> {
        (0..n)
            .map(|_| {
                let encoder = self.view_pair(device);
                let linear_head = self.view_pair(device);
                SslBatch::keyed(encoder, linear_head)
            })
            .collect()
    }
}

/// Pretrain a SimCLR or BYOL module on synthetic data with the online evaluator attached.
pub fn run_pretrain(args: PretrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let device = <RunBackend as Backend>::Device::default();

    // 1. Load config
    let mut toml = load_ssl_toml(&args.config)?;
    toml.apply_overrides(CliOverrides {
        ssl_type: args.ssl_type,
        max_epochs: args.max_epochs,
        checkpoint_dir: args.checkpoint_dir.map(|p| p.display().to_string()),
    });

    // 2. Build module
    let mut module: Box<dyn SelfSupervisedModule<RunBackend>> = match toml.run.ssl_type {
        SslTrainingType::SimClr => Box::new(toml.simclr_config().init::<RunBackend>(&device)?),
        SslTrainingType::Byol => Box::new(toml.byol_config().init::<RunBackend>(&device)?),
    };
    tracing::info!(
        ssl_type = %module.ssl_type(),
        representation_dim = module.representation_dim(),
        "Built SSL module"
    );

    // 3. Attach online evaluator
    let mut trainer = Trainer::<RunBackend>::new(toml.trainer_config());
    let evaluator = if toml.online_eval.enabled {
        let config = toml.online_eval_config(module.representation_dim());
        let evaluator = Rc::new(RefCell::new(OnlineEvaluator::new(config, &device)?));
        module.set_online_eval_optimizer(evaluator.borrow().optimizer_slot());
        let callback: SharedCallback<RunBackend> = evaluator.clone();
        trainer.add_callback(callback);
        Some(evaluator)
    } else {
        None
    };

    // 4. Synthetic data
    let mut data = SyntheticData::new(
        toml.run.seed,
        toml.run.batch_size,
        toml.run.image_size,
        toml.run.num_classes,
    );
    let num_train_batches = (toml.run.num_samples / toml.run.batch_size.max(1)).max(1);
    let train = data.batches(num_train_batches, &device);
    let val = data.batches(toml.run.num_val_batches, &device);

    // 5. Fit
    let summary = trainer.fit(module.as_mut(), &train, &val, args.resume_from.as_deref())?;

    if let Some(evaluator) = evaluator {
        for (name, value) in evaluator.borrow().metrics().iter() {
            tracing::info!(metric = name, value, "Online evaluator metric");
        }
    }
    tracing::info!(
        epochs = summary.epochs_run,
        global_step = summary.global_step,
        train_loss = ?summary.last_train_loss,
        val_loss = ?summary.last_val_loss,
        checkpoint = ?summary.last_checkpoint,
        elapsed_s = start.elapsed().as_secs_f64(),
        "Pretraining finished"
    );
    Ok(())
}

/// Build a classifier from a pretraining checkpoint and evaluate it on one synthetic batch.
pub fn run_build_classifier(args: BuildClassifierArgs) -> anyhow::Result<()> {
    let device = <RunBackend as Backend>::Device::default();

    let classifier = create_ssl_image_classifier::<RunBackend>(
        args.num_classes,
        args.freeze_encoder,
        &args.checkpoint,
        args.class_weights,
        &device,
    )?;

    let mut data = SyntheticData::new(0, args.batch_size, args.image_size, args.num_classes);
    let images = data.images(&device);
    let labels = data.labels(&device);
    let metrics = classifier.evaluate(images, labels);
    tracing::info!(
        loss = format!("{:.4}", metrics.loss),
        accuracy = format!("{:.3}", metrics.accuracy),
        "Classifier smoke evaluation"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_batches_are_keyed_and_labelled() {
        let device = Default::default();
        let mut data = SyntheticData::new(7, 4, 8, 3);
        let batches = data.batches(2, &device);
        assert_eq!(batches.len(), 2);
        let head = batches[0]
            .select(selfsup::SslDataModuleType::LinearHead)
            .unwrap();
        assert_eq!(head.view1.dims(), [4, 3, 8, 8]);
        let labels: Vec<i64> = head.labels.clone().into_data().to_vec().unwrap();
        assert!(labels.iter().all(|&l| (0..3).contains(&l)));
    }

    #[test]
    fn test_pretrain_then_build_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ssl.toml");
        std::fs::write(
            &config_path,
            r#"
[run]
ssl_type = "SimCLR"
num_samples = 8
batch_size = 4
image_size = 4
num_classes = 3

[model]
use_7x7_first_conv_in_resnet = false
stem_channels = 2
warmup_epochs = 1

[online_eval]
drop_p = 0.0
"#,
        )
        .unwrap();

        let checkpoint_dir = dir.path().join("ckpt");
        run_pretrain(PretrainArgs {
            config: config_path,
            ssl_type: None,
            max_epochs: Some(1),
            checkpoint_dir: Some(checkpoint_dir.clone()),
            resume_from: None,
        })
        .unwrap();
        assert!(checkpoint_dir.join("last").join("checkpoint.json").exists());

        run_build_classifier(BuildClassifierArgs {
            checkpoint: checkpoint_dir.join("last"),
            num_classes: 3,
            freeze_encoder: true,
            class_weights: None,
            batch_size: 2,
            image_size: 4,
        })
        .unwrap();
    }
}
