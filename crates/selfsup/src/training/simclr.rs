//! SimCLR training module.
//!
//! Encoder + projection head trained with NT-Xent on two augmented views.
//! Optimizer 0 updates the encoder and projection under a per-step linear
//! warmup / cosine decay schedule. When an online evaluator is attached, its
//! optimizer is appended as optimizer 1 with a constant schedule so
//! checkpoints capture it; this module never steps it.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::SslBatch;
use crate::error::{Result, TrainingError};
use crate::model::encoder::{SslEncoder, SslEncoderConfig};
use crate::model::projection::{Projection, ProjectionConfig};
use crate::training::loss::nt_xent_loss;
use crate::training::module::{OptimizerConfiguration, SelfSupervisedModule};
use crate::training::optimization::{manual_optimization_step, ManualOptimization};
use crate::training::optimizer::{OptimizerSlot, ParamGroup, SharedGroup, SharedSlot};
use crate::training::scheduler::{LrSchedule, LrScheduleEntry, ScheduleInterval};
use crate::training::trainer::TrainerState;
use crate::types::{SslDataModuleType, SslTrainingType};

/// Hyperparameters of a SimCLR module. Saved verbatim in checkpoints.
#[derive(Config, Debug)]
pub struct SimClrConfig {
    /// Encoder name, see [`crate::model::encoder::ENCODER_FEATURE_DIMS`].
    pub encoder_name: String,
    /// Dataset label, used in log fields only.
    pub dataset_name: String,
    /// Training-set size, used to size the schedule.
    pub num_samples: usize,
    /// Per-device batch size.
    pub batch_size: usize,
    #[config(default = 1)]
    pub devices: usize,
    #[config(default = 100)]
    pub max_epochs: usize,
    #[config(default = 10)]
    pub warmup_epochs: usize,
    #[config(default = 0.1)]
    pub temperature: f64,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 1e-6)]
    pub weight_decay: f64,
    #[config(default = true)]
    pub use_7x7_first_conv_in_resnet: bool,
    /// Projection hidden width.
    #[config(default = 2048)]
    pub hidden_mlp: usize,
    /// Projection output width.
    #[config(default = 128)]
    pub feat_dim: usize,
    #[config(default = 32)]
    pub stem_channels: usize,
}

impl SimClrConfig {
    /// `num_samples / (batch_size * devices)`.
    pub fn train_iters_per_epoch(&self) -> usize {
        self.num_samples / (self.batch_size * self.devices).max(1)
    }

    /// Per-step warmup + cosine decay over the whole run.
    pub fn lr_schedule(&self) -> LrSchedule {
        let iters = self.train_iters_per_epoch();
        LrSchedule::LinearWarmupCosineDecay {
            base_lr: self.learning_rate,
            warmup_steps: iters * self.warmup_epochs,
            total_steps: iters * self.max_epochs,
        }
    }

    pub fn init<B: AutodiffBackend>(&self, device: &B::Device) -> Result<SimClr<B>> {
        let encoder = SslEncoderConfig::new(self.encoder_name.clone())
            .with_use_7x7_first_conv_in_resnet(self.use_7x7_first_conv_in_resnet)
            .with_stem_channels(self.stem_channels)
            .init(device)?;
        let projection = ProjectionConfig::new(encoder.feature_dim())
            .with_hidden_dim(self.hidden_mlp)
            .with_output_dim(self.feat_dim)
            .init(device);
        let network = SimClrNetwork { encoder, projection };
        let group = ParamGroup::adam(
            "simclr",
            network,
            self.lr_schedule().lr_at(0),
            Some(self.weight_decay),
            device,
        );

        tracing::info!(
            encoder = %self.encoder_name,
            dataset = %self.dataset_name,
            train_iters_per_epoch = self.train_iters_per_epoch(),
            "Created SimCLR module"
        );
        Ok(SimClr {
            config: self.clone(),
            network: group.into_shared(),
            online_eval_optimizer: None,
            optimizers: Vec::new(),
        })
    }
}

/// Parameters updated by optimizer 0.
#[derive(Module, Debug)]
pub struct SimClrNetwork<B: Backend> {
    encoder: SslEncoder<B>,
    projection: Projection<B>,
}

impl<B: Backend> SimClrNetwork<B> {
    pub fn encoder(&self) -> &SslEncoder<B> {
        &self.encoder
    }

    /// Contrastive loss on a pair of views.
    fn loss(&self, view1: Tensor<B, 4>, view2: Tensor<B, 4>, temperature: f64) -> Tensor<B, 1> {
        let z1 = self.projection.forward(self.encoder.forward(view1));
        let z2 = self.projection.forward(self.encoder.forward(view2));
        nt_xent_loss(z1, z2, temperature)
    }
}

pub struct SimClr<B: AutodiffBackend> {
    config: SimClrConfig,
    network: SharedGroup<B, SimClrNetwork<B>>,
    online_eval_optimizer: Option<SharedSlot<B>>,
    optimizers: Vec<SharedSlot<B>>,
}

impl<B: AutodiffBackend> SimClr<B> {
    /// Rebuild from checkpoint hyperparameters.
    pub fn from_hyper_parameters(hparams: serde_json::Value, device: &B::Device) -> Result<Self> {
        let config: SimClrConfig = serde_json::from_value(hparams)?;
        config.init(device)
    }

    pub fn config(&self) -> &SimClrConfig {
        &self.config
    }

    pub fn train_iters_per_epoch(&self) -> usize {
        self.config.train_iters_per_epoch()
    }

    /// The encoder reused by downstream classifiers.
    pub fn encoder(&self) -> SslEncoder<B> {
        self.network.borrow().module().encoder.clone()
    }

    pub fn network(&self) -> SimClrNetwork<B> {
        self.network.borrow().module().clone()
    }

    /// NT-Xent loss on the encoder sub-batch.
    pub fn shared_step(&self, batch: &SslBatch<B>) -> Result<Tensor<B, 1>> {
        let batch = batch.select(SslDataModuleType::Encoder)?;
        let group = self.network.borrow();
        Ok(group
            .module()
            .loss(batch.view1.clone(), batch.view2.clone(), self.config.temperature))
    }
}

impl<B: AutodiffBackend> ManualOptimization<B> for SimClr<B> {
    fn optimizers(&self) -> &[SharedSlot<B>] {
        &self.optimizers
    }
}

impl<B: AutodiffBackend> SelfSupervisedModule<B> for SimClr<B> {
    fn ssl_type(&self) -> SslTrainingType {
        SslTrainingType::SimClr
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.network.borrow().module().encoder.forward(images)
    }

    fn representation_dim(&self) -> usize {
        self.network.borrow().module().encoder.feature_dim()
    }

    fn set_online_eval_optimizer(&mut self, optimizer: SharedSlot<B>) {
        self.online_eval_optimizer = Some(optimizer);
    }

    fn configure_optimizers(&mut self) -> Result<OptimizerConfiguration<B>> {
        let entry = LrScheduleEntry::new(self.config.lr_schedule(), ScheduleInterval::Step);
        self.network
            .borrow_mut()
            .set_learning_rate(entry.scheduler.current_lr());
        let encoder_slot: SharedSlot<B> = self.network.clone();

        let mut optimizers = vec![encoder_slot];
        let mut schedulers = vec![entry];
        if let Some(eval) = &self.online_eval_optimizer {
            let lr = eval.borrow().learning_rate();
            optimizers.push(eval.clone());
            schedulers.push(LrScheduleEntry::constant(lr));
        }
        Ok((optimizers, schedulers))
    }

    fn attach_optimizers(&mut self, optimizers: Vec<SharedSlot<B>>) -> Result<()> {
        if !(1..=2).contains(&optimizers.len()) {
            return Err(TrainingError::OptimizerCount {
                expected: "1 or 2".to_string(),
                actual: optimizers.len(),
            });
        }
        self.optimizers = optimizers;
        Ok(())
    }

    fn training_step(
        &mut self,
        batch: &SslBatch<B>,
        batch_idx: usize,
        optimizer_idx: usize,
        trainer: &mut TrainerState,
    ) -> Result<Option<f64>> {
        // Other optimizers (the online evaluator's) are stepped by their owners.
        if optimizer_idx != 0 {
            return Ok(None);
        }
        if !(1..=2).contains(&self.optimizers.len()) {
            return Err(TrainingError::OptimizerCount {
                expected: "1 or 2".to_string(),
                actual: self.optimizers.len(),
            });
        }

        let loss = self.shared_step(batch)?;
        let value: f64 = loss.clone().into_scalar().elem();
        manual_optimization_step(&*self, trainer, loss, 0)?;
        tracing::debug!(
            batch_idx,
            global_step = trainer.global_step,
            loss = value,
            "simclr/train/loss"
        );
        Ok(Some(value))
    }

    fn validation_step(&self, batch: &SslBatch<B>, batch_idx: usize) -> Result<f64> {
        let batch = batch.select(SslDataModuleType::Encoder)?;
        let network = self.network.borrow().module().valid();
        let loss = network.loss(
            batch.view1.clone().inner(),
            batch.view2.clone().inner(),
            self.config.temperature,
        );
        let value: f64 = loss.into_scalar().elem();
        tracing::debug!(batch_idx, loss = value, "simclr/val/loss");
        Ok(value)
    }

    fn hyper_parameters(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        self.network.borrow().save_module(path)
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.network.borrow_mut().load_module(path)
    }
}
