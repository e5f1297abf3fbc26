//! BYOL training module.
//!
//! An online arm (encoder + projector) followed by a predictor regresses the
//! projections of a target arm on the other view. Only the online arm and the
//! predictor receive gradients; the target arm follows the online arm as an
//! exponential moving average after every optimizer-0 step:
//!
//! ```text
//! tau_k = 1 - (1 - initial_tau) * (cos(pi * k / K) + 1) / 2
//! target = tau_k * target + (1 - tau_k) * online
//! ```
//!
//! The target arm lives in the same parameter group as the online arm so a
//! single weight file holds both. It never sees gradients: its outputs are
//! detached, and its parameters have their own ids.

use std::f64::consts::PI;
use std::marker::PhantomData;
use std::path::Path;

use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::SslBatch;
use crate::error::{Result, TrainingError};
use crate::model::encoder::{SslEncoder, SslEncoderConfig};
use crate::model::projection::{MlpHead, MlpHeadConfig};
use crate::training::loss::symmetric_byol_loss;
use crate::training::module::{OptimizerConfiguration, SelfSupervisedModule};
use crate::training::optimization::{manual_optimization_step, ManualOptimization};
use crate::training::optimizer::{OptimizerSlot, ParamGroup, SharedGroup, SharedSlot};
use crate::training::scheduler::{LrSchedule, LrScheduleEntry, ScheduleInterval};
use crate::training::trainer::TrainerState;
use crate::types::{SslDataModuleType, SslTrainingType};

/// Hyperparameters of a BYOL module. Saved verbatim in checkpoints.
#[derive(Config, Debug)]
pub struct ByolConfig {
    pub encoder_name: String,
    pub dataset_name: String,
    pub num_samples: usize,
    pub batch_size: usize,
    #[config(default = 1)]
    pub devices: usize,
    #[config(default = 1000)]
    pub max_epochs: usize,
    #[config(default = 10)]
    pub warmup_epochs: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 1.5e-6)]
    pub weight_decay: f64,
    /// EMA decay at step 0; rises to 1 by the end of training.
    #[config(default = 0.99)]
    pub initial_tau: f64,
    #[config(default = true)]
    pub use_7x7_first_conv_in_resnet: bool,
    #[config(default = 4096)]
    pub projector_hidden_dim: usize,
    #[config(default = 256)]
    pub projector_out_dim: usize,
    #[config(default = 32)]
    pub stem_channels: usize,
}

impl ByolConfig {
    pub fn train_iters_per_epoch(&self) -> usize {
        self.num_samples / (self.batch_size * self.devices).max(1)
    }

    /// Total optimizer-0 steps over the run (the EMA horizon).
    pub fn max_steps(&self) -> usize {
        self.max_epochs * self.train_iters_per_epoch()
    }

    /// Per-epoch warmup + cosine annealing.
    pub fn lr_schedule(&self) -> LrSchedule {
        LrSchedule::LinearWarmupCosineAnnealing {
            base_lr: self.learning_rate,
            warmup_epochs: self.warmup_epochs,
            max_epochs: self.max_epochs,
            warmup_start_lr: 0.0,
            eta_min: 0.0,
        }
    }

    /// EMA decay after `step` optimizer steps.
    pub fn tau_at(&self, step: usize) -> f64 {
        let horizon = self.max_steps().max(1) as f64;
        let progress = (step as f64 / horizon).min(1.0);
        1.0 - (1.0 - self.initial_tau) * ((PI * progress).cos() + 1.0) / 2.0
    }

    fn init_arm<B: Backend>(&self, device: &B::Device) -> Result<ByolArm<B>> {
        let encoder = SslEncoderConfig::new(self.encoder_name.clone())
            .with_use_7x7_first_conv_in_resnet(self.use_7x7_first_conv_in_resnet)
            .with_stem_channels(self.stem_channels)
            .init(device)?;
        let projector = MlpHeadConfig::new(encoder.feature_dim())
            .with_hidden_dim(self.projector_hidden_dim)
            .with_output_dim(self.projector_out_dim)
            .init(device);
        Ok(ByolArm { encoder, projector })
    }

    pub fn init<B: AutodiffBackend>(&self, device: &B::Device) -> Result<Byol<B>> {
        let arm = self.init_arm::<B>(device)?;
        let predictor = MlpHeadConfig::new(self.projector_out_dim)
            .with_hidden_dim(self.projector_hidden_dim)
            .with_output_dim(self.projector_out_dim)
            .init(device);
        // fresh parameter ids, then copy the online values over
        let target = ema_update(self.init_arm::<B>(device)?, &arm, 0.0);

        let network = ByolNetwork {
            online: ByolOnline { arm, predictor },
            target,
        };
        let group = ParamGroup::adam(
            "byol",
            network,
            self.lr_schedule().lr_at(0),
            Some(self.weight_decay),
            device,
        );

        tracing::info!(
            encoder = %self.encoder_name,
            dataset = %self.dataset_name,
            max_steps = self.max_steps(),
            initial_tau = self.initial_tau,
            "Created BYOL module"
        );
        Ok(Byol {
            config: self.clone(),
            network: group.into_shared(),
            online_eval_optimizer: None,
            optimizers: Vec::new(),
            current_tau: self.initial_tau,
        })
    }
}

/// Encoder followed by a projector.
#[derive(Module, Debug)]
pub struct ByolArm<B: Backend> {
    encoder: SslEncoder<B>,
    projector: MlpHead<B>,
}

impl<B: Backend> ByolArm<B> {
    pub fn encoder(&self) -> &SslEncoder<B> {
        &self.encoder
    }

    /// Projection of `images`.
    pub fn project(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.projector.forward(self.encoder.forward(images))
    }
}

#[derive(Module, Debug)]
pub struct ByolOnline<B: Backend> {
    arm: ByolArm<B>,
    predictor: MlpHead<B>,
}

impl<B: Backend> ByolOnline<B> {
    fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.predictor.forward(self.arm.project(images))
    }
}

#[derive(Module, Debug)]
pub struct ByolNetwork<B: Backend> {
    online: ByolOnline<B>,
    target: ByolArm<B>,
}

impl<B: Backend> ByolNetwork<B> {
    fn loss(&self, view1: Tensor<B, 4>, view2: Tensor<B, 4>) -> Tensor<B, 1> {
        let p1 = self.online.predict(view1.clone());
        let p2 = self.online.predict(view2.clone());
        let z1 = self.target.project(view1).detach();
        let z2 = self.target.project(view2).detach();
        symmetric_byol_loss(p1, z2, p2, z1)
    }
}

// ---------------------------------------------------------------------------
// Exponential moving average
// ---------------------------------------------------------------------------

/// Flattened copies of every float tensor, in visit order.
struct Snapshot<B: AutodiffBackend> {
    tensors: Vec<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Snapshot<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.tensors.push(tensor.clone().inner().reshape([numel]));
    }
}

struct EmaMapper<B: AutodiffBackend> {
    online: Vec<Tensor<B::InnerBackend, 1>>,
    tau: f64,
    index: usize,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(online) = self.online.get(self.index).cloned() else {
            return tensor;
        };
        self.index += 1;
        let online: Tensor<B::InnerBackend, D> = online.reshape(tensor.dims());
        let target = tensor.inner();
        Tensor::from_inner(target.mul_scalar(self.tau) + online.mul_scalar(1.0 - self.tau))
    }
}

/// `tau * target + (1 - tau) * online`, tensor by tensor, untracked.
fn ema_update<B: AutodiffBackend>(target: ByolArm<B>, online: &ByolArm<B>, tau: f64) -> ByolArm<B> {
    let mut snapshot = Snapshot::<B> { tensors: Vec::new() };
    online.visit(&mut snapshot);
    let mut mapper = EmaMapper::<B> {
        online: snapshot.tensors,
        tau,
        index: 0,
        _backend: PhantomData,
    };
    target.map(&mut mapper)
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

pub struct Byol<B: AutodiffBackend> {
    config: ByolConfig,
    network: SharedGroup<B, ByolNetwork<B>>,
    online_eval_optimizer: Option<SharedSlot<B>>,
    optimizers: Vec<SharedSlot<B>>,
    current_tau: f64,
}

impl<B: AutodiffBackend> Byol<B> {
    pub fn from_hyper_parameters(hparams: serde_json::Value, device: &B::Device) -> Result<Self> {
        let config: ByolConfig = serde_json::from_value(hparams)?;
        config.init(device)
    }

    pub fn config(&self) -> &ByolConfig {
        &self.config
    }

    pub fn current_tau(&self) -> f64 {
        self.current_tau
    }

    /// Target arm encoder, the one reused by downstream classifiers.
    pub fn target_encoder(&self) -> SslEncoder<B> {
        self.network.borrow().module().target.encoder.clone()
    }

    pub fn online_encoder(&self) -> SslEncoder<B> {
        self.network.borrow().module().online.arm.encoder.clone()
    }

    pub fn shared_step(&self, batch: &SslBatch<B>) -> Result<Tensor<B, 1>> {
        let batch = batch.select(SslDataModuleType::Encoder)?;
        let group = self.network.borrow();
        Ok(group.module().loss(batch.view1.clone(), batch.view2.clone()))
    }

    /// Move the target arm towards the online arm using the decay for `step`.
    pub fn update_target(&mut self, step: usize) {
        let tau = self.config.tau_at(step);
        let mut group = self.network.borrow_mut();
        let ByolNetwork { online, target } = group.module().clone();
        let target = ema_update(target, &online.arm, tau);
        group.set_module(ByolNetwork { online, target });
        self.current_tau = tau;
    }
}

impl<B: AutodiffBackend> ManualOptimization<B> for Byol<B> {
    fn optimizers(&self) -> &[SharedSlot<B>] {
        &self.optimizers
    }
}

impl<B: AutodiffBackend> SelfSupervisedModule<B> for Byol<B> {
    fn ssl_type(&self) -> SslTrainingType {
        SslTrainingType::Byol
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.network.borrow().module().online.arm.encoder.forward(images)
    }

    fn representation_dim(&self) -> usize {
        self.network.borrow().module().online.arm.encoder.feature_dim()
    }

    fn set_online_eval_optimizer(&mut self, optimizer: SharedSlot<B>) {
        self.online_eval_optimizer = Some(optimizer);
    }

    fn configure_optimizers(&mut self) -> Result<OptimizerConfiguration<B>> {
        let entry = LrScheduleEntry::new(self.config.lr_schedule(), ScheduleInterval::Epoch);
        self.network
            .borrow_mut()
            .set_learning_rate(entry.scheduler.current_lr());
        let online_slot: SharedSlot<B> = self.network.clone();

        let mut optimizers = vec![online_slot];
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
        self.update_target(trainer.global_step);
        tracing::debug!(
            batch_idx,
            global_step = trainer.global_step,
            loss = value,
            tau = self.current_tau,
            "byol/train/loss"
        );
        Ok(Some(value))
    }

    fn validation_step(&self, batch: &SslBatch<B>, batch_idx: usize) -> Result<f64> {
        let batch = batch.select(SslDataModuleType::Encoder)?;
        let network = self.network.borrow().module().valid();
        let loss = network.loss(batch.view1.clone().inner(), batch.view2.clone().inner());
        let value: f64 = loss.into_scalar().elem();
        tracing::debug!(batch_idx, loss = value, "byol/val/loss");
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

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn tiny_config() -> ByolConfig {
        ByolConfig::new("resnet18".to_string(), "cifar10".to_string(), 8, 4)
            .with_max_epochs(5)
            .with_warmup_epochs(1)
            .with_projector_hidden_dim(8)
            .with_projector_out_dim(4)
            .with_stem_channels(2)
            .with_use_7x7_first_conv_in_resnet(false)
    }

    fn flat<B: Backend>(encoder: &SslEncoder<B>, device: &B::Device) -> Vec<f32> {
        encoder
            .forward(Tensor::ones([1, 3, 4, 4], device))
            .into_data()
            .to_vec()
            .unwrap()
    }

    #[test]
    fn test_tau_schedule_endpoints() {
        let config = tiny_config();
        assert!((config.tau_at(0) - 0.99).abs() < 1e-12);
        assert!((config.tau_at(config.max_steps()) - 1.0).abs() < 1e-12);
        assert!(config.tau_at(3) > config.tau_at(1));
    }

    #[test]
    fn test_target_starts_equal_to_online() {
        let device = Default::default();
        let module = tiny_config().init::<TestAutodiffBackend>(&device).unwrap();
        assert_eq!(
            flat(&module.online_encoder(), &device),
            flat(&module.target_encoder(), &device)
        );
    }

    #[test]
    fn test_target_lags_online_after_a_step() {
        let device = Default::default();
        let mut module = tiny_config().init::<TestAutodiffBackend>(&device).unwrap();
        let (optimizers, _) = module.configure_optimizers().unwrap();
        module.attach_optimizers(optimizers).unwrap();
        // constant lr so the first step moves the online arm
        module.optimizers()[0].borrow_mut().set_learning_rate(1e-2);

        let batch = SslBatch::Single(crate::batch::ViewPairBatch::new(
            Tensor::random([4, 3, 4, 4], burn::tensor::Distribution::Normal(0.0, 1.0), &device),
            Tensor::random([4, 3, 4, 4], burn::tensor::Distribution::Normal(0.0, 1.0), &device),
            Tensor::zeros([4], &device),
        ));
        let target_before = flat(&module.target_encoder(), &device);
        let mut trainer = TrainerState::default();
        let loss = module.training_step(&batch, 0, 0, &mut trainer).unwrap();
        assert!(loss.is_some_and(|l| l.is_finite()));

        let online_after = flat(&module.online_encoder(), &device);
        let target_after = flat(&module.target_encoder(), &device);
        assert_ne!(online_after, target_before, "online arm should move");
        assert_ne!(target_after, online_after, "target arm should lag behind");
        assert!((module.current_tau() - 0.99).abs() < 1e-12);
    }
}
