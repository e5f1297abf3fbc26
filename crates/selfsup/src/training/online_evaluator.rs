//! Online evaluator callback.
//!
//! Trains a small classifier head on detached encoder representations while
//! the encoder itself is being pretrained. The head has its own optimizer,
//! stepped here rather than through the module's step coordinator; the
//! module only references that optimizer so checkpoints capture it.
//!
//! Lifecycle: the callback is `Uninitialized` until the trainer fires
//! `on_pretrain_routine_start`. At that point, if the trainer reports a
//! process group, the head switches to sync batch norm and its gradients are
//! averaged across workers from then on. The switch happens once and is
//! never undone.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::SslBatch;
use crate::error::{Result, TrainingError};
use crate::model::evaluator::{SslEvaluator, SslEvaluatorConfig};
use crate::training::distributed::DistributedParallel;
use crate::training::loss::{accuracy, check_class_weights, weighted_cross_entropy};
use crate::training::metrics::{MetricsLog, RunningAvg, StepMetrics};
use crate::training::module::SelfSupervisedModule;
use crate::training::optimizer::{OptimizerSlot, ParamGroup, SharedGroup, SharedSlot};
use crate::training::trainer::{Callback, TrainerState};
use crate::types::SslDataModuleType;

/// Key of the callback's sub-bundle in checkpoints; the callback type name.
pub const ONLINE_EVALUATOR_NAME: &str = "OnlineEvaluator";
pub const OPTIMIZER_STATE_NAME: &str = "optimizer_state";
pub const EVALUATOR_STATE_NAME: &str = "evaluator_weights";
const METRIC_PREFIX: &str = "ssl_online_evaluator";

#[derive(Config, Debug)]
pub struct OnlineEvaluatorConfig {
    /// Representation width produced by the encoder.
    pub z_dim: usize,
    pub num_classes: usize,
    /// Dataset label, used in log fields only.
    pub dataset: String,
    #[config(default = "None")]
    pub class_weights: Option<Vec<f32>>,
    #[config(default = 0.2)]
    pub drop_p: f64,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = "None")]
    pub hidden_dim: Option<usize>,
    #[config(default = 1e-4)]
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorPhase {
    Uninitialized,
    Active,
}

pub struct OnlineEvaluator<B: AutodiffBackend> {
    config: OnlineEvaluatorConfig,
    head: SharedGroup<B, SslEvaluator<B>>,
    phase: EvaluatorPhase,
    parallel: Option<DistributedParallel>,
    train_avg: RunningAvg,
    val_avg: RunningAvg,
    metrics: MetricsLog,
}

impl<B: AutodiffBackend> OnlineEvaluator<B> {
    /// Fails with `IncompatibleConfig` when `class_weights` does not have one
    /// entry per class.
    pub fn new(config: OnlineEvaluatorConfig, device: &B::Device) -> Result<Self> {
        check_class_weights(config.class_weights.as_deref(), config.num_classes)?;
        let head = SslEvaluatorConfig::new(config.z_dim, config.num_classes)
            .with_p(config.drop_p)
            .with_n_hidden(config.hidden_dim)
            .init::<B>(device);
        let group = ParamGroup::adam(
            "online_evaluator",
            head,
            config.learning_rate,
            Some(config.weight_decay),
            device,
        );
        Ok(Self {
            config,
            head: group.into_shared(),
            phase: EvaluatorPhase::Uninitialized,
            parallel: None,
            train_avg: RunningAvg::new(),
            val_avg: RunningAvg::new(),
            metrics: MetricsLog::default(),
        })
    }

    pub fn config(&self) -> &OnlineEvaluatorConfig {
        &self.config
    }

    /// The head's optimizer, to be handed to the module for checkpointing.
    pub fn optimizer_slot(&self) -> SharedSlot<B> {
        self.head.clone()
    }

    /// Current classifier head.
    pub fn head(&self) -> SslEvaluator<B> {
        self.head.borrow().module().clone()
    }

    pub fn phase(&self) -> EvaluatorPhase {
        self.phase
    }

    pub fn is_distributed_wrapped(&self) -> bool {
        self.parallel.is_some()
    }

    pub fn parallel(&self) -> Option<&DistributedParallel> {
        self.parallel.as_ref()
    }

    pub fn metrics(&self) -> &MetricsLog {
        &self.metrics
    }

    fn require_active(&self) -> Result<()> {
        match self.phase {
            EvaluatorPhase::Active => Ok(()),
            EvaluatorPhase::Uninitialized => Err(TrainingError::Lifecycle(
                "online evaluator used before on_pretrain_routine_start".to_string(),
            )),
        }
    }

    fn log_step(&mut self, stage: &str, metrics: StepMetrics) {
        self.metrics.log(format!("{METRIC_PREFIX}/{stage}/loss"), metrics.loss);
        self.metrics.log(format!("{METRIC_PREFIX}/{stage}/accuracy"), metrics.accuracy);
    }

    /// One supervised step of the head on a frozen representation.
    pub fn train_step(
        &mut self,
        module: &dyn SelfSupervisedModule<B>,
        batch: &SslBatch<B>,
    ) -> Result<StepMetrics> {
        self.require_active()?;
        let batch = batch.select(SslDataModuleType::LinearHead)?;
        let representation = module.forward(batch.view1.clone()).detach();

        let group = self.parallel.as_ref().map(|p| p.process_group.as_ref());
        let logits = self.head.borrow().module().forward_with(representation, group)?;
        let loss = weighted_cross_entropy(
            logits.clone(),
            batch.labels.clone(),
            self.config.class_weights.as_deref(),
        );
        let metrics = StepMetrics {
            loss: loss.clone().into_scalar().elem(),
            accuracy: accuracy(logits, batch.labels.clone()),
        };

        let mut head = self.head.borrow_mut();
        head.zero_grad();
        head.backward(loss);
        head.step()?;
        drop(head);

        self.train_avg.update(&metrics);
        self.log_step("train", metrics);
        Ok(metrics)
    }

    /// Loss and accuracy of the head on a validation batch, without stepping.
    pub fn eval_step(
        &mut self,
        module: &dyn SelfSupervisedModule<B>,
        batch: &SslBatch<B>,
    ) -> Result<StepMetrics> {
        self.require_active()?;
        let batch = batch.select(SslDataModuleType::LinearHead)?;
        let representation = module.forward(batch.view1.clone()).inner();
        let labels = batch.labels.clone().inner();

        let head = self.head.borrow().module().valid();
        let logits = head.forward(representation)?;
        let loss = weighted_cross_entropy(
            logits.clone(),
            labels.clone(),
            self.config.class_weights.as_deref(),
        );
        let metrics = StepMetrics {
            loss: loss.into_scalar().elem(),
            accuracy: accuracy(logits, labels),
        };
        self.val_avg.update(&metrics);
        self.log_step("val", metrics);
        Ok(metrics)
    }
}

impl<B: AutodiffBackend> Callback<B> for OnlineEvaluator<B> {
    fn name(&self) -> &str {
        ONLINE_EVALUATOR_NAME
    }

    fn on_pretrain_routine_start(&mut self, trainer: &TrainerState) -> Result<()> {
        if self.phase == EvaluatorPhase::Active {
            return Err(TrainingError::Lifecycle(
                "on_pretrain_routine_start fired twice for the online evaluator".to_string(),
            ));
        }

        if let Some(process_group) = &trainer.process_group {
            let mut head = self.head.borrow_mut();
            let converted = head.module().clone().convert_sync_batchnorm();
            head.set_module(converted);
            head.enable_gradient_sync(process_group.clone());
            drop(head);

            let parallel = DistributedParallel::new(process_group.clone());
            tracing::info!(
                rank = process_group.rank(),
                world_size = process_group.world_size(),
                device_ids = ?parallel.device_ids,
                "Wrapped online evaluator for distributed training"
            );
            self.parallel = Some(parallel);
        }
        self.phase = EvaluatorPhase::Active;
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        trainer: &TrainerState,
        module: &dyn SelfSupervisedModule<B>,
        batch: &SslBatch<B>,
        batch_idx: usize,
    ) -> Result<()> {
        let metrics = self.train_step(module, batch)?;
        tracing::debug!(
            dataset = %self.config.dataset,
            global_step = trainer.global_step,
            batch_idx,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            "ssl_online_evaluator/train"
        );
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        _trainer: &TrainerState,
        module: &dyn SelfSupervisedModule<B>,
        batch: &SslBatch<B>,
        batch_idx: usize,
    ) -> Result<()> {
        let metrics = self.eval_step(module, batch)?;
        tracing::debug!(
            dataset = %self.config.dataset,
            batch_idx,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            "ssl_online_evaluator/val"
        );
        Ok(())
    }

    fn on_train_epoch_end(&mut self, trainer: &TrainerState) -> Result<()> {
        tracing::info!(
            dataset = %self.config.dataset,
            epoch = trainer.current_epoch,
            train = %self.train_avg.display(),
            val = %self.val_avg.display(),
            "Online evaluator"
        );
        self.train_avg.reset();
        self.val_avg.reset();
        Ok(())
    }

    fn on_save_checkpoint(&self, dir: &Path) -> Result<Vec<String>> {
        let head = self.head.borrow();
        head.save_state(&dir.join(OPTIMIZER_STATE_NAME))?;
        head.save_module(&dir.join(EVALUATOR_STATE_NAME))?;
        Ok(vec![
            OPTIMIZER_STATE_NAME.to_string(),
            EVALUATOR_STATE_NAME.to_string(),
        ])
    }

    fn on_load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let mut head = self.head.borrow_mut();
        head.load_state(&dir.join(OPTIMIZER_STATE_NAME))?;
        head.load_module(&dir.join(EVALUATOR_STATE_NAME))?;
        tracing::info!(path = %dir.display(), "Restored online evaluator");
        Ok(())
    }
}
