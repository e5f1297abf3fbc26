//! Interface shared by the SimCLR and BYOL training modules.

use std::path::Path;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::SslBatch;
use crate::error::Result;
use crate::training::optimization::ManualOptimization;
use crate::training::optimizer::SharedSlot;
use crate::training::scheduler::LrScheduleEntry;
use crate::training::trainer::TrainerState;
use crate::types::SslTrainingType;

/// Optimizers and their positionally aligned schedule entries.
pub type OptimizerConfiguration<B> = (Vec<SharedSlot<B>>, Vec<LrScheduleEntry>);

/// A self-supervised encoder training module driven by [`crate::training::trainer::Trainer`].
///
/// Modules run with automatic optimization off: every optimizer step is
/// issued from `training_step` through
/// [`crate::training::optimization::manual_optimization_step`].
pub trait SelfSupervisedModule<B: AutodiffBackend>: ManualOptimization<B> {
    fn ssl_type(&self) -> SslTrainingType;

    /// Encoder representation of `images`, without projection.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Width of the representation returned by `forward`.
    fn representation_dim(&self) -> usize;

    /// Register the online evaluator's optimizer so it is checkpointed with
    /// this module. Must be called before `configure_optimizers`.
    fn set_online_eval_optimizer(&mut self, optimizer: SharedSlot<B>);

    /// Optimizers and schedules, index 0 first.
    fn configure_optimizers(&mut self) -> Result<OptimizerConfiguration<B>>;

    /// Install the optimizer list returned by `configure_optimizers`.
    fn attach_optimizers(&mut self, optimizers: Vec<SharedSlot<B>>) -> Result<()>;

    fn automatic_optimization(&self) -> bool {
        false
    }

    /// Run one step for `optimizer_idx`. Returns the loss when a step was taken.
    fn training_step(
        &mut self,
        batch: &SslBatch<B>,
        batch_idx: usize,
        optimizer_idx: usize,
        trainer: &mut TrainerState,
    ) -> Result<Option<f64>>;

    /// Objective on a validation batch, without gradient tracking.
    fn validation_step(&self, batch: &SslBatch<B>, batch_idx: usize) -> Result<f64>;

    /// Constructor arguments, serialized so the module can be rebuilt.
    fn hyper_parameters(&self) -> Result<serde_json::Value>;

    fn save_weights(&self, path: &Path) -> Result<()>;

    fn load_weights(&mut self, path: &Path) -> Result<()>;
}
