//! Lifecycle-driving training loop.
//!
//! The trainer owns the loop state (epoch, step, last-batch flag, schedule
//! entries, optional process group) and the callbacks. It never applies
//! gradients itself: modules step their optimizers explicitly and callbacks
//! step their own.
//!
//! Lifecycle per `fit`:
//! 1. `configure_optimizers` → `attach_optimizers`; schedules stored here
//! 2. optional restore from a checkpoint directory
//! 3. `on_pretrain_routine_start` on every callback, once
//! 4. per epoch: `training_step` for each optimizer index and
//!    `on_train_batch_end` per batch, then validation batches and
//!    `on_validation_batch_end`, then epoch-end hooks
//! 5. `last` checkpoint every `checkpoint_every_n_epochs` and after the final epoch

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::SslBatch;
use crate::error::{Result, TrainingError};
use crate::training::checkpoint::{restore_checkpoint, save_checkpoint};
use crate::training::distributed::ProcessGroup;
use crate::training::module::SelfSupervisedModule;
use crate::training::scheduler::LrScheduleEntry;

/// Loop state visible to modules, callbacks and the step coordinator.
#[derive(Clone, Default)]
pub struct TrainerState {
    /// Number of completed epochs when outside an epoch; the running epoch inside one.
    pub current_epoch: usize,
    /// Number of training batches processed over the whole run.
    pub global_step: usize,
    pub batch_idx: usize,
    pub num_training_batches: usize,
    /// Set while the last training batch of an epoch is being processed.
    pub is_last_batch: bool,
    /// Schedule entries aligned with the module's optimizer list.
    pub lr_schedulers: Vec<LrScheduleEntry>,
    /// Present when the run spans several workers.
    pub process_group: Option<Arc<dyn ProcessGroup>>,
}

impl TrainerState {
    pub fn is_distributed(&self) -> bool {
        self.process_group.is_some()
    }
}

impl fmt::Debug for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainerState")
            .field("current_epoch", &self.current_epoch)
            .field("global_step", &self.global_step)
            .field("batch_idx", &self.batch_idx)
            .field("is_last_batch", &self.is_last_batch)
            .field("lr_schedulers", &self.lr_schedulers)
            .field("distributed", &self.is_distributed())
            .finish()
    }
}

/// Observer hooks fired by the [`Trainer`]. All hooks default to no-ops.
pub trait Callback<B: AutodiffBackend> {
    /// Key of this callback's block in checkpoints.
    fn name(&self) -> &str;

    fn on_pretrain_routine_start(&mut self, _trainer: &TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &TrainerState,
        _module: &dyn SelfSupervisedModule<B>,
        _batch: &SslBatch<B>,
        _batch_idx: usize,
    ) -> Result<()> {
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        _trainer: &TrainerState,
        _module: &dyn SelfSupervisedModule<B>,
        _batch: &SslBatch<B>,
        _batch_idx: usize,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_epoch_end(&mut self, _trainer: &TrainerState) -> Result<()> {
        Ok(())
    }

    /// Write this callback's named state blocks into `dir`, returning their names.
    fn on_save_checkpoint(&self, _dir: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Restore the blocks written by `on_save_checkpoint`.
    fn on_load_checkpoint(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

pub type SharedCallback<B> = Rc<RefCell<dyn Callback<B>>>;

/// Configuration for the training loop.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    #[config(default = 1)]
    pub max_epochs: usize,
    /// Save a `last` checkpoint every N epochs (0 disables periodic saves).
    #[config(default = 1)]
    pub checkpoint_every_n_epochs: usize,
    /// Directory receiving checkpoints. No checkpoints are written when unset.
    #[config(default = "None")]
    pub checkpoint_dir: Option<String>,
    /// Backend RNG seed applied at the start of `fit`.
    #[config(default = 42)]
    pub seed: u64,
}

/// Outcome of a `fit` call.
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub global_step: usize,
    pub last_train_loss: Option<f64>,
    pub last_val_loss: Option<f64>,
    pub last_checkpoint: Option<PathBuf>,
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainerConfig,
    state: TrainerState,
    callbacks: Vec<SharedCallback<B>>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            state: TrainerState::default(),
            callbacks: Vec::new(),
        }
    }

    /// Run as one worker of a data-parallel group.
    pub fn with_process_group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.state.process_group = Some(group);
        self
    }

    pub fn add_callback(&mut self, callback: SharedCallback<B>) {
        self.callbacks.push(callback);
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn callbacks(&self) -> &[SharedCallback<B>] {
        &self.callbacks
    }

    /// Train `module` on `train`, validating on `val` after each epoch.
    pub fn fit(
        &mut self,
        module: &mut dyn SelfSupervisedModule<B>,
        train: &[SslBatch<B>],
        val: &[SslBatch<B>],
        resume_from: Option<&Path>,
    ) -> Result<FitSummary> {
        if module.automatic_optimization() {
            return Err(TrainingError::Lifecycle(
                "modules must disable automatic optimization; the trainer never steps optimizers"
                    .to_string(),
            ));
        }
        B::seed(self.config.seed);

        let (optimizers, schedulers) = module.configure_optimizers()?;
        if optimizers.len() < schedulers.len() {
            return Err(TrainingError::OptimizerCount {
                expected: format!("at least {}", schedulers.len()),
                actual: optimizers.len(),
            });
        }
        tracing::info!(
            ssl_type = %module.ssl_type(),
            optimizers = optimizers.len(),
            schedulers = schedulers.len(),
            "Configured optimizers"
        );
        module.attach_optimizers(optimizers)?;
        self.state.lr_schedulers = schedulers;

        if let Some(dir) = resume_from {
            restore_checkpoint(dir, module, &mut self.state, &self.callbacks)?;
        }

        for callback in &self.callbacks {
            callback.borrow_mut().on_pretrain_routine_start(&self.state)?;
        }

        let mut summary = FitSummary::default();
        self.state.num_training_batches = train.len();
        let fit_start = Instant::now();

        for epoch in self.state.current_epoch..self.config.max_epochs {
            self.state.current_epoch = epoch;
            let mut train_loss_sum = 0.0;
            let mut train_loss_count = 0usize;

            for (batch_idx, batch) in train.iter().enumerate() {
                self.state.batch_idx = batch_idx;
                self.state.is_last_batch = batch_idx + 1 == train.len();

                let num_optimizers = module.optimizers().len();
                for optimizer_idx in 0..num_optimizers {
                    if let Some(loss) =
                        module.training_step(batch, batch_idx, optimizer_idx, &mut self.state)?
                    {
                        train_loss_sum += loss;
                        train_loss_count += 1;
                        summary.last_train_loss = Some(loss);
                    }
                }
                for callback in &self.callbacks {
                    callback
                        .borrow_mut()
                        .on_train_batch_end(&self.state, &*module, batch, batch_idx)?;
                }
                self.state.global_step += 1;
            }
            self.state.is_last_batch = false;

            let mut val_loss_sum = 0.0;
            for (batch_idx, batch) in val.iter().enumerate() {
                val_loss_sum += module.validation_step(batch, batch_idx)?;
                for callback in &self.callbacks {
                    callback
                        .borrow_mut()
                        .on_validation_batch_end(&self.state, &*module, batch, batch_idx)?;
                }
            }
            if !val.is_empty() {
                summary.last_val_loss = Some(val_loss_sum / val.len() as f64);
            }

            for callback in &self.callbacks {
                callback.borrow_mut().on_train_epoch_end(&self.state)?;
            }

            let train_loss = if train_loss_count > 0 {
                train_loss_sum / train_loss_count as f64
            } else {
                f64::NAN
            };
            tracing::info!(
                epoch,
                global_step = self.state.global_step,
                train_loss = format!("{train_loss:.4}"),
                val_loss = ?summary.last_val_loss,
                elapsed_s = fit_start.elapsed().as_secs_f64(),
                "Epoch complete"
            );

            self.state.current_epoch = epoch + 1;
            summary.epochs_run += 1;

            if let Some(dir) = &self.config.checkpoint_dir {
                let every = self.config.checkpoint_every_n_epochs;
                let periodic = every > 0 && (epoch + 1) % every == 0;
                if periodic || epoch + 1 == self.config.max_epochs {
                    let path = Path::new(dir).join("last");
                    save_checkpoint(&path, &*module, &self.state, &self.callbacks)?;
                    summary.last_checkpoint = Some(path);
                }
            }
        }

        summary.global_step = self.state.global_step;
        tracing::info!(
            epochs_run = summary.epochs_run,
            global_step = summary.global_step,
            "Training complete"
        );
        Ok(summary)
    }

    /// Write a checkpoint of `module` and every callback into `dir`.
    pub fn save_checkpoint(&self, module: &dyn SelfSupervisedModule<B>, dir: &Path) -> Result<()> {
        save_checkpoint(dir, module, &self.state, &self.callbacks)
    }
}
