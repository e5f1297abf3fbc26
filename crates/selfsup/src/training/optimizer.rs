//! Parameter groups: one module, one optimizer, one gradient buffer.
//!
//! burn's [`Optimizer`] is generic over the module it updates and is not
//! object safe, so each optimizer is paired with the module it owns inside a
//! [`ParamGroup`]. The group is then exposed to the trainer and to the step
//! coordinator through the object-safe [`OptimizerSlot`] trait.
//!
//! `backward` only extracts gradients for the group's own module, so a loss
//! that reaches parameters of another group never leaks into this one.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;

use crate::error::{Result, TrainingError};
use crate::training::distributed::{all_reduce_gradients, ProcessGroup};

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Object-safe view of a burn optimizer bound to module type `M`.
pub trait ModuleOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> Result<M>;
    fn save(&self, path: &Path) -> Result<()>;
    fn load(&mut self, path: &Path, device: &B::Device) -> Result<()>;
}

/// Adapter giving any [`Optimizer`] the [`ModuleOptimizer`] interface.
pub struct BurnOptimizer<O> {
    // `None` only transiently while a record is being loaded.
    inner: Option<O>,
}

impl<O> BurnOptimizer<O> {
    pub fn new(optimizer: O) -> Self {
        Self {
            inner: Some(optimizer),
        }
    }

    fn missing() -> TrainingError {
        TrainingError::Lifecycle("optimizer state lost during a failed load".to_string())
    }
}

impl<B, M, O> ModuleOptimizer<B, M> for BurnOptimizer<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> Result<M> {
        let optimizer = self.inner.as_mut().ok_or_else(Self::missing)?;
        Ok(optimizer.step(lr, module, grads))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let optimizer = self.inner.as_ref().ok_or_else(Self::missing)?;
        let recorder = CheckpointRecorder::new();
        <CheckpointRecorder as Recorder<B>>::record(&recorder, optimizer.to_record(), path.to_path_buf())
            .map_err(|e| TrainingError::record(path, e))?;
        Ok(())
    }

    fn load(&mut self, path: &Path, device: &B::Device) -> Result<()> {
        let recorder = CheckpointRecorder::new();
        let record: O::Record =
            <CheckpointRecorder as Recorder<B>>::load(&recorder, path.to_path_buf(), device)
                .map_err(|e| TrainingError::record(path, e))?;
        let optimizer = self.inner.take().ok_or_else(Self::missing)?;
        self.inner = Some(optimizer.load_record(record));
        Ok(())
    }
}

/// Object-safe optimizer handle used by the coordinator and the trainer.
pub trait OptimizerSlot<B: AutodiffBackend> {
    fn name(&self) -> &str;

    /// Discard accumulated gradients.
    fn zero_grad(&mut self);

    /// Backpropagate `loss` and accumulate gradients for this group only.
    fn backward(&mut self, loss: Tensor<B, 1>);

    /// Apply accumulated gradients at the current learning rate.
    fn step(&mut self) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Number of optimizer steps applied so far.
    fn steps_taken(&self) -> usize;

    fn save_state(&self, path: &Path) -> Result<()>;

    fn load_state(&mut self, path: &Path) -> Result<()>;
}

/// Shared, dynamically typed optimizer handle.
pub type SharedSlot<B> = Rc<RefCell<dyn OptimizerSlot<B>>>;

/// Shared, typed parameter group (the owner keeps this for forward passes).
pub type SharedGroup<B, M> = Rc<RefCell<ParamGroup<B, M>>>;

/// A module together with the optimizer that updates it.
pub struct ParamGroup<B: AutodiffBackend, M: AutodiffModule<B>> {
    name: String,
    module: M,
    optimizer: Box<dyn ModuleOptimizer<B, M>>,
    accumulator: GradientsAccumulator<M>,
    learning_rate: f64,
    steps: usize,
    gradient_sync: Option<Arc<dyn ProcessGroup>>,
    device: B::Device,
}

impl<B: AutodiffBackend, M: AutodiffModule<B> + 'static> ParamGroup<B, M> {
    pub fn new(
        name: impl Into<String>,
        module: M,
        optimizer: Box<dyn ModuleOptimizer<B, M>>,
        learning_rate: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            name: name.into(),
            module,
            optimizer,
            accumulator: GradientsAccumulator::new(),
            learning_rate,
            steps: 0,
            gradient_sync: None,
            device: device.clone(),
        }
    }

    /// Group updated by Adam, with optional L2 weight decay.
    pub fn adam(
        name: impl Into<String>,
        module: M,
        learning_rate: f64,
        weight_decay: Option<f64>,
        device: &B::Device,
    ) -> Self {
        let config = AdamConfig::new()
            .with_weight_decay(weight_decay.map(|wd| WeightDecayConfig::new(wd as f32)));
        let optimizer = BurnOptimizer::new(config.init::<B, M>());
        Self::new(name, module, Box::new(optimizer), learning_rate, device)
    }

    pub fn into_shared(self) -> SharedGroup<B, M> {
        Rc::new(RefCell::new(self))
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Replace the module, keeping optimizer state and pending gradients.
    pub fn set_module(&mut self, module: M) {
        self.module = module;
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Average gradients across `group` before every step.
    pub fn enable_gradient_sync(&mut self, group: Arc<dyn ProcessGroup>) {
        self.gradient_sync = Some(group);
    }

    pub fn is_gradient_synced(&self) -> bool {
        self.gradient_sync.is_some()
    }

    /// Write the module parameters to `path` (recorder adds `.mpk`).
    pub fn save_module(&self, path: &Path) -> Result<()> {
        self.module
            .clone()
            .save_file(path.to_path_buf(), &CheckpointRecorder::new())
            .map_err(|e| TrainingError::record(path, e))
    }

    /// Load module parameters from `path` into the current module structure.
    pub fn load_module(&mut self, path: &Path) -> Result<()> {
        self.module = self
            .module
            .clone()
            .load_file(path.to_path_buf(), &CheckpointRecorder::new(), &self.device)
            .map_err(|e| TrainingError::record(path, e))?;
        Ok(())
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B> + 'static> OptimizerSlot<B> for ParamGroup<B, M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn zero_grad(&mut self) {
        let _ = self.accumulator.grads();
    }

    fn backward(&mut self, loss: Tensor<B, 1>) {
        let grads = GradientsParams::from_grads(loss.backward(), &self.module);
        self.accumulator.accumulate(&self.module, grads);
    }

    fn step(&mut self) -> Result<()> {
        let mut grads = self.accumulator.grads();
        if let Some(group) = &self.gradient_sync {
            grads = all_reduce_gradients(&self.module, grads, group.as_ref())?;
        }
        self.module = self
            .optimizer
            .step(self.learning_rate, self.module.clone(), grads)?;
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn steps_taken(&self) -> usize {
        self.steps
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        self.optimizer.save(path)
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        self.optimizer.load(path, &self.device)
    }
}
